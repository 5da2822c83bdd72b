use std::time::Duration;

use crate::event::Context;

/// Tracks which contexts have been reported recently so that index events
/// are not repeated for every evaluation.
///
/// Owned and called only by the dispatcher task.
pub trait ContextDeduplicator: Send {
    /// How often [`flush`](Self::flush) should run, if at all.
    fn flush_interval(&self) -> Option<Duration>;

    /// Records the context and returns true if it was not already known.
    fn process_context(&mut self, context: &Context) -> bool;

    /// Forgets every known context.
    fn flush(&mut self);
}
