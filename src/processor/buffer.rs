use tracing::warn;

use super::summarizer::{EventSummarizer, EventSummary};
use crate::event::{Event, FeatureRequestEvent};

/// Unit of work handed from the dispatcher to a delivery worker.
#[derive(Debug, Default)]
pub struct FlushPayload {
    pub events: Vec<Event>,
    pub summary: EventSummary,
}

impl FlushPayload {
    /// Number of wire events this payload produces.
    pub fn output_count(&self) -> usize {
        self.events.len() + usize::from(!self.summary.is_empty())
    }
}

/// Events and summary counters accumulated during one flush cycle.
///
/// Only the dispatcher task touches a buffer.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Event>,
    summarizer: EventSummarizer,
    capacity: usize,
    capacity_exceeded: bool,
    dropped_events: u64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            summarizer: EventSummarizer::new(),
            capacity,
            capacity_exceeded: false,
            dropped_events: 0,
        }
    }

    /// Appends an event, or counts it as dropped when the buffer is full.
    pub fn add(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            if !self.capacity_exceeded {
                self.capacity_exceeded = true;
                warn!(
                    capacity = self.capacity,
                    "Exceeded event buffer capacity, dropping events"
                );
            }
            self.dropped_events += 1;
            return;
        }
        self.capacity_exceeded = false;
        self.events.push(event);
    }

    pub fn add_to_summary(&mut self, event: &FeatureRequestEvent) {
        self.summarizer.summarize_event(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.summarizer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn get_and_clear_dropped_count(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_events)
    }

    /// Moves the buffered events and the current summary into a payload.
    /// The buffer is left empty.
    pub fn take_payload(&mut self) -> FlushPayload {
        FlushPayload {
            events: std::mem::take(&mut self.events),
            summary: self.summarizer.get_summary_and_reset(),
        }
    }

    /// Gives back a payload that could not be handed off. Its events go in
    /// front of anything buffered since, and its summary is merged.
    pub fn restore_payload(&mut self, payload: FlushPayload) {
        let FlushPayload { mut events, summary } = payload;
        events.append(&mut self.events);
        self.events = events;
        self.summarizer.restore_to(summary);
    }
}
