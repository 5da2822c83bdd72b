pub mod http;

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub use http::HttpEventSender;

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendResult {
    pub success: bool,
    /// The collector rejected us permanently; stop sending.
    pub must_shutdown: bool,
    /// Server clock at the time of the response, if reported.
    pub time_from_server: Option<DateTime<Utc>>,
}

impl SendResult {
    pub fn ok(time_from_server: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            must_shutdown: false,
            time_from_server,
        }
    }

    pub fn failed(must_shutdown: bool) -> Self {
        Self {
            success: false,
            must_shutdown,
            time_from_server: None,
        }
    }
}

/// Classification of a failed delivery.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("recoverable delivery failure: {0}")]
    Recoverable(String),
    #[error("collector rejected request with status {status}")]
    Unrecoverable { status: u16 },
}

impl SendError {
    pub fn must_shutdown(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}

/// Transport that delivers serialized payloads to the collector.
///
/// Implementations own all network concerns; the processor only looks at
/// the returned [`SendResult`].
pub trait EventSender: Send + Sync + 'static {
    /// Delivers a JSON array of analytics events.
    fn send_analytics_events(
        &self,
        data: Vec<u8>,
        event_count: usize,
        base_uri: &str,
    ) -> impl Future<Output = SendResult> + Send;

    /// Delivers a single diagnostic event.
    fn send_diagnostic_event(
        &self,
        data: Vec<u8>,
        base_uri: &str,
    ) -> impl Future<Output = SendResult> + Send;

    /// Releases transport resources. Called once during shutdown.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}
