//! Analytics and diagnostic event pipeline for feature-flag SDKs.
//!
//! Application threads hand events to an [`EventProcessor`]. A single
//! dispatcher task summarizes, deduplicates and samples them, and a small
//! pool of delivery workers ships the resulting JSON batches through an
//! [`EventSender`].

pub mod config;
pub mod dedup;
pub mod diagnostic;
pub mod event;
pub mod output;
pub mod processor;
pub mod sender;

pub use config::{Config, EventsConfig, HttpSenderConfig};
pub use dedup::ContextDeduplicator;
pub use diagnostic::{DiagnosticStore, SdkDiagnosticParams};
pub use event::{Context, Event, SingleContext};
pub use processor::{EventProcessor, EventProcessorBuilder};
pub use sender::{EventSender, HttpEventSender, SendResult};
