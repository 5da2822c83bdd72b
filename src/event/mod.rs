pub mod context;

use serde_json::Value;

pub use context::{AttributeRef, Context, SingleContext};

/// Returns the current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// An analytics event accepted by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FeatureRequest(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    Index(IndexEvent),
    MigrationOp(MigrationOpEvent),
}

impl Event {
    /// Returns the canonical wire `kind` name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FeatureRequest(fe) if fe.debug => "debug",
            Self::FeatureRequest(_) => "feature",
            Self::Identify(_) => "identify",
            Self::Custom(_) => "custom",
            Self::Index(_) => "index",
            Self::MigrationOp(_) => "migration_op",
        }
    }

    pub fn creation_date(&self) -> u64 {
        match self {
            Self::FeatureRequest(e) => e.creation_date,
            Self::Identify(e) => e.creation_date,
            Self::Custom(e) => e.creation_date,
            Self::Index(e) => e.creation_date,
            Self::MigrationOp(e) => e.creation_date,
        }
    }

    pub fn context(&self) -> &Context {
        match self {
            Self::FeatureRequest(e) => &e.context,
            Self::Identify(e) => &e.context,
            Self::Custom(e) => &e.context,
            Self::Index(e) => &e.context,
            Self::MigrationOp(e) => &e.context,
        }
    }

    /// 1-in-N sampling ratio. Index events are never sampled.
    pub fn sampling_ratio(&self) -> u64 {
        match self {
            Self::FeatureRequest(e) => e.sampling_ratio,
            Self::Identify(e) => e.sampling_ratio,
            Self::Custom(e) => e.sampling_ratio,
            Self::Index(_) => 1,
            Self::MigrationOp(e) => e.sampling_ratio,
        }
    }
}

impl From<FeatureRequestEvent> for Event {
    fn from(e: FeatureRequestEvent) -> Self {
        Self::FeatureRequest(e)
    }
}

impl From<IdentifyEvent> for Event {
    fn from(e: IdentifyEvent) -> Self {
        Self::Identify(e)
    }
}

impl From<CustomEvent> for Event {
    fn from(e: CustomEvent) -> Self {
        Self::Custom(e)
    }
}

impl From<MigrationOpEvent> for Event {
    fn from(e: MigrationOpEvent) -> Self {
        Self::MigrationOp(e)
    }
}

/// Records a single flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRequestEvent {
    pub creation_date: u64,
    pub key: String,
    pub context: Context,
    /// Flag version, `None` when the flag was not found.
    pub version: Option<u64>,
    /// Variation index, `None` when evaluation fell back to the default.
    pub variation: Option<u32>,
    pub value: Value,
    pub default: Value,
    pub reason: Option<Value>,
    /// Key of the flag this evaluation was a prerequisite of.
    pub prereq_of: Option<String>,
    pub track_events: bool,
    pub exclude_from_summaries: bool,
    /// Millisecond timestamp until which debug copies are emitted; 0 disables.
    pub debug_events_until_date: u64,
    pub sampling_ratio: u64,
    /// Set on the copy emitted as a `debug` event.
    pub debug: bool,
}

impl FeatureRequestEvent {
    /// Creates an untracked evaluation event stamped with the current time.
    pub fn new(key: &str, context: Context, value: Value, default: Value) -> Self {
        Self {
            creation_date: now_millis(),
            key: key.to_string(),
            context,
            version: None,
            variation: None,
            value,
            default,
            reason: None,
            prereq_of: None,
            track_events: false,
            exclude_from_summaries: false,
            debug_events_until_date: 0,
            sampling_ratio: 1,
            debug: false,
        }
    }

    /// Returns the copy of this event emitted as a debug event.
    pub fn to_debug_event(&self) -> Self {
        Self {
            debug: true,
            ..self.clone()
        }
    }
}

/// Explicitly reports a context to the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyEvent {
    pub creation_date: u64,
    pub context: Context,
    pub sampling_ratio: u64,
}

impl IdentifyEvent {
    pub fn new(context: Context) -> Self {
        Self {
            creation_date: now_millis(),
            context,
            sampling_ratio: 1,
        }
    }
}

/// Application-defined event, optionally carrying data and a metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub creation_date: u64,
    pub key: String,
    pub context: Context,
    pub data: Value,
    pub metric_value: Option<f64>,
    pub sampling_ratio: u64,
}

impl CustomEvent {
    pub fn new(key: &str, context: Context) -> Self {
        Self {
            creation_date: now_millis(),
            key: key.to_string(),
            context,
            data: Value::Null,
            metric_value: None,
            sampling_ratio: 1,
        }
    }
}

/// Generated by the processor the first time a context is seen within a
/// deduplication window.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEvent {
    pub creation_date: u64,
    pub context: Context,
}

/// Which side of a migration a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvokedMeasurement {
    pub old: bool,
    pub new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyMeasurement {
    pub consistent: bool,
    pub sampling_ratio: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyMeasurement {
    pub old_ms: Option<u64>,
    pub new_ms: Option<u64>,
}

impl LatencyMeasurement {
    pub fn has_measurement(&self) -> bool {
        self.old_ms.is_some() || self.new_ms.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorMeasurement {
    pub old: bool,
    pub new: bool,
}

impl ErrorMeasurement {
    pub fn has_measurement(&self) -> bool {
        self.old || self.new
    }
}

/// Comparative measurements for one operation of a migration between an
/// old and a new code path.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOpEvent {
    pub creation_date: u64,
    pub context: Context,
    /// `read` or `write`.
    pub operation: String,
    pub sampling_ratio: u64,
    pub flag_key: String,
    pub flag_version: Option<u64>,
    pub variation: Option<u32>,
    pub value: Value,
    pub default: Value,
    pub reason: Option<Value>,
    pub invoked: InvokedMeasurement,
    pub consistency: Option<ConsistencyMeasurement>,
    pub latency: Option<LatencyMeasurement>,
    pub error: Option<ErrorMeasurement>,
}

impl MigrationOpEvent {
    pub fn new(flag_key: &str, context: Context, operation: &str) -> Self {
        Self {
            creation_date: now_millis(),
            context,
            operation: operation.to_string(),
            sampling_ratio: 1,
            flag_key: flag_key.to_string(),
            flag_version: None,
            variation: None,
            value: Value::Null,
            default: Value::Null,
            reason: None,
            invoked: InvokedMeasurement::default(),
            consistency: None,
            latency: None,
            error: None,
        }
    }
}
