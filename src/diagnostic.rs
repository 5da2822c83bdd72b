use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::event::now_millis;

/// Identifies one SDK instance across its diagnostic events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticId {
    pub diagnostic_id: String,
    pub sdk_key_suffix: String,
}

impl DiagnosticId {
    /// Creates a fresh random ID. Only the last six characters of the SDK
    /// key are kept.
    pub fn new(sdk_key: &str) -> Self {
        let skip = sdk_key.chars().count().saturating_sub(6);
        Self {
            diagnostic_id: uuid::Uuid::new_v4().to_string(),
            sdk_key_suffix: sdk_key.chars().skip(skip).collect(),
        }
    }
}

/// A single streaming-connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInit {
    pub timestamp: u64,
    pub duration_millis: u64,
    pub failed: bool,
}

/// Sent once at startup to describe the SDK, its configuration and host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticInitEvent {
    pub creation_date: u64,
    pub id: DiagnosticId,
    pub sdk: Value,
    pub configuration: Value,
    pub platform: Value,
}

/// Periodic health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticStatsEvent {
    pub creation_date: u64,
    pub id: DiagnosticId,
    pub data_since_date: u64,
    pub dropped_events: u64,
    pub deduplicated_users: u64,
    pub events_in_last_batch: u64,
    pub stream_inits: Vec<StreamInit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum DiagnosticEvent {
    #[serde(rename = "diagnostic-init")]
    Init(DiagnosticInitEvent),
    #[serde(rename = "diagnostic")]
    Statistics(DiagnosticStatsEvent),
}

impl DiagnosticEvent {
    pub fn is_init(&self) -> bool {
        matches!(self, Self::Init(_))
    }

    /// Serializes the event to its JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Configuration property names accepted in the init event, with the JSON
/// type each must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticConfigProperty {
    AllAttributesPrivate,
    BackgroundPollingDisabled,
    BackgroundPollingIntervalMillis,
    ConnectTimeoutMillis,
    CustomBaseUri,
    CustomEventsUri,
    CustomStreamUri,
    DataStoreType,
    DiagnosticRecordingIntervalMillis,
    EvaluationReasonsRequested,
    EventsCapacity,
    EventsFlushIntervalMillis,
    MaxCachedUsers,
    Offline,
    PollingIntervalMillis,
    ReconnectTimeMillis,
    SocketTimeoutMillis,
    StartWaitMillis,
    StreamingDisabled,
    UserKeysCapacity,
    UserKeysFlushIntervalMillis,
    UseReport,
    UsingProxy,
    UsingProxyAuthenticator,
    UsingRelayDaemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonKind {
    Bool,
    Number,
    String,
}

impl DiagnosticConfigProperty {
    const ALL: [Self; 25] = [
        Self::AllAttributesPrivate,
        Self::BackgroundPollingDisabled,
        Self::BackgroundPollingIntervalMillis,
        Self::ConnectTimeoutMillis,
        Self::CustomBaseUri,
        Self::CustomEventsUri,
        Self::CustomStreamUri,
        Self::DataStoreType,
        Self::DiagnosticRecordingIntervalMillis,
        Self::EvaluationReasonsRequested,
        Self::EventsCapacity,
        Self::EventsFlushIntervalMillis,
        Self::MaxCachedUsers,
        Self::Offline,
        Self::PollingIntervalMillis,
        Self::ReconnectTimeMillis,
        Self::SocketTimeoutMillis,
        Self::StartWaitMillis,
        Self::StreamingDisabled,
        Self::UserKeysCapacity,
        Self::UserKeysFlushIntervalMillis,
        Self::UseReport,
        Self::UsingProxy,
        Self::UsingProxyAuthenticator,
        Self::UsingRelayDaemon,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllAttributesPrivate => "allAttributesPrivate",
            Self::BackgroundPollingDisabled => "backgroundPollingDisabled",
            Self::BackgroundPollingIntervalMillis => "backgroundPollingIntervalMillis",
            Self::ConnectTimeoutMillis => "connectTimeoutMillis",
            Self::CustomBaseUri => "customBaseURI",
            Self::CustomEventsUri => "customEventsURI",
            Self::CustomStreamUri => "customStreamURI",
            Self::DataStoreType => "dataStoreType",
            Self::DiagnosticRecordingIntervalMillis => "diagnosticRecordingIntervalMillis",
            Self::EvaluationReasonsRequested => "evaluationReasonsRequested",
            Self::EventsCapacity => "eventsCapacity",
            Self::EventsFlushIntervalMillis => "eventsFlushIntervalMillis",
            Self::MaxCachedUsers => "maxCachedUsers",
            Self::Offline => "offline",
            Self::PollingIntervalMillis => "pollingIntervalMillis",
            Self::ReconnectTimeMillis => "reconnectTimeMillis",
            Self::SocketTimeoutMillis => "socketTimeoutMillis",
            Self::StartWaitMillis => "startWaitMillis",
            Self::StreamingDisabled => "streamingDisabled",
            Self::UserKeysCapacity => "userKeysCapacity",
            Self::UserKeysFlushIntervalMillis => "userKeysFlushIntervalMillis",
            Self::UseReport => "useReport",
            Self::UsingProxy => "usingProxy",
            Self::UsingProxyAuthenticator => "usingProxyAuthenticator",
            Self::UsingRelayDaemon => "usingRelayDaemon",
        }
    }

    /// Looks up a property by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    fn kind(self) -> JsonKind {
        match self {
            Self::DataStoreType => JsonKind::String,
            Self::BackgroundPollingIntervalMillis
            | Self::ConnectTimeoutMillis
            | Self::DiagnosticRecordingIntervalMillis
            | Self::EventsCapacity
            | Self::EventsFlushIntervalMillis
            | Self::MaxCachedUsers
            | Self::PollingIntervalMillis
            | Self::ReconnectTimeMillis
            | Self::SocketTimeoutMillis
            | Self::StartWaitMillis
            | Self::UserKeysCapacity
            | Self::UserKeysFlushIntervalMillis => JsonKind::Number,
            _ => JsonKind::Bool,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self.kind() {
            JsonKind::Bool => value.is_boolean(),
            JsonKind::Number => value.is_number(),
            JsonKind::String => value.is_string(),
        }
    }
}

/// Static SDK description used to build the init event.
#[derive(Debug, Clone, Default)]
pub struct SdkDiagnosticParams {
    pub sdk_key: String,
    pub sdk_name: String,
    pub sdk_version: String,
    pub platform_name: String,
    /// Extra properties merged into the `platform` object.
    pub extra_platform_data: Option<Map<String, Value>>,
    /// Wrapper library in `Name` or `Name/Version` form.
    pub wrapper: Option<String>,
    /// JSON objects merged into the `configuration` object.
    pub config_properties: Vec<Value>,
}

#[derive(Debug)]
struct StoreState {
    data_since_date: u64,
    stream_inits: Vec<StreamInit>,
    events_in_last_batch: u64,
}

/// Accumulates diagnostic statistics between periodic diagnostic events.
///
/// Shared between the event dispatcher and whatever component records
/// stream connection attempts.
#[derive(Debug)]
pub struct DiagnosticStore {
    id: DiagnosticId,
    creation_date: u64,
    sdk: Value,
    configuration: Value,
    platform: Value,
    state: Mutex<StoreState>,
}

impl DiagnosticStore {
    pub fn new(params: SdkDiagnosticParams) -> Self {
        let now = now_millis();
        Self {
            id: DiagnosticId::new(&params.sdk_key),
            creation_date: now,
            sdk: sdk_data(&params),
            configuration: config_data(&params.config_properties),
            platform: platform_data(&params),
            state: Mutex::new(StoreState {
                data_since_date: now,
                stream_inits: Vec::new(),
                events_in_last_batch: 0,
            }),
        }
    }

    pub fn diagnostic_id(&self) -> &DiagnosticId {
        &self.id
    }

    pub fn data_since_date(&self) -> u64 {
        self.state.lock().data_since_date
    }

    pub fn init_event(&self) -> DiagnosticEvent {
        DiagnosticEvent::Init(DiagnosticInitEvent {
            creation_date: self.creation_date,
            id: self.id.clone(),
            sdk: self.sdk.clone(),
            configuration: self.configuration.clone(),
            platform: self.platform.clone(),
        })
    }

    pub fn record_stream_init(&self, timestamp: u64, duration_millis: u64, failed: bool) {
        self.state.lock().stream_inits.push(StreamInit {
            timestamp,
            duration_millis,
            failed,
        });
    }

    pub fn record_events_in_batch(&self, count: u64) {
        self.state.lock().events_in_last_batch = count;
    }

    /// Builds a statistics event covering everything since the previous one
    /// and starts a new collection period.
    pub fn create_event_and_reset(&self, dropped_events: u64, deduplicated_users: u64) -> DiagnosticEvent {
        let now = now_millis();
        let mut state = self.state.lock();
        let event = DiagnosticStatsEvent {
            creation_date: now,
            id: self.id.clone(),
            data_since_date: state.data_since_date,
            dropped_events,
            deduplicated_users,
            events_in_last_batch: state.events_in_last_batch,
            stream_inits: std::mem::take(&mut state.stream_inits),
        };
        state.data_since_date = now;
        state.events_in_last_batch = 0;
        DiagnosticEvent::Statistics(event)
    }
}

fn sdk_data(params: &SdkDiagnosticParams) -> Value {
    let mut sdk = Map::new();
    sdk.insert("name".into(), Value::from(params.sdk_name.as_str()));
    sdk.insert("version".into(), Value::from(params.sdk_version.as_str()));
    if let Some(wrapper) = params.wrapper.as_deref().filter(|w| !w.is_empty()) {
        let (name, version) = match wrapper.split_once('/') {
            Some((name, version)) => (name, Some(version)),
            None => (wrapper, None),
        };
        sdk.insert("wrapperName".into(), Value::from(name));
        if let Some(version) = version {
            sdk.insert("wrapperVersion".into(), Value::from(version));
        }
    }
    Value::Object(sdk)
}

fn platform_data(params: &SdkDiagnosticParams) -> Value {
    let mut platform = Map::new();
    platform.insert("name".into(), Value::from(params.platform_name.as_str()));
    platform.insert("osArch".into(), Value::from(std::env::consts::ARCH));
    platform.insert("osName".into(), Value::from(std::env::consts::OS));
    if let Some(extra) = &params.extra_platform_data {
        for (k, v) in extra {
            platform.insert(k.clone(), v.clone());
        }
    }
    Value::Object(platform)
}

fn config_data(properties: &[Value]) -> Value {
    let mut config = Map::new();
    for props in properties.iter().filter_map(Value::as_object) {
        for (name, value) in props {
            match DiagnosticConfigProperty::from_name(name) {
                Some(prop) if prop.accepts(value) => {
                    config.insert(name.clone(), value.clone());
                }
                _ => {}
            }
        }
    }
    Value::Object(config)
}
