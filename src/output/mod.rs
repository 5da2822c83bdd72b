pub mod context;

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::EventsConfig;
use crate::event::{Context, CustomEvent, Event, FeatureRequestEvent, MigrationOpEvent};
use crate::processor::summarizer::EventSummary;

pub use context::ContextFormatter;

fn non_null(v: &Value) -> Option<&Value> {
    (!v.is_null()).then_some(v)
}

fn is_one(v: &u64) -> bool {
    *v == 1
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeatureJson<'a> {
    kind: &'static str,
    creation_date: u64,
    key: &'a str,
    context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prereq_of: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a Value>,
}

/// Shared shape of `identify` and `index` events.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextJson {
    kind: &'static str,
    creation_date: u64,
    context: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CustomJson<'a> {
    kind: &'static str,
    creation_date: u64,
    key: &'a str,
    context_keys: BTreeMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_value: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationEvaluationJson<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationOpJson<'a> {
    kind: &'static str,
    creation_date: u64,
    context_keys: BTreeMap<&'a str, &'a str>,
    operation: &'a str,
    #[serde(skip_serializing_if = "is_one")]
    sampling_ratio: u64,
    evaluation: MigrationEvaluationJson<'a>,
    measurements: Vec<Value>,
}

#[derive(Serialize)]
struct CounterJson<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unknown: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
    count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagSummaryJson<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<&'a Value>,
    context_kinds: Vec<&'a str>,
    counters: Vec<CounterJson<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryJson<'a> {
    kind: &'static str,
    start_date: u64,
    end_date: u64,
    features: BTreeMap<&'a str, FlagSummaryJson<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OutputEvent<'a> {
    Feature(FeatureJson<'a>),
    Context(ContextJson),
    Custom(CustomJson<'a>),
    MigrationOp(MigrationOpJson<'a>),
    Summary(SummaryJson<'a>),
}

/// Turns buffered events and a summary into the JSON array sent to the
/// analytics endpoint.
#[derive(Debug, Clone)]
pub struct EventOutputFormatter {
    contexts: ContextFormatter,
}

impl EventOutputFormatter {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            contexts: ContextFormatter::new(
                config.all_attributes_private,
                config.private_attribute_refs(),
            ),
        }
    }

    /// Serializes `events` plus a summary event (if the summary is
    /// non-empty). Returns the bytes and the number of events written.
    /// Events whose context is invalid are skipped.
    pub fn format(&self, events: &[Event], summary: &EventSummary) -> Result<(Vec<u8>, usize)> {
        let mut out: Vec<OutputEvent<'_>> = events
            .iter()
            .filter(|e| e.context().is_valid())
            .map(|e| self.output_event(e))
            .collect();
        if !summary.is_empty() {
            out.push(OutputEvent::Summary(summary_json(summary)));
        }
        let bytes = serde_json::to_vec(&out).context("serializing analytics events")?;
        Ok((bytes, out.len()))
    }

    fn output_event<'a>(&self, event: &'a Event) -> OutputEvent<'a> {
        match event {
            Event::FeatureRequest(fe) => OutputEvent::Feature(self.feature_json(fe)),
            Event::Identify(e) => OutputEvent::Context(ContextJson {
                kind: "identify",
                creation_date: e.creation_date,
                context: self.contexts.format(&e.context, false),
            }),
            Event::Index(e) => OutputEvent::Context(ContextJson {
                kind: "index",
                creation_date: e.creation_date,
                context: self.contexts.format(&e.context, false),
            }),
            Event::Custom(ce) => OutputEvent::Custom(custom_json(ce)),
            Event::MigrationOp(me) => OutputEvent::MigrationOp(migration_json(me)),
        }
    }

    fn feature_json<'a>(&self, fe: &'a FeatureRequestEvent) -> FeatureJson<'a> {
        FeatureJson {
            kind: if fe.debug { "debug" } else { "feature" },
            creation_date: fe.creation_date,
            key: &fe.key,
            context: self.contexts.format(&fe.context, !fe.debug),
            version: fe.version,
            variation: fe.variation,
            value: non_null(&fe.value),
            default: non_null(&fe.default),
            prereq_of: fe.prereq_of.as_deref(),
            reason: fe.reason.as_ref(),
        }
    }
}

fn context_keys(context: &Context) -> BTreeMap<&str, &str> {
    context
        .individual_contexts()
        .iter()
        .map(|c| (c.kind(), c.key()))
        .collect()
}

fn custom_json(ce: &CustomEvent) -> CustomJson<'_> {
    CustomJson {
        kind: "custom",
        creation_date: ce.creation_date,
        key: &ce.key,
        context_keys: context_keys(&ce.context),
        data: non_null(&ce.data),
        metric_value: ce.metric_value,
    }
}

fn migration_json(me: &MigrationOpEvent) -> MigrationOpJson<'_> {
    let mut measurements = Vec::with_capacity(4);

    let mut invoked = Map::new();
    if me.invoked.old {
        invoked.insert("old".into(), Value::Bool(true));
    }
    if me.invoked.new {
        invoked.insert("new".into(), Value::Bool(true));
    }
    measurements.push(json!({"key": "invoked", "values": invoked}));

    if let Some(c) = &me.consistency {
        let mut m = json!({"key": "consistent", "value": c.consistent});
        if c.sampling_ratio != 1 {
            m["samplingRatio"] = Value::from(c.sampling_ratio);
        }
        measurements.push(m);
    }

    if let Some(l) = me.latency.filter(|l| l.has_measurement()) {
        let mut values = Map::new();
        if let Some(old) = l.old_ms {
            values.insert("old".into(), Value::from(old));
        }
        if let Some(new) = l.new_ms {
            values.insert("new".into(), Value::from(new));
        }
        measurements.push(json!({"key": "latency_ms", "values": values}));
    }

    if let Some(e) = me.error.filter(|e| e.has_measurement()) {
        let mut values = Map::new();
        if e.old {
            values.insert("old".into(), Value::Bool(true));
        }
        if e.new {
            values.insert("new".into(), Value::Bool(true));
        }
        measurements.push(json!({"key": "error", "values": values}));
    }

    MigrationOpJson {
        kind: "migration_op",
        creation_date: me.creation_date,
        context_keys: context_keys(&me.context),
        operation: &me.operation,
        sampling_ratio: me.sampling_ratio,
        evaluation: MigrationEvaluationJson {
            key: &me.flag_key,
            variation: me.variation,
            version: me.flag_version,
            value: non_null(&me.value),
            default: non_null(&me.default),
            reason: me.reason.as_ref(),
        },
        measurements,
    }
}

fn summary_json(summary: &EventSummary) -> SummaryJson<'_> {
    let features = summary
        .features
        .iter()
        .map(|(key, flag)| {
            let counters = flag
                .counters
                .iter()
                .flat_map(|(version, variations)| {
                    variations.iter().map(move |(variation, counter)| CounterJson {
                        variation: *variation,
                        version: *version,
                        unknown: version.is_none().then_some(true),
                        value: non_null(&counter.value),
                        count: counter.count,
                    })
                })
                .collect();
            let info = FlagSummaryJson {
                default: non_null(&flag.default),
                context_kinds: flag.context_kinds.iter().map(String::as_str).collect(),
                counters,
            };
            (key.as_str(), info)
        })
        .collect();

    SummaryJson {
        kind: "summary",
        start_date: summary.start_date,
        end_date: summary.end_date,
        features,
    }
}
