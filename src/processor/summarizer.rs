use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::event::FeatureRequestEvent;

/// Count and representative value for one (flag, version, variation).
#[derive(Debug, Clone, PartialEq)]
pub struct CounterValue {
    pub count: u64,
    pub value: Value,
}

/// Aggregated evaluations of a single flag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlagInfo {
    pub default: Value,
    pub context_kinds: BTreeSet<String>,
    /// version -> variation -> counter. `None` version means the flag was
    /// unknown; `None` variation means the default was served.
    pub counters: BTreeMap<Option<u64>, BTreeMap<Option<u32>, CounterValue>>,
}

/// Snapshot of all evaluation counters between two flushes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventSummary {
    pub start_date: u64,
    pub end_date: u64,
    pub features: BTreeMap<String, FlagInfo>,
}

impl EventSummary {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Total number of counted evaluations.
    pub fn total_count(&self) -> u64 {
        self.features
            .values()
            .flat_map(|f| f.counters.values())
            .flat_map(|v| v.values())
            .map(|c| c.count)
            .sum()
    }

    /// Merges `other` into this summary, widening the time window and adding
    /// counts. Representative values and defaults already present win.
    pub fn merge(&mut self, other: EventSummary) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        self.start_date = self.start_date.min(other.start_date);
        self.end_date = self.end_date.max(other.end_date);

        for (key, info) in other.features {
            let dst = self.features.entry(key).or_insert_with(|| FlagInfo {
                default: info.default.clone(),
                ..Default::default()
            });
            dst.context_kinds.extend(info.context_kinds);
            for (version, variations) in info.counters {
                let dst_variations = dst.counters.entry(version).or_default();
                for (variation, counter) in variations {
                    dst_variations
                        .entry(variation)
                        .and_modify(|c| c.count += counter.count)
                        .or_insert(counter);
                }
            }
        }
    }
}

/// Accumulates per-flag evaluation counters between flush cycles.
#[derive(Debug, Default)]
pub struct EventSummarizer {
    summary: EventSummary,
}

impl EventSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one evaluation.
    pub fn summarize_event(&mut self, event: &FeatureRequestEvent) {
        let summary = &mut self.summary;
        let flag = summary
            .features
            .entry(event.key.clone())
            .or_insert_with(|| FlagInfo {
                default: event.default.clone(),
                ..Default::default()
            });
        for kind in event.context.kinds() {
            if !flag.context_kinds.contains(kind) {
                flag.context_kinds.insert(kind.to_string());
            }
        }
        flag.counters
            .entry(event.version)
            .or_default()
            .entry(event.variation)
            .and_modify(|c| c.count += 1)
            .or_insert_with(|| CounterValue {
                count: 1,
                value: event.value.clone(),
            });

        let ts = event.creation_date;
        if summary.start_date == 0 || ts < summary.start_date {
            summary.start_date = ts;
        }
        if ts > summary.end_date {
            summary.end_date = ts;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }

    /// Returns the accumulated summary and starts a fresh one.
    pub fn get_summary_and_reset(&mut self) -> EventSummary {
        std::mem::take(&mut self.summary)
    }

    /// Puts a previously taken summary back, merging it with anything
    /// counted since it was taken.
    pub fn restore_to(&mut self, previous: EventSummary) {
        self.summary.merge(previous);
    }
}
