use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use serde::Serialize;
use tracing::{info, warn};

pub mod stage {
    pub const NORMALIZE: &str = "normalize";
    pub const STREAM_FINALIZE: &str = "stream_finalize";
    pub const STREAM_OUT: &str = "stream_out";
    pub const NON_STREAM_OUT: &str = "non_stream_out";
}

pub mod action {
    pub const WRAPPED_INPUT: &str = "wrapped_input";
    pub const DROP_TOOL_CALL: &str = "drop_tool_call";
    pub const DEFAULTS_APPLIED: &str = "defaults_applied";
    pub const EXPLICIT_EMPTY: &str = "explicit_empty";
    pub const DROP_INVALID: &str = "drop_invalid";
}

type CounterKey = (&'static str, &'static str);

/// Process-wide tool-call counters, labelled `{stage, reason}` for
/// malformed payloads and `{stage, action}` for repairs.
#[derive(Debug, Default)]
pub struct ToolCallMetrics {
    malformed: Mutex<BTreeMap<CounterKey, u64>>,
    fallback: Mutex<BTreeMap<CounterKey, u64>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CounterSample {
    pub stage: String,
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub malformed: Vec<CounterSample>,
    pub fallback: Vec<CounterSample>,
}

impl MetricsSnapshot {
    pub fn malformed_count(&self, stage: &str, reason: &str) -> u64 {
        find(&self.malformed, stage, reason)
    }

    pub fn fallback_count(&self, stage: &str, action: &str) -> u64 {
        find(&self.fallback, stage, action)
    }
}

fn find(samples: &[CounterSample], stage: &str, label: &str) -> u64 {
    samples
        .iter()
        .find(|sample| sample.stage == stage && sample.label == label)
        .map(|sample| sample.count)
        .unwrap_or(0)
}

fn bump(counters: &Mutex<BTreeMap<CounterKey, u64>>, key: CounterKey) {
    let mut counters = counters.lock().unwrap_or_else(PoisonError::into_inner);
    *counters.entry(key).or_default() += 1;
}

fn samples(counters: &Mutex<BTreeMap<CounterKey, u64>>) -> Vec<CounterSample> {
    let counters = counters.lock().unwrap_or_else(PoisonError::into_inner);
    counters
        .iter()
        .map(|((stage, label), count)| CounterSample {
            stage: (*stage).to_string(),
            label: (*label).to_string(),
            count: *count,
        })
        .collect()
}

impl ToolCallMetrics {
    pub fn malformed(&self, stage: &'static str, reason: &'static str) {
        warn!(event = "tool_call.malformed", stage, reason, "tool call issue");
        bump(&self.malformed, (stage, reason));
    }

    pub fn malformed_with(&self, stage: &'static str, reason: &'static str, detail: &str) {
        warn!(event = "tool_call.malformed", stage, reason, detail, "tool call issue");
        bump(&self.malformed, (stage, reason));
    }

    pub fn fallback(&self, stage: &'static str, action: &'static str) {
        info!(event = "tool_call.fallback", stage, action, "tool call repaired");
        bump(&self.fallback, (stage, action));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot { malformed: samples(&self.malformed), fallback: samples(&self.fallback) }
    }
}
