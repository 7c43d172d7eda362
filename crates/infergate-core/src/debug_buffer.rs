use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use serde::Serialize;
use serde_json::Value;

use crate::model::now_ms;

pub const DEFAULT_DEBUG_CAPACITY: usize = 200;

pub mod source {
    pub const STREAM_CHUNK: &str = "stream_chunk";
    pub const NON_STREAM_RESPONSE: &str = "non_stream_response";
}

/// How the tool calls in one raw payload were encoded.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct FormatCensus {
    pub total: u32,
    pub args_string: u32,
    pub args_object: u32,
    pub args_other: u32,
    pub shorthand: u32,
}

impl FormatCensus {
    pub fn of(payload: &Value) -> Self {
        let mut census = Self::default();
        for call in payload.as_array().into_iter().flatten().filter(|call| call.is_object()) {
            census.total += 1;
            if call.get("function").is_none() && call.get("name").is_some_and(Value::is_string) {
                census.shorthand += 1;
                continue;
            }
            match call.get("function").filter(|f| f.is_object()).and_then(|f| f.get("arguments")) {
                Some(Value::String(_)) => census.args_string += 1,
                Some(Value::Object(_)) => census.args_object += 1,
                _ => census.args_other += 1,
            }
        }
        census
    }
}

/// True when any call uses the flattened shape or structured arguments.
pub fn uses_shorthand(payload: &Value) -> bool {
    payload.as_array().into_iter().flatten().any(|call| {
        let function = call.get("function");
        (function.is_none() && call.get("name").is_some_and(Value::is_string))
            || function.and_then(|f| f.get("arguments")).is_some_and(Value::is_object)
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DebugEntry {
    pub ts_ms: u64,
    pub source: &'static str,
    pub model: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub shorthand: bool,
    pub tool_call_format: FormatCensus,
}

/// Bounded FIFO of raw tool-call payloads; the oldest entry is evicted
/// once capacity is reached.
#[derive(Debug)]
pub struct ToolCallDebugBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<DebugEntry>>,
}

impl Default for ToolCallDebugBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUG_CAPACITY)
    }
}

impl ToolCallDebugBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, source: &'static str, model: &str, payload: &Value, raw: Option<&str>) {
        self.push(DebugEntry {
            ts_ms: now_ms(),
            source,
            model: model.to_string(),
            payload: payload.clone(),
            raw: raw.map(str::to_string),
            shorthand: uses_shorthand(payload),
            tool_call_format: FormatCensus::of(payload),
        });
    }

    pub fn push(&self, entry: DebugEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<DebugEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
