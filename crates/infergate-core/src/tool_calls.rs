//! Canonicalization and repair of backend tool-call payloads.
//!
//! Backends emit tool calls either in the standard nested shape
//! (`{id, type, function: {name, arguments}}`) or in a flattened shorthand
//! (`{name, arguments}`), with arguments encoded as JSON text, as an
//! already-structured value, or not at all. Everything here degrades
//! locally: a bad call is dropped or its arguments wrapped, and the issue
//! is reported through [`ToolCallMetrics`].

use infergate_contracts::{TOOL_CALL_TYPE, ToolCall};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::metrics::{ToolCallMetrics, action, stage};

const SEARCH_TOOL: &str = "search_files";
const LIST_TOOL: &str = "list_files";

pub fn generate_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..16])
}

/// True when `text` is, by itself, a complete JSON object. Backends that
/// resend the full argument object on every chunk are detected with this.
pub fn looks_like_complete_json_object(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && serde_json::from_str::<Value>(trimmed).is_ok_and(|value| value.is_object())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallShape {
    Standard,
    Shorthand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawArguments {
    Text(String),
    /// An object or array sent as-is instead of JSON text.
    Structured(Value),
    /// A number or boolean.
    Scalar(Value),
    Missing,
}

impl RawArguments {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Missing,
            Some(Value::String(text)) => Self::Text(text.clone()),
            Some(value @ (Value::Object(_) | Value::Array(_))) => Self::Structured(value.clone()),
            Some(value) => Self::Scalar(value.clone()),
        }
    }
}

/// One backend tool call, decoded but not yet repaired.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub shape: ToolCallShape,
    pub id: Option<String>,
    pub index: Option<u32>,
    pub name: Option<String>,
    pub arguments: RawArguments,
}

impl RawToolCall {
    /// Returns `None` for anything that is not a JSON object.
    pub fn from_value(call: &Value) -> Option<Self> {
        let fields = call.as_object()?;
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string);
        let index = fields.get("index").and_then(Value::as_u64).and_then(|i| u32::try_from(i).ok());
        let top_name = fields.get("name").and_then(Value::as_str).map(str::to_string);
        let top_arguments = fields.get("arguments");

        let (shape, name, arguments) = match fields.get("function") {
            None | Some(Value::Null) => (ToolCallShape::Shorthand, top_name, top_arguments),
            Some(Value::Object(function)) => (
                ToolCallShape::Standard,
                function.get("name").and_then(Value::as_str).map(str::to_string),
                function.get("arguments"),
            ),
            Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(function)) => {
                    let name = function.get("name").and_then(Value::as_str).map(str::to_string);
                    let arguments = RawArguments::from_value(function.get("arguments"));
                    return Some(Self { shape: ToolCallShape::Standard, id, index, name, arguments });
                }
                _ => (ToolCallShape::Standard, Some(text.clone()), top_arguments),
            },
            Some(other) => (ToolCallShape::Standard, Some(other.to_string()), top_arguments),
        };

        Some(Self { shape, id, index, name, arguments: RawArguments::from_value(arguments) })
    }
}

/// A call with a definite id and index whose arguments are JSON text,
/// partial text (streaming), or absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedToolCall {
    pub id: String,
    pub index: u32,
    pub name: String,
    pub arguments: Option<String>,
    pub explicit_empty: bool,
}

/// Decodes and canonicalizes a list of backend tool calls. In `partial`
/// mode (streaming fragments) argument text that does not parse is kept
/// as-is so it can be completed by later fragments.
pub fn normalize_tool_calls(
    calls: &Value,
    partial: bool,
    metrics: &ToolCallMetrics,
) -> Vec<NormalizedToolCall> {
    let Some(items) = calls.as_array() else {
        return Vec::new();
    };

    let mut normalized = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let Some(raw) = RawToolCall::from_value(item) else {
            metrics.malformed(stage::NORMALIZE, "call_not_dict");
            continue;
        };

        let mut explicit_empty = false;
        let arguments = match raw.arguments {
            RawArguments::Text(text) if text.trim().is_empty() => {
                explicit_empty = true;
                Some(String::new())
            }
            RawArguments::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => {
                    explicit_empty = parsed.as_object().is_some_and(Map::is_empty);
                    Some(text)
                }
                Err(_) if partial => Some(text),
                Err(_) => {
                    metrics.fallback(stage::NORMALIZE, action::WRAPPED_INPUT);
                    Some(json!({ "input": text }).to_string())
                }
            },
            RawArguments::Structured(value) => Some(value.to_string()),
            RawArguments::Scalar(value) if partial => Some(value.to_string()),
            RawArguments::Scalar(value) => {
                metrics.fallback(stage::NORMALIZE, action::WRAPPED_INPUT);
                Some(json!({ "input": value.to_string() }).to_string())
            }
            RawArguments::Missing => None,
        };

        normalized.push(NormalizedToolCall {
            id: raw.id.unwrap_or_else(generate_call_id),
            index: raw.index.unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX)),
            name: raw.name.unwrap_or_default(),
            arguments,
            explicit_empty,
        });
    }
    normalized
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolvedArguments {
    Object { arguments: Map<String, Value>, wrapped: bool },
    Missing,
    Invalid,
}

/// Turns argument text into the object that will be emitted.
pub(crate) fn resolve_arguments(text: Option<&str>, explicit_empty: bool) -> ResolvedArguments {
    let Some(text) = text.filter(|text| !text.trim().is_empty()) else {
        return if explicit_empty {
            ResolvedArguments::Object { arguments: Map::new(), wrapped: false }
        } else {
            ResolvedArguments::Missing
        };
    };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(arguments)) => ResolvedArguments::Object { arguments, wrapped: false },
        Ok(other) => {
            let mut arguments = Map::new();
            arguments.insert("input".to_string(), other);
            ResolvedArguments::Object { arguments, wrapped: true }
        }
        Err(_) => ResolvedArguments::Invalid,
    }
}

/// Fills in missing parameters of the built-in file tools. Returns whether
/// anything was inserted.
fn inject_defaults(name: &str, arguments: &mut Map<String, Value>) -> bool {
    let defaults = match name {
        SEARCH_TOOL => vec![("path", json!(".")), ("regex", json!(".*")), ("file_pattern", json!("*.*"))],
        LIST_TOOL => vec![("path", json!(".")), ("recursive", json!(false))],
        _ => return false,
    };
    let mut applied = false;
    for (key, value) in defaults {
        if !arguments.contains_key(key) {
            arguments.insert(key.to_string(), value);
            applied = true;
        }
    }
    applied
}

/// Final repair of a complete tool-call list: every surviving call has a
/// name and an object encoded as JSON text for arguments.
pub fn fix_tool_calls(calls: &Value, metrics: &ToolCallMetrics) -> Vec<ToolCall> {
    let mut fixed = Vec::new();
    for call in normalize_tool_calls(calls, false, metrics) {
        if call.name.trim().is_empty() {
            metrics.malformed(stage::NORMALIZE, "missing_name");
            continue;
        }

        let mut arguments =
            match resolve_arguments(call.arguments.as_deref(), call.explicit_empty) {
                ResolvedArguments::Object { arguments, wrapped } => {
                    if wrapped {
                        metrics.fallback(stage::NORMALIZE, action::WRAPPED_INPUT);
                    }
                    arguments
                }
                ResolvedArguments::Missing | ResolvedArguments::Invalid => {
                    metrics.malformed(stage::NORMALIZE, "arguments_invalid");
                    metrics.fallback(stage::NORMALIZE, action::DROP_TOOL_CALL);
                    continue;
                }
            };

        if !call.explicit_empty && inject_defaults(&call.name, &mut arguments) {
            metrics.fallback(stage::NORMALIZE, action::DEFAULTS_APPLIED);
        }

        fixed.push(ToolCall::function(
            call.id,
            call.index,
            call.name,
            Value::Object(arguments).to_string(),
        ));
    }
    fixed
}

/// Checks a tool-call list right before it reaches the client. Every
/// violation is counted; the caller drops the whole list on `false`.
pub fn validate_tool_calls(
    calls: &[ToolCall],
    stage: &'static str,
    require_object: bool,
    metrics: &ToolCallMetrics,
) -> bool {
    if calls.is_empty() {
        metrics.malformed(stage, "not_list_or_empty");
        return false;
    }

    let mut valid = true;
    for call in calls {
        if call.id.trim().is_empty() {
            valid = false;
            metrics.malformed(stage, "missing_id");
        }
        if call.kind != TOOL_CALL_TYPE {
            valid = false;
            metrics.malformed_with(stage, "invalid_type", &call.kind);
        }
        if call.function.name.trim().is_empty() {
            valid = false;
            metrics.malformed(stage, "missing_name");
        }
        match serde_json::from_str::<Value>(&call.function.arguments) {
            Err(_) => {
                valid = false;
                metrics.malformed(stage, "arguments_not_json");
            }
            Ok(parsed) if require_object && !parsed.is_object() => {
                valid = false;
                metrics.malformed(stage, "arguments_not_object");
            }
            Ok(_) => {}
        }
    }
    valid
}
