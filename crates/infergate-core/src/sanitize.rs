use infergate_contracts::ChatMessage;
use serde_json::{Map, Value, json};
use tracing::info;

pub const DEFAULT_MAX_TOKENS: u32 = 2048;

const ALWAYS_BLOCKED: [&str; 2] = ["strict", "response_format"];
const TOOL_KEYS: [&str; 4] = ["tools", "tool_choice", "functions", "function_call"];
const MAX_TOKENS_ALIASES: [&str; 2] = ["max_output_tokens", "max_completion_tokens"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeOptions {
    pub allow_tools: bool,
    pub force_stream: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self { allow_tools: true, force_stream: true }
    }
}

/// A chat request in the shape that is forwarded to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    /// Every other field the client sent that survived sanitization.
    pub body: Map<String, Value>,
}

impl SanitizedRequest {
    pub fn into_payload(self) -> Value {
        let mut body = self.body;
        body.insert("model".to_string(), Value::String(self.model));
        body.insert("messages".to_string(), json!(self.messages));
        body.insert("max_tokens".to_string(), json!(self.max_tokens));
        if self.stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }
}

/// Flattens message or delta content to plain text. Strings pass through,
/// lists keep only their text parts, null becomes empty.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.clone()),
                Value::Object(fields) if fields.get("type").and_then(Value::as_str) == Some("text") => {
                    Some(match fields.get("text") {
                        Some(Value::String(text)) => text.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    })
                }
                _ => None,
            })
            .collect(),
        other => other.to_string(),
    }
}

/// Keeps only messages that carry a role, flattening their content.
pub fn normalize_messages(messages: &Value) -> Vec<ChatMessage> {
    let Some(items) = messages.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|message| {
            let role = message.get("role")?.as_str().filter(|role| !role.is_empty())?;
            let content = message.get("content").map(content_text).unwrap_or_default();
            Some(ChatMessage { role: role.to_string(), content })
        })
        .collect()
}

/// Lenient integer coercion for completion limits. Absent, boolean,
/// blank and non-numeric values fall back to the default; anything
/// below one is clamped to one.
pub fn coerce_max_tokens(value: Option<&Value>) -> u32 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) if !text.trim().is_empty() => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed.filter(|number| number.is_finite()).map(f64::trunc) {
        None => DEFAULT_MAX_TOKENS,
        Some(number) if number < 1.0 => 1,
        Some(number) if number >= f64::from(u32::MAX) => u32::MAX,
        Some(number) => number as u32,
    }
}

/// Reduces stream options to the one recognized key.
pub fn sanitize_stream_options(options: Option<&Value>) -> Option<Value> {
    let include_usage = options?.get("include_usage")?.as_bool()?;
    Some(json!({ "include_usage": include_usage }))
}

pub fn accepts_event_stream(accept: Option<&str>) -> bool {
    accept.is_some_and(|accept| accept.contains("text/event-stream"))
}

pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
    }
}

pub fn sanitize_request(
    model: &str,
    mut body: Map<String, Value>,
    accepts_event_stream: bool,
    options: SanitizeOptions,
) -> SanitizedRequest {
    for key in ALWAYS_BLOCKED {
        body.remove(key);
    }
    if !options.allow_tools {
        for key in TOOL_KEYS {
            body.remove(key);
        }
    }

    if !body.contains_key("max_tokens")
        && let Some(alias) = MAX_TOKENS_ALIASES.iter().find_map(|key| body.get(*key).cloned())
    {
        body.insert("max_tokens".to_string(), alias);
    }
    for key in MAX_TOKENS_ALIASES {
        body.remove(key);
    }
    let requested_max_tokens = body.remove("max_tokens");
    let max_tokens = coerce_max_tokens(requested_max_tokens.as_ref());
    if requested_max_tokens.as_ref().and_then(Value::as_u64) != Some(u64::from(max_tokens)) {
        info!(
            event = "request.max_tokens.normalized",
            from = ?requested_max_tokens,
            to = max_tokens,
            "normalized max_tokens"
        );
    }

    let messages = body.remove("messages").map(|raw| normalize_messages(&raw)).unwrap_or_default();

    let requested_stream = truthy(body.get("stream"));
    let stream = requested_stream && (accepts_event_stream || options.force_stream);
    if requested_stream && !accepts_event_stream {
        info!(
            event = "request.stream.negotiated",
            forced = options.force_stream,
            "client did not accept text/event-stream"
        );
    }
    body.remove("stream");
    let stream_options = body.remove("stream_options");
    if stream && let Some(reduced) = sanitize_stream_options(stream_options.as_ref()) {
        body.insert("stream_options".to_string(), reduced);
    }

    SanitizedRequest { model: model.to_string(), messages, max_tokens, stream, body }
}
