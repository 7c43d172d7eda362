use std::{collections::BTreeMap, sync::Arc};

use infergate_contracts::{
    CHAT_COMPLETION_CHUNK_OBJECT, ChatCompletionChunk, ChunkChoice, ChunkDelta, STREAM_TERMINATOR,
    ToolCall, Usage,
};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::{
    debug_buffer::{ToolCallDebugBuffer, source},
    metrics::{ToolCallMetrics, action, stage},
    sanitize::content_text,
    tool_calls::{
        ResolvedArguments, looks_like_complete_json_object, normalize_tool_calls,
        resolve_arguments, validate_tool_calls,
    },
};

const TOOL_CALLS_FINISH: &str = "tool_calls";

/// Tool call being assembled from streamed fragments for one index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallAccumulator {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub explicit_empty: bool,
}

impl ToolCallAccumulator {
    fn new(id: String) -> Self {
        Self { id, ..Self::default() }
    }

    fn merge_name(&mut self, fragment: &str) {
        if fragment.is_empty() || fragment == self.name {
            return;
        }
        if self.name.is_empty() || fragment.starts_with(self.name.as_str()) {
            self.name = fragment.to_string();
        } else {
            self.name.push_str(fragment);
        }
    }

    /// Some backends resend the whole argument object on each chunk; a
    /// self-contained object replaces the buffer, anything else extends it.
    fn merge_arguments(&mut self, fragment: &str) {
        if fragment.is_empty() {
            self.explicit_empty = true;
        } else if looks_like_complete_json_object(fragment) {
            self.arguments = fragment.trim().to_string();
        } else {
            self.arguments.push_str(fragment);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyStep {
    Skip,
    Chunk(ChatCompletionChunk),
    Done,
}

/// Rebuilds client chunks from one backend event stream, line by line.
pub struct StreamReassembler {
    model: String,
    fallback_id: String,
    metrics: Arc<ToolCallMetrics>,
    debug: Arc<ToolCallDebugBuffer>,
    accumulators: BTreeMap<u32, ToolCallAccumulator>,
    last_usage: Option<Usage>,
    usage_emitted: bool,
    terminated: bool,
}

impl StreamReassembler {
    pub fn new(model: &str, metrics: Arc<ToolCallMetrics>, debug: Arc<ToolCallDebugBuffer>) -> Self {
        Self {
            model: model.to_string(),
            fallback_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            metrics,
            debug,
            accumulators: BTreeMap::new(),
            last_usage: None,
            usage_emitted: false,
            terminated: false,
        }
    }

    /// Usage most recently reported by the backend, if any.
    pub fn usage(&self) -> Option<Usage> {
        self.last_usage
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.accumulators.len()
    }

    pub fn push_line(&mut self, line: &str) -> ReassemblyStep {
        if self.terminated {
            return ReassemblyStep::Skip;
        }
        let Some(data) = line.trim().strip_prefix("data:").map(str::trim) else {
            return ReassemblyStep::Skip;
        };
        if data == STREAM_TERMINATOR {
            self.terminated = true;
            return ReassemblyStep::Done;
        }
        let chunk = match serde_json::from_str::<Value>(data) {
            Ok(chunk @ Value::Object(_)) => chunk,
            _ => {
                debug!(event = "stream.chunk.undecodable", data, "skipping undecodable event");
                return ReassemblyStep::Skip;
            }
        };

        let carried_usage = chunk.get("usage").filter(|usage| usage.is_object()).map(Usage::from_value);
        if carried_usage.is_some() {
            self.last_usage = carried_usage;
        }

        let id = chunk.get("id").and_then(Value::as_str).unwrap_or(&self.fallback_id).to_string();
        let model = chunk.get("model").and_then(Value::as_str).unwrap_or(&self.model).to_string();
        let created = chunk.get("created").and_then(Value::as_i64);

        let choices = chunk.get("choices").and_then(Value::as_array).filter(|c| !c.is_empty());
        let Some(choices) = choices else {
            if let Some(usage) = self.last_usage.filter(|_| !self.usage_emitted) {
                self.usage_emitted = true;
                return ReassemblyStep::Chunk(ChatCompletionChunk {
                    id,
                    object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
                    created,
                    model,
                    choices: Vec::new(),
                    usage: Some(usage),
                });
            }
            return ReassemblyStep::Skip;
        };

        let mut out_choices = Vec::new();
        for choice in choices.iter().filter(|choice| choice.is_object()) {
            if let Some(out) = self.reassemble_choice(choice, &model, data) {
                out_choices.push(out);
            }
        }
        if out_choices.is_empty() {
            return ReassemblyStep::Skip;
        }

        let usage = carried_usage.filter(|_| !self.usage_emitted);
        if usage.is_some() {
            self.usage_emitted = true;
        }
        ReassemblyStep::Chunk(ChatCompletionChunk {
            id,
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created,
            model,
            choices: out_choices,
            usage,
        })
    }

    fn reassemble_choice(&mut self, choice: &Value, model: &str, raw: &str) -> Option<ChunkChoice> {
        let delta = choice.get("delta").filter(|delta| delta.is_object());
        let field = |name: &str| delta.and_then(|delta| delta.get(name)).filter(|v| !v.is_null());

        let content = field("content").map(content_text).filter(|text| !text.is_empty());
        let role = field("role").and_then(Value::as_str).map(str::to_string);
        let finish_reason = choice.get("finish_reason").and_then(Value::as_str).map(str::to_string);

        let mut fragments = 0;
        if let Some(tool_calls) = field("tool_calls") {
            self.debug.record(source::STREAM_CHUNK, model, tool_calls, Some(raw));
            let normalized = normalize_tool_calls(tool_calls, true, &self.metrics);
            fragments = normalized.len();
            for call in normalized {
                let accumulator = self
                    .accumulators
                    .entry(call.index)
                    .or_insert_with(|| ToolCallAccumulator::new(call.id.clone()));
                accumulator.merge_name(&call.name);
                if let Some(arguments) = call.arguments.as_deref() {
                    accumulator.merge_arguments(arguments);
                }
            }
        }

        let tool_activity = fragments > 0 || !self.accumulators.is_empty();
        if content.is_none() && role.is_none() && finish_reason.is_none() && !tool_activity {
            return None;
        }

        let mut delta = ChunkDelta { role, content, tool_calls: None };
        if finish_reason.as_deref() == Some(TOOL_CALLS_FINISH) && !self.accumulators.is_empty() {
            let finalized = self.finalize_tool_calls();
            if validate_tool_calls(&finalized, stage::STREAM_OUT, true, &self.metrics) {
                delta.tool_calls = Some(finalized);
            } else {
                self.metrics.fallback(stage::STREAM_OUT, action::DROP_INVALID);
            }
        }
        if delta.is_empty() && finish_reason.as_deref() == Some(TOOL_CALLS_FINISH) {
            return None;
        }

        let index = choice.get("index").and_then(Value::as_u64).and_then(|i| u32::try_from(i).ok());
        Some(ChunkChoice { index: index.unwrap_or(0), delta, finish_reason })
    }

    /// Drains every accumulator in index order into complete tool calls.
    fn finalize_tool_calls(&mut self) -> Vec<ToolCall> {
        let mut finalized = Vec::new();
        for (index, accumulator) in std::mem::take(&mut self.accumulators) {
            if accumulator.name.trim().is_empty() {
                self.metrics.malformed(stage::STREAM_FINALIZE, "missing_name");
                continue;
            }
            let arguments = match resolve_arguments(
                Some(accumulator.arguments.as_str()),
                accumulator.explicit_empty,
            ) {
                ResolvedArguments::Object { arguments, wrapped } => {
                    if arguments.is_empty() && accumulator.arguments.trim().is_empty() {
                        self.metrics.fallback(stage::STREAM_FINALIZE, action::EXPLICIT_EMPTY);
                    }
                    if wrapped {
                        self.metrics.fallback(stage::STREAM_FINALIZE, action::WRAPPED_INPUT);
                    }
                    arguments
                }
                ResolvedArguments::Missing => {
                    self.metrics.malformed(stage::STREAM_FINALIZE, "arguments_missing");
                    continue;
                }
                ResolvedArguments::Invalid => {
                    self.metrics.malformed(stage::STREAM_FINALIZE, "arguments_invalid");
                    self.metrics.fallback(stage::STREAM_FINALIZE, action::DROP_TOOL_CALL);
                    continue;
                }
            };
            finalized.push(ToolCall::function(
                accumulator.id,
                index,
                accumulator.name,
                Value::Object(arguments).to_string(),
            ));
        }
        finalized
    }

    /// Ends the stream, discarding tool calls that never saw a finish.
    pub fn finish(&mut self) -> Option<Usage> {
        for _ in 0..self.accumulators.len() {
            self.metrics.malformed(stage::STREAM_FINALIZE, "unterminated");
        }
        self.accumulators.clear();
        self.terminated = true;
        self.last_usage
    }
}
