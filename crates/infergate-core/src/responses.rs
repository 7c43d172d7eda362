//! The responses-style endpoint, served by rewriting it onto the chat
//! pipeline. The backend call is never streamed; a streamed reply is
//! replayed from the finished response as two events.

use infergate_contracts::{ResponseStreamEvent, ResponsesResponse};
use serde_json::{Map, Value, json};

use crate::{
    engine::{GatewayEngine, InboundRequest, PreparedRequest, parse_body},
    error::CoreError,
    sanitize::truthy,
};

/// A prepared responses request and whether the client gets events.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedResponse {
    pub prepared: PreparedRequest,
    pub stream_reply: bool,
}

/// Rewrites a responses body into a chat body. `messages` wins over
/// `input`; a string input becomes one user message and an array input
/// is taken as the message list.
pub fn chat_body_from_responses(mut body: Map<String, Value>) -> Map<String, Value> {
    let input = body.remove("input");
    let messages = match (body.remove("messages"), input) {
        (Some(messages @ Value::Array(_)), _) => messages,
        (_, Some(items @ Value::Array(_))) => items,
        (_, Some(Value::String(text))) => json!([{ "role": "user", "content": text }]),
        (_, Some(other)) if !other.is_null() => {
            json!([{ "role": "user", "content": other.to_string() }])
        }
        _ => json!([{ "role": "user", "content": "" }]),
    };
    body.insert("messages".to_string(), messages);

    if let Some(limit) = body.remove("max_output_tokens").filter(|limit| !limit.is_null()) {
        body.insert("max_tokens".to_string(), limit);
    }
    body.remove("stream");
    body.remove("stream_options");
    body
}

/// The event sequence for a streamed reply: the text delta (when there is
/// any text) followed by the completed envelope.
pub fn response_events(response: &ResponsesResponse) -> Vec<ResponseStreamEvent> {
    let text = response.output_text();
    let mut events = Vec::with_capacity(2);
    if !text.is_empty() {
        events.push(ResponseStreamEvent::OutputTextDelta { delta: text.to_string() });
    }
    events.push(ResponseStreamEvent::Completed { response: response.clone() });
    events
}

impl GatewayEngine {
    pub async fn prepare_responses(
        &self,
        inbound: InboundRequest,
    ) -> Result<PreparedResponse, CoreError> {
        let (model, body) = parse_body(&inbound.body)?;
        let stream_reply = truthy(body.get("stream"))
            && (inbound.accepts_event_stream || self.settings().sanitize.force_stream);
        let body = chat_body_from_responses(body);
        let prepared = self.prepare_parsed(model, body, &inbound).await?;
        Ok(PreparedResponse { prepared, stream_reply })
    }

    pub async fn respond(&self, prepared: &PreparedRequest) -> Result<ResponsesResponse, CoreError> {
        let chat = self.complete(prepared).await?;
        Ok(ResponsesResponse::from_chat(&chat, &prepared.model))
    }
}
