use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use infergate_contracts::{
    AssistantMessage, CHAT_COMPLETION_OBJECT, ChatChoice, ChatCompletionsResponse, StageName,
    StreamFrame, Usage,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::{
    budget::TokenBudget,
    debug_buffer::{ToolCallDebugBuffer, source},
    error::CoreError,
    guard::AccessGuard,
    metrics::{ToolCallMetrics, action, stage},
    model::{Credential, UsageRecord, now_ms, now_secs},
    ports::{
        AccountStore, BackendClient, CredentialStore, ModelRegistry, ServerPool, UsageStore,
    },
    resolver::{BackendAddress, BackendResolver, LoopbackPolicy},
    sanitize::{SanitizeOptions, SanitizedRequest, content_text, sanitize_request},
    stream::{ReassemblyStep, StreamReassembler},
    tool_calls::{fix_tool_calls, validate_tool_calls},
};

pub const UPSTREAM_ERROR_MESSAGE: &str = "Upstream error";
const STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GatewaySettings {
    pub sanitize: SanitizeOptions,
    pub budget: TokenBudget,
}

/// Collaborators the engine is wired from.
#[derive(Clone)]
pub struct GatewayParts {
    pub credentials: Arc<dyn CredentialStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub models: Arc<dyn ModelRegistry>,
    pub servers: Arc<dyn ServerPool>,
    pub usage: Arc<dyn UsageStore>,
    pub backend: Arc<dyn BackendClient>,
    pub metrics: Arc<ToolCallMetrics>,
    pub debug: Arc<ToolCallDebugBuffer>,
    pub loopback: LoopbackPolicy,
}

/// One inbound chat request as it arrives from the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub body: Vec<u8>,
    pub credential: Option<String>,
    pub accepts_event_stream: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub request_id: String,
    pub model: String,
    pub credential: Credential,
    pub backend: BackendAddress,
    pub request: SanitizedRequest,
    pub estimated_prompt_tokens: u64,
}

impl PreparedRequest {
    pub fn stream(&self) -> bool {
        self.request.stream
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayContext {
    pub request_id: String,
    pub model: String,
    pub presented_credential: Option<String>,
    pub accepts_event_stream: bool,
    pub body: Map<String, Value>,
    pub credential: Option<Credential>,
    pub backend: Option<BackendAddress>,
    pub request: Option<SanitizedRequest>,
    pub estimated_prompt_tokens: u64,
}

impl GatewayContext {
    fn new(model: String, body: Map<String, Value>, inbound: &InboundRequest) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            model,
            presented_credential: inbound.credential.clone(),
            accepts_event_stream: inbound.accepts_event_stream,
            body,
            credential: None,
            backend: None,
            request: None,
            estimated_prompt_tokens: 0,
        }
    }

    fn into_prepared(self) -> Result<PreparedRequest, CoreError> {
        match (self.credential, self.backend, self.request) {
            (Some(credential), Some(backend), Some(request)) => Ok(PreparedRequest {
                request_id: self.request_id,
                model: self.model,
                credential,
                backend,
                request,
                estimated_prompt_tokens: self.estimated_prompt_tokens,
            }),
            _ => Err(CoreError::Validation("request pipeline ended incomplete".to_string())),
        }
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageName;
    async fn handle(&self, context: &mut GatewayContext) -> Result<(), CoreError>;
}

struct AuthenticateHandler {
    guard: Arc<AccessGuard>,
}

#[async_trait]
impl StageHandler for AuthenticateHandler {
    fn stage(&self) -> StageName {
        StageName::Authenticate
    }

    async fn handle(&self, context: &mut GatewayContext) -> Result<(), CoreError> {
        let credential = self.guard.authorize(context.presented_credential.as_deref()).await?;
        context.credential = Some(credential);
        Ok(())
    }
}

struct ResolveHandler {
    resolver: Arc<BackendResolver>,
}

#[async_trait]
impl StageHandler for ResolveHandler {
    fn stage(&self) -> StageName {
        StageName::Resolve
    }

    async fn handle(&self, context: &mut GatewayContext) -> Result<(), CoreError> {
        context.backend = Some(self.resolver.resolve(&context.model).await?);
        Ok(())
    }
}

struct SanitizeHandler {
    options: SanitizeOptions,
}

#[async_trait]
impl StageHandler for SanitizeHandler {
    fn stage(&self) -> StageName {
        StageName::Sanitize
    }

    async fn handle(&self, context: &mut GatewayContext) -> Result<(), CoreError> {
        let body = std::mem::take(&mut context.body);
        context.request =
            Some(sanitize_request(&context.model, body, context.accepts_event_stream, self.options));
        Ok(())
    }
}

struct BudgetHandler {
    budget: TokenBudget,
}

#[async_trait]
impl StageHandler for BudgetHandler {
    fn stage(&self) -> StageName {
        StageName::Budget
    }

    async fn handle(&self, context: &mut GatewayContext) -> Result<(), CoreError> {
        let Some(request) = context.request.as_mut() else {
            return Err(CoreError::Validation("budget requires a sanitized request".to_string()));
        };
        let decision = self.budget.apply(&request.messages, request.max_tokens)?;
        request.max_tokens = decision.max_tokens;
        context.estimated_prompt_tokens = decision.estimated;
        Ok(())
    }
}

/// Reads the body as a JSON object with a non-blank `model`.
pub fn parse_body(body: &[u8]) -> Result<(String, Map<String, Value>), CoreError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(CoreError::Validation("empty request body".to_string()));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| CoreError::Validation("invalid JSON body".to_string()))?;
    let Value::Object(fields) = value else {
        return Err(CoreError::Validation("request body must be a JSON object".to_string()));
    };
    let model = fields
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| CoreError::Validation("missing model parameter".to_string()))?
        .to_string();
    Ok((model, fields))
}

pub struct GatewayEngine {
    guard: Arc<AccessGuard>,
    resolver: Arc<BackendResolver>,
    backend: Arc<dyn BackendClient>,
    usage: Arc<dyn UsageStore>,
    metrics: Arc<ToolCallMetrics>,
    debug: Arc<ToolCallDebugBuffer>,
    settings: GatewaySettings,
}

impl GatewayEngine {
    pub fn new(parts: GatewayParts, settings: GatewaySettings) -> Self {
        Self {
            guard: Arc::new(AccessGuard::new(parts.credentials, parts.accounts)),
            resolver: Arc::new(BackendResolver::new(parts.models, parts.servers, parts.loopback)),
            backend: parts.backend,
            usage: parts.usage,
            metrics: parts.metrics,
            debug: parts.debug,
            settings,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<ToolCallMetrics> {
        &self.metrics
    }

    pub fn debug_buffer(&self) -> &Arc<ToolCallDebugBuffer> {
        &self.debug
    }

    /// Validates the body, then runs authenticate, resolve, sanitize and
    /// budget in order. No backend call is made here.
    pub async fn prepare(&self, inbound: InboundRequest) -> Result<PreparedRequest, CoreError> {
        let (model, body) = parse_body(&inbound.body)?;
        self.prepare_parsed(model, body, &inbound).await
    }

    pub(crate) async fn prepare_parsed(
        &self,
        model: String,
        body: Map<String, Value>,
        inbound: &InboundRequest,
    ) -> Result<PreparedRequest, CoreError> {
        let mut context = GatewayContext::new(model, body, inbound);
        info!(
            event = "gateway.request.received",
            request_id = %context.request_id,
            model = %context.model,
            "chat request received"
        );

        let authenticate = AuthenticateHandler { guard: Arc::clone(&self.guard) };
        self.run_stage(&authenticate, &mut context).await?;

        let resolve = ResolveHandler { resolver: Arc::clone(&self.resolver) };
        self.run_stage(&resolve, &mut context).await?;

        let sanitize = SanitizeHandler { options: self.settings.sanitize };
        self.run_stage(&sanitize, &mut context).await?;

        let budget = BudgetHandler { budget: self.settings.budget };
        self.run_stage(&budget, &mut context).await?;

        context.into_prepared()
    }

    async fn run_stage<H: StageHandler>(
        &self,
        handler: &H,
        context: &mut GatewayContext,
    ) -> Result<(), CoreError> {
        let stage = handler.stage();
        let span = info_span!(
            "pipeline_stage",
            request_id = %context.request_id,
            stage = ?stage,
            model = %context.model
        );

        async move { handler.handle(context).await }.instrument(span).await
    }

    /// Forwards a prepared request without streaming and collapses the
    /// reply into one canonical completion.
    pub async fn complete(
        &self,
        prepared: &PreparedRequest,
    ) -> Result<ChatCompletionsResponse, CoreError> {
        let mut request = prepared.request.clone();
        request.stream = false;
        request.body.remove("stream_options");
        let payload = request.into_payload();

        info!(
            event = "upstream.request.sent",
            request_id = %prepared.request_id,
            backend_url = %prepared.backend.chat_completions_url(),
            "forwarding non-stream request"
        );
        let reply = self.backend.complete(&prepared.backend, &payload).await.inspect_err(|err| {
            warn!(
                event = "upstream.request.failed",
                request_id = %prepared.request_id,
                error = %err,
                "backend call failed"
            );
        })?;

        let response = self.canonicalize(&reply, &prepared.model);
        self.record_usage(prepared, response.usage).await;
        Ok(response)
    }

    fn canonicalize(&self, reply: &Value, requested_model: &str) -> ChatCompletionsResponse {
        let model = reply.get("model").and_then(Value::as_str).unwrap_or(requested_model);
        let choice = reply.get("choices").and_then(Value::as_array).and_then(|c| c.first());
        let message = choice.and_then(|choice| choice.get("message"));

        let content = message.and_then(|m| m.get("content")).map(content_text).unwrap_or_default();
        let finish_reason = choice
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(Value::as_str)
            .filter(|reason| !reason.is_empty())
            .unwrap_or("stop");

        let tool_calls = message.and_then(|m| m.get("tool_calls")).filter(|tc| !tc.is_null());
        let tool_calls = tool_calls.and_then(|raw| {
            self.debug.record(source::NON_STREAM_RESPONSE, model, raw, None);
            let fixed = fix_tool_calls(raw, &self.metrics);
            if fixed.is_empty() {
                return None;
            }
            if validate_tool_calls(&fixed, stage::NON_STREAM_OUT, true, &self.metrics) {
                Some(fixed)
            } else {
                self.metrics.fallback(stage::NON_STREAM_OUT, action::DROP_INVALID);
                None
            }
        });

        ChatCompletionsResponse {
            id: reply
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4().simple())),
            object: CHAT_COMPLETION_OBJECT.to_string(),
            created: reply.get("created").and_then(Value::as_i64).unwrap_or_else(now_secs),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls,
                },
                finish_reason: finish_reason.to_string(),
            }],
            usage: Usage::from_value(reply.get("usage").unwrap_or(&Value::Null)),
        }
    }

    /// Streams reconstructed chunks for a prepared request. The stream
    /// always ends with [`StreamFrame::Done`]; backend failures become a
    /// single [`StreamFrame::Error`] first. Dropping the receiver cancels
    /// the upstream read.
    pub fn execute_stream(self: Arc<Self>, prepared: PreparedRequest) -> ReceiverStream<StreamFrame> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let span = info_span!(
            "execute_stream",
            request_id = %prepared.request_id,
            model = %prepared.model
        );
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = self.drive_stream(&prepared, &tx) => {}
                    _ = tx.closed() => {
                        info!(event = "stream.client.disconnected", "client went away, upstream read canceled");
                    }
                }
            }
            .instrument(span),
        );
        ReceiverStream::new(rx)
    }

    async fn drive_stream(&self, prepared: &PreparedRequest, tx: &mpsc::Sender<StreamFrame>) {
        let payload = prepared.request.clone().into_payload();
        let mut lines = match self.backend.open_stream(&prepared.backend, &payload).await {
            Ok(lines) => lines,
            Err(err) => {
                warn!(event = "stream.upstream.error", error = %err, "backend refused stream");
                let _ = tx.send(upstream_error_frame()).await;
                let _ = tx.send(StreamFrame::Done).await;
                return;
            }
        };

        let mut reassembler =
            StreamReassembler::new(&prepared.model, Arc::clone(&self.metrics), Arc::clone(&self.debug));
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(event = "stream.upstream.error", error = %err, "backend stream broke");
                    if tx.send(upstream_error_frame()).await.is_err() {
                        return;
                    }
                    break;
                }
            };
            match reassembler.push_line(&line) {
                ReassemblyStep::Skip => {}
                ReassemblyStep::Chunk(chunk) => {
                    if tx.send(StreamFrame::Chunk(chunk)).await.is_err() {
                        return;
                    }
                }
                ReassemblyStep::Done => break,
            }
        }
        drop(lines);

        if let Some(usage) = reassembler.finish() {
            self.record_usage(prepared, usage).await;
        }
        let _ = tx.send(StreamFrame::Done).await;
    }

    async fn record_usage(&self, prepared: &PreparedRequest, usage: Usage) {
        let record = UsageRecord {
            credential_key: prepared.credential.key.clone(),
            model: prepared.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            timestamp_ms: now_ms(),
        };
        if let Err(err) = self.usage.append(record).await {
            warn!(
                event = "usage.record.failed",
                request_id = %prepared.request_id,
                error = %err,
                "failed to persist usage record"
            );
        }
    }
}

fn upstream_error_frame() -> StreamFrame {
    StreamFrame::Error { message: UPSTREAM_ERROR_MESSAGE.to_string() }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::testing::{MemoryStores, ScriptedBackend};

    #[derive(Debug, Clone)]
    struct CoreFixture<'a> {
        name: &'a str,
        credential: Option<&'a str>,
        accept_event_stream: bool,
        body: String,
        reply: Result<Value, CoreError>,
        lines: Result<Vec<Result<String, CoreError>>, CoreError>,
        context_window: u64,
        allow_tools: bool,
        force_stream: bool,
    }

    impl<'a> CoreFixture<'a> {
        fn parse(raw: &'a str) -> Self {
            let mut fixture = Self {
                name: "unnamed",
                credential: Some("key-1"),
                accept_event_stream: false,
                body: r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#.to_string(),
                reply: Ok(json!({
                    "id": "chatcmpl-up",
                    "created": 1,
                    "model": "m",
                    "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                })),
                lines: Ok(Vec::new()),
                context_window: 129_000,
                allow_tools: true,
                force_stream: true,
            };

            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let key = key.trim();
                let value = value.trim();

                match key {
                    "name" => fixture.name = value,
                    "credential" => fixture.credential = (value != "none").then_some(value),
                    "accept" => fixture.accept_event_stream = value == "event-stream",
                    "body" => fixture.body = value.to_string(),
                    "reply" => {
                        fixture.reply = match value.strip_prefix("status:") {
                            Some(status) => Err(CoreError::upstream(
                                Some(status.parse().expect("status must be numeric")),
                                "backend returned an error status",
                            )),
                            None if value == "unreachable" => {
                                Err(CoreError::upstream(None, "connection refused"))
                            }
                            None => Ok(serde_json::from_str(value).expect("reply must be JSON")),
                        }
                    }
                    "line" => {
                        if let Ok(lines) = fixture.lines.as_mut() {
                            lines.push(if value == "!error" {
                                Err(CoreError::upstream(None, "connection reset"))
                            } else {
                                Ok(value.to_string())
                            });
                        }
                    }
                    "stream_status" => {
                        fixture.lines = Err(CoreError::upstream(
                            Some(value.parse().expect("status must be numeric")),
                            "backend returned an error status",
                        ))
                    }
                    "context_window" => {
                        fixture.context_window = value.parse().expect("numeric window")
                    }
                    "allow_tools" => fixture.allow_tools = value == "true",
                    "force_stream" => fixture.force_stream = value == "true",
                    other => panic!("unsupported fixture key: {other}"),
                }
            }

            fixture
        }
    }

    struct Wired {
        engine: Arc<GatewayEngine>,
        stores: Arc<MemoryStores>,
        backend: Arc<ScriptedBackend>,
    }

    fn wire(fixture: &CoreFixture<'_>, backend: ScriptedBackend) -> Wired {
        let stores = MemoryStores::new()
            .with_credential("key-1", "acct-1", true)
            .with_credential("key-off", "acct-1", false)
            .with_credential("key-inactive", "acct-2", true)
            .with_account("acct-1", true)
            .with_account("acct-2", false)
            .with_model("m", "10.0.0.7", 8000, true)
            .with_model("pooled", "auto", 0, true)
            .with_server("gpu-a", 8000, true)
            .with_server("gpu-b", 8000, true);
        let backend = Arc::new(backend);
        let parts = GatewayParts {
            credentials: stores.clone(),
            accounts: stores.clone(),
            models: stores.clone(),
            servers: stores.clone(),
            usage: stores.clone(),
            backend: backend.clone(),
            metrics: Arc::new(ToolCallMetrics::default()),
            debug: Arc::new(ToolCallDebugBuffer::new(8)),
            loopback: LoopbackPolicy::Keep,
        };
        let settings = GatewaySettings {
            sanitize: SanitizeOptions {
                allow_tools: fixture.allow_tools,
                force_stream: fixture.force_stream,
            },
            budget: TokenBudget::new(fixture.context_window, 4.0),
        };
        Wired { engine: Arc::new(GatewayEngine::new(parts, settings)), stores, backend }
    }

    fn inbound(fixture: &CoreFixture<'_>) -> InboundRequest {
        InboundRequest {
            body: fixture.body.clone().into_bytes(),
            credential: fixture.credential.map(str::to_string),
            accepts_event_stream: fixture.accept_event_stream,
        }
    }

    fn assert_snapshot(name: &str, actual: &str, expected: &str) {
        let actual = actual.trim();
        let expected = expected.trim();
        assert_eq!(
            actual, expected,
            "snapshot mismatch for fixture `{name}`\n\nactual:\n{actual}\n\nexpected:\n{expected}"
        );
    }

    fn error_kind(error: &CoreError) -> &'static str {
        match error {
            CoreError::Unauthorized(_) => "Unauthorized",
            CoreError::Forbidden(_) => "Forbidden",
            CoreError::Validation(_) => "Validation",
            CoreError::NotFound(_) => "NotFound",
            CoreError::PromptTooLarge { .. } => "PromptTooLarge",
            CoreError::Upstream { .. } => "Upstream",
            CoreError::ClientDisconnected => "ClientDisconnected",
            CoreError::Store(_) => "Store",
        }
    }

    fn render_forwarded(wired: &Wired) -> String {
        let calls = wired.backend.calls();
        let Some((address, payload)) = calls.first() else {
            return "backend_calls=0".to_string();
        };
        let mut keys: Vec<_> = payload.as_object().map(|o| o.keys().cloned().collect()).unwrap_or_default();
        keys.sort();
        format!(
            "backend_calls={}\nbackend={}\nforwarded_keys={}\nforwarded_max_tokens={}",
            calls.len(),
            address.base_url(),
            keys.join(","),
            payload["max_tokens"]
        )
    }

    fn render_response(response: &ChatCompletionsResponse) -> String {
        let choice = &response.choices[0];
        let tool_calls = choice
            .message
            .tool_calls
            .as_ref()
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| format!("{}({})", call.function.name, call.function.arguments))
                    .collect::<Vec<_>>()
                    .join(";")
            })
            .unwrap_or_else(|| "none".to_string());
        format!(
            "kind=ok\nid={}\nmodel={}\ncontent={}\nfinish_reason={}\ntool_calls={}\nusage_total={}",
            response.id,
            response.model,
            choice.message.content,
            choice.finish_reason,
            tool_calls,
            response.usage.total_tokens
        )
    }

    async fn check_fixture(raw_fixture: &str, expected_snapshot: &str) {
        let fixture = CoreFixture::parse(raw_fixture);
        let wired = wire(&fixture, ScriptedBackend::replying(fixture.reply.clone()));
        let upstream_id = fixture.reply.as_ref().ok().and_then(|reply| reply.get("id")).is_some();

        let result = match wired.engine.prepare(inbound(&fixture)).await {
            Ok(prepared) => wired.engine.complete(&prepared).await,
            Err(err) => Err(err),
        };
        let outcome = match result {
            Ok(mut response) => {
                if !upstream_id {
                    assert!(response.id.starts_with("chatcmpl-"), "{}", response.id);
                    response.id = "<generated>".to_string();
                }
                render_response(&response)
            }
            Err(error) => format!("kind=err\nerror_kind={}\nerror={}", error_kind(&error), error),
        };
        let actual = format!(
            "{outcome}\n{}\nusage_records={}",
            render_forwarded(&wired),
            wired.stores.usage_records().len()
        );
        assert_snapshot(fixture.name, &actual, expected_snapshot);
    }

    #[tokio::test]
    async fn core_non_stream_fixtures() {
        let fixtures = [
            (
                r#"
name=plain_completion
"#,
                r#"
kind=ok
id=chatcmpl-up
model=m
content=hello
finish_reason=stop
tool_calls=none
usage_total=4
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model
forwarded_max_tokens=2048
usage_records=1
"#,
            ),
            (
                r#"
name=missing_credential
credential=none
"#,
                r#"
kind=err
error_kind=Unauthorized
error=unauthorized: missing API key
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=disabled_credential
credential=key-off
"#,
                r#"
kind=err
error_kind=Unauthorized
error=unauthorized: invalid API key
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=inactive_account
credential=key-inactive
"#,
                r#"
kind=err
error_kind=Forbidden
error=forbidden: user is disabled
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=empty_body
body=
"#,
                r#"
kind=err
error_kind=Validation
error=validation failed: empty request body
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=invalid_json
body={"model":
"#,
                r#"
kind=err
error_kind=Validation
error=validation failed: invalid JSON body
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=missing_model
body={"messages":[]}
"#,
                r#"
kind=err
error_kind=Validation
error=validation failed: missing model parameter
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=unknown_model
body={"model":"ghost","messages":[]}
"#,
                r#"
kind=err
error_kind=NotFound
error=not found: model 'ghost' not found
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=prompt_too_large
context_window=10
body={"model":"m","messages":[{"role":"user","content":"aaaaaaaaaaaaaaaaaaaaaaaaa"}]}
"#,
                r#"
kind=err
error_kind=PromptTooLarge
error=prompt too long for model context (estimated 11 tokens > max_model_len 10)
backend_calls=0
usage_records=0
"#,
            ),
            (
                r#"
name=max_tokens_capped_and_fields_stripped
context_window=100
body={"model":"m","messages":[{"role":"user","content":"hi"}],"max_output_tokens":500,"strict":true,"response_format":{"type":"json_object"},"stream":true,"stream_options":{"include_usage":true}}
force_stream=false
"#,
                r#"
kind=ok
id=chatcmpl-up
model=m
content=hello
finish_reason=stop
tool_calls=none
usage_total=4
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model
forwarded_max_tokens=95
usage_records=1
"#,
            ),
            (
                r#"
name=tools_stripped_when_disabled
allow_tools=false
body={"model":"m","messages":[],"tools":[{"type":"function"}],"tool_choice":"auto","temperature":0}
"#,
                r#"
kind=ok
id=chatcmpl-up
model=m
content=hello
finish_reason=stop
tool_calls=none
usage_total=4
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model,temperature
forwarded_max_tokens=2048
usage_records=1
"#,
            ),
            (
                r#"
name=odd_reply_is_canonicalized
reply={"choices":[{"message":{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}}]}
"#,
                r#"
kind=ok
id=<generated>
model=m
content=ab
finish_reason=stop
tool_calls=none
usage_total=0
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model
forwarded_max_tokens=2048
usage_records=1
"#,
            ),
            (
                r#"
name=tool_calls_are_repaired
reply={"id":"c","model":"m","choices":[{"message":{"content":null,"tool_calls":[{"id":"t1","name":"search_files","arguments":{}},{"id":"t2","function":{"name":"list_files","arguments":"{}"}},{"id":"t3","function":{"name":"lookup","arguments":"oops"}}]},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":9}}
"#,
                r#"
kind=ok
id=c
model=m
content=
finish_reason=tool_calls
tool_calls=search_files({"file_pattern":"*.*","path":".","regex":".*"});list_files({});lookup({"input":"oops"})
usage_total=0
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model
forwarded_max_tokens=2048
usage_records=1
"#,
            ),
            (
                r#"
name=upstream_status_error
reply=status:503
"#,
                r#"
kind=err
error_kind=Upstream
error=upstream error: backend returned an error status
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model
forwarded_max_tokens=2048
usage_records=0
"#,
            ),
            (
                r#"
name=upstream_unreachable
reply=unreachable
"#,
                r#"
kind=err
error_kind=Upstream
error=upstream error: connection refused
backend_calls=1
backend=http://10.0.0.7:8000
forwarded_keys=max_tokens,messages,model
forwarded_max_tokens=2048
usage_records=0
"#,
            ),
        ];

        for (fixture, expected) in fixtures {
            check_fixture(fixture, expected).await;
        }
    }

    #[tokio::test]
    async fn pooled_models_rotate_across_requests() {
        let fixture = CoreFixture::parse(
            r#"body={"model":"pooled","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let wired = wire(&fixture, ScriptedBackend::replying(fixture.reply.clone()));
        for _ in 0..3 {
            let prepared = wired.engine.prepare(inbound(&fixture)).await.expect("prepared");
            wired.engine.complete(&prepared).await.expect("completed");
        }
        let hosts: Vec<_> =
            wired.backend.calls().into_iter().map(|(address, _)| address.host).collect();
        assert_eq!(hosts, ["gpu-a", "gpu-b", "gpu-a"]);
        assert!(wired.stores.usage_records().iter().all(|r| r.model == "pooled"));
    }

    #[tokio::test]
    async fn usage_store_failures_do_not_fail_the_request() {
        let fixture = CoreFixture::parse("name=usage_failure");
        let wired = wire(&fixture, ScriptedBackend::replying(fixture.reply.clone()));
        let stores = wired.stores.clone().failing_usage();
        let prepared = wired.engine.prepare(inbound(&fixture)).await.expect("prepared");
        let response = wired.engine.complete(&prepared).await.expect("usage errors are swallowed");
        assert_eq!(response.choices[0].message.content, "hello");
        assert!(stores.usage_records().is_empty());
    }

    #[tokio::test]
    async fn prepare_sets_stream_from_negotiation() {
        let body = r#"body={"model":"m","messages":[],"stream":true}"#;
        let cases = [
            (body.to_string(), true),
            (format!("{body}\nforce_stream=false"), false),
            (format!("{body}\nforce_stream=false\naccept=event-stream"), true),
        ];
        for (raw, expected) in &cases {
            let fixture = CoreFixture::parse(raw);
            let wired = wire(&fixture, ScriptedBackend::replying(Ok(Value::Null)));
            let prepared = wired.engine.prepare(inbound(&fixture)).await.expect("prepared");
            assert_eq!(prepared.stream(), *expected, "{raw}");
        }
    }

    fn render_frames(frames: &[StreamFrame]) -> String {
        frames
            .iter()
            .map(|frame| match frame {
                StreamFrame::Chunk(chunk) => {
                    let mut parts = Vec::new();
                    for choice in &chunk.choices {
                        if let Some(role) = &choice.delta.role {
                            parts.push(format!("role={role}"));
                        }
                        if let Some(content) = &choice.delta.content {
                            parts.push(format!("content={content}"));
                        }
                        if let Some(calls) = &choice.delta.tool_calls {
                            for call in calls {
                                parts.push(format!(
                                    "tool={}#{}({})",
                                    call.function.name, call.index, call.function.arguments
                                ));
                            }
                        }
                        if let Some(reason) = &choice.finish_reason {
                            parts.push(format!("finish={reason}"));
                        }
                    }
                    if let Some(usage) = chunk.usage {
                        parts.push(format!("usage={}", usage.total_tokens));
                    }
                    std::iter::once("chunk".to_string()).chain(parts).collect::<Vec<_>>().join(" ")
                }
                StreamFrame::Error { message } => format!("error {message}"),
                StreamFrame::Done => "done".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn check_stream_fixture(raw_fixture: &str, expected_snapshot: &str) {
        let fixture = CoreFixture::parse(raw_fixture);
        let wired = wire(&fixture, ScriptedBackend::streaming(fixture.lines.clone()));
        let prepared = wired.engine.prepare(inbound(&fixture)).await.expect("prepared");
        assert!(prepared.stream());

        let frames: Vec<StreamFrame> =
            Arc::clone(&wired.engine).execute_stream(prepared).collect().await;
        let forwarded = wired.backend.calls();
        let actual = format!(
            "{}\nforwarded_stream={}\nusage_records={}",
            render_frames(&frames),
            forwarded[0].1["stream"],
            wired.stores.usage_records().len()
        );
        assert_snapshot(fixture.name, &actual, expected_snapshot);
    }

    #[tokio::test]
    async fn core_stream_fixtures() {
        let stream_body = r#"body={"model":"m","messages":[{"role":"user","content":"hi"}],"stream":true,"stream_options":{"include_usage":true}}"#;
        let fixtures = [
            (
                r#"
name=text_stream_with_trailing_usage
line=data: {"id":"c1","choices":[{"index":0,"delta":{"role":"assistant"}}]}
line=data: {"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}
line=
line=data: {"id":"c1","choices":[{"index":0,"delta":{"content":"lo"}}]}
line=data: {"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}
line=data: {"id":"c1","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}
line=data: [DONE]
"#,
                r#"
chunk role=assistant
chunk content=Hel
chunk content=lo
chunk finish=stop
chunk usage=5
done
forwarded_stream=true
usage_records=1
"#,
            ),
            (
                r#"
name=fragmented_tool_call
line=data: {"id":"c2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"name":"search","arguments":""}}]}}]}
line=data: {"id":"c2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"name":"_files","arguments":"{\"regex\":"}}]}}]}
line=data: {"id":"c2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"fn main\"}"}}]}}]}
line=data: {"id":"c2","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}
line=data: [DONE]
"#,
                r#"
chunk
chunk
chunk
chunk tool=search_files#0({"regex":"fn main"}) finish=tool_calls
done
forwarded_stream=true
usage_records=0
"#,
            ),
            (
                r#"
name=upstream_status_error
stream_status=502
"#,
                r#"
error Upstream error
done
forwarded_stream=true
usage_records=0
"#,
            ),
            (
                r#"
name=read_error_mid_stream
line=data: {"id":"c3","choices":[{"index":0,"delta":{"content":"par"}}]}
line=!error
"#,
                r#"
chunk content=par
error Upstream error
done
forwarded_stream=true
usage_records=0
"#,
            ),
            (
                r#"
name=missing_terminator_still_done
line=data: {"id":"c4","choices":[{"index":0,"delta":{"content":"x"}}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}
"#,
                r#"
chunk content=x usage=2
done
forwarded_stream=true
usage_records=1
"#,
            ),
        ];

        for (fixture, expected) in fixtures {
            check_stream_fixture(&format!("{stream_body}\n{fixture}"), expected).await;
        }
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels_the_upstream_read() {
        let fixture = CoreFixture::parse(
            r#"body={"model":"m","messages":[],"stream":true}
line=data: {"id":"c","choices":[{"index":0,"delta":{"content":"first"}}]}"#,
        );
        let backend = ScriptedBackend::streaming(fixture.lines.clone()).hanging();
        let wired = wire(&fixture, backend);
        let prepared = wired.engine.prepare(inbound(&fixture)).await.expect("prepared");

        let mut frames = Arc::clone(&wired.engine).execute_stream(prepared);
        let first = frames.next().await.expect("first frame");
        assert!(matches!(first, StreamFrame::Chunk(_)));
        drop(frames);

        for _ in 0..100 {
            if wired.backend.stream_dropped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(wired.backend.stream_dropped());
        assert!(wired.stores.usage_records().is_empty());
    }
}
