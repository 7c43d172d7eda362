use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::{StreamExt, stream};
use infergate_clients_openai::HttpBackendClient;
use infergate_contracts::{
    ChatCompletionChunk, ChatCompletionsRequest, ChatCompletionsResponse, ResponsesRequest,
    ResponsesResponse,
};
use infergate_core::{
    BackendClient, CoreError, DebugEntry, GatewayEngine, GatewayParts, GatewaySettings, InboundRequest,
    LoopbackPolicy, MetricsSnapshot, ModelRegistry, SanitizeOptions, TokenBudget, ToolCallDebugBuffer,
    ToolCallMetrics, accepts_event_stream, extract_credential, model::now_secs, response_events,
};
use infergate_stores::{InMemoryRegistry, RegistrySeed};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub mod config;

use config::AppConfig;

const CLIENT_CLOSED_REQUEST: u16 = 499;
const DEFAULT_DEBUG_LIMIT: usize = 50;
const OWNER: &str = "infergate";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct HealthResponse {
    status: String,
    timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ModelCapabilities {
    tool_calls: bool,
    function_calling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ModelEntry {
    id: String,
    object: String,
    owned_by: String,
    capabilities: ModelCapabilities,
    #[schema(value_type = Option<Vec<Object>>)]
    available_tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ModelsResponse {
    object: String,
    data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_model_len: Option<u64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
struct DebugToolCallsResponse {
    count: usize,
    #[schema(value_type = Vec<Object>)]
    items: Vec<DebugEntry>,
    #[schema(value_type = Object)]
    counters: MetricsSnapshot,
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct DebugQuery {
    limit: Option<usize>,
    clear: Option<bool>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_models,
        get_debug_tool_calls,
        post_responses,
        post_chat_completions
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            ModelCapabilities,
            ModelEntry,
            ModelsResponse,
            DebugToolCallsResponse,
            ChatCompletionsRequest,
            ChatCompletionsResponse,
            ChatCompletionChunk,
            ResponsesRequest,
            ResponsesResponse
        )
    ),
    tags(
        (name = "infergate", description = "inference gateway API")
    )
)]
struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<GatewayEngine>,
    models: Arc<dyn ModelRegistry>,
    expose_tools: bool,
    admin_key: Option<String>,
    max_body_bytes: usize,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let seed = match config.registry_path.as_deref() {
            Some(path) => RegistrySeed::load(path)?,
            None => {
                warn!(event = "registry.empty", "GATEWAY_REGISTRY_PATH not set, registry is empty");
                RegistrySeed::default()
            }
        };
        let backend = Arc::new(HttpBackendClient::new(config.upstream_timeout_seconds)?);
        Ok(Self::with_components(config, InMemoryRegistry::from_seed(seed), backend))
    }

    pub fn with_components(
        config: &AppConfig,
        registry: InMemoryRegistry,
        backend: Arc<dyn BackendClient>,
    ) -> Self {
        let registry = Arc::new(registry);
        let parts = GatewayParts {
            credentials: registry.clone(),
            accounts: registry.clone(),
            models: registry.clone(),
            servers: registry.clone(),
            usage: registry.clone(),
            backend,
            metrics: Arc::new(ToolCallMetrics::default()),
            debug: Arc::new(ToolCallDebugBuffer::new(config.debug_capacity)),
            loopback: if config.substitute_loopback {
                LoopbackPolicy::Substitute
            } else {
                LoopbackPolicy::Keep
            },
        };
        let settings = GatewaySettings {
            sanitize: SanitizeOptions {
                allow_tools: config.allow_tools,
                force_stream: config.force_stream,
            },
            budget: TokenBudget::new(config.context_window, config.chars_per_token),
        };

        Self {
            engine: Arc::new(GatewayEngine::new(parts, settings)),
            models: registry,
            expose_tools: config.expose_tools,
            admin_key: config.admin_key.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/v1/models", get(get_models))
        .route("/v1/chat/completions", post(post_chat_completions))
        .route("/v1/responses", post(post_responses))
        .route("/debug/tool-calls", get(get_debug_tool_calls))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "infergate"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".to_string(), timestamp: now_secs() })
}

fn builtin_tools() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "search_files",
                "description": "Search files by content pattern",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Directory path"},
                        "regex": {"type": "string", "description": "Search regex pattern"},
                        "file_pattern": {"type": "string", "description": "File pattern"}
                    }
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "list_files",
                "description": "List files in a directory",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Directory path"},
                        "recursive": {"type": "boolean", "description": "Recursive listing"}
                    }
                }
            }
        }),
    ]
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses(
        (status = 200, description = "Enabled models in OpenAI list form", body = ModelsResponse),
        (status = 500, description = "Registry unavailable", body = ErrorResponse)
    ),
    tag = "infergate"
)]
async fn get_models(State(state): State<AppState>) -> Response {
    let models = match state.models.list_enabled().await {
        Ok(models) => models,
        Err(err) => return error_response(err),
    };
    let tools = state.expose_tools.then(builtin_tools);
    let data = models
        .into_iter()
        .map(|model| ModelEntry {
            id: model.name,
            object: "model".to_string(),
            owned_by: OWNER.to_string(),
            capabilities: ModelCapabilities { tool_calls: true, function_calling: true },
            available_tools: tools.clone(),
        })
        .collect();
    Json(ModelsResponse { object: "list".to_string(), data }).into_response()
}

#[utoipa::path(
    get,
    path = "/debug/tool-calls",
    params(DebugQuery),
    responses(
        (status = 200, description = "Recent raw tool-call payloads", body = DebugToolCallsResponse),
        (status = 403, description = "Missing or wrong admin key", body = ErrorResponse)
    ),
    tag = "infergate"
)]
async fn get_debug_tool_calls(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DebugQuery>,
) -> Response {
    let presented = header_value(&headers, "x-admin-key").or_else(|| header_value(&headers, "x-api-key"));
    let authorized = match (state.admin_key.as_deref(), presented) {
        (Some(expected), Some(presented)) => expected == presented,
        _ => false,
    };
    if !authorized {
        return error_response(CoreError::Forbidden("admin key required".to_string()));
    }

    let buffer = state.engine.debug_buffer();
    let limit = query.limit.unwrap_or(DEFAULT_DEBUG_LIMIT).clamp(1, buffer.capacity());
    let items = buffer.recent(limit);
    if query.clear.unwrap_or(false) {
        buffer.clear();
    }
    Json(DebugToolCallsResponse {
        count: items.len(),
        items,
        counters: state.engine.metrics().snapshot(),
    })
    .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionsRequest,
    responses(
        (status = 200, description = "Chat completion, or an event stream of chunks", body = ChatCompletionsResponse),
        (status = 400, description = "Invalid request or prompt too long", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 403, description = "Account disabled", body = ErrorResponse),
        (status = 404, description = "Unknown model", body = ErrorResponse),
        (status = 502, description = "Backend unreachable", body = ErrorResponse)
    ),
    tag = "infergate"
)]
#[instrument(skip_all, fields(route = "chat_completions"))]
async fn post_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let inbound = match read_inbound(&headers, body, state.max_body_bytes).await {
        Ok(inbound) => inbound,
        Err(response) => return response,
    };
    let prepared = match state.engine.prepare(inbound).await {
        Ok(prepared) => prepared,
        Err(err) => return error_response(err),
    };

    if prepared.stream() {
        let frames = Arc::clone(&state.engine).execute_stream(prepared);
        let events =
            frames.map(|frame| Ok::<Event, Infallible>(Event::default().data(frame.to_data())));
        return Sse::new(events).into_response();
    }

    match state.engine.complete(&prepared).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/responses",
    request_body = ResponsesRequest,
    responses(
        (status = 200, description = "Responses envelope, or a two-event stream", body = ResponsesResponse),
        (status = 400, description = "Invalid request or prompt too long", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse)
    ),
    tag = "infergate"
)]
#[instrument(skip_all, fields(route = "responses"))]
async fn post_responses(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    let inbound = match read_inbound(&headers, body, state.max_body_bytes).await {
        Ok(inbound) => inbound,
        Err(response) => return response,
    };
    let plan = match state.engine.prepare_responses(inbound).await {
        Ok(plan) => plan,
        Err(err) => return error_response(err),
    };
    let response = match state.engine.respond(&plan.prepared).await {
        Ok(response) => response,
        Err(err) => return error_response(err),
    };

    if !plan.stream_reply {
        return Json(response).into_response();
    }
    let events = response_events(&response).into_iter().map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().event(event.event_name()).data(data))
    });
    Sse::new(stream::iter(events.collect::<Vec<_>>())).into_response()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn read_inbound(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<InboundRequest, Response> {
    let declared = header_value(headers, header::CONTENT_LENGTH.as_str())
        .and_then(|value| value.trim().parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(plain_error(format!("request body exceeds {limit} bytes"))),
        )
            .into_response());
    }

    let body: Bytes = to_bytes(body, limit).await.map_err(|err| {
        info!(event = "request.body.aborted", error = %err, "client went away while sending the body");
        error_response(CoreError::ClientDisconnected)
    })?;

    Ok(InboundRequest {
        body: body.to_vec(),
        credential: extract_credential(
            header_value(headers, "x-api-key"),
            header_value(headers, header::AUTHORIZATION.as_str()),
        ),
        accepts_event_stream: accepts_event_stream(header_value(headers, header::ACCEPT.as_str())),
    })
}

fn plain_error(error: String) -> ErrorResponse {
    ErrorResponse { error, estimated_prompt_tokens: None, max_model_len: None }
}

fn error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::Validation(_) | CoreError::PromptTooLarge { .. } => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Upstream { status, .. } => status
            .and_then(|status| StatusCode::from_u16(status).ok())
            .unwrap_or(StatusCode::BAD_GATEWAY),
        CoreError::ClientDisconnected => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match &err {
        CoreError::PromptTooLarge { estimated, limit } => ErrorResponse {
            error: err.to_string(),
            estimated_prompt_tokens: Some(*estimated),
            max_model_len: Some(*limit),
        },
        CoreError::ClientDisconnected => plain_error("Client disconnected".to_string()),
        _ => plain_error(err.to_string()),
    };
    (status, Json(body)).into_response()
}
