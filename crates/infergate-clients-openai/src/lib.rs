use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use infergate_core::{BackendAddress, BackendClient, CoreError, LineStream};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, warn};

mod sse;

pub use sse::{SseLineDecoder, line_stream};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

/// OpenAI-compatible backend over HTTP. Plain calls are bounded by the
/// configured timeout; event streams are not, since generation may run
/// for as long as the backend keeps producing.
#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    request_client: Client,
    stream_client: Client,
}

impl HttpBackendClient {
    pub fn build_http_client(timeout_seconds: Option<u64>) -> Result<Client, CoreError> {
        let mut builder = Client::builder();
        if let Some(seconds) = timeout_seconds {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        builder
            .build()
            .map_err(|err| CoreError::upstream(None, format!("http client init failed: {err}")))
    }

    pub fn new(timeout_seconds: u64) -> Result<Self, CoreError> {
        Ok(Self::with_http_clients(
            Self::build_http_client(Some(timeout_seconds))?,
            Self::build_http_client(None)?,
        ))
    }

    pub fn with_http_clients(request_client: Client, stream_client: Client) -> Self {
        Self { request_client, stream_client }
    }

    async fn post(
        &self,
        client: &Client,
        address: &BackendAddress,
        payload: &Value,
    ) -> Result<Response, CoreError> {
        let url = address.chat_completions_url();
        debug!(event = "upstream.request.started", url = %url);
        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                warn!(event = "upstream.request.unreachable", url = %url, error = %err);
                CoreError::upstream(None, format!("backend request failed: {err}"))
            })?;
        check_status(response).await
    }
}

/// Maps a non-2xx reply to an upstream error carrying its status.
async fn check_status(response: Response) -> Result<Response, CoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(
        event = "upstream.response.error_status",
        status = status.as_u16(),
        body = %truncate(&body, 512)
    );
    Err(CoreError::upstream(Some(status.as_u16()), format!("backend returned status {status}")))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn complete(&self, address: &BackendAddress, payload: &Value) -> Result<Value, CoreError> {
        let response = self.post(&self.request_client, address, payload).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| CoreError::upstream(None, format!("backend response parse failed: {err}")))
    }

    async fn open_stream(
        &self,
        address: &BackendAddress,
        payload: &Value,
    ) -> Result<LineStream, CoreError> {
        let response = self.post(&self.stream_client, address, payload).await?;
        Ok(line_stream(response.bytes_stream().boxed()))
    }
}
