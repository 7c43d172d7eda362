use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{
    error::CoreError,
    model::{Credential, ModelRegistration, ServerNode, UsageRecord},
    resolver::BackendAddress,
};

/// Raw text lines of a backend event stream, in arrival order.
pub type LineStream = BoxStream<'static, Result<String, CoreError>>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<Credential>, CoreError>;
    async fn touch_last_used(&self, key: &str, at_ms: u64) -> Result<(), CoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn is_active(&self, account_id: &str) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ModelRegistration>, CoreError>;
    async fn list_enabled(&self) -> Result<Vec<ModelRegistration>, CoreError>;
}

#[async_trait]
pub trait ServerPool: Send + Sync {
    /// Enabled nodes in a stable order; rotation indexes into this list.
    async fn list_enabled(&self) -> Result<Vec<ServerNode>, CoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<(), CoreError>;
}

/// Transport to an OpenAI-compatible inference backend.
///
/// `complete` returns the decoded JSON body of a 2xx reply. A transport
/// failure, a non-2xx status or a body that is not JSON must surface as
/// [`CoreError::Upstream`]. `open_stream` fails the same way for a
/// connect error or a status of 400 and above; afterwards read errors
/// arrive as items of the returned stream.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn complete(&self, address: &BackendAddress, payload: &Value)
    -> Result<Value, CoreError>;
    async fn open_stream(
        &self,
        address: &BackendAddress,
        payload: &Value,
    ) -> Result<LineStream, CoreError>;
}
