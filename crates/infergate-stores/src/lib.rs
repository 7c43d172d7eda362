use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use infergate_core::{
    Account, AccountStore, CoreError, Credential, CredentialStore, ModelRegistration,
    ModelRegistry, ServerNode, ServerPool, UsageRecord, UsageStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read registry seed {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("invalid registry seed {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

/// Initial contents of the registry, as loaded from a JSON document.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistrySeed {
    pub credentials: Vec<Credential>,
    pub accounts: Vec<Account>,
    pub models: Vec<ModelRegistration>,
    pub servers: Vec<ServerNode>,
}

impl RegistrySeed {
    pub fn from_json(path: &str, text: &str) -> Result<Self, SeedError> {
        serde_json::from_str(text)
            .map_err(|source| SeedError::Parse { path: path.to_string(), source })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|source| SeedError::Read { path: display.clone(), source })?;
        Self::from_json(&display, &text)
    }
}

#[derive(Default)]
struct RegistryState {
    credentials: Vec<Credential>,
    accounts: Vec<Account>,
    models: Vec<ModelRegistration>,
    servers: Vec<ServerNode>,
    usage: Vec<UsageRecord>,
}

/// Every store port backed by process memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl InMemoryRegistry {
    pub fn from_seed(seed: RegistrySeed) -> Self {
        info!(
            event = "registry.seeded",
            credentials = seed.credentials.len(),
            accounts = seed.accounts.len(),
            models = seed.models.len(),
            servers = seed.servers.len(),
            "registry loaded"
        );
        let state = RegistryState {
            credentials: seed.credentials,
            accounts: seed.accounts,
            models: seed.models,
            servers: seed.servers,
            usage: Vec::new(),
        };
        Self { inner: Arc::new(RwLock::new(state)) }
    }

    pub async fn upsert_model(&self, model: ModelRegistration) {
        let mut guard = self.inner.write().await;
        guard.models.retain(|existing| existing.name != model.name);
        guard.models.push(model);
    }

    pub async fn add_server(&self, server: ServerNode) {
        self.inner.write().await.servers.push(server);
    }

    pub async fn set_credential_enabled(&self, key: &str, enabled: bool) -> bool {
        let mut guard = self.inner.write().await;
        match guard.credentials.iter_mut().find(|credential| credential.key == key) {
            Some(credential) => {
                credential.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.inner.read().await.usage.clone()
    }
}

#[async_trait]
impl CredentialStore for InMemoryRegistry {
    async fn lookup(&self, key: &str) -> Result<Option<Credential>, CoreError> {
        let guard = self.inner.read().await;
        Ok(guard.credentials.iter().find(|credential| credential.key == key).cloned())
    }

    async fn touch_last_used(&self, key: &str, at_ms: u64) -> Result<(), CoreError> {
        let mut guard = self.inner.write().await;
        if let Some(credential) = guard.credentials.iter_mut().find(|c| c.key == key) {
            credential.last_used_ms = Some(at_ms);
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for InMemoryRegistry {
    async fn is_active(&self, account_id: &str) -> Result<bool, CoreError> {
        let guard = self.inner.read().await;
        Ok(guard.accounts.iter().any(|account| account.id == account_id && account.active))
    }
}

#[async_trait]
impl ModelRegistry for InMemoryRegistry {
    async fn get(&self, name: &str) -> Result<Option<ModelRegistration>, CoreError> {
        let guard = self.inner.read().await;
        Ok(guard.models.iter().find(|model| model.name == name).cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<ModelRegistration>, CoreError> {
        let guard = self.inner.read().await;
        Ok(guard.models.iter().filter(|model| model.enabled).cloned().collect())
    }
}

#[async_trait]
impl ServerPool for InMemoryRegistry {
    async fn list_enabled(&self) -> Result<Vec<ServerNode>, CoreError> {
        let guard = self.inner.read().await;
        Ok(guard.servers.iter().filter(|server| server.enabled).cloned().collect())
    }
}

#[async_trait]
impl UsageStore for InMemoryRegistry {
    async fn append(&self, record: UsageRecord) -> Result<(), CoreError> {
        self.inner.write().await.usage.push(record);
        Ok(())
    }
}
