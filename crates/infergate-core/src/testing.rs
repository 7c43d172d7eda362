use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::Value;

use crate::{
    error::CoreError,
    model::{Account, Credential, ModelRegistration, ServerNode, UsageRecord},
    ports::{
        AccountStore, BackendClient, CredentialStore, LineStream, ModelRegistry, ServerPool,
        UsageStore,
    },
    resolver::BackendAddress,
};

#[derive(Default)]
struct StoreState {
    credentials: Vec<Credential>,
    accounts: Vec<Account>,
    models: Vec<ModelRegistration>,
    servers: Vec<ServerNode>,
    usage: Vec<UsageRecord>,
    fail_usage: bool,
}

/// Every store port over one in-memory state, built up fluently.
#[derive(Default)]
pub struct MemoryStores {
    state: Mutex<StoreState>,
}

impl MemoryStores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn edit(self: Arc<Self>, change: impl FnOnce(&mut StoreState)) -> Arc<Self> {
        change(&mut self.state.lock().expect("store lock"));
        self
    }

    pub fn with_credential(self: Arc<Self>, key: &str, account: &str, enabled: bool) -> Arc<Self> {
        self.edit(|state| {
            state.credentials.push(Credential {
                key: key.to_string(),
                account_id: account.to_string(),
                enabled,
                last_used_ms: None,
            })
        })
    }

    pub fn with_account(self: Arc<Self>, id: &str, active: bool) -> Arc<Self> {
        self.edit(|state| state.accounts.push(Account { id: id.to_string(), active }))
    }

    pub fn with_model(self: Arc<Self>, name: &str, host: &str, port: u16, enabled: bool) -> Arc<Self> {
        self.edit(|state| {
            state.models.push(ModelRegistration {
                name: name.to_string(),
                host: host.to_string(),
                port,
                enabled,
            })
        })
    }

    pub fn with_server(self: Arc<Self>, hostname: &str, port: u16, enabled: bool) -> Arc<Self> {
        self.edit(|state| {
            state.servers.push(ServerNode { hostname: hostname.to_string(), port, enabled })
        })
    }

    pub fn failing_usage(self: Arc<Self>) -> Arc<Self> {
        self.edit(|state| state.fail_usage = true)
    }

    pub fn last_used(&self, key: &str) -> Option<u64> {
        let state = self.state.lock().expect("store lock");
        state.credentials.iter().find(|c| c.key == key).and_then(|c| c.last_used_ms)
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.state.lock().expect("store lock").usage.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryStores {
    async fn lookup(&self, key: &str) -> Result<Option<Credential>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.credentials.iter().find(|c| c.key == key).cloned())
    }

    async fn touch_last_used(&self, key: &str, at_ms: u64) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("store lock");
        if let Some(credential) = state.credentials.iter_mut().find(|c| c.key == key) {
            credential.last_used_ms = Some(at_ms.max(1));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStores {
    async fn is_active(&self, account_id: &str) -> Result<bool, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.accounts.iter().any(|a| a.id == account_id && a.active))
    }
}

#[async_trait]
impl ModelRegistry for MemoryStores {
    async fn get(&self, name: &str) -> Result<Option<ModelRegistration>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.models.iter().find(|m| m.name == name).cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<ModelRegistration>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.models.iter().filter(|m| m.enabled).cloned().collect())
    }
}

#[async_trait]
impl ServerPool for MemoryStores {
    async fn list_enabled(&self) -> Result<Vec<ServerNode>, CoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.servers.iter().filter(|s| s.enabled).cloned().collect())
    }
}

#[async_trait]
impl UsageStore for MemoryStores {
    async fn append(&self, record: UsageRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("store lock");
        if state.fail_usage {
            return Err(CoreError::Store("usage table unavailable".to_string()));
        }
        state.usage.push(record);
        Ok(())
    }
}

/// Backend double that replays canned replies and records payloads.
pub struct ScriptedBackend {
    reply: Result<Value, CoreError>,
    stream: Result<Vec<Result<String, CoreError>>, CoreError>,
    hang_after_stream: bool,
    stream_dropped: Arc<AtomicBool>,
    calls: Mutex<Vec<(BackendAddress, Value)>>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn replying(reply: Result<Value, CoreError>) -> Self {
        Self {
            reply,
            stream: Ok(Vec::new()),
            hang_after_stream: false,
            stream_dropped: Arc::new(AtomicBool::new(false)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(lines: Result<Vec<Result<String, CoreError>>, CoreError>) -> Self {
        Self { stream: lines, ..Self::replying(Ok(Value::Null)) }
    }

    pub fn hanging(mut self) -> Self {
        self.hang_after_stream = true;
        self
    }

    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(BackendAddress, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn complete(&self, address: &BackendAddress, payload: &Value) -> Result<Value, CoreError> {
        self.calls.lock().expect("calls lock").push((address.clone(), payload.clone()));
        self.reply.clone()
    }

    async fn open_stream(
        &self,
        address: &BackendAddress,
        payload: &Value,
    ) -> Result<LineStream, CoreError> {
        self.calls.lock().expect("calls lock").push((address.clone(), payload.clone()));
        let lines = self.stream.clone()?;
        let guard = DropFlag(Arc::clone(&self.stream_dropped));
        let replay = stream::iter(lines);
        let lines = if self.hang_after_stream {
            replay.chain(stream::pending()).boxed()
        } else {
            replay.boxed()
        };
        Ok(lines
            .map(move |line| {
                let _ = &guard;
                line
            })
            .boxed())
    }
}
