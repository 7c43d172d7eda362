use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{net::UdpSocket, sync::RwLock};
use tracing::{info, warn};

use crate::{
    error::CoreError,
    model::BackendSpec,
    ports::{ModelRegistry, ServerPool},
};

const PROBE_TARGET: &str = "8.8.8.8:80";
const LOOPBACK_FALLBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url())
    }
}

/// What to do when a resolved host points at this machine's loopback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackPolicy {
    /// Replace with the address of the outbound interface.
    Substitute,
    /// Replace with a fixed host.
    Replace(String),
    Keep,
}

pub fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Address of the interface that would carry traffic to a public host.
/// Connecting a datagram socket only selects a route, nothing is sent.
pub async fn primary_ip() -> String {
    async fn probe() -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(PROBE_TARGET).await?;
        Ok(socket.local_addr()?.ip())
    }

    match probe().await {
        Ok(ip) if !ip.is_unspecified() => ip.to_string(),
        _ => LOOPBACK_FALLBACK.to_string(),
    }
}

pub struct BackendResolver {
    models: Arc<dyn ModelRegistry>,
    servers: Arc<dyn ServerPool>,
    loopback: LoopbackPolicy,
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl BackendResolver {
    pub fn new(
        models: Arc<dyn ModelRegistry>,
        servers: Arc<dyn ServerPool>,
        loopback: LoopbackPolicy,
    ) -> Self {
        Self { models, servers, loopback, counters: RwLock::new(HashMap::new()) }
    }

    pub async fn resolve(&self, model: &str) -> Result<BackendAddress, CoreError> {
        let registration = self
            .models
            .get(model)
            .await?
            .filter(|registration| registration.enabled)
            .ok_or_else(|| CoreError::NotFound(format!("model '{model}' not found")))?;

        let (host, port, pooled) = match registration.backend() {
            BackendSpec::Fixed { host, port } => (host, port, false),
            BackendSpec::Pool { fallback } => {
                let pool: Vec<_> = self
                    .servers
                    .list_enabled()
                    .await?
                    .into_iter()
                    .filter(|node| node.enabled)
                    .collect();
                if pool.is_empty() {
                    let Some((host, port)) = fallback else {
                        return Err(CoreError::upstream(
                            None,
                            format!("no enabled backend servers for model '{model}'"),
                        ));
                    };
                    warn!(
                        event = "backend.pool.empty",
                        model = %registration.name,
                        "pool is empty, using the registered address"
                    );
                    (host, port, false)
                } else {
                    let ticket = self.next_ticket(&registration.name).await;
                    let slot = usize::try_from(ticket % pool.len() as u64).unwrap_or(0);
                    let node = &pool[slot];
                    (node.hostname.clone(), node.port, true)
                }
            }
        };

        let address = BackendAddress { host: self.substitute_loopback(host).await, port };
        info!(
            event = "backend.resolved",
            model = %registration.name,
            pooled,
            backend_url = %address.base_url(),
            "resolved model backend"
        );
        Ok(address)
    }

    /// Returns the current rotation value for `model` and advances it.
    async fn next_ticket(&self, model: &str) -> u64 {
        if let Some(counter) = self.counters.read().await.get(model) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        let counter = {
            let mut counters = self.counters.write().await;
            Arc::clone(counters.entry(model.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn substitute_loopback(&self, host: String) -> String {
        if !is_loopback_host(&host) {
            return host;
        }
        match &self.loopback {
            LoopbackPolicy::Keep => host,
            LoopbackPolicy::Replace(replacement) => replacement.clone(),
            LoopbackPolicy::Substitute => primary_ip().await,
        }
    }
}
