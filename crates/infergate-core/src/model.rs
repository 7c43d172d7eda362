use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub account_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub last_used_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub active: bool,
}

/// Where requests for a model go: a fixed node, or the shared pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    Pool { fallback: Option<(String, u16)> },
    Fixed { host: String, port: u16 },
}

const POOL_SENTINELS: [&str; 5] = ["", "auto", "servers", "pool", "round_robin"];

impl BackendSpec {
    /// Interprets a registered host. Pool sentinels are matched
    /// case-insensitively after trimming.
    pub fn parse(host: &str, port: u16) -> Self {
        let trimmed = host.trim();
        let lowered = trimmed.to_ascii_lowercase();
        if POOL_SENTINELS.contains(&lowered.as_str()) {
            let fallback =
                if trimmed.is_empty() { None } else { Some((trimmed.to_string(), port)) };
            Self::Pool { fallback }
        } else {
            Self::Fixed { host: trimmed.to_string(), port }
        }
    }

    pub fn is_pool(&self) -> bool {
        matches!(self, Self::Pool { .. })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModelRegistration {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl ModelRegistration {
    pub fn backend(&self) -> BackendSpec {
        BackendSpec::parse(&self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerNode {
    pub hostname: String,
    pub port: u16,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub credential_key: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub timestamp_ms: u64,
}

fn enabled_by_default() -> bool {
    true
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub fn now_secs() -> i64 {
    i64::try_from(now_ms() / 1000).unwrap_or(i64::MAX)
}
