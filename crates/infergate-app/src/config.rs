use std::env;

use infergate_core::{
    budget::{DEFAULT_CHARS_PER_TOKEN, DEFAULT_CONTEXT_WINDOW},
    debug_buffer::DEFAULT_DEBUG_CAPACITY,
};

const CONTEXT_WINDOW_VARS: [&str; 3] = ["VLLM_MAX_MODEL_LEN", "MAX_MODEL_LEN", "MODEL_MAX_LEN"];
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub allow_tools: bool,
    pub force_stream: bool,
    pub context_window: u64,
    pub chars_per_token: f64,
    pub debug_capacity: usize,
    pub upstream_timeout_seconds: u64,
    pub expose_tools: bool,
    pub substitute_loopback: bool,
    pub admin_key: Option<String>,
    pub registry_path: Option<String>,
    pub max_body_bytes: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid GATEWAY_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid {var} value: {value}")]
    InvalidBool { var: &'static str, value: String },
    #[error("invalid GATEWAY_UPSTREAM_TIMEOUT value: {0}")]
    InvalidUpstreamTimeout(String),
    #[error("invalid GATEWAY_MAX_BODY_BYTES value: {0}")]
    InvalidBodyLimit(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_blank = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let flag = |var: &'static str, default: bool| match non_blank(var) {
            None => Ok(default),
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidBool { var, value: raw }),
        };

        let host = non_blank("GATEWAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port_raw = non_blank("GATEWAY_PORT").unwrap_or_else(|| "8001".to_string());
        let port = port_raw.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort(port_raw))?;

        let timeout_raw = non_blank("GATEWAY_UPSTREAM_TIMEOUT").unwrap_or_else(|| "120".to_string());
        let upstream_timeout_seconds = parse_positive_u64(&timeout_raw)
            .ok_or(ConfigError::InvalidUpstreamTimeout(timeout_raw))?;

        let body_raw = non_blank("GATEWAY_MAX_BODY_BYTES");
        let max_body_bytes = match body_raw {
            None => DEFAULT_MAX_BODY_BYTES,
            Some(raw) => parse_positive_u64(&raw)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .ok_or(ConfigError::InvalidBodyLimit(raw))?,
        };

        let context_window = CONTEXT_WINDOW_VARS
            .iter()
            .find_map(|var| lookup(var))
            .and_then(|raw| coerce_positive_int(&raw))
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let chars_per_token = non_blank("TOKEN_CHARS_PER_TOKEN")
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(DEFAULT_CHARS_PER_TOKEN);
        let debug_capacity = non_blank("TOOL_CALL_DEBUG_MAX")
            .and_then(|raw| coerce_positive_int(&raw))
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(DEFAULT_DEBUG_CAPACITY);

        Ok(Self {
            host,
            port,
            allow_tools: flag("ALLOW_TOOLS", true)?,
            force_stream: flag("FORCE_STREAM", true)?,
            context_window,
            chars_per_token,
            debug_capacity,
            upstream_timeout_seconds,
            expose_tools: flag("EXPOSE_TOOLS", true)?,
            substitute_loopback: flag("GATEWAY_SUBSTITUTE_LOOPBACK", true)?,
            admin_key: non_blank("GATEWAY_ADMIN_KEY"),
            registry_path: non_blank("GATEWAY_REGISTRY_PATH"),
            max_body_bytes,
        })
    }

    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            allow_tools: true,
            force_stream: true,
            context_window: DEFAULT_CONTEXT_WINDOW,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            debug_capacity: DEFAULT_DEBUG_CAPACITY,
            upstream_timeout_seconds: 5,
            expose_tools: true,
            substitute_loopback: false,
            admin_key: Some("admin-secret".to_string()),
            registry_path: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive_u64(value: &str) -> Option<u64> {
    let parsed = value.trim().parse::<u64>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

/// Accepts integers and integral-looking decimals such as `"4096.0"`.
fn coerce_positive_int(value: &str) -> Option<u64> {
    let parsed = value.trim().parse::<f64>().ok().filter(|number| number.is_finite())?;
    let truncated = parsed.trunc();
    if truncated < 1.0 || truncated > u64::MAX as f64 { None } else { Some(truncated as u64) }
}
