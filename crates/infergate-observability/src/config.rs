use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogExporterKind {
    Stdout,
    None,
}

pub fn parse_log_exporter_kind(raw: &str) -> LogExporterKind {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" => LogExporterKind::None,
        _ => LogExporterKind::Stdout,
    }
}

pub fn span_events_mask(log_span_events: bool) -> FmtSpan {
    if log_span_events { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub log_exporter: LogExporterKind,
    pub trace_enabled: bool,
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let truthy = |name: &str| {
            lookup(name).is_some_and(|value| {
                matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
            })
        };
        Self {
            log_level: lookup("GATEWAY_LOG_LEVEL")
                .map(|level| level.trim().to_string())
                .filter(|level| !level.is_empty())
                .unwrap_or_else(|| "info".to_string()),
            log_span_events: truthy("GATEWAY_LOG_SPAN_EVENTS"),
            log_exporter: parse_log_exporter_kind(
                &lookup("GATEWAY_LOG_EXPORTER").unwrap_or_default(),
            ),
            trace_enabled: truthy("GATEWAY_TRACE_ENABLED"),
        }
    }

    /// Filter applied when `RUST_LOG` is not set.
    pub fn fallback_filter(&self) -> String {
        let level = &self.log_level;
        format!(
            "{level},infergate_app={level},infergate_core={level},infergate_clients_openai={level},infergate_stores={level}"
        )
    }
}
