use opentelemetry::trace::TracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;

pub use config::{LogExporterKind, ObservabilityConfig, parse_log_exporter_kind, span_events_mask};

pub fn init_observability(service_name: &str, config: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.fallback_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = (config.log_exporter == LogExporterKind::Stdout).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stdout)
            .with_span_events(span_events_mask(config.log_span_events))
    });
    let telemetry_layer = config.trace_enabled.then(|| {
        tracing_opentelemetry::layer().with_tracer(
            opentelemetry::trace::noop::NoopTracerProvider::new().tracer(service_name.to_string()),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .ok();
}

pub fn init_tracing(service_name: &str) {
    init_observability(service_name, &ObservabilityConfig::from_env());
}
