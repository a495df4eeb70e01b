//! Log and span output for the posture binaries.
//!
//! [`init_tracing`] installs the global subscriber.  Output goes to stderr as
//! compact text, or as JSON lines with `POSTURE_LOG_FORMAT=json`.  `RUST_LOG`
//! sets the filter.  Setting `OTEL_EXPORTER_OTLP_ENDPOINT` additionally ships
//! spans to that collector over OTLP/HTTP.
//!
//! ```rust,no_run
//! let _guard = posture_runtime::telemetry::init_tracing("posture");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FORMAT_VAR: &str = "POSTURE_LOG_FORMAT";
const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Output choices read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LogSettings {
    json: bool,
    otlp_endpoint: Option<String>,
}

impl LogSettings {
    fn from_env() -> Self {
        Self::from_vars(
            std::env::var(LOG_FORMAT_VAR).ok().as_deref(),
            std::env::var(OTLP_ENDPOINT_VAR).ok(),
        )
    }

    fn from_vars(format: Option<&str>, endpoint: Option<String>) -> Self {
        Self {
            json: format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json")),
            otlp_endpoint: endpoint.filter(|e| !e.trim().is_empty()),
        }
    }
}

/// Install the global subscriber for `service_name`.
///
/// Keep the returned guard alive until exit so buffered spans reach the
/// collector.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let settings = LogSettings::from_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(service_name, endpoint));
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));
    let (json, compact) = if settings.json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer().compact()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(json)
        .with(compact)
        .init();

    TracerProviderGuard(provider)
}

/// Flushes and shuts down the span exporter when dropped.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[posture] span exporter shutdown failed: {e}");
        }
    }
}

/// `None` when the exporter cannot be built; logging then stays local.
fn build_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[posture] OTLP exporter for {endpoint} unavailable: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // Simple export: the CLI starts its Tokio runtime after logging is up.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
