//! Logging setup.
//!
//! Filter: `OSOBA_LOG`, then `RUST_LOG`, then `info`. `OSOBA_LOG_FORMAT=json`
//! switches stderr output to JSON lines. With the `otel` feature, spans are
//! also exported over OTLP/HTTP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Flushes exporters on drop. Hold it for the life of `main`.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("warning: flushing traces failed: {e}");
        }
    }
}

fn env_filter() -> EnvFilter {
    ["OSOBA_LOG", "RUST_LOG"]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn json_requested() -> bool {
    std::env::var("OSOBA_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init() -> TelemetryGuard {
    #[allow(unused_mut)]
    let mut guard = TelemetryGuard::default();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if json_requested() {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        );
    }

    #[cfg(feature = "otel")]
    if let Some((layer, provider)) = otel::layer() {
        layers.push(layer);
        guard.provider = Some(provider);
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter())
        .try_init();
    guard
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::{Layer, Registry};

    pub(super) fn layer() -> Option<(Box<dyn Layer<Registry> + Send + Sync>, SdkTracerProvider)> {
        std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT")?;
        let exporter = match opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .build()
        {
            Ok(exporter) => exporter,
            Err(e) => {
                eprintln!("warning: OTLP exporter disabled: {e}");
                return None;
            }
        };
        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(Resource::builder().with_service_name("osoba").build())
            .build();
        let tracer = provider.tracer("osoba");
        let layer = tracing_opentelemetry::layer().with_tracer(tracer).boxed();
        Some((layer, provider))
    }
}
