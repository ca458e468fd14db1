use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::instruments;

const SERVICE_NAME: &str = "atelier-relay";
const OTEL_STDOUT_ENV: &str = "ATELIER_RELAY_OTEL_STDOUT";
const DEFAULT_FILTER: &str = "info,relay=debug";

/// Logging, span export and the Prometheus recorder for the relay binary.
///
/// Dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = instruments::install_prometheus()?;

        let tracer_provider = flag_enabled(std::env::var(OTEL_STDOUT_ENV).ok().as_deref())
            .then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        info!(
            otel_stdout = tracer_provider.is_some(),
            "relay telemetry initialised"
        );

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "span exporter shutdown failed");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn flag_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::flag_enabled;

    #[test]
    fn otel_flag_accepts_common_truthy_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(flag_enabled(Some(raw)), "{raw:?} should enable");
        }
        for raw in ["0", "off", "", "maybe"] {
            assert!(!flag_enabled(Some(raw)), "{raw:?} should not enable");
        }
        assert!(!flag_enabled(None));
    }
}
