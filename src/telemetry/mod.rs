//! Telemetry for a running pool.
//!
//! Logs always go to a fmt layer. Lifecycle events (the `workpool::event`
//! target) get their own level so a quiet server can still record every
//! enqueue and completion. With an OTLP endpoint, spans for each execution,
//! the `workpool.*` instruments, and logs are exported too, all tagged with
//! the pool's resource attributes.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event;
use crate::segment::SEGMENT_MS;

/// sqlx logs every statement at debug; the loop issues many per pass.
const SQLX_DIRECTIVE: &str = "sqlx=warn";

const SERVICE_INSTANCE_ID: &str = "service.instance.id";

pub struct TelemetryConfig {
    /// OTLP endpoint (e.g. "http://localhost:4317"). `None` logs locally only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Default filter when `RUST_LOG` is unset (e.g. "info").
    pub log_level: String,
    /// Level for lifecycle events. Follows `log_level` when `None`.
    pub event_level: Option<String>,
    /// Reported as the `workpool.max_parallelism` resource attribute.
    pub max_parallelism: Option<u32>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>, log_level: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            log_level: log_level.into(),
            event_level: None,
            max_parallelism: None,
        }
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.log_level.clone(), SQLX_DIRECTIVE.to_string()];
        if let Some(level) = &self.event_level {
            directives.push(format!("{}={level}", event::TARGET));
        }
        directives.join(",")
    }

    /// Attributes identifying this pool process in every exported signal.
    pub fn resource(&self) -> Resource {
        let mut builder = Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
            .with_attribute(KeyValue::new(SERVICE_INSTANCE_ID, Uuid::new_v4().to_string()))
            .with_attribute(KeyValue::new("workpool.segment_ms", SEGMENT_MS));
        if let Some(max) = self.max_parallelism {
            builder = builder.with_attribute(KeyValue::new("workpool.max_parallelism", max as i64));
        }
        builder.build()
    }
}

/// Flushes and shuts down the OTel providers on drop. Hold it for the life
/// of the process.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }

    /// Force-flush all telemetry pipelines.
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

fn otlp_providers(endpoint: &str, resource: Resource) -> Result<Providers> {
    use opentelemetry_otlp::WithExportConfig as _;

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP span exporter: {e}")))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP metric exporter: {e}")))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource.clone())
        .build();

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP log exporter: {e}")))?;
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(Providers {
        tracer,
        meter,
        logger,
    })
}

/// Install the global subscriber and, with an endpoint, the OTel pipelines.
///
/// # Errors
///
/// Returns an error if an OTLP exporter fails to build or a global
/// subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));
    let init_err = |e: tracing_subscriber::util::TryInitError| {
        Error::Other(format!("failed to init tracing subscriber: {e}"))
    };

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(init_err)?;
        return Ok(TelemetryGuard { providers: None });
    };

    let providers = otlp_providers(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());
    let trace_layer =
        tracing_opentelemetry::layer().with_tracer(providers.tracer.tracer("workpool"));
    let log_layer =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&providers.logger);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(init_err)?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}
