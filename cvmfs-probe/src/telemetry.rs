//! Metric emission boundary.
//!
//! Every measurement leaves the probe as a [`Sample`] handed to a
//! [`MetricSink`]. The production sink exports samples as OpenTelemetry
//! gauges to an OTLP Collector; without a configured endpoint the probe
//! falls back to logging each sample.
//!
//! ## OTLP Endpoint Priority
//! 1. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 2. If not set, metrics export is disabled (no default fallback)

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Gauge, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

pub const PLUGIN_NAME: &str = "cvmfs";

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// One measurement, scoped by plugin name and repository.
///
/// `interval` is the instance's own sampling cadence; `None` means the
/// scheduler's global default applies. The sink decides what to do with it
/// (the OTLP exporter has its own export cadence and drops it).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub plugin: &'static str,
    pub plugin_instance: String,
    pub type_name: String,
    pub type_instance: Option<String>,
    pub value: f64,
    pub interval: Option<Duration>,
}

impl Sample {
    pub fn new(repo: &str, type_name: &str, value: f64, interval: Option<Duration>) -> Self {
        Self {
            plugin: PLUGIN_NAME,
            plugin_instance: repo.to_string(),
            type_name: type_name.to_string(),
            type_instance: None,
            value,
            interval,
        }
    }

    pub fn with_instance(
        repo: &str,
        type_name: &str,
        type_instance: &str,
        value: f64,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            type_instance: Some(type_instance.to_string()),
            ..Self::new(repo, type_name, value, interval)
        }
    }
}

/// Dispatch target for probe samples. Implementations must tolerate being
/// called from concurrently scheduled probe instances.
pub trait MetricSink: Send + Sync {
    fn dispatch(&self, sample: Sample);
}

/// Fallback sink used when no OTLP endpoint is configured: samples go to the
/// log so the probe stays observable without a collector.
pub struct LogSink;

impl MetricSink for LogSink {
    fn dispatch(&self, sample: Sample) {
        let interval = match sample.interval {
            Some(i) => format!("{}s", i.as_secs()),
            None => "default".to_string(),
        };
        match &sample.type_instance {
            Some(instance) => info!(
                "{}/{}: {}/{} = {} (interval {})",
                sample.plugin,
                sample.plugin_instance,
                sample.type_name,
                instance,
                sample.value,
                interval
            ),
            None => info!(
                "{}/{}: {} = {} (interval {})",
                sample.plugin, sample.plugin_instance, sample.type_name, sample.value, interval
            ),
        }
    }
}

/// OTLP-backed sink. Sample types map to gauges named `cvmfs_<type>` with
/// the repository and type instance as attributes. Instruments are created
/// lazily because attribute directives name their own metric types.
pub struct OtlpSink {
    meter: Meter,
    gauges: RwLock<HashMap<String, Gauge<f64>>>,
}

impl OtlpSink {
    fn new(meter: Meter) -> Self {
        Self {
            meter,
            gauges: RwLock::new(HashMap::new()),
        }
    }

    fn gauge(&self, type_name: &str) -> Gauge<f64> {
        if let Ok(gauges) = self.gauges.read() {
            if let Some(gauge) = gauges.get(type_name) {
                return gauge.clone();
            }
        }
        let gauge = self
            .meter
            .f64_gauge(format!("{PLUGIN_NAME}_{type_name}"))
            .build();
        if let Ok(mut gauges) = self.gauges.write() {
            gauges.insert(type_name.to_string(), gauge.clone());
        }
        gauge
    }
}

impl MetricSink for OtlpSink {
    fn dispatch(&self, sample: Sample) {
        let gauge = self.gauge(&sample.type_name);
        let mut attrs = vec![KeyValue::new("repository", sample.plugin_instance)];
        if let Some(instance) = sample.type_instance {
            attrs.push(KeyValue::new("type_instance", instance));
        }
        gauge.record(sample.value, &attrs);
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize the OpenTelemetry metrics provider and return the OTLP sink.
///
/// Configures metrics export to an OTLP Collector via gRPC. Returns `None`
/// (export disabled) if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics() -> Result<Option<OtlpSink>> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(None);
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "cvmfs-probe"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("cvmfs-probe");

    info!("OpenTelemetry metrics initialized successfully");
    Ok(Some(OtlpSink::new(meter)))
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every dispatched sample for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        samples: Mutex<Vec<Sample>>,
    }

    impl RecordingSink {
        pub(crate) fn samples(&self) -> Vec<Sample> {
            self.samples.lock().unwrap().clone()
        }
    }

    impl MetricSink for RecordingSink {
        fn dispatch(&self, sample: Sample) {
            self.samples.lock().unwrap().push(sample);
        }
    }
}
