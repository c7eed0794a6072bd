//! Metrics module for recording I/O events via OpenTelemetry.
//!
//! Provides [`MetricsRecorder`] for translating [`TraceEvent`]s into OTel
//! metrics and [`init_otlp_metrics`] for bootstrapping the OTLP gRPC
//! export pipeline.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use strata_common::{kind, kind_name, Layer, SystemTag, TraceEvent};

/// Get the system hostname.
fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Records I/O metrics from trace events using OpenTelemetry instruments.
///
/// Two instruments are maintained:
///
/// | Metric              | Type      | Unit | Description                     |
/// |---------------------|-----------|------|---------------------------------|
/// | `strata.io.bytes`   | Counter   | By   | Bytes observed per layer        |
/// | `strata.io.latency` | Histogram | ns   | Device completion latency       |
///
/// Every data-point carries the following attributes:
/// `layer`, `event`, `system`, `comm`, `hostname`.
pub struct MetricsRecorder {
    io_bytes: Counter<u64>,
    io_latency: Histogram<f64>,
    hostname: String,
}

impl MetricsRecorder {
    /// Create a new `MetricsRecorder` using the system hostname.
    pub fn new(meter: &Meter) -> Self {
        Self::with_hostname(meter, get_hostname())
    }

    /// Create a new `MetricsRecorder` with an explicit hostname.
    ///
    /// This is primarily useful for testing where a deterministic hostname
    /// is desirable.
    pub fn with_hostname(meter: &Meter, hostname: String) -> Self {
        let io_bytes = meter
            .u64_counter("strata.io.bytes")
            .with_description("Bytes observed per storage-stack layer")
            .with_unit("By")
            .build();

        let io_latency = meter
            .f64_histogram("strata.io.latency")
            .with_description("Device I/O completion latency")
            .with_unit("ns")
            .build();

        Self {
            io_bytes,
            io_latency,
            hostname,
        }
    }

    /// Record metrics for a single trace event.
    pub fn record_event(&self, event: &TraceEvent) {
        let layer = Layer::from_raw(event.layer)
            .map(Layer::name)
            .unwrap_or("UNKNOWN");

        let attrs = [
            KeyValue::new("layer", layer),
            KeyValue::new("event", kind_name(event.kind)),
            KeyValue::new("system", SystemTag::from_raw(event.system).name()),
            KeyValue::new("comm", crate::comm_to_string(&event.comm)),
            KeyValue::new("hostname", self.hostname.clone()),
        ];

        self.io_bytes.add(event.accounted_size(), &attrs);
        if event.kind == kind::DEV_BIO_COMPLETE && event.latency_ns > 0 {
            self.io_latency.record(event.latency_ns as f64, &attrs);
        }
    }
}

/// Initialise an OTLP gRPC metrics export pipeline.
///
/// Returns a [`SdkMeterProvider`](opentelemetry_sdk::metrics::SdkMeterProvider)
/// that **must** be kept alive for the duration of the program.  Call
/// [`shutdown()`](opentelemetry_sdk::metrics::SdkMeterProvider::shutdown)
/// before dropping to flush any remaining data.
pub fn init_otlp_metrics(
    endpoint: &str,
) -> anyhow::Result<opentelemetry_sdk::metrics::SdkMeterProvider> {
    use opentelemetry_otlp::{MetricExporter, WithExportConfig};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter).build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .build();

    Ok(provider)
}
