//! Integration tests for the strata metrics module.
//!
//! These tests verify that [`TraceEvent`]s are correctly translated into
//! OpenTelemetry metrics using an in-memory exporter.  No eBPF probes or
//! root privileges are required.
//!
//! Run with: `cargo test --test metrics`

use strata::metrics::MetricsRecorder;
use strata_common::{kind, Layer, SystemTag, TraceEvent, COMM_LEN};

use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a synthetic [`TraceEvent`].
fn make_event(layer: Layer, kind: u32, size: u64, latency_ns: u64, comm: &str) -> TraceEvent {
    let mut e = TraceEvent::zeroed();
    e.layer = layer as u8;
    e.kind = kind;
    e.size = size;
    e.aligned_size = size;
    e.latency_ns = latency_ns;
    e.system = SystemTag::Minio as u32;
    e.pid = 1234;
    e.timestamp_ns = 1_000_000_000;
    let b = comm.as_bytes();
    let len = b.len().min(COMM_LEN - 1);
    e.comm[..len].copy_from_slice(&b[..len]);
    e
}

/// Create a `SdkMeterProvider` backed by an [`InMemoryMetricExporter`].
fn setup() -> (SdkMeterProvider, InMemoryMetricExporter) {
    let exporter = InMemoryMetricExporter::default();
    let reader = PeriodicReader::builder(exporter.clone()).build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    (provider, exporter)
}

/// Locate metric data by name inside exported [`ResourceMetrics`].
fn find_metric_data<'a>(
    resource_metrics: &'a [ResourceMetrics],
    name: &str,
) -> Option<&'a AggregatedMetrics> {
    for rm in resource_metrics {
        for sm in rm.scope_metrics() {
            for m in sm.metrics() {
                if m.name() == name {
                    return Some(m.data());
                }
            }
        }
    }
    None
}

/// Extract the total value from a `Sum<u64>` metric (summing across all
/// data-points / attribute combinations).
fn sum_u64_total(resource_metrics: &[ResourceMetrics], name: &str) -> u64 {
    let data = find_metric_data(resource_metrics, name)
        .unwrap_or_else(|| panic!("metric {name} not found"));
    match data {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => {
            sum.data_points().map(|dp| dp.value()).sum()
        }
        other => panic!("expected Sum<u64> for {name}, got {other:?}"),
    }
}

/// Count data-points in a `Sum<u64>` metric.
fn sum_u64_dp_count(resource_metrics: &[ResourceMetrics], name: &str) -> usize {
    let data = find_metric_data(resource_metrics, name)
        .unwrap_or_else(|| panic!("metric {name} not found"));
    match data {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => sum.data_points().count(),
        other => panic!("expected Sum<u64> for {name}, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// The bytes counter is emitted after recording a single event; the latency
/// histogram appears once a completion event is recorded.
#[test]
fn test_all_metrics_emitted() {
    let (provider, exporter) = setup();
    let meter = provider.meter("test");
    let recorder = MetricsRecorder::with_hostname(&meter, "test-host".into());

    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_READ, 1024, 0, "myapp"));
    recorder.record_event(&make_event(
        Layer::Device,
        kind::DEV_BIO_COMPLETE,
        4096,
        5_000,
        "myapp",
    ));

    provider.force_flush().unwrap();
    let metrics = exporter.get_finished_metrics().unwrap();

    assert!(
        find_metric_data(&metrics, "strata.io.bytes").is_some(),
        "missing strata.io.bytes"
    );
    assert!(
        find_metric_data(&metrics, "strata.io.latency").is_some(),
        "missing strata.io.latency"
    );

    let _ = provider.shutdown();
}

/// The bytes counter accumulates the accounted sizes from all events.
#[test]
fn test_byte_counts() {
    let (provider, exporter) = setup();
    let meter = provider.meter("test");
    let recorder = MetricsRecorder::with_hostname(&meter, "test-host".into());

    recorder.record_event(&make_event(Layer::Application, kind::APP_WRITE, 1024, 0, "app"));
    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_WRITE, 2048, 0, "app"));

    provider.force_flush().unwrap();
    let metrics = exporter.get_finished_metrics().unwrap();

    assert_eq!(
        sum_u64_total(&metrics, "strata.io.bytes"),
        3072,
        "expected 1024 + 2048 = 3072 bytes"
    );

    let _ = provider.shutdown();
}

/// The latency histogram records only device completion events.
#[test]
fn test_latency_histogram_values() {
    let (provider, exporter) = setup();
    let meter = provider.meter("test");
    let recorder = MetricsRecorder::with_hostname(&meter, "test-host".into());

    // A VFS event with incidental latency must not be recorded.
    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_READ, 100, 9_999, "app"));
    // 5 000 000 ns = 5 ms completion.
    recorder.record_event(&make_event(
        Layer::Device,
        kind::DEV_BIO_COMPLETE,
        100,
        5_000_000,
        "app",
    ));

    provider.force_flush().unwrap();
    let metrics = exporter.get_finished_metrics().unwrap();

    let data = find_metric_data(&metrics, "strata.io.latency")
        .expect("missing strata.io.latency");

    match data {
        AggregatedMetrics::F64(MetricData::Histogram(hist)) => {
            let dps: Vec<_> = hist.data_points().collect();
            assert!(!dps.is_empty(), "no histogram data points");
            let dp = dps[0];
            assert_eq!(dp.count(), 1, "expected only the completion sample");
            let expected_sum = 5_000_000.0;
            assert!(
                (dp.sum() - expected_sum).abs() < 1e-6,
                "expected latency sum ≈ {expected_sum} ns, got {}",
                dp.sum()
            );
        }
        other => panic!("expected Histogram<f64>, got {other:?}"),
    }

    let _ = provider.shutdown();
}

/// Every data-point must carry the five required attributes:
/// `layer`, `event`, `system`, `comm`, `hostname`.
#[test]
fn test_attributes_present() {
    let (provider, exporter) = setup();
    let meter = provider.meter("test");
    let recorder = MetricsRecorder::with_hostname(&meter, "test-host".into());

    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_READ, 512, 0, "myapp"));

    provider.force_flush().unwrap();
    let metrics = exporter.get_finished_metrics().unwrap();

    let data = find_metric_data(&metrics, "strata.io.bytes")
        .expect("missing strata.io.bytes");

    match data {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => {
            let dps: Vec<_> = sum.data_points().collect();
            assert_eq!(dps.len(), 1);
            let dp = dps[0];
            let keys: Vec<String> = dp.attributes().map(|kv| kv.key.to_string()).collect();
            for expected in &["layer", "event", "system", "comm", "hostname"] {
                assert!(
                    keys.contains(&expected.to_string()),
                    "missing attribute '{expected}'; present: {keys:?}"
                );
            }
        }
        other => panic!("expected Sum<u64>, got {other:?}"),
    }

    let _ = provider.shutdown();
}

/// Events at different layers must produce separate data-points in the
/// aggregation.
#[test]
fn test_layers_separated() {
    let (provider, exporter) = setup();
    let meter = provider.meter("test");
    let recorder = MetricsRecorder::with_hostname(&meter, "test-host".into());

    recorder.record_event(&make_event(Layer::Application, kind::APP_WRITE, 100, 0, "app"));
    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_WRITE, 200, 0, "app"));

    provider.force_flush().unwrap();
    let metrics = exporter.get_finished_metrics().unwrap();

    let count = sum_u64_dp_count(&metrics, "strata.io.bytes");
    assert_eq!(
        count, 2,
        "expected 2 data-points (application + OS), got {count}"
    );
    assert_eq!(sum_u64_total(&metrics, "strata.io.bytes"), 300);

    let _ = provider.shutdown();
}

/// Multiple events from different commands should produce separate
/// data-points per comm.
#[test]
fn test_multiple_comms_separated() {
    let (provider, exporter) = setup();
    let meter = provider.meter("test");
    let recorder = MetricsRecorder::with_hostname(&meter, "test-host".into());

    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_READ, 100, 0, "app_a"));
    recorder.record_event(&make_event(Layer::Os, kind::OS_VFS_READ, 200, 0, "app_b"));

    provider.force_flush().unwrap();
    let metrics = exporter.get_finished_metrics().unwrap();

    let count = sum_u64_dp_count(&metrics, "strata.io.bytes");
    assert_eq!(
        count, 2,
        "expected 2 data-points (app_a + app_b), got {count}"
    );

    let _ = provider.shutdown();
}
