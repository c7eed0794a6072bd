//! CSV export: one row per `(size, operation)` pair, aggregated over the
//! flow table. Feeds the downstream analysis pipeline; the amplification
//! values reproduce what the summary shows for the same flows.

use std::collections::BTreeMap;
use std::io::{self, Write};
use strata_common::Layer;

use crate::flow::FlowTable;

/// Aggregated amplification for all flows sharing a request size and
/// operation.
#[derive(Clone, Debug, PartialEq)]
pub struct SizeBucket {
    pub size: u64,
    pub operation: String,
    pub os_bytes: u64,
    pub device_bytes: u64,
    pub os_amp: f64,
    pub device_amp: f64,
    pub metadata_count: u64,
}

/// Group flows by `(application bytes, operation)`. Flows without
/// application bytes have no defined amplification and are skipped.
pub fn aggregate(flows: &FlowTable) -> Vec<SizeBucket> {
    let mut buckets: BTreeMap<(u64, &'static str), (u64, u64, u64, u64)> = BTreeMap::new();

    for flow in flows.sorted_by_start() {
        let app = flow.app_bytes();
        if app == 0 {
            continue;
        }
        let entry = buckets.entry((app, flow.op_name())).or_insert((0, 0, 0, 0));
        entry.0 += app;
        entry.1 += flow.layer_bytes(Layer::Os);
        entry.2 += flow.layer_bytes(Layer::Device);
        entry.3 += flow.metadata_ops as u64;
    }

    buckets
        .into_iter()
        .map(
            |((size, operation), (app_total, os_bytes, device_bytes, metadata_count))| SizeBucket {
                size,
                operation: operation.to_string(),
                os_bytes,
                device_bytes,
                os_amp: os_bytes as f64 / app_total as f64,
                device_amp: device_bytes as f64 / app_total as f64,
                metadata_count,
            },
        )
        .collect()
}

/// Write the buckets as CSV with a header row.
pub fn write_csv<W: Write>(out: &mut W, buckets: &[SizeBucket]) -> io::Result<()> {
    writeln!(
        out,
        "size,operation,os_bytes,device_bytes,os_amp,device_amp,metadata_count"
    )?;
    for b in buckets {
        writeln!(
            out,
            "{},{},{},{},{:.4},{:.4},{}",
            b.size, b.operation, b.os_bytes, b.device_bytes, b.os_amp, b.device_amp, b.metadata_count
        )?;
    }
    Ok(())
}
