//! Per-layer accumulators and run-level counters.
//!
//! Everything here is a commutative add, so ingest order does not matter:
//! the ring delivers events from different CPUs in arbitrary interleaving.

use strata_common::{kind, Layer, TraceEvent, LAYER_COUNT};

/// Accumulators for one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub events: u64,
    pub total_bytes: u64,
    pub aligned_bytes: u64,
    pub metadata_ops: u64,
    pub journal_ops: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_latency_ns: u64,
}

/// Global statistics across all ingested events, plus the user-side
/// anomaly counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    layers: [LayerStats; LAYER_COUNT],
    /// Total events ingested.
    pub events: u64,
    /// Events that arrived with `request_id = 0` (correlation lost at
    /// source; still counted into layer statistics).
    pub unattributed: u64,
    /// Events with a layer tag outside the closed set; dropped.
    pub anomalies: u64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    /// Fold one event into the per-layer accumulators.
    pub fn record(&mut self, event: &TraceEvent) {
        let Some(layer) = Layer::from_raw(event.layer) else {
            self.anomalies += 1;
            return;
        };

        self.events += 1;
        if event.request_id == 0 {
            self.unattributed += 1;
        }

        let s = &mut self.layers[layer.index()];
        s.events += 1;
        s.total_bytes += event.size;
        s.aligned_bytes += event.accounted_size();
        if event.is_metadata != 0 {
            s.metadata_ops += 1;
        }
        if event.is_journal != 0 {
            s.journal_ops += 1;
        }
        if event.cache_hit != 0 {
            s.cache_hits += 1;
        } else if event.kind == kind::OS_VFS_READ {
            s.cache_misses += 1;
        }
        s.total_latency_ns += event.latency_ns;
    }

    pub fn layer(&self, layer: Layer) -> &LayerStats {
        &self.layers[layer.index()]
    }

    /// Bytes requested at the application layer; the denominator of every
    /// amplification factor.
    pub fn application_bytes(&self) -> u64 {
        self.layer(Layer::Application).total_bytes
    }

    /// Amplification of `layer` against the application total, or `None`
    /// when no application bytes were observed.
    pub fn amplification(&self, layer: Layer) -> Option<f64> {
        let app = self.application_bytes();
        if app == 0 {
            return None;
        }
        Some(self.layer(layer).aligned_bytes as f64 / app as f64)
    }

    /// The bottom-most layer that saw traffic: device, else filesystem,
    /// else OS-aligned. Used for the headline amplification number.
    pub fn final_bytes(&self) -> u64 {
        let dev = self.layer(Layer::Device).total_bytes;
        if dev > 0 {
            return dev;
        }
        let fs = self.layer(Layer::Filesystem).total_bytes;
        if fs > 0 {
            return fs;
        }
        self.layer(Layer::Os).aligned_bytes
    }

    /// Headline amplification: final bytes over application bytes.
    pub fn total_amplification(&self) -> Option<f64> {
        let app = self.application_bytes();
        let fin = self.final_bytes();
        if app == 0 || fin == 0 {
            return None;
        }
        Some(fin as f64 / app as f64)
    }
}
