//! Request-flow correlation: the table keyed by request id.
//!
//! A flow record accumulates everything observed for one request id across
//! all five layers. Events with a zero request id never reach this table;
//! they are global-statistics-only. The table is capped; overflow evicts
//! the flow with the oldest start time and counts the eviction (evicted
//! flows were already folded into the layer statistics at ingest).

use strata_common::{kind, op, Layer, SystemTag, TraceEvent, LAYER_COUNT};

use crate::path_to_string;

/// Default flow-table capacity.
pub const DEFAULT_FLOW_CAPACITY: usize = 10_000;

/// Everything known about one request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowRecord {
    pub request_id: u64,
    pub parent_id: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub total_branches: u32,
    pub completed_branches: u32,
    /// Accumulated bytes per layer, indexed by [`Layer::index`].
    pub bytes: [u64; LAYER_COUNT],
    pub vfs_reads: u32,
    pub vfs_writes: u32,
    pub bio_submits: u32,
    pub metadata_ops: u32,
    pub journal_ops: u32,
    /// `op::GET` or `op::PUT`, taken from the first application event.
    pub op: u8,
    pub system: SystemTag,
    pub object_path: Option<String>,
    pub erasure_branches: u32,
    pub replication_factor: u32,
}

impl FlowRecord {
    fn new(request_id: u64) -> FlowRecord {
        FlowRecord {
            request_id,
            system: SystemTag::Unknown,
            ..FlowRecord::default()
        }
    }

    pub fn app_bytes(&self) -> u64 {
        self.bytes[Layer::Application.index()]
    }

    pub fn layer_bytes(&self, layer: Layer) -> u64 {
        self.bytes[layer.index()]
    }

    /// Bytes at the bottom-most layer this flow reached.
    pub fn final_bytes(&self) -> u64 {
        let dev = self.layer_bytes(Layer::Device);
        if dev > 0 {
            return dev;
        }
        let fs = self.layer_bytes(Layer::Filesystem);
        if fs > 0 {
            return fs;
        }
        self.layer_bytes(Layer::Os)
    }

    /// Amplification of one layer against this flow's application bytes.
    pub fn layer_amplification(&self, layer: Layer) -> Option<f64> {
        let app = self.app_bytes();
        if app == 0 {
            return None;
        }
        Some(self.layer_bytes(layer) as f64 / app as f64)
    }

    /// Headline amplification for this flow.
    pub fn amplification(&self) -> Option<f64> {
        let app = self.app_bytes();
        if app == 0 {
            return None;
        }
        Some(self.final_bytes() as f64 / app as f64)
    }

    pub fn op_name(&self) -> &'static str {
        if self.op == op::PUT {
            "PUT"
        } else {
            "GET"
        }
    }
}

/// The flow table plus its eviction accounting.
#[derive(Clone, Debug, Default)]
pub struct FlowTable {
    flows: std::collections::HashMap<u64, FlowRecord>,
    capacity: usize,
    /// Flows evicted on overflow.
    pub evicted: u64,
}

impl FlowTable {
    pub fn new(capacity: usize) -> FlowTable {
        FlowTable {
            flows: std::collections::HashMap::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, request_id: u64) -> Option<&FlowRecord> {
        self.flows.get(&request_id)
    }

    /// Fold one event into its flow. Events without a request id are
    /// ignored here; the caller accounts them globally.
    pub fn update(&mut self, event: &TraceEvent) {
        if event.request_id == 0 {
            return;
        }
        let Some(layer) = Layer::from_raw(event.layer) else {
            return;
        };

        if !self.flows.contains_key(&event.request_id) {
            self.make_room();
            self.flows
                .insert(event.request_id, FlowRecord::new(event.request_id));
        }
        let flow = self.flows.get_mut(&event.request_id).expect("just inserted");

        if event.parent_request_id != 0 && flow.parent_id == 0 {
            flow.parent_id = event.parent_request_id;
        }

        if flow.start_ns == 0 || event.timestamp_ns < flow.start_ns {
            flow.start_ns = event.timestamp_ns;
        }
        if event.timestamp_ns > flow.end_ns {
            flow.end_ns = event.timestamp_ns;
        }

        if event.branch_count > flow.total_branches {
            flow.total_branches = event.branch_count;
        }

        // OS events prefer the page-aligned size; accounted_size covers that.
        flow.bytes[layer.index()] += event.accounted_size();

        if layer == Layer::Application {
            flow.op = if event.kind == kind::APP_WRITE {
                op::PUT
            } else {
                op::GET
            };
            flow.system = SystemTag::from_raw(event.system);
        } else if flow.system == SystemTag::Unknown {
            flow.system = SystemTag::from_raw(event.system);
        }

        // First non-empty path wins.
        if flow.object_path.is_none() {
            flow.object_path = path_to_string(&event.path);
        }

        match event.kind {
            kind::OS_VFS_READ => flow.vfs_reads += 1,
            kind::OS_VFS_WRITE => flow.vfs_writes += 1,
            kind::DEV_BIO_SUBMIT => flow.bio_submits += 1,
            kind::DEV_BIO_COMPLETE => {
                flow.completed_branches += 1;
                // A completion implies the branch existed even if no
                // application entry announced it.
                if flow.completed_branches > flow.total_branches {
                    flow.total_branches = flow.completed_branches;
                }
            }
            _ => {}
        }

        if event.is_metadata != 0 {
            flow.metadata_ops += 1;
        }
        if event.is_journal != 0 {
            flow.journal_ops += 1;
        }
        if event.is_erasure != 0 {
            flow.erasure_branches += 1;
        }
        if event.replication > 0 && flow.replication_factor == 0 {
            flow.replication_factor = event.replication;
        }
    }

    /// Flows ordered by start time, oldest first.
    pub fn sorted_by_start(&self) -> Vec<&FlowRecord> {
        let mut flows: Vec<&FlowRecord> = self.flows.values().collect();
        flows.sort_by_key(|f| (f.start_ns, f.request_id));
        flows
    }

    /// Evict the oldest-start flow if the table is at capacity.
    fn make_room(&mut self) {
        if self.flows.len() < self.capacity {
            return;
        }
        if let Some(oldest) = self
            .flows
            .values()
            .min_by_key(|f| (f.start_ns, f.request_id))
            .map(|f| f.request_id)
        {
            self.flows.remove(&oldest);
            self.evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(layer: Layer, kind: u32, request_id: u64, size: u64, ts: u64) -> TraceEvent {
        let mut e = TraceEvent::zeroed();
        e.layer = layer as u8;
        e.kind = kind;
        e.request_id = request_id;
        e.size = size;
        e.aligned_size = size;
        e.timestamp_ns = ts;
        e
    }

    #[test]
    fn zero_request_id_is_not_tracked() {
        let mut table = FlowTable::new(10);
        table.update(&event(Layer::Os, kind::OS_VFS_WRITE, 0, 100, 1));
        assert!(table.is_empty());
    }

    #[test]
    fn timestamps_track_min_and_max() {
        let mut table = FlowTable::new(10);
        table.update(&event(Layer::Application, kind::APP_WRITE, 7, 10, 50));
        table.update(&event(Layer::Device, kind::DEV_BIO_SUBMIT, 7, 4096, 90));
        table.update(&event(Layer::Os, kind::OS_VFS_WRITE, 7, 10, 20));

        let flow = table.get(7).unwrap();
        assert_eq!(flow.start_ns, 20);
        assert_eq!(flow.end_ns, 90);
    }

    #[test]
    fn eviction_removes_oldest_start() {
        let mut table = FlowTable::new(2);
        table.update(&event(Layer::Application, kind::APP_WRITE, 1, 10, 100));
        table.update(&event(Layer::Application, kind::APP_WRITE, 2, 10, 50));
        table.update(&event(Layer::Application, kind::APP_WRITE, 3, 10, 200));

        assert_eq!(table.len(), 2);
        assert_eq!(table.evicted, 1);
        // Request 2 had the oldest start and is gone.
        assert!(table.get(2).is_none());
        assert!(table.get(1).is_some());
        assert!(table.get(3).is_some());
    }
}
