//! Tests for the request-flow correlator.
//!
//! Events are synthesized the way the probes would emit them for real
//! workloads; no eBPF or privileges required.
//!
//! Run with: `cargo test --test flow`

use strata::flow::{FlowTable, DEFAULT_FLOW_CAPACITY};
use strata_common::{kind, op, Layer, SystemTag, TraceEvent, PATH_LEN};

fn event(layer: Layer, kind: u32, request_id: u64, ts: u64) -> TraceEvent {
    let mut e = TraceEvent::zeroed();
    e.layer = layer as u8;
    e.kind = kind;
    e.request_id = request_id;
    e.timestamp_ns = ts;
    e
}

fn sized(mut e: TraceEvent, size: u64, aligned: u64) -> TraceEvent {
    e.size = size;
    e.aligned_size = aligned;
    e
}

fn with_path(mut e: TraceEvent, path: &str) -> TraceEvent {
    let bytes = path.as_bytes();
    let len = bytes.len().min(PATH_LEN - 1);
    e.path[..len].copy_from_slice(&bytes[..len]);
    e
}

/// A one-byte PUT flowing down all five layers, the shape of scenario S1:
/// tiny request, page-aligned OS traffic, 4 KiB device write.
#[test]
fn small_put_spans_all_layers() {
    let mut table = FlowTable::new(DEFAULT_FLOW_CAPACITY);
    let req = 0xabcd_0001;

    table.update(&sized(event(Layer::Application, kind::APP_WRITE, req, 100), 1, 1));
    table.update(&sized(event(Layer::Os, kind::OS_VFS_WRITE, req, 200), 1, 4096));
    table.update(&event(Layer::Filesystem, kind::FS_SYNC, req, 300));
    table.update(&sized(
        event(Layer::Device, kind::DEV_BIO_SUBMIT, req, 400),
        4096,
        4096,
    ));

    let flow = table.get(req).expect("flow created");
    assert_eq!(flow.app_bytes(), 1);
    assert_eq!(flow.layer_bytes(Layer::Os), 4096);
    assert_eq!(flow.layer_bytes(Layer::Device), 4096);
    assert_eq!(flow.op, op::PUT);
    assert_eq!(flow.vfs_writes, 1);
    assert_eq!(flow.bio_submits, 1);
    assert_eq!(flow.amplification(), Some(4096.0));
}

#[test]
fn get_op_from_read_kind() {
    let mut table = FlowTable::new(16);
    table.update(&sized(event(Layer::Application, kind::APP_READ, 5, 10), 512, 512));
    assert_eq!(table.get(5).unwrap().op, op::GET);
}

#[test]
fn os_layer_prefers_aligned_size() {
    let mut table = FlowTable::new(16);
    table.update(&sized(event(Layer::Os, kind::OS_VFS_WRITE, 9, 10), 100, 4096));
    assert_eq!(table.get(9).unwrap().layer_bytes(Layer::Os), 4096);
}

#[test]
fn zero_request_id_never_creates_a_flow() {
    let mut table = FlowTable::new(16);
    table.update(&sized(event(Layer::Os, kind::OS_VFS_WRITE, 0, 10), 100, 4096));
    table.update(&event(Layer::Device, kind::DEV_BIO_COMPLETE, 0, 20));
    assert!(table.is_empty());
}

#[test]
fn first_nonempty_path_wins() {
    let mut table = FlowTable::new(16);
    let req = 42;

    table.update(&event(Layer::Application, kind::APP_WRITE, req, 10));
    table.update(&with_path(
        event(Layer::StorageService, kind::SVC_METADATA_TOUCH, req, 20),
        "/data/bucket/obj/xl.meta",
    ));
    table.update(&with_path(
        event(Layer::StorageService, kind::SVC_ERASURE_WRITE, req, 30),
        "/data/bucket/obj/part.1",
    ));

    assert_eq!(
        table.get(req).unwrap().object_path.as_deref(),
        Some("/data/bucket/obj/xl.meta")
    );
}

#[test]
fn branch_bounds_hold() {
    let mut table = FlowTable::new(16);
    let req = 7;

    let mut branched = event(Layer::Application, kind::APP_WRITE, req, 10);
    branched.branch_count = 3;
    table.update(&branched);

    for ts in [20, 30] {
        table.update(&event(Layer::Device, kind::DEV_BIO_COMPLETE, req, ts));
    }

    let flow = table.get(req).unwrap();
    assert_eq!(flow.total_branches, 3);
    assert_eq!(flow.completed_branches, 2);
    assert!(flow.completed_branches <= flow.total_branches);
}

/// Completions beyond the announced branch count widen the bound instead of
/// violating it.
#[test]
fn completions_never_exceed_total_branches() {
    let mut table = FlowTable::new(16);
    let req = 8;

    for ts in [10, 20, 30] {
        table.update(&event(Layer::Device, kind::DEV_BIO_COMPLETE, req, ts));
    }

    let flow = table.get(req).unwrap();
    assert_eq!(flow.completed_branches, 3);
    assert!(flow.completed_branches <= flow.total_branches);
}

#[test]
fn parent_link_is_sticky() {
    let mut table = FlowTable::new(16);
    let req = 11;

    let mut child = event(Layer::Application, kind::APP_WRITE, req, 10);
    child.parent_request_id = 99;
    table.update(&child);

    let mut other = event(Layer::Os, kind::OS_VFS_WRITE, req, 20);
    other.parent_request_id = 77;
    table.update(&other);

    assert_eq!(table.get(req).unwrap().parent_id, 99);
}

#[test]
fn erasure_branches_accumulate_and_replication_is_first_seen() {
    let mut table = FlowTable::new(16);
    let req = 12;

    let mut erasure = event(Layer::StorageService, kind::SVC_ERASURE_WRITE, req, 10);
    erasure.is_erasure = 1;
    erasure.replication = 3;
    table.update(&erasure);

    let mut second = event(Layer::StorageService, kind::SVC_ERASURE_WRITE, req, 20);
    second.is_erasure = 1;
    second.replication = 5;
    table.update(&second);

    let flow = table.get(req).unwrap();
    assert_eq!(flow.erasure_branches, 2);
    assert_eq!(flow.replication_factor, 3, "first reported factor wins");
}

#[test]
fn metadata_and_journal_ops_count() {
    let mut table = FlowTable::new(16);
    let req = 13;

    let mut sync = event(Layer::Filesystem, kind::FS_SYNC, req, 10);
    sync.is_metadata = 1;
    table.update(&sync);

    let mut journal = sized(event(Layer::Device, kind::DEV_BIO_SUBMIT, req, 20), 4096, 4096);
    journal.is_journal = 1;
    table.update(&journal);

    let flow = table.get(req).unwrap();
    assert_eq!(flow.metadata_ops, 1);
    assert_eq!(flow.journal_ops, 1);
}

#[test]
fn eviction_keeps_capacity_and_counts() {
    let capacity = 8;
    let mut table = FlowTable::new(capacity);

    for i in 0..20u64 {
        table.update(&sized(
            event(Layer::Application, kind::APP_WRITE, 1000 + i, 100 + i),
            64,
            64,
        ));
    }

    assert_eq!(table.len(), capacity);
    assert_eq!(table.evicted, 12);

    // The survivors are the newest starts.
    for i in 12..20u64 {
        assert!(table.get(1000 + i).is_some(), "flow {} should survive", i);
    }
}

#[test]
fn sorted_by_start_is_chronological() {
    let mut table = FlowTable::new(16);
    table.update(&event(Layer::Application, kind::APP_WRITE, 1, 300));
    table.update(&event(Layer::Application, kind::APP_WRITE, 2, 100));
    table.update(&event(Layer::Application, kind::APP_WRITE, 3, 200));

    let order: Vec<u64> = table.sorted_by_start().iter().map(|f| f.request_id).collect();
    assert_eq!(order, vec![2, 3, 1]);
}

/// A 10 MiB write streamed through in page-sized VFS chunks stays close to
/// 1x: large requests amortize the fixed metadata cost.
#[test]
fn large_write_amplification_stays_low() {
    let mut table = FlowTable::new(16);
    let req = 31;
    let total: u64 = 10 * 1024 * 1024;

    table.update(&sized(event(Layer::Application, kind::APP_WRITE, req, 10), total, total));
    let chunk = 128 * 1024;
    for i in 0..(total / chunk) {
        table.update(&sized(
            event(Layer::Os, kind::OS_VFS_WRITE, req, 20 + i),
            chunk,
            chunk,
        ));
        table.update(&sized(
            event(Layer::Device, kind::DEV_BIO_SUBMIT, req, 21 + i),
            chunk,
            chunk,
        ));
    }
    // Journal tail.
    let mut journal = sized(event(Layer::Device, kind::DEV_BIO_SUBMIT, req, 999), 4096, 4096);
    journal.is_journal = 1;
    table.update(&journal);

    let flow = table.get(req).unwrap();
    let amp = flow.amplification().expect("app bytes present");
    assert!(amp >= 1.0, "device bytes at least cover the data: {amp}");
    assert!(amp <= 3.0, "large writes amortize overhead: {amp}");
}

/// Amplification is always finite and non-negative once application bytes
/// exist.
#[test]
fn amplification_is_finite_and_non_negative() {
    let mut table = FlowTable::new(16);
    let req = 32;

    table.update(&sized(event(Layer::Application, kind::APP_WRITE, req, 10), 1, 1));
    let flow = table.get(req).unwrap();
    let amp = flow.amplification().unwrap();
    assert!(amp.is_finite() && amp >= 0.0);

    for layer in [Layer::StorageService, Layer::Os, Layer::Filesystem, Layer::Device] {
        let amp = flow.layer_amplification(layer).unwrap();
        assert!(amp.is_finite() && amp >= 0.0);
    }
}

#[test]
fn system_tag_comes_from_application_event() {
    let mut table = FlowTable::new(16);
    let req = 21;

    let mut vfs = event(Layer::Os, kind::OS_VFS_WRITE, req, 10);
    vfs.system = SystemTag::Application as u32;
    table.update(&vfs);

    let mut app = event(Layer::Application, kind::APP_WRITE, req, 20);
    app.system = SystemTag::Minio as u32;
    table.update(&app);

    assert_eq!(table.get(req).unwrap().system, SystemTag::Minio);
}
