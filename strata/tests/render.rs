//! Tests for the streaming renderers.
//!
//! Run with: `cargo test --test render`

use strata::render::{human_line, json_line, ClockSync, EventLine};
use strata_common::{kind, Layer, SystemTag, TraceEvent, COMM_LEN, PATH_LEN};

fn base_event() -> TraceEvent {
    let mut e = TraceEvent::zeroed();
    e.timestamp_ns = 1_234_567_890;
    e.pid = 4242;
    e.tid = 4243;
    e.layer = Layer::Os as u8;
    e.kind = kind::OS_VFS_WRITE;
    e.system = SystemTag::Minio as u32;
    e.size = 100;
    e.aligned_size = 4096;
    e.latency_ns = 2500;
    e.request_id = 0x0000_beef_0000_cafe;
    let comm = b"minio";
    e.comm[..comm.len()].copy_from_slice(comm);
    e.is_target = 1;
    e
}

fn clock() -> ClockSync {
    ClockSync::fixed(0)
}

/// The JSON stream parses back to a record equal to the one built from the
/// in-memory event.
#[test]
fn json_line_round_trips() {
    let event = base_event();
    let clock = clock();

    let line = json_line(&event, &clock);
    let parsed: EventLine = serde_json::from_str(&line).expect("line parses");
    assert_eq!(parsed, EventLine::from_event(&event, &clock));
}

#[test]
fn json_fields_match_event() {
    let mut event = base_event();
    event.is_metadata = 1;
    let path = b"/data/xl.meta";
    event.path[..path.len()].copy_from_slice(path);

    let parsed: EventLine =
        serde_json::from_str(&json_line(&event, &clock())).expect("line parses");

    assert_eq!(parsed.layer, "OS");
    assert_eq!(parsed.event, "OS_VFS_WRITE");
    assert_eq!(parsed.pid, 4242);
    assert_eq!(parsed.comm, "minio");
    assert_eq!(parsed.system, "MinIO");
    assert_eq!(parsed.size, 100);
    assert_eq!(parsed.aligned_size, 4096);
    assert_eq!(parsed.latency_us, 2.5);
    assert_eq!(parsed.request_id, "0000beef0000cafe");
    assert!(parsed.is_metadata);
    assert!(!parsed.is_journal);
    assert!(parsed.is_target);
    assert_eq!(parsed.filename, "/data/xl.meta");
}

/// Comm and path longer than the wire buffers arrive truncated; the JSON
/// line carries the truncated values unchanged.
#[test]
fn truncated_strings_survive_round_trip() {
    let mut event = base_event();
    event.comm = [b'x'; COMM_LEN];
    event.comm[COMM_LEN - 1] = 0;
    event.path = [b'p'; PATH_LEN];
    event.path[PATH_LEN - 1] = 0;

    let parsed: EventLine =
        serde_json::from_str(&json_line(&event, &clock())).expect("line parses");
    assert_eq!(parsed.comm.len(), COMM_LEN - 1);
    assert_eq!(parsed.filename.len(), PATH_LEN - 1);
}

#[test]
fn human_line_has_columns_and_flags() {
    let mut event = base_event();
    event.is_metadata = 1;
    event.is_journal = 1;
    event.cache_hit = 1;
    event.inline_metadata = 1;

    let line = human_line(&event, &clock(), false, false, false);
    assert!(line.contains("OS"));
    assert!(line.contains("OS_VFS_WRITE"));
    assert!(line.contains("minio"));
    assert!(line.contains("[META]"));
    assert!(line.contains("[JRNL]"));
    assert!(line.contains("[HIT]"));
    assert!(line.contains("[TARGET]"));
    assert!(line.contains("[METAFILE]"));
}

#[test]
fn correlation_annotations_appear_when_enabled() {
    let mut event = base_event();
    event.branch_id = 2;
    event.branch_count = 4;
    event.parent_request_id = 0x1111_2222_3333_4444;

    let plain = human_line(&event, &clock(), false, false, false);
    assert!(!plain.contains("[REQ:"));

    let correlated = human_line(&event, &clock(), true, false, false);
    assert!(correlated.contains("[REQ:0000cafe]"));
    assert!(correlated.contains("[BRANCH 2/4]"));
    assert!(correlated.contains("[CHILD OF 33334444]"));
}

#[test]
fn verbose_prints_path_continuation() {
    let mut event = base_event();
    let path = b"/data/bucket/obj/part.1";
    event.path[..path.len()].copy_from_slice(path);

    let terse = human_line(&event, &clock(), false, false, false);
    assert!(!terse.contains("part.1"));

    let verbose = human_line(&event, &clock(), false, false, true);
    assert!(verbose.contains("\n    -> /data/bucket/obj/part.1"));
}

#[test]
fn color_wraps_target_events_only() {
    let mut event = base_event();
    let colored = human_line(&event, &clock(), false, true, false);
    assert!(colored.starts_with("\x1b[1;36m"));

    event.is_target = 0;
    let uncolored = human_line(&event, &clock(), false, true, false);
    assert!(!uncolored.contains("\x1b["));
}

#[test]
fn unattributed_event_has_zero_request_id() {
    let mut event = base_event();
    event.request_id = 0;

    let line = human_line(&event, &clock(), true, false, false);
    assert!(!line.contains("[REQ:"), "request id 0 is not annotated");

    let parsed: EventLine =
        serde_json::from_str(&json_line(&event, &clock())).expect("line parses");
    assert_eq!(parsed.request_id, "0000000000000000");
}
