//! Streaming output: one human-readable or JSON line per event.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};
use strata_common::{kind_name, Layer, SystemTag, TraceEvent};
use time::OffsetDateTime;

use crate::{comm_to_string, monotonic_now_ns, path_to_string};

/// Maps the monotonic timestamps the probes emit onto the wall clock.
///
/// The offset is sampled once at startup; event rendering only needs
/// millisecond fidelity.
#[derive(Clone, Copy, Debug)]
pub struct ClockSync {
    offset_ns: i128,
}

impl ClockSync {
    pub fn new() -> ClockSync {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        let mono = monotonic_now_ns() as i128;
        ClockSync {
            offset_ns: wall - mono,
        }
    }

    /// A fixed offset, for deterministic rendering in tests.
    pub fn fixed(offset_ns: i128) -> ClockSync {
        ClockSync { offset_ns }
    }

    pub fn wall_ns(&self, mono_ns: u64) -> i128 {
        self.offset_ns + mono_ns as i128
    }

    fn wall_time(&self, mono_ns: u64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(self.wall_ns(mono_ns))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

impl Default for ClockSync {
    fn default() -> ClockSync {
        ClockSync::new()
    }
}

fn layer_name(raw: u8) -> &'static str {
    Layer::from_raw(raw).map(Layer::name).unwrap_or("UNKNOWN")
}

/// `HH:MM:SS.mmm` wall-clock stamp.
fn stamp_millis(clock: &ClockSync, mono_ns: u64) -> String {
    let t = clock.wall_time(mono_ns);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        t.hour(),
        t.minute(),
        t.second(),
        t.millisecond()
    )
}

/// `HH:MM:SS.nnnnnnnnn` stamp with the nanosecond tail, for JSON lines.
fn stamp_nanos(clock: &ClockSync, mono_ns: u64) -> String {
    let t = clock.wall_time(mono_ns);
    format!(
        "{:02}:{:02}:{:02}.{:09}",
        t.hour(),
        t.minute(),
        t.second(),
        t.nanosecond()
    )
}

/// Column header for the human stream.
pub fn human_header() -> String {
    format!(
        "{:<16} {:<12} {:<20} {:>8} {:>8} {:>9} {:<15} FLAGS\n{}",
        "TIME",
        "LAYER",
        "EVENT",
        "SIZE",
        "ALIGNED",
        "LAT(us)",
        "COMM",
        "=".repeat(96)
    )
}

/// Render one event as a human-readable line. With `verbose`, a captured
/// path is printed on a continuation line. `color` wraps target events in
/// cyan.
pub fn human_line(
    event: &TraceEvent,
    clock: &ClockSync,
    correlate: bool,
    color: bool,
    verbose: bool,
) -> String {
    let mut line = String::with_capacity(160);

    let colored = color && event.is_target != 0;
    if colored {
        line.push_str("\x1b[1;36m");
    }

    let _ = write!(
        line,
        "{:<16} {:<12} {:<20} {:>8} {:>8} {:>9.2} {:<15}",
        stamp_millis(clock, event.timestamp_ns),
        layer_name(event.layer),
        kind_name(event.kind),
        event.size,
        event.accounted_size(),
        event.latency_ns as f64 / 1000.0,
        comm_to_string(&event.comm),
    );

    if event.is_metadata != 0 {
        line.push_str(" [META]");
    }
    if event.is_journal != 0 {
        line.push_str(" [JRNL]");
    }
    if event.cache_hit != 0 {
        line.push_str(" [HIT]");
    }
    if event.is_target != 0 {
        line.push_str(" [TARGET]");
    }
    if event.inline_metadata != 0 {
        line.push_str(" [METAFILE]");
    }

    if correlate && event.request_id != 0 {
        let _ = write!(line, " [REQ:{:08x}]", event.request_id & 0xFFFF_FFFF);
        if event.branch_count > 1 {
            let _ = write!(line, " [BRANCH {}/{}]", event.branch_id, event.branch_count);
        }
        if event.parent_request_id != 0 {
            let _ = write!(
                line,
                " [CHILD OF {:08x}]",
                event.parent_request_id & 0xFFFF_FFFF
            );
        }
    }

    if colored {
        line.push_str("\x1b[0m");
    }

    if verbose {
        if let Some(path) = path_to_string(&event.path) {
            let _ = write!(line, "\n    -> {}", path);
        }
    }

    line
}

/// One line of the JSON stream. Parsing a rendered line back yields a value
/// equal to the one produced from the event, up to comm/path truncation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLine {
    pub timestamp: String,
    pub layer: String,
    pub event: String,
    pub pid: u32,
    pub comm: String,
    pub system: String,
    pub size: u64,
    pub aligned_size: u64,
    pub latency_us: f64,
    pub request_id: String,
    pub is_metadata: bool,
    pub is_journal: bool,
    pub cache_hit: bool,
    pub is_target: bool,
    pub filename: String,
}

impl EventLine {
    pub fn from_event(event: &TraceEvent, clock: &ClockSync) -> EventLine {
        EventLine {
            timestamp: stamp_nanos(clock, event.timestamp_ns),
            layer: layer_name(event.layer).to_string(),
            event: kind_name(event.kind).to_string(),
            pid: event.pid,
            comm: comm_to_string(&event.comm),
            system: SystemTag::from_raw(event.system).name().to_string(),
            size: event.size,
            aligned_size: event.accounted_size(),
            latency_us: event.latency_ns as f64 / 1000.0,
            request_id: format!("{:016x}", event.request_id),
            is_metadata: event.is_metadata != 0,
            is_journal: event.is_journal != 0,
            cache_hit: event.cache_hit != 0,
            is_target: event.is_target != 0,
            filename: path_to_string(&event.path).unwrap_or_default(),
        }
    }
}

/// Render one event as a newline-delimited JSON object.
pub fn json_line(event: &TraceEvent, clock: &ClockSync) -> String {
    serde_json::to_string(&EventLine::from_event(event, clock))
        .unwrap_or_else(|_| String::from("{}"))
}
