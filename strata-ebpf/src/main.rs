//! strata eBPF probes: multi-layer I/O event producers.
//!
//! One probe per instrumented hook, spread over five layers of the storage
//! stack. Every probe is a short, allocation-free routine whose only side
//! effect is one event submitted to the `EVENTS` ring buffer. Probes never
//! propagate errors; anything that fails mid-probe either zeroes the affected
//! field or drops the event and bumps a counter.

#![no_std]
#![no_main]

mod app;
mod dev;
mod fs;
mod kernel;
mod os;
mod svc;

use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, RingBuf},
};
use strata_common::{counter, BioTiming, RequestContext, TraceConfig, TraceEvent, COMM_LEN};

/// Ring buffer carrying events to user space. Reservation failure under
/// back-pressure drops the event and bumps the loss counter.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

/// Per-task request contexts, keyed by `pid_tgid`. Entries are removed on
/// task exit here and by an age sweep from user space.
#[map]
static REQUESTS: HashMap<u64, RequestContext> = HashMap::with_max_entries(10240, 0);

/// Submit timestamps keyed by bio address, for device-layer latency.
#[map]
static BIO_TIMING: HashMap<u64, BioTiming> = HashMap::with_max_entries(10240, 0);

/// Explicit target pids, used in `by_pid` mode.
#[map]
static TARGET_PIDS: HashMap<u32, u8> = HashMap::with_max_entries(128, 0);

/// Single-entry configuration record, installed once before attach.
#[map]
static CONFIG: Array<TraceConfig> = Array::with_max_entries(1, 0);

/// Runtime transient-error counters, read by user space at summary time.
#[map]
static COUNTERS: Array<u64> = Array::with_max_entries(counter::SLOTS, 0);

/// Snapshot the installed configuration; tracing is off until the agent
/// writes the record.
#[inline(always)]
fn config() -> TraceConfig {
    match CONFIG.get(0) {
        Some(cfg) => *cfg,
        None => TraceConfig::disabled(),
    }
}

#[inline(always)]
fn counter_bump(slot: u32) {
    if let Some(v) = COUNTERS.get_ptr_mut(slot) {
        unsafe { *v += 1 };
    }
}

/// Target decision for the current task under the installed policy.
#[inline(always)]
fn task_is_target(cfg: &TraceConfig, comm: &[u8; COMM_LEN], pid: u32) -> bool {
    let pid_in_set = unsafe { TARGET_PIDS.get(&pid).is_some() };
    strata_common::is_target(cfg, comm, pid_in_set)
}

/// Reserve a zeroed event slot, or account the drop.
///
/// The record is built directly in ring memory; a 384-byte event does not
/// fit on the probe stack alongside locals.
#[inline(always)]
fn reserve_event() -> Option<aya_ebpf::maps::ring_buf::RingBufEntry<TraceEvent>> {
    match EVENTS.reserve::<TraceEvent>(0) {
        Some(entry) => Some(entry),
        None => {
            counter_bump(counter::RING_DROPS);
            None
        }
    }
}

/// Zero an in-ring event before the probe fills its fields.
#[inline(always)]
unsafe fn init_event(event: *mut TraceEvent) {
    core::ptr::write_bytes(event, 0, 1);
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
