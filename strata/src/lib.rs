//! strata library: loading and attaching the probe set, installing the
//! probe configuration, and the user-space half of the tracer: flow
//! correlation, layer statistics, stream rendering, summary and CSV export.

use anyhow::{anyhow, Context, Result};
use aya::{
    maps::{Array, HashMap as BpfHashMap, MapData},
    programs::{KProbe, TracePoint},
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use std::path::Path;
use strata_common::{counter, RequestContext, TraceConfig, COMM_LEN};

pub mod export;
pub mod flow;
pub mod metrics;
pub mod render;
pub mod stats;
pub mod summary;

/// Syscall and scheduler tracepoints, attached under their category.
const TRACEPOINTS: &[(&str, &str)] = &[
    ("syscalls", "sys_enter_read"),
    ("syscalls", "sys_enter_write"),
    ("syscalls", "sys_enter_openat"),
    ("sched", "sched_process_exit"),
];

/// Kprobes that must attach for the tracer to be useful: program name and
/// target symbol.
const KPROBES: &[(&str, &str)] = &[
    ("vfs_read", "vfs_read"),
    ("vfs_write", "vfs_write"),
    ("submit_bio", "submit_bio"),
    ("bio_endio", "bio_endio"),
];

/// Kprobes whose absence degrades gracefully (symbol availability varies
/// across kernels and configs).
const OPTIONAL_KPROBES: &[(&str, &str)] = &[("splice_direct", "do_splice_direct")];

/// Metadata-tracking kprobes, attached only with `-T`.
const METADATA_KPROBES: &[(&str, &str)] = &[("vfs_fsync_range", "vfs_fsync_range")];
const OPTIONAL_METADATA_KPROBES: &[(&str, &str)] = &[("mark_inode_dirty", "__mark_inode_dirty")];

/// Convert a string to a fixed-size comm buffer (NUL-terminated).
pub fn string_to_comm(s: &str) -> [u8; COMM_LEN] {
    let mut comm = [0u8; COMM_LEN];
    let bytes = s.as_bytes();
    let len = bytes.len().min(COMM_LEN - 1);
    comm[..len].copy_from_slice(&bytes[..len]);
    comm
}

/// Format a comm buffer as a string.
pub fn comm_to_string(comm: &[u8; COMM_LEN]) -> String {
    let len = comm.iter().position(|&c| c == 0).unwrap_or(COMM_LEN);
    String::from_utf8_lossy(&comm[..len]).to_string()
}

/// Format a captured path buffer as a string; `None` when empty.
pub fn path_to_string(path: &[u8]) -> Option<String> {
    if path.first().copied().unwrap_or(0) == 0 {
        return None;
    }
    let len = path.iter().position(|&c| c == 0).unwrap_or(path.len());
    Some(String::from_utf8_lossy(&path[..len]).to_string())
}

/// The comm this process runs under, read back from the kernel so the
/// self-exclusion check compares what the classifier will actually see.
pub fn own_comm() -> [u8; COMM_LEN] {
    std::fs::read_to_string("/proc/self/comm")
        .map(|s| string_to_comm(s.trim_end()))
        .unwrap_or_else(|_| string_to_comm("strata"))
}

/// Current CLOCK_MONOTONIC time, the clock the probes stamp events with.
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Raise RLIMIT_MEMLOCK so older kernels can lock the map memory.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(anyhow!("failed to raise RLIMIT_MEMLOCK"));
    }
    Ok(())
}

/// Load the probe object from disk.
pub fn load_probes(bpf_path: &Path) -> Result<Ebpf> {
    let data = std::fs::read(bpf_path)
        .with_context(|| format!("Failed to read eBPF object file: {:?}", bpf_path))?;

    let mut bpf = Ebpf::load(&data).context("Failed to load eBPF object")?;

    // Kernel-side logs are optional; missing log maps are fine.
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        debug!("Failed to initialize eBPF logger: {}", e);
    }

    Ok(bpf)
}

/// Install the probe configuration. Must happen before attach; the probes
/// only ever read it afterwards.
pub fn install_config(bpf: &mut Ebpf, cfg: &TraceConfig) -> Result<()> {
    let map = bpf
        .map_mut("CONFIG")
        .ok_or_else(|| anyhow!("CONFIG map not found"))?;
    let mut config: Array<_, TraceConfig> = Array::try_from(map)?;
    config
        .set(0, *cfg, 0)
        .context("Failed to install probe configuration")?;
    Ok(())
}

/// Add a pid to the kernel target-pid set.
pub fn add_target_pid(bpf: &mut Ebpf, pid: u32) -> Result<()> {
    let map = bpf
        .map_mut("TARGET_PIDS")
        .ok_or_else(|| anyhow!("TARGET_PIDS map not found"))?;
    let mut pids: BpfHashMap<_, u32, u8> = BpfHashMap::try_from(map)?;
    pids.insert(pid, 1, 0)
        .with_context(|| format!("Failed to add target pid {}", pid))?;
    Ok(())
}

/// Scan `/proc` for processes whose comm equals `name` exactly.
pub fn discover_pids(name: &str) -> Vec<u32> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return found;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let comm_path = entry.path().join("comm");
        if let Ok(comm) = std::fs::read_to_string(&comm_path) {
            if comm.trim_end() == name {
                found.push(pid);
            }
        }
    }
    found
}

/// Attach the probe set. `trace_metadata` additionally attaches the fsync
/// and inode-dirty probes; optional probes log a warning instead of failing.
pub fn attach_probes(bpf: &mut Ebpf, trace_metadata: bool) -> Result<()> {
    for (category, name) in TRACEPOINTS {
        let prog: &mut TracePoint = bpf
            .program_mut(name)
            .with_context(|| format!("tracepoint program {} not found", name))?
            .try_into()?;
        prog.load()?;
        prog.attach(category, name)
            .with_context(|| format!("Failed to attach tracepoint {}/{}", category, name))?;
        info!("Attached tracepoint {}/{}", category, name);
    }

    for (name, symbol) in KPROBES {
        attach_kprobe(bpf, name, symbol)?;
        info!("Attached kprobe to {}", symbol);
    }

    for (name, symbol) in OPTIONAL_KPROBES {
        match attach_kprobe(bpf, name, symbol) {
            Ok(()) => info!("Attached kprobe to {}", symbol),
            Err(e) => warn!("Optional kprobe {} unavailable: {}", symbol, e),
        }
    }

    if trace_metadata {
        for (name, symbol) in METADATA_KPROBES {
            attach_kprobe(bpf, name, symbol)?;
            info!("Attached kprobe to {}", symbol);
        }
        for (name, symbol) in OPTIONAL_METADATA_KPROBES {
            match attach_kprobe(bpf, name, symbol) {
                Ok(()) => info!("Attached kprobe to {}", symbol),
                Err(e) => warn!("Optional kprobe {} unavailable: {}", symbol, e),
            }
        }
    }

    Ok(())
}

fn attach_kprobe(bpf: &mut Ebpf, name: &str, symbol: &str) -> Result<()> {
    let prog: &mut KProbe = bpf
        .program_mut(name)
        .with_context(|| format!("kprobe program {} not found", name))?
        .try_into()?;
    prog.load()?;
    prog.attach(symbol, 0)
        .with_context(|| format!("Failed to attach kprobe {}", symbol))?;
    Ok(())
}

/// Kernel-side transient-error counters, surfaced in the summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelCounters {
    pub ring_drops: u64,
    pub ctx_table_full: u64,
    pub bio_table_full: u64,
}

/// Read the counter array. Missing slots read as zero.
pub fn read_counters(bpf: &mut Ebpf) -> Result<KernelCounters> {
    let map = bpf
        .map("COUNTERS")
        .ok_or_else(|| anyhow!("COUNTERS map not found"))?;
    let counters: Array<_, u64> = Array::try_from(map)?;
    Ok(KernelCounters {
        ring_drops: counters.get(&counter::RING_DROPS, 0).unwrap_or(0),
        ctx_table_full: counters.get(&counter::CTX_TABLE_FULL, 0).unwrap_or(0),
        bio_table_full: counters.get(&counter::BIO_TABLE_FULL, 0).unwrap_or(0),
    })
}

/// Drain whatever the ring buffer currently holds.
///
/// The agent's poll loop consumes the ring through an `AsyncFd`; this
/// synchronous variant exists for integration tests.
pub fn read_events(bpf: &mut Ebpf) -> Result<Vec<strata_common::TraceEvent>> {
    let map = bpf
        .map_mut("EVENTS")
        .ok_or_else(|| anyhow!("EVENTS map not found"))?;
    let mut ring = aya::maps::RingBuf::try_from(map)?;
    let mut events = Vec::new();

    while let Some(item) = ring.next() {
        if item.len() >= std::mem::size_of::<strata_common::TraceEvent>() {
            let event: strata_common::TraceEvent =
                unsafe { std::ptr::read_unaligned(item.as_ptr() as *const _) };
            events.push(event);
        }
    }

    Ok(events)
}

/// Evict request contexts older than `max_age_ns` from the kernel table.
///
/// The kernel deletes contexts on task exit; this sweep catches tasks that
/// went quiet without exiting. Returns the number of entries removed.
pub fn sweep_contexts(bpf: &mut Ebpf, max_age_ns: u64) -> Result<usize> {
    let now = monotonic_now_ns();
    let map = bpf
        .map_mut("REQUESTS")
        .ok_or_else(|| anyhow!("REQUESTS map not found"))?;
    let mut requests: BpfHashMap<&mut MapData, u64, RequestContext> = BpfHashMap::try_from(map)?;

    let stale: Vec<u64> = requests
        .iter()
        .filter_map(|entry| entry.ok())
        .filter(|(_, ctx)| now.saturating_sub(ctx.start_ns) > max_age_ns)
        .map(|(key, _)| key)
        .collect();

    let mut removed = 0;
    for key in stale {
        if requests.remove(&key).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("Swept {} stale request contexts", removed);
    }
    Ok(removed)
}
