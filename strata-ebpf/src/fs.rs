//! Filesystem-layer probes: fsync ranges and inode dirtying.
//!
//! Sync events carry no byte size; the device layer bears the journal cost.
//! The inode-dirty probe is optional; the agent tolerates its attach
//! failing on kernels where the symbol is unavailable.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::kprobe,
    programs::ProbeContext,
};
use strata_common::{kind, Layer};

use crate::{config, init_event, kernel, reserve_event, task_is_target, REQUESTS};

#[kprobe]
pub fn vfs_fsync_range(ctx: ProbeContext) -> u32 {
    match fs_meta_entry(&ctx, kind::FS_SYNC, 0) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[kprobe]
pub fn mark_inode_dirty(ctx: ProbeContext) -> u32 {
    // __mark_inode_dirty(inode, flags)
    let inode_ptr: usize = match ctx.arg::<u64>(0) {
        Some(p) => p as usize,
        None => 0,
    };
    match fs_meta_entry(&ctx, kind::FS_INODE_DIRTY, inode_ptr) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[inline(always)]
fn fs_meta_entry(_ctx: &ProbeContext, event_kind: u32, inode_ptr: usize) -> Result<u32, i64> {
    let cfg = config();
    if cfg.mode == strata_common::mode::OFF || cfg.trace_metadata == 0 {
        return Ok(0);
    }

    let comm = bpf_get_current_comm().map_err(|e| e as i64)?;
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;

    if !task_is_target(&cfg, &comm, pid) {
        return Ok(0);
    }

    let Some(mut entry) = reserve_event() else {
        return Ok(0);
    };
    let event = entry.as_mut_ptr();
    unsafe {
        init_event(event);
        (*event).timestamp_ns = bpf_ktime_get_ns();
        (*event).pid = pid;
        (*event).tid = pid_tgid as u32;
        (*event).layer = Layer::Filesystem as u8;
        (*event).kind = event_kind;
        (*event).is_metadata = 1;
        (*event).inode = kernel::inode_ino(inode_ptr);
        (*event).system = strata_common::detect_system(&comm) as u32;
        (*event).is_target = 1;
        (*event).comm = comm;

        if let Some(req) = REQUESTS.get(&pid_tgid) {
            (*event).request_id = req.request_id;
            (*event).parent_request_id = req.parent_request_id;
            (*event).branch_id = req.branch_count;
            (*event).branch_count = req.branch_count;
            (*event).system = req.system;
        }
    }
    entry.submit(0);

    Ok(0)
}
