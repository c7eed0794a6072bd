//! OS-layer probes: VFS read/write entry.
//!
//! The OS layer reports what the page cache actually has to move, so the
//! event carries both the requested count and the page-rounded size. The
//! inode is read defensively; a zero inode is an accepted outcome.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::kprobe,
    programs::ProbeContext,
};
use strata_common::{kind, page_align, Layer};

use crate::{config, init_event, kernel, reserve_event, task_is_target, REQUESTS};

#[kprobe]
pub fn vfs_read(ctx: ProbeContext) -> u32 {
    match vfs_rw_entry(&ctx, kind::OS_VFS_READ) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[kprobe]
pub fn vfs_write(ctx: ProbeContext) -> u32 {
    match vfs_rw_entry(&ctx, kind::OS_VFS_WRITE) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[inline(always)]
fn vfs_rw_entry(ctx: &ProbeContext, event_kind: u32) -> Result<u32, i64> {
    let cfg = config();
    if cfg.mode == strata_common::mode::OFF {
        return Ok(0);
    }

    let comm = bpf_get_current_comm().map_err(|e| e as i64)?;
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;

    if !task_is_target(&cfg, &comm, pid) {
        return Ok(0);
    }

    // vfs_read(file, buf, count, pos)
    let file: u64 = ctx.arg(0).ok_or(1i64)?;
    let count: u64 = ctx.arg(2).ok_or(1i64)?;

    let Some(mut entry) = reserve_event() else {
        return Ok(0);
    };
    let event = entry.as_mut_ptr();
    unsafe {
        init_event(event);
        (*event).timestamp_ns = bpf_ktime_get_ns();
        (*event).pid = pid;
        (*event).tid = pid_tgid as u32;
        (*event).layer = Layer::Os as u8;
        (*event).kind = event_kind;
        (*event).size = count;
        (*event).aligned_size = page_align(count);
        (*event).inode = kernel::file_inode(file as usize);
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
