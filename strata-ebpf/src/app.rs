//! Application-layer probes: read/write syscall entry and task exit.
//!
//! Syscall entry is where a request context is created (or branched) for the
//! current task; every higher layer copies its request id from that context.
//! Exit of the task, not of the syscall, is what deletes the context; a
//! single logical request commonly spans many syscalls.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::tracepoint,
    programs::TracePointContext,
};
use strata_common::{counter, kind, make_request_id, op, Layer, RequestContext};

use crate::{config, counter_bump, init_event, reserve_event, task_is_target, REQUESTS};

/// Offset of the `count` argument in sys_enter_read/sys_enter_write.
/// Tracepoint args are 8-byte slots starting at offset 16: fd, buf, count.
const RW_COUNT_OFFSET: usize = 32;

#[tracepoint(category = "syscalls", name = "sys_enter_read")]
pub fn sys_enter_read(ctx: TracePointContext) -> u32 {
    match app_rw_enter(&ctx, kind::APP_READ, op::GET) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[tracepoint(category = "syscalls", name = "sys_enter_write")]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    match app_rw_enter(&ctx, kind::APP_WRITE, op::PUT) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

/// Delete the request context when the task itself goes away.
#[tracepoint(category = "sched", name = "sched_process_exit")]
pub fn sched_process_exit(_ctx: TracePointContext) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    let _ = REQUESTS.remove(&pid_tgid);
    0
}

#[inline(always)]
fn app_rw_enter(ctx: &TracePointContext, event_kind: u32, op_kind: u8) -> Result<u32, i64> {
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

    let count = unsafe { ctx.read_at::<u64>(RW_COUNT_OFFSET)? };
    let now = unsafe { bpf_ktime_get_ns() };
    let system = strata_common::detect_system(&comm);

    // Install or branch the per-task context. A reentrant entry whose stored
    // context carries a parent id is a branch of the same logical request.
    let mut req = RequestContext {
        request_id: 0,
        parent_request_id: 0,
        start_ns: now,
        original_size: count,
        system: system as u32,
        branch_count: 0,
        op: op_kind,
        is_target: 1,
        _pad: [0; 6],
    };
    match unsafe { REQUESTS.get(&pid_tgid) } {
        Some(existing) if existing.parent_request_id != 0 => {
            req = *existing;
            req.branch_count += 1;
        }
        _ => {
            req.request_id = make_request_id(pid_tgid, now);
        }
    }

    // A full table costs the correlation, never the event.
    let correlated = match REQUESTS.insert(&pid_tgid, &req, 0) {
        Ok(()) => true,
        Err(_) => {
            counter_bump(counter::CTX_TABLE_FULL);
            false
        }
    };

    let Some(mut entry) = reserve_event() else {
        return Ok(0);
    };
    let event = entry.as_mut_ptr();
    unsafe {
        init_event(event);
        (*event).timestamp_ns = now;
        (*event).pid = pid;
        (*event).tid = pid_tgid as u32;
        (*event).layer = Layer::Application as u8;
        (*event).kind = event_kind;
        (*event).system = system as u32;
        (*event).size = count;
        (*event).aligned_size = count;
        if correlated {
            (*event).request_id = req.request_id;
            (*event).parent_request_id = req.parent_request_id;
            (*event).branch_id = req.branch_count;
            (*event).branch_count = req.branch_count;
        }
        (*event).is_target = 1;
        (*event).comm = comm;
    }
    entry.submit(0);

    Ok(0)
}
