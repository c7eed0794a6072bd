//! Storage-service layer probes: openat path classification and splice.
//!
//! The service layer has no kernel hook of its own; it is inferred from what
//! a target daemon touches. An openat whose path matches a known metadata or
//! erasure-part pattern is reclassified from a plain application open to a
//! storage-service touch. Splice traffic (multipart object assembly) is
//! reported with its byte count.

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
        bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use strata_common::{classify_path, kind, Layer, PathClass};

use crate::{config, init_event, reserve_event, task_is_target, REQUESTS};

/// Offset of the `filename` pointer in sys_enter_openat.
const OPENAT_FILENAME_OFFSET: usize = 24;

#[tracepoint(category = "syscalls", name = "sys_enter_openat")]
pub fn sys_enter_openat(ctx: TracePointContext) -> u32 {
    match openat_enter(&ctx) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[kprobe]
pub fn splice_direct(ctx: ProbeContext) -> u32 {
    match splice_enter(&ctx) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[inline(always)]
fn openat_enter(ctx: &TracePointContext) -> Result<u32, i64> {
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

    let filename = unsafe { ctx.read_at::<u64>(OPENAT_FILENAME_OFFSET)? };

    let Some(mut entry) = reserve_event() else {
        return Ok(0);
    };
    let event = entry.as_mut_ptr();
    unsafe {
        init_event(event);
        (*event).timestamp_ns = bpf_ktime_get_ns();
        (*event).pid = pid;
        (*event).tid = pid_tgid as u32;
        (*event).layer = Layer::Application as u8;
        (*event).kind = kind::APP_OPEN;
        (*event).system = strata_common::detect_system(&comm) as u32;
        (*event).is_target = 1;
        (*event).comm = comm;

        // Bounded copy straight into the event; an unreadable path leaves the
        // field zeroed and the event still goes out.
        if filename != 0 {
            let _ = bpf_probe_read_user_str_bytes(filename as *const u8, &mut (*event).path);
        }

        if cfg.trace_erasure != 0 {
            match classify_path(&(*event).path) {
                Some(PathClass::InlineMetadata) => {
                    (*event).layer = Layer::StorageService as u8;
                    (*event).kind = kind::SVC_METADATA_TOUCH;
                    (*event).is_metadata = 1;
                    (*event).inline_metadata = 1;
                }
                Some(PathClass::ErasurePart) => {
                    (*event).layer = Layer::StorageService as u8;
                    (*event).kind = kind::SVC_ERASURE_WRITE;
                    (*event).is_erasure = 1;
                }
                None => {}
            }
        }

        if let Some(req) = REQUESTS.get(&pid_tgid) {
            (*event).request_id = req.request_id;
            (*event).parent_request_id = req.parent_request_id;
            (*event).branch_id = req.branch_count;
            (*event).branch_count = req.branch_count;
        }
    }
    entry.submit(0);

    Ok(0)
}

#[inline(always)]
fn splice_enter(ctx: &ProbeContext) -> Result<u32, i64> {
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

    // do_splice_direct(in, ppos, out, opos, len, flags)
    let len: u64 = ctx.arg(4).ok_or(1i64)?;

    let Some(mut entry) = reserve_event() else {
        return Ok(0);
    };
    let event = entry.as_mut_ptr();
    unsafe {
        init_event(event);
        (*event).timestamp_ns = bpf_ktime_get_ns();
        (*event).pid = pid;
        (*event).tid = pid_tgid as u32;
        (*event).layer = Layer::StorageService as u8;
        (*event).kind = kind::SVC_MULTIPART;
        (*event).system = strata_common::detect_system(&comm) as u32;
        (*event).size = len;
        (*event).is_target = 1;
        (*event).comm = comm;

        if let Some(req) = REQUESTS.get(&pid_tgid) {
            (*event).request_id = req.request_id;
            (*event).parent_request_id = req.parent_request_id;
            (*event).branch_id = req.branch_count;
            (*event).branch_count = req.branch_count;
        }
    }
    entry.submit(0);

    Ok(0)
}
