//! Device-layer probes: block I/O submit and completion.
//!
//! Submit installs a timing record keyed by the bio address; completion
//! consumes it to compute latency. The request id travels inside the timing
//! record because `bio_endio` often runs on a worker thread with no request
//! context of its own. Submissions at or below the configured threshold are
//! tagged as journal traffic, a heuristic applied when no better signal
//! exists.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::kprobe,
    programs::ProbeContext,
};
use strata_common::{counter, kind, BioTiming, Layer};

use crate::{
    config, counter_bump, init_event, kernel, reserve_event, task_is_target, BIO_TIMING, REQUESTS,
};

#[kprobe]
pub fn submit_bio(ctx: ProbeContext) -> u32 {
    match bio_submit(&ctx) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[kprobe]
pub fn bio_endio(ctx: ProbeContext) -> u32 {
    match bio_complete(&ctx) {
        Ok(v) => v,
        Err(_) => 0,
    }
}

#[inline(always)]
fn bio_submit(ctx: &ProbeContext) -> Result<u32, i64> {
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

    let bio: usize = ctx.arg::<u64>(0).ok_or(1i64)? as usize;
    if bio == 0 {
        return Ok(0);
    }

    let now = unsafe { bpf_ktime_get_ns() };
    let size = kernel::bio_size(bio) as u64;
    let sector = kernel::bio_sector(bio);
    let dev = kernel::bio_dev(bio);

    let mut request_id = 0u64;
    let mut parent_id = 0u64;
    let mut branches = 0u32;
    let mut system = strata_common::detect_system(&comm) as u32;
    if let Some(req) = unsafe { REQUESTS.get(&pid_tgid) } {
        request_id = req.request_id;
        parent_id = req.parent_request_id;
        branches = req.branch_count;
        system = req.system;
    }

    if let Some(mut entry) = reserve_event() {
        let event = entry.as_mut_ptr();
        unsafe {
            init_event(event);
            (*event).timestamp_ns = now;
            (*event).pid = pid;
            (*event).tid = pid_tgid as u32;
            (*event).layer = Layer::Device as u8;
            (*event).kind = kind::DEV_BIO_SUBMIT;
            (*event).system = system;
            (*event).size = size;
            // Block I/O is already sector-aligned.
            (*event).aligned_size = size;
            (*event).offset = sector * 512;
            (*event).dev_major = dev >> 20;
            (*event).dev_minor = dev & 0xFFFFF;
            (*event).is_journal = (size > 0 && size <= cfg.journal_threshold as u64) as u8;
            (*event).request_id = request_id;
            (*event).parent_request_id = parent_id;
            (*event).branch_id = branches;
            (*event).branch_count = branches;
            (*event).is_target = 1;
            (*event).comm = comm;
        }
        entry.submit(0);
    }

    let timing = BioTiming {
        submit_ns: now,
        request_id,
    };
    if BIO_TIMING.insert(&(bio as u64), &timing, 0).is_err() {
        counter_bump(counter::BIO_TABLE_FULL);
    }

    Ok(0)
}

#[inline(always)]
fn bio_complete(ctx: &ProbeContext) -> Result<u32, i64> {
    let bio: usize = ctx.arg::<u64>(0).ok_or(1i64)? as usize;
    if bio == 0 {
        return Ok(0);
    }

    let key = bio as u64;
    // Only bios we saw submitted produce completion events.
    let timing = match unsafe { BIO_TIMING.get(&key) } {
        Some(t) => *t,
        None => return Ok(0),
    };
    let _ = BIO_TIMING.remove(&key);

    let now = unsafe { bpf_ktime_get_ns() };
    let size = kernel::bio_size(bio) as u64;
    let cfg = config();

    let Some(mut entry) = reserve_event() else {
        return Ok(0);
    };
    let event = entry.as_mut_ptr();
    unsafe {
        init_event(event);
        (*event).timestamp_ns = now;
        (*event).layer = Layer::Device as u8;
        (*event).kind = kind::DEV_BIO_COMPLETE;
        (*event).latency_ns = now.saturating_sub(timing.submit_ns).max(1);
        (*event).size = size;
        (*event).aligned_size = size;
        (*event).is_journal = (size > 0 && size <= cfg.journal_threshold as u64) as u8;
        (*event).request_id = timing.request_id;
    }
    entry.submit(0);

    Ok(0)
}
