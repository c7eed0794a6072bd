//! The exit summary: per-layer table, amplification ladder, per-request
//! correlation table, run counters, and the headline amplification number.
//!
//! Rendering is a pure function of the final state; running it twice over
//! the same state produces byte-identical output. The headline number is
//! always the last line printed.

use std::io::{self, Write};
use strata_common::Layer;

use crate::flow::FlowTable;
use crate::stats::Stats;
use crate::KernelCounters;

/// How many flows the correlation table shows.
const MAX_FLOW_ROWS: usize = 50;

const LAYERS: [Layer; 5] = [
    Layer::Application,
    Layer::StorageService,
    Layer::Os,
    Layer::Filesystem,
    Layer::Device,
];

fn fmt_amp(amp: Option<f64>) -> String {
    match amp {
        Some(a) => format!("{:.2}x", a),
        None => "n/a".to_string(),
    }
}

/// Write the complete summary.
pub fn print_summary<W: Write>(
    out: &mut W,
    stats: &Stats,
    flows: Option<&FlowTable>,
    counters: &KernelCounters,
) -> io::Result<()> {
    writeln!(out, "\n========================================")?;
    writeln!(out, "    I/O AMPLIFICATION ANALYSIS")?;
    writeln!(out, "========================================\n")?;

    per_layer_table(out, stats)?;
    amplification_ladder(out, stats)?;
    if let Some(flows) = flows {
        correlation_table(out, flows)?;
    }
    run_counters(out, stats, flows, counters)?;

    // Headline, always the last line.
    writeln!(
        out,
        "\n*** TOTAL AMPLIFICATION: {} ***",
        fmt_amp(stats.total_amplification())
    )?;
    Ok(())
}

fn per_layer_table<W: Write>(out: &mut W, stats: &Stats) -> io::Result<()> {
    writeln!(out, "Per-Layer Statistics:")?;
    writeln!(
        out,
        "{:<15} {:>10} {:>12} {:>12} {:>8} {:>8} {:>8} {:>10}",
        "LAYER", "EVENTS", "BYTES", "ALIGNED", "META", "JRNL", "CACHE", "AMP_FACTOR"
    )?;
    writeln!(out, "{}", "-".repeat(90))?;

    for layer in LAYERS {
        let s = stats.layer(layer);
        writeln!(
            out,
            "{:<15} {:>10} {:>12} {:>12} {:>8} {:>8} {:>8} {:>10}",
            layer.name(),
            s.events,
            s.total_bytes,
            s.aligned_bytes,
            s.metadata_ops,
            s.journal_ops,
            s.cache_hits,
            fmt_amp(stats.amplification(layer)),
        )?;
    }
    Ok(())
}

fn amplification_ladder<W: Write>(out: &mut W, stats: &Stats) -> io::Result<()> {
    writeln!(out, "\nAmplification Breakdown:")?;
    writeln!(out, "{}", "-".repeat(70))?;

    let app_bytes = stats.application_bytes();
    if app_bytes == 0 {
        writeln!(out, "No application-layer bytes observed.")?;
        return Ok(());
    }

    writeln!(
        out,
        "Original application I/O:      {:>12} bytes",
        app_bytes
    )?;

    let svc = stats.layer(Layer::StorageService);
    if svc.total_bytes > 0 {
        writeln!(
            out,
            "After storage service layer:   {:>12} bytes ({})",
            svc.aligned_bytes,
            fmt_amp(stats.amplification(Layer::StorageService)),
        )?;
    }

    let os = stats.layer(Layer::Os);
    if os.aligned_bytes > 0 {
        writeln!(
            out,
            "After OS/page cache alignment: {:>12} bytes ({})",
            os.aligned_bytes,
            fmt_amp(stats.amplification(Layer::Os)),
        )?;
    }

    let fs = stats.layer(Layer::Filesystem);
    if fs.events > 0 {
        writeln!(
            out,
            "After filesystem layer:        {:>12} bytes ({})",
            fs.aligned_bytes,
            fmt_amp(stats.amplification(Layer::Filesystem)),
        )?;
        writeln!(
            out,
            "  - Journal writes:            {:>12} bytes",
            fs.journal_ops * 4096
        )?;
        writeln!(
            out,
            "  - Metadata updates:          {:>12} operations",
            fs.metadata_ops
        )?;
    }

    let dev = stats.layer(Layer::Device);
    if dev.total_bytes > 0 {
        writeln!(
            out,
            "Final device layer I/O:        {:>12} bytes ({})",
            dev.total_bytes,
            fmt_amp(stats.amplification(Layer::Device)),
        )?;
    }

    Ok(())
}

fn correlation_table<W: Write>(out: &mut W, flows: &FlowTable) -> io::Result<()> {
    writeln!(out, "\nRequest Flows (chronological):")?;
    writeln!(out, "Total requests tracked: {}", flows.len())?;
    writeln!(
        out,
        "{:<10} {:<5} {:<28} {:>10} {:>10} {:>10} {:>10} {:>8} {:>7} {:<10}",
        "REQUEST", "OP", "OBJECT", "APP", "OS", "FS", "DEVICE", "AMP", "BRANCH", "SYSTEM"
    )?;
    writeln!(out, "{}", "-".repeat(116))?;

    for flow in flows.sorted_by_start().into_iter().take(MAX_FLOW_ROWS) {
        writeln!(
            out,
            "{:08x}   {:<5} {:<28} {:>10} {:>10} {:>10} {:>10} {:>8} {:>3}/{:<3} {:<10}",
            flow.request_id & 0xFFFF_FFFF,
            flow.op_name(),
            flow.object_path.as_deref().unwrap_or("<unknown>"),
            flow.app_bytes(),
            flow.layer_bytes(Layer::Os),
            flow.layer_bytes(Layer::Filesystem),
            flow.layer_bytes(Layer::Device),
            fmt_amp(flow.amplification()),
            flow.total_branches,
            flow.completed_branches,
            flow.system.name(),
        )?;

        if flow.total_branches > 1 {
            writeln!(
                out,
                "  -> Branches: {} total, {} completed | VFS: {} reads, {} writes | BIO: {} submits | Metadata: {} ops | Journal: {} ops",
                flow.total_branches,
                flow.completed_branches,
                flow.vfs_reads,
                flow.vfs_writes,
                flow.bio_submits,
                flow.metadata_ops,
                flow.journal_ops,
            )?;
        }
        if flow.parent_id != 0 {
            writeln!(
                out,
                "  -> Parent request: {:08x}",
                flow.parent_id & 0xFFFF_FFFF
            )?;
        }
        if flow.erasure_branches > 0 {
            writeln!(out, "  -> Erasure coding: {} branches", flow.erasure_branches)?;
        }
    }

    // Aggregate operation summary over the full table.
    let mut gets = 0u64;
    let mut puts = 0u64;
    let mut branched = 0u64;
    for flow in flows.sorted_by_start() {
        if flow.op == strata_common::op::PUT {
            puts += 1;
        } else {
            gets += 1;
        }
        if flow.total_branches > 1 {
            branched += 1;
        }
    }
    writeln!(out, "\nOperation Summary:")?;
    writeln!(out, "  Total GET operations:  {}", gets)?;
    writeln!(out, "  Total PUT operations:  {}", puts)?;
    let pct = if flows.len() > 0 {
        100.0 * branched as f64 / flows.len() as f64
    } else {
        0.0
    };
    writeln!(out, "  Branched requests:     {} ({:.1}%)", branched, pct)?;

    Ok(())
}

fn run_counters<W: Write>(
    out: &mut W,
    stats: &Stats,
    flows: Option<&FlowTable>,
    counters: &KernelCounters,
) -> io::Result<()> {
    writeln!(out, "\nRun Counters:")?;
    writeln!(out, "  Events consumed:         {}", stats.events)?;
    writeln!(out, "  Events dropped (ring):   {}", counters.ring_drops)?;
    writeln!(out, "  Context table overflow:  {}", counters.ctx_table_full)?;
    writeln!(out, "  Bio table overflow:      {}", counters.bio_table_full)?;
    writeln!(out, "  Uncorrelated events:     {}", stats.unattributed)?;
    writeln!(out, "  Shape anomalies:         {}", stats.anomalies)?;
    if let Some(flows) = flows {
        writeln!(out, "  Flows evicted:           {}", flows.evicted)?;
    }
    Ok(())
}
