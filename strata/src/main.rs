//! strata agent binary.
//!
//! Loads and attaches the probe set, installs the trace configuration,
//! then consumes events from the ring buffer until a signal or the
//! `--duration` deadline, and prints the amplification summary.

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{info, warn};
use std::io::{IsTerminal, Write};
use std::mem;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use strata::flow::{FlowTable, DEFAULT_FLOW_CAPACITY};
use strata::metrics::MetricsRecorder;
use strata::render::{human_header, human_line, json_line, ClockSync};
use strata::stats::Stats;
use strata::{
    add_target_pid, attach_probes, bump_memlock_rlimit, comm_to_string, discover_pids, export,
    install_config, load_probes, own_comm, read_counters, string_to_comm, summary::print_summary,
    sweep_contexts,
};
use strata_common::{mode, SystemTag, TraceConfig, TraceEvent};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// How often the kernel request-context table is swept, and how old an
/// entry must be to get evicted.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const CONTEXT_MAX_AGE_NS: u64 = 30_000_000_000;

/// How often `-A` rescans /proc for new target processes.
const RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// How long the ring is drained after the shutdown trigger.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    about = "Multi-layer I/O amplification tracer for storage daemons"
)]
struct Args {
    /// Verbose output: per-event paths on the stream, attach progress
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Stream events as newline-delimited JSON
    #[arg(short = 'j', long)]
    json: bool,

    /// Trace for the given number of seconds, then summarize (0 = until signal)
    #[arg(short = 'd', long, default_value_t = 0)]
    duration: u64,

    /// Write stream and summary to a file instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Suppress the event stream; print only the summary
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Enable request correlation (flow table and per-request summary)
    #[arg(short = 'c', long)]
    correlate: bool,

    /// Only stream events from one storage system (minio/ceph/etcd/postgres/gluster)
    #[arg(short = 's', long)]
    system: Option<String>,

    /// Target by name: trace processes whose comm contains the target name
    #[arg(short = 'M', long)]
    by_name: bool,

    /// Auto-discover pids whose comm equals the target name, rescanning
    /// periodically
    #[arg(short = 'A', long)]
    auto_discover: bool,

    /// Target an explicit pid (repeatable)
    #[arg(short = 'p', long = "pid")]
    pids: Vec<u32>,

    /// Enable erasure/openat path-pattern classification
    #[arg(short = 'E', long)]
    trace_erasure: bool,

    /// Enable metadata tracking (fsync and inode-dirty probes)
    #[arg(short = 'T', long)]
    trace_metadata: bool,

    /// Name used by --by-name and --auto-discover
    #[arg(long, default_value = "minio")]
    target_name: String,

    /// Export per-(size, operation) amplification as CSV at exit
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Export metrics to an OTLP gRPC endpoint
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Block submissions at or below this size count as journal traffic
    #[arg(long, default_value_t = strata_common::DEFAULT_JOURNAL_THRESHOLD)]
    journal_threshold: u32,

    /// Path to the compiled eBPF probe object
    #[arg(long, default_value = env!("STRATA_EBPF_PATH"))]
    bpf_path: PathBuf,
}

enum StreamMode {
    Human { color: bool },
    Json,
    Quiet,
}

/// The single-threaded event consumer: every popped event goes to the
/// stream, the layer statistics, the flow table, and the metrics recorder.
struct Consumer {
    stats: Stats,
    flows: Option<FlowTable>,
    clock: ClockSync,
    stream: StreamMode,
    correlate: bool,
    verbose: bool,
    system_filter: Option<SystemTag>,
    recorder: Option<MetricsRecorder>,
}

impl Consumer {
    fn ingest(&mut self, out: &mut dyn Write, event: &TraceEvent) {
        if let Some(filter) = self.system_filter {
            if SystemTag::from_raw(event.system) != filter {
                return;
            }
        }

        self.stats.record(event);
        if let Some(flows) = self.flows.as_mut() {
            flows.update(event);
        }
        if let Some(recorder) = &self.recorder {
            recorder.record_event(event);
        }

        match &self.stream {
            StreamMode::Human { color } => {
                let _ = writeln!(
                    out,
                    "{}",
                    human_line(event, &self.clock, self.correlate, *color, self.verbose)
                );
            }
            StreamMode::Json => {
                let _ = writeln!(out, "{}", json_line(event, &self.clock));
            }
            StreamMode::Quiet => {}
        }
    }

    fn drain(&mut self, out: &mut dyn Write, ring: &mut RingBuf<aya::maps::MapData>) {
        while let Some(item) = ring.next() {
            if item.len() >= mem::size_of::<TraceEvent>() {
                let event: TraceEvent =
                    unsafe { std::ptr::read_unaligned(item.as_ptr() as *const _) };
                self.ingest(out, &event);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to open output file {:?}", path))?,
        ),
        None => Box::new(std::io::stdout()),
    };

    bump_memlock_rlimit().context("Failed to raise RLIMIT_MEMLOCK")?;

    let mut bpf = load_probes(&args.bpf_path)?;

    // Decide the target-selection policy. Explicit pids win over names;
    // with no selection at all, every non-empty comm is a target.
    let mut trace_mode = if args.auto_discover || !args.pids.is_empty() {
        mode::BY_PID
    } else if args.by_name {
        mode::BY_NAME
    } else {
        mode::ALL
    };

    let mut target_pids: Vec<u32> = args.pids.clone();
    if args.auto_discover {
        let found = discover_pids(&args.target_name);
        if found.is_empty() && args.pids.is_empty() {
            warn!(
                "No '{}' processes found; falling back to name matching",
                args.target_name
            );
            trace_mode = mode::BY_NAME;
        } else {
            info!("Found {} '{}' process(es)", found.len(), args.target_name);
            target_pids.extend(found);
        }
    }

    let cfg = TraceConfig {
        mode: trace_mode,
        trace_erasure: args.trace_erasure as u8,
        trace_metadata: args.trace_metadata as u8,
        verbose: args.verbose as u8,
        journal_threshold: args.journal_threshold,
        target_comm: string_to_comm(&args.target_name),
        self_comm: own_comm(),
    };
    install_config(&mut bpf, &cfg).context("Failed to install probe configuration")?;
    for pid in &target_pids {
        add_target_pid(&mut bpf, *pid)?;
    }

    attach_probes(&mut bpf, args.trace_metadata).context("Failed to attach probes")?;

    if args.verbose {
        info!(
            "Tracing layers: application, storage service, OS, filesystem, device (self comm {})",
            comm_to_string(&cfg.self_comm)
        );
    }

    let provider = match &args.otlp_endpoint {
        Some(endpoint) => Some(
            strata::metrics::init_otlp_metrics(endpoint)
                .context("Failed to initialise OTLP metrics pipeline")?,
        ),
        None => None,
    };
    let recorder = provider.as_ref().map(|p| {
        use opentelemetry::metrics::MeterProvider;
        MetricsRecorder::new(&p.meter("strata"))
    });

    let stream = if args.quiet {
        StreamMode::Quiet
    } else if args.json {
        StreamMode::Json
    } else {
        StreamMode::Human {
            color: args.output.is_none() && std::io::stdout().is_terminal(),
        }
    };

    let mut consumer = Consumer {
        stats: Stats::new(),
        flows: args.correlate.then(|| FlowTable::new(DEFAULT_FLOW_CAPACITY)),
        clock: ClockSync::new(),
        stream,
        correlate: args.correlate,
        verbose: args.verbose,
        system_filter: args.system.as_deref().and_then(SystemTag::from_name),
        recorder,
    };

    if matches!(consumer.stream, StreamMode::Human { .. }) {
        writeln!(out, "{}", human_header())?;
    }

    // The ring is taken out of the Ebpf handle so the other maps stay
    // reachable for the sweep and pid-refresh work in the loop.
    let events_map = bpf
        .take_map("EVENTS")
        .context("EVENTS ring buffer map not found")?;
    let ring = RingBuf::try_from(events_map)?;
    let mut poll = tokio::io::unix::AsyncFd::new(ring)?;

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sweep_timer = tokio::time::interval(SWEEP_INTERVAL);
    let mut rescan_timer = tokio::time::interval(RESCAN_INTERVAL);

    let deadline = tokio::time::sleep(if args.duration > 0 {
        Duration::from_secs(args.duration)
    } else {
        // Effectively forever; the branch below is disabled anyway.
        Duration::from_secs(60 * 60 * 24 * 365)
    });
    tokio::pin!(deadline);

    info!("Listening for I/O events... press Ctrl+C to stop");

    loop {
        tokio::select! {
            guard = poll.readable_mut() => {
                let mut guard = guard?;
                consumer.drain(&mut out, guard.get_inner_mut());
                guard.clear_ready();
            }
            _ = sweep_timer.tick() => {
                if let Err(e) = sweep_contexts(&mut bpf, CONTEXT_MAX_AGE_NS) {
                    warn!("Context sweep failed: {}", e);
                }
            }
            _ = rescan_timer.tick(), if args.auto_discover => {
                for pid in discover_pids(&args.target_name) {
                    let _ = add_target_pid(&mut bpf, pid);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = &mut deadline, if args.duration > 0 => {
                info!("Duration of {}s elapsed, shutting down...", args.duration);
                break;
            }
        }
    }

    // Drop the probe handle first: programs detach, and anything produced
    // after this point is dropped at source. Then drain what the ring
    // already holds within a short grace window.
    let counters = read_counters(&mut bpf)?;
    drop(bpf);

    let mut ring = poll.into_inner();
    let grace_end = Instant::now() + DRAIN_GRACE;
    while Instant::now() < grace_end {
        consumer.drain(&mut out, &mut ring);
        std::thread::sleep(Duration::from_millis(20));
    }

    print_summary(
        &mut out,
        &consumer.stats,
        consumer.flows.as_ref(),
        &counters,
    )?;
    out.flush()?;

    if let Some(csv_path) = &args.csv {
        let buckets = consumer
            .flows
            .as_ref()
            .map(export::aggregate)
            .unwrap_or_default();
        let mut csv_out = std::fs::File::create(csv_path)
            .with_context(|| format!("Failed to open CSV file {:?}", csv_path))?;
        export::write_csv(&mut csv_out, &buckets)?;
        if !args.correlate {
            warn!("CSV export without -c has no per-request rows");
        }
    }

    if let Some(provider) = provider {
        let _ = provider.shutdown();
    }

    Ok(())
}
