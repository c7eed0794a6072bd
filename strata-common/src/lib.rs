//! Types shared between the strata eBPF probes and the user-space agent.
//!
//! This crate is `no_std` so it can be linked into the eBPF programs. The
//! `user` feature adds the `aya::Pod` impls the agent needs to read these
//! records out of kernel maps and the ring buffer.

#![no_std]

/// Maximum length of a process command name, including the NUL.
pub const COMM_LEN: usize = 16;

/// Maximum length of a captured path.
pub const PATH_LEN: usize = 256;

/// Page size used for OS-layer alignment accounting.
pub const PAGE_SIZE: u64 = 4096;

/// Default cutoff (bytes) below which a block submission is attributed to
/// journal traffic.
pub const DEFAULT_JOURNAL_THRESHOLD: u32 = 8192;

/// How far into a captured path the metadata/erasure pattern scan looks.
pub const PATH_SCAN_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Storage-stack layer an event was observed at.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    Application = 1,
    StorageService = 2,
    Os = 3,
    Filesystem = 4,
    Device = 5,
}

/// Number of instrumented layers.
pub const LAYER_COUNT: usize = 5;

impl Layer {
    /// Decode a raw layer tag; `None` for anything outside the closed set.
    pub fn from_raw(raw: u8) -> Option<Layer> {
        match raw {
            1 => Some(Layer::Application),
            2 => Some(Layer::StorageService),
            3 => Some(Layer::Os),
            4 => Some(Layer::Filesystem),
            5 => Some(Layer::Device),
            _ => None,
        }
    }

    /// Zero-based index into per-layer accumulator arrays.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn name(self) -> &'static str {
        match self {
            Layer::Application => "APPLICATION",
            Layer::StorageService => "STORAGE_SVC",
            Layer::Os => "OS",
            Layer::Filesystem => "FILESYSTEM",
            Layer::Device => "DEVICE",
        }
    }
}

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Event kinds, numbered per layer (hundreds digit matches the layer).
pub mod kind {
    pub const APP_READ: u32 = 101;
    pub const APP_WRITE: u32 = 102;
    pub const APP_OPEN: u32 = 103;

    pub const SVC_ERASURE_WRITE: u32 = 203;
    pub const SVC_METADATA_TOUCH: u32 = 204;
    pub const SVC_MULTIPART: u32 = 205;

    pub const OS_VFS_READ: u32 = 303;
    pub const OS_VFS_WRITE: u32 = 304;

    pub const FS_SYNC: u32 = 401;
    pub const FS_INODE_DIRTY: u32 = 404;

    pub const DEV_BIO_SUBMIT: u32 = 501;
    pub const DEV_BIO_COMPLETE: u32 = 502;
}

/// Human-readable name for an event kind.
pub fn kind_name(kind: u32) -> &'static str {
    match kind {
        kind::APP_READ => "APP_READ",
        kind::APP_WRITE => "APP_WRITE",
        kind::APP_OPEN => "APP_OPEN",
        kind::SVC_ERASURE_WRITE => "SVC_ERASURE_WRITE",
        kind::SVC_METADATA_TOUCH => "SVC_METADATA_TOUCH",
        kind::SVC_MULTIPART => "SVC_MULTIPART",
        kind::OS_VFS_READ => "OS_VFS_READ",
        kind::OS_VFS_WRITE => "OS_VFS_WRITE",
        kind::FS_SYNC => "FS_SYNC",
        kind::FS_INODE_DIRTY => "FS_INODE_DIRTY",
        kind::DEV_BIO_SUBMIT => "DEV_BIO_SUBMIT",
        kind::DEV_BIO_COMPLETE => "DEV_BIO_COMPLETE",
        _ => "UNKNOWN",
    }
}

// ---------------------------------------------------------------------------
// Storage systems
// ---------------------------------------------------------------------------

/// Storage system a task was classified as.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemTag {
    Unknown = 0,
    Minio = 1,
    Ceph = 2,
    Etcd = 3,
    Postgres = 4,
    Gluster = 5,
    Application = 6,
}

impl SystemTag {
    pub fn from_raw(raw: u32) -> SystemTag {
        match raw {
            1 => SystemTag::Minio,
            2 => SystemTag::Ceph,
            3 => SystemTag::Etcd,
            4 => SystemTag::Postgres,
            5 => SystemTag::Gluster,
            6 => SystemTag::Application,
            _ => SystemTag::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SystemTag::Unknown => "Unknown",
            SystemTag::Minio => "MinIO",
            SystemTag::Ceph => "Ceph",
            SystemTag::Etcd => "etcd",
            SystemTag::Postgres => "PostgreSQL",
            SystemTag::Gluster => "GlusterFS",
            SystemTag::Application => "Application",
        }
    }

    /// Parse a `-s` style system name (case-insensitive, ASCII).
    pub fn from_name(name: &str) -> Option<SystemTag> {
        let mut buf = [0u8; 16];
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > buf.len() {
            return None;
        }
        for (i, b) in bytes.iter().enumerate() {
            buf[i] = b.to_ascii_lowercase();
        }
        match &buf[..bytes.len()] {
            b"minio" => Some(SystemTag::Minio),
            b"ceph" => Some(SystemTag::Ceph),
            b"etcd" => Some(SystemTag::Etcd),
            b"postgres" => Some(SystemTag::Postgres),
            b"gluster" => Some(SystemTag::Gluster),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trace modes and operations
// ---------------------------------------------------------------------------

/// Target-selection policy, installed once in the configuration record.
pub mod mode {
    pub const OFF: u8 = 0;
    pub const BY_NAME: u8 = 1;
    pub const BY_PID: u8 = 2;
    pub const ALL: u8 = 3;
}

/// Request operation direction.
pub mod op {
    pub const GET: u8 = 0;
    pub const PUT: u8 = 1;
}

/// Slots in the kernel-side counter array.
pub mod counter {
    /// Ring reservation failures (events dropped at source).
    pub const RING_DROPS: u32 = 0;
    /// Request-context table full; event emitted with `request_id = 0`.
    pub const CTX_TABLE_FULL: u32 = 1;
    /// Bio-timing table full; completion latency lost.
    pub const BIO_TABLE_FULL: u32 = 2;
    pub const SLOTS: u32 = 3;
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Fixed-size event record sent through the ring buffer.
///
/// Field order keeps the record free of interior padding: 8-byte fields,
/// 4-byte fields, the flag bytes, then the inline strings.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TraceEvent {
    /// Monotonic timestamp (`bpf_ktime_get_ns`).
    pub timestamp_ns: u64,
    /// Logical size in bytes (syscall count, VFS count, or bio size).
    pub size: u64,
    /// Page-rounded size where relevant; equal to `size` for block I/O.
    pub aligned_size: u64,
    /// Byte offset on the device (sectors * 512); 0 elsewhere.
    pub offset: u64,
    /// Submit-to-complete latency; nonzero only on completion events.
    pub latency_ns: u64,
    /// Inode number, 0 if unknown.
    pub inode: u64,
    /// Synthesized request identifier; 0 when correlation was lost.
    pub request_id: u64,
    /// Identifier of the originating request for branched entries.
    pub parent_request_id: u64,
    pub pid: u32,
    pub tid: u32,
    /// One of the `kind::*` constants.
    pub kind: u32,
    /// Raw [`SystemTag`].
    pub system: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub branch_id: u32,
    pub branch_count: u32,
    /// Replication factor reported by a storage-service event, 0 otherwise.
    pub replication: u32,
    /// Syscall/helper return value where observed.
    pub retval: i32,
    /// Raw [`Layer`] tag.
    pub layer: u8,
    pub is_metadata: u8,
    pub is_journal: u8,
    pub cache_hit: u8,
    pub is_erasure: u8,
    pub is_parity: u8,
    pub inline_metadata: u8,
    pub is_target: u8,
    pub comm: [u8; COMM_LEN],
    pub path: [u8; PATH_LEN],
}

impl TraceEvent {
    /// An all-zero event; probes fill only the fields that apply.
    pub const fn zeroed() -> TraceEvent {
        TraceEvent {
            timestamp_ns: 0,
            size: 0,
            aligned_size: 0,
            offset: 0,
            latency_ns: 0,
            inode: 0,
            request_id: 0,
            parent_request_id: 0,
            pid: 0,
            tid: 0,
            kind: 0,
            system: 0,
            dev_major: 0,
            dev_minor: 0,
            branch_id: 0,
            branch_count: 0,
            replication: 0,
            retval: 0,
            layer: 0,
            is_metadata: 0,
            is_journal: 0,
            cache_hit: 0,
            is_erasure: 0,
            is_parity: 0,
            inline_metadata: 0,
            is_target: 0,
            comm: [0; COMM_LEN],
            path: [0; PATH_LEN],
        }
    }

    /// Size to account for in byte totals: aligned when present, else logical.
    pub fn accounted_size(&self) -> u64 {
        if self.aligned_size > 0 {
            self.aligned_size
        } else {
            self.size
        }
    }
}

/// Per-task request context carried across layer boundaries.
///
/// Keyed by `pid_tgid` in the kernel table. Created at application-layer
/// entry, read by the higher-layer probes, removed on task exit or by the
/// user-space age sweep.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestContext {
    pub request_id: u64,
    pub parent_request_id: u64,
    pub start_ns: u64,
    pub original_size: u64,
    pub system: u32,
    pub branch_count: u32,
    /// One of the `op::*` constants.
    pub op: u8,
    pub is_target: u8,
    pub _pad: [u8; 6],
}

/// Timing record installed on bio submit, consumed on completion.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BioTiming {
    pub submit_ns: u64,
    /// Request id captured at submit so the completion event can carry it.
    pub request_id: u64,
}

/// Process-wide probe configuration, written once by the agent before the
/// probes attach and only read afterwards.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TraceConfig {
    /// One of the `mode::*` constants.
    pub mode: u8,
    /// Enables openat path-pattern reclassification.
    pub trace_erasure: u8,
    /// Enables the fsync and inode-dirty probes.
    pub trace_metadata: u8,
    pub verbose: u8,
    /// Block submissions at or below this size are tagged `is_journal`.
    pub journal_threshold: u32,
    /// Substring matched against task comms in `by_name` mode.
    pub target_comm: [u8; COMM_LEN],
    /// The agent's own comm; never a target.
    pub self_comm: [u8; COMM_LEN],
}

impl TraceConfig {
    pub const fn disabled() -> TraceConfig {
        TraceConfig {
            mode: mode::OFF,
            trace_erasure: 0,
            trace_metadata: 0,
            verbose: 0,
            journal_threshold: DEFAULT_JOURNAL_THRESHOLD,
            target_comm: [0; COMM_LEN],
            self_comm: [0; COMM_LEN],
        }
    }
}

#[cfg(feature = "user")]
mod pod {
    unsafe impl aya::Pod for super::TraceEvent {}
    unsafe impl aya::Pod for super::RequestContext {}
    unsafe impl aya::Pod for super::BioTiming {}
    unsafe impl aya::Pod for super::TraceConfig {}
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Fixed-window substring scan over a comm buffer.
///
/// Needle length is a const generic so the comparison unrolls to plain byte
/// compares, which keeps the verifier happy when this inlines into a probe.
#[inline(always)]
fn comm_contains<const N: usize>(comm: &[u8; COMM_LEN], needle: &[u8; N]) -> bool {
    if N == 0 || N > COMM_LEN {
        return false;
    }
    let mut i = 0;
    while i + N <= COMM_LEN {
        let mut j = 0;
        let mut matched = true;
        while j < N {
            if comm[i + j] != needle[j] {
                matched = false;
                break;
            }
            j += 1;
        }
        if matched {
            return true;
        }
        // A NUL ends the comm; nothing past it can match.
        if comm[i] == 0 {
            return false;
        }
        i += 1;
    }
    false
}

/// NUL-bounded substring match with a runtime needle (the configured
/// `target_comm`). Both buffers are fixed-size so the loops stay bounded.
#[inline(always)]
fn comm_contains_config(comm: &[u8; COMM_LEN], needle: &[u8; COMM_LEN]) -> bool {
    if needle[0] == 0 {
        return false;
    }
    let mut i = 0;
    while i < COMM_LEN {
        let mut j = 0;
        let mut matched = true;
        while j < COMM_LEN && needle[j] != 0 {
            if i + j >= COMM_LEN || comm[i + j] != needle[j] {
                matched = false;
                break;
            }
            j += 1;
        }
        if matched {
            return true;
        }
        if comm[i] == 0 {
            return false;
        }
        i += 1;
    }
    false
}

/// Exact NUL-terminated comparison of two comm buffers.
#[inline(always)]
pub fn comm_equals(a: &[u8; COMM_LEN], b: &[u8; COMM_LEN]) -> bool {
    let mut i = 0;
    while i < COMM_LEN {
        if a[i] != b[i] {
            return false;
        }
        if a[i] == 0 {
            return true;
        }
        i += 1;
    }
    true
}

/// Classify a task by its command name.
pub fn detect_system(comm: &[u8; COMM_LEN]) -> SystemTag {
    if comm_contains(comm, b"minio") {
        return SystemTag::Minio;
    }
    if comm_contains(comm, b"ceph") {
        return SystemTag::Ceph;
    }
    if comm_contains(comm, b"etcd") {
        return SystemTag::Etcd;
    }
    if comm_contains(comm, b"post") {
        return SystemTag::Postgres;
    }
    if comm_contains(comm, b"glus") {
        return SystemTag::Gluster;
    }
    if comm[0] != 0 && comm[0] != b' ' {
        return SystemTag::Application;
    }
    SystemTag::Unknown
}

/// Target decision for a task, given the installed configuration.
///
/// `pid_in_set` is the caller's lookup result in the target-pid map, only
/// consulted in `by_pid` mode. The agent's own comm is never a target, which
/// keeps its output writes from feeding back into its own numbers.
pub fn is_target(cfg: &TraceConfig, comm: &[u8; COMM_LEN], pid_in_set: bool) -> bool {
    match cfg.mode {
        mode::OFF => false,
        mode::ALL => comm[0] != 0 && !comm_equals(comm, &cfg.self_comm),
        mode::BY_PID => pid_in_set,
        mode::BY_NAME => {
            comm_contains_config(comm, &cfg.target_comm) && !comm_equals(comm, &cfg.self_comm)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Path patterns
// ---------------------------------------------------------------------------

/// Storage-service file classes recognized in openat paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathClass {
    /// Inline-metadata file (`xl.meta`).
    InlineMetadata,
    /// Erasure-coded part file (`part.`).
    ErasurePart,
}

/// Scan the head of a captured path for well-known storage-service file
/// patterns. The pattern set approximates current on-disk layouts and is not
/// a contract.
pub fn classify_path(path: &[u8; PATH_LEN]) -> Option<PathClass> {
    let mut i = 0;
    while i < PATH_SCAN_LEN {
        if path[i] == 0 {
            return None;
        }
        if i + 7 <= PATH_LEN
            && path[i] == b'x'
            && path[i + 1] == b'l'
            && path[i + 2] == b'.'
            && path[i + 3] == b'm'
            && path[i + 4] == b'e'
            && path[i + 5] == b't'
            && path[i + 6] == b'a'
        {
            return Some(PathClass::InlineMetadata);
        }
        if i + 5 <= PATH_LEN
            && path[i] == b'p'
            && path[i + 1] == b'a'
            && path[i + 2] == b'r'
            && path[i + 3] == b't'
            && path[i + 4] == b'.'
        {
            return Some(PathClass::ErasurePart);
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

/// Round a byte count up to the page-cache granularity.
#[inline(always)]
pub fn page_align(count: u64) -> u64 {
    (count + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// Synthesize a request identifier from the task id and the low timestamp
/// bits. Collisions across generations are tolerated by the correlator.
#[inline(always)]
pub fn make_request_id(pid_tgid: u64, now_ns: u64) -> u64 {
    (pid_tgid << 32) | (now_ns & 0xFFFF_FFFF)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
