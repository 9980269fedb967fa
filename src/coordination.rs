//! # Cross-Process Coordination Module
//!
//! Multi-process runs spawn one child per process of the configuration. Each
//! child opens its own device context, runs its workers, merges them into a
//! [`ProcessSummary`](crate::metrics::ProcessSummary), and hands that summary
//! back to the parent through a mailbox before it exits.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐   stdout pipe    ┌──────────────────────┐
//! │ Parent               │◄─────────────────┤ Child (pid C1)       │
//! │  ProcessManager      │                  │  workers → summary   │
//! │   spawn N children   │◄─────────────────┤ Child (pid C2)       │
//! │   wait for all exits │                  │  workers → summary   │
//! │   Mailbox::drain     │        ...       │                      │
//! │   aggregate_entries  │                  │                      │
//! └──────────────────────┘                  └──────────────────────┘
//! ```
//!
//! ## Mailbox
//!
//! Each child's stdout is the write end of its own pipe. The parent keeps the
//! read end in a [`Mailbox`] keyed by `"{parent_pid}_{child_pid}"`, so no two
//! processes ever share a slot. An entry is six newline-separated decimals:
//! start, end, latency min, latency max, latency mean, count. Once every child
//! has exited the parent drains the mailbox: each entry is read exactly once
//! and removed, and empty or corrupt entries are logged and skipped.
//!
//! ## Throughput across processes
//!
//! Processes overlap in wall-clock time, so throughput is the total count over
//! the span from the earliest start to the latest end, not over the sum of each
//! process's own elapsed time. Setup and teardown skew between processes is
//! accepted as noise.

use crate::error::{BenchError, MailboxError};
use crate::metrics::{LatencyStats, ProcessSummary, TimeWindow};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Name of the benchmark binary re-executed for child processes.
const EXE_NAME: &str = "accel-bench";

/// Hidden flag that switches the binary into child mode.
pub const CHILD_FLAG: &str = "--internal-run-as-child";

/// Identity of one mailbox slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxKey {
    pub parent: u32,
    pub child: u32,
}

impl fmt::Display for MailboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.parent, self.child)
    }
}

/// What one process publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxEntry {
    pub window: TimeWindow,
    pub latency_min: i64,
    pub latency_max: i64,
    pub latency_mean: i64,
    /// Completed commands.
    pub count: u64,
}

impl MailboxEntry {
    pub fn from_summary(summary: &ProcessSummary) -> Self {
        let (latency_min, latency_max, latency_mean) = summary.latency.raw_parts();
        Self {
            window: summary.window,
            latency_min,
            latency_max,
            latency_mean,
            count: summary.completions,
        }
    }

    /// Latency statistics carried by the entry, empty when none were measured.
    pub fn latency(&self) -> LatencyStats {
        if self.latency_min > self.latency_max {
            return LatencyStats::new();
        }
        LatencyStats::from_parts(
            self.latency_min,
            self.latency_max,
            self.latency_mean,
            self.count,
        )
    }

    pub fn encode(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.window.start_ns,
            self.window.end_ns,
            self.latency_min,
            self.latency_max,
            self.latency_mean,
            self.count
        )
    }

    pub fn decode(text: &str) -> Result<Self, MailboxError> {
        let mut lines = text.lines().map(str::trim);
        let mut next = |field: &'static str| {
            lines
                .next()
                .filter(|l| !l.is_empty())
                .ok_or(MailboxError::MissingField(field))
        };
        let start = parse_field::<u64>("start", next("start")?)?;
        let end = parse_field::<u64>("end", next("end")?)?;
        let latency_min = parse_field::<i64>("min", next("min")?)?;
        let latency_max = parse_field::<i64>("max", next("max")?)?;
        let latency_mean = parse_field::<i64>("mean", next("mean")?)?;
        let count = parse_field::<u64>("count", next("count")?)?;
        Ok(Self {
            window: TimeWindow::new(start, end),
            latency_min,
            latency_max,
            latency_mean,
            count,
        })
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, MailboxError> {
    value.parse().map_err(|_| MailboxError::Parse {
        field,
        value: value.to_string(),
    })
}

/// Write `entry` in one piece.
pub fn publish<W: Write>(entry: &MailboxEntry, writer: &mut W) -> std::io::Result<()> {
    writer.write_all(entry.encode().as_bytes())?;
    writer.flush()
}

/// Write-once, read-once store of per-process entries.
#[derive(Default)]
pub struct Mailbox {
    slots: BTreeMap<MailboxKey, Box<dyn Read + Send>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the source of one process's entry.
    pub fn deposit(&mut self, key: MailboxKey, source: Box<dyn Read + Send>) {
        if self.slots.insert(key, source).is_some() {
            warn!("Mailbox slot {} was deposited twice; keeping the latest", key);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read and remove one entry.
    pub fn take(&mut self, key: &MailboxKey) -> Option<Result<MailboxEntry, MailboxError>> {
        let mut source = self.slots.remove(key)?;
        Some(read_entry(&mut *source))
    }

    /// Read and remove every entry, skipping unreadable ones.
    pub fn drain(&mut self) -> Vec<(MailboxKey, MailboxEntry)> {
        let slots = std::mem::take(&mut self.slots);
        let mut entries = Vec::with_capacity(slots.len());
        for (key, mut source) in slots {
            match read_entry(&mut *source) {
                Ok(entry) => {
                    debug!("Mailbox {}: {:?}", key, entry);
                    entries.push((key, entry));
                }
                Err(e) => warn!("Skipping mailbox entry {}: {}", key, e),
            }
        }
        entries
    }
}

fn read_entry(source: &mut (dyn Read + Send)) -> Result<MailboxEntry, MailboxError> {
    let mut text = String::new();
    source.read_to_string(&mut text)?;
    MailboxEntry::decode(&text)
}

/// Statistics merged across sibling processes.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossProcessSummary {
    pub processes_reported: usize,
    pub completions: u64,
    pub latency: LatencyStats,
    /// Earliest start to latest end over all entries.
    pub window: TimeWindow,
}

impl CrossProcessSummary {
    /// Completions per second over the spanning window.
    pub fn throughput_ops(&self) -> f64 {
        let ns = self.window.duration_ns();
        if ns == 0 {
            return 0.0;
        }
        self.completions as f64 * 1e9 / ns as f64
    }
}

/// Merge published entries. `None` when there is nothing to merge.
pub fn aggregate_entries(entries: &[MailboxEntry]) -> Option<CrossProcessSummary> {
    let (first, rest) = entries.split_first()?;
    let mut summary = CrossProcessSummary {
        processes_reported: 1,
        completions: first.count,
        latency: first.latency(),
        window: first.window,
    };
    for entry in rest {
        summary.processes_reported += 1;
        summary.completions += entry.count;
        summary.latency.merge(&entry.latency());
        summary.window = summary.window.span(&entry.window);
    }
    Some(summary)
}

/// Spawns child benchmark processes and collects their mailbox entries.
pub struct ProcessManager {
    exe_path: PathBuf,
    parent: u32,
    children: Vec<(MailboxKey, Child)>,
    mailbox: Mailbox,
}

impl ProcessManager {
    /// Manager re-executing the benchmark binary.
    pub fn new() -> Result<Self> {
        Ok(Self::with_binary(resolve_binary()?))
    }

    pub fn with_binary(exe_path: PathBuf) -> Self {
        Self {
            exe_path,
            parent: std::process::id(),
            children: Vec::new(),
            mailbox: Mailbox::new(),
        }
    }

    pub fn spawned(&self) -> usize {
        self.children.len()
    }

    /// Start one child with `args`; its stdout becomes its mailbox slot.
    pub fn spawn<S: AsRef<std::ffi::OsStr>>(&mut self, args: &[S]) -> Result<MailboxKey> {
        let (reader, writer) =
            os_pipe::pipe().context("Failed to create OS pipe for child mailbox")?;

        // The command owns the write end; dropping it after spawn leaves the
        // child as the only writer, so the read sees EOF once the child exits.
        let child = {
            let mut cmd = Command::new(&self.exe_path);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(Stdio::inherit());
            cmd.spawn()
                .with_context(|| format!("Failed to spawn {}", self.exe_path.display()))?
        };

        let key = MailboxKey {
            parent: self.parent,
            child: child.id(),
        };
        debug!("Spawned child process {}", key);
        self.mailbox.deposit(key, Box::new(reader) as Box<dyn Read + Send>);
        self.children.push((key, child));
        Ok(key)
    }

    /// Wait for every child, then drain the mailbox.
    ///
    /// A child that exits unsuccessfully is fatal with `strict`, otherwise it
    /// is logged and whatever it published (usually nothing) is skipped.
    pub fn collect(mut self, strict: bool) -> Result<Vec<MailboxEntry>> {
        let mut failed = Vec::new();
        for (key, child) in self.children.iter_mut() {
            let status = child
                .wait()
                .with_context(|| format!("Failed to wait for child process {}", key))?;
            if !status.success() {
                warn!("Child process {} exited with {}", key, status);
                failed.push(*key);
            }
        }

        if strict && !failed.is_empty() {
            let keys: Vec<String> = failed.iter().map(|k| k.to_string()).collect();
            anyhow::bail!("child process(es) failed: {}", keys.join(", "));
        }

        let spawned = self.children.len();
        let entries: Vec<MailboxEntry> = self
            .mailbox
            .drain()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        if entries.len() < spawned {
            warn!(
                "{} of {} process(es) reported results",
                entries.len(),
                spawned
            );
        }
        if entries.is_empty() {
            return Err(BenchError::NoResults { spawned }.into());
        }
        Ok(entries)
    }
}

/// Locate the benchmark binary.
///
/// `current_exe()` points at the test harness when running under `cargo
/// test`, so resolution tries, in order: the current executable if it is the
/// benchmark binary, `CARGO_BIN_EXE_accel-bench`, then `target/debug`.
fn resolve_binary() -> Result<PathBuf> {
    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let file_name = current_exe.file_stem().and_then(|n| n.to_str());
    if file_name == Some(EXE_NAME) {
        return Ok(current_exe);
    }

    if let Ok(p) = std::env::var("CARGO_BIN_EXE_accel-bench") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Ok(path);
        }
    }

    let fallback = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("debug")
        .join(format!("{}{}", EXE_NAME, std::env::consts::EXE_SUFFIX));
    if fallback.exists() {
        return Ok(fallback);
    }

    anyhow::bail!(
        "Could not resolve '{}' binary for child processes. Build it with \
         `cargo build --bin {}` first.",
        EXE_NAME,
        EXE_NAME
    )
}
