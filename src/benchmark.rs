//! # Benchmark Engine Module
//!
//! This module turns one configuration into one measured run. It owns the
//! path from parsed arguments to a finished [`RunReport`]:
//!
//! 1. **Configuration**: [`BenchmarkConfig::from_args`] validates the command
//!    line and resolves derived values (execution count for DMA, window depth).
//! 2. **Setup**: open the device, load the program and build one window of
//!    command slots per worker. Any failure here is a setup error and no
//!    statistics are reported.
//! 3. **Measurement**: start the shared [`RunClock`] and run every worker on its
//!    own scoped thread. A single worker runs on the calling thread.
//! 4. **Aggregation**: merge the workers (consistency check included), or, for
//!    isolated runs, merge the mailbox entries of the child processes.
//!
//! ## Process isolation
//!
//! Device context acquisition has process-wide side effects, so multi-process
//! configurations spawn one child per process. Each child re-executes this
//! binary in child mode ([`run_child`]), runs the same configuration
//! in-process, and publishes its summary on stdout.
//!
//! ## Multiple cards
//!
//! `-k a.bin,b.bin -d 0,1` pairs program images with device indices. Every
//! [`Card`] gets its own `-p` children and all of them report into the same
//! mailbox, so the run is measured as one.
//!
//! ## Compute unit placement
//!
//! With `-c mc` or `-c mk` each worker is bound to a different compute unit
//! (or single-unit kernel) of its card, see [`place_kernel`]. Children carry
//! the global index of their first worker so placement continues across the
//! processes of one card.

use crate::{
    cli::{Args, CuLayout, DmaDirection, RunType},
    command::{CommandKind, CommandSlot},
    coordination::{
        aggregate_entries, publish, CrossProcessSummary, MailboxEntry, ProcessManager, CHILD_FLAG,
    },
    device::{Device, DeviceConfig, DeviceFactory, Kernel, SimProfile, SyncDirection},
    error::{BenchError, DeviceError},
    metrics::{aggregate_workers, LatencyCollector, ProcessSummary, WorkerResult},
    results::RunReport,
    utils::{
        dma_count_for_size, format_bytes, format_duration, validate_bulk, validate_parallelism,
        validate_payload_size, validate_percentiles,
    },
    window::{RunClock, WindowDriver, Worker},
};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// When a run stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    /// Each worker completes exactly this many commands.
    Count(u64),
    /// Each worker keeps issuing until the budget has elapsed.
    Time(Duration),
}

impl RunLimit {
    pub fn count(&self) -> Option<u64> {
        match self {
            RunLimit::Count(n) => Some(*n),
            RunLimit::Time(_) => None,
        }
    }

    pub fn budget(&self) -> Option<Duration> {
        match self {
            RunLimit::Count(_) => None,
            RunLimit::Time(d) => Some(*d),
        }
    }
}

/// One device and the program loaded onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub index: u32,
    pub program: Option<PathBuf>,
}

/// Pair program images with device indices.
///
/// Zero or one program applies to every device; otherwise the lists must
/// have the same length.
fn resolve_cards(programs: &[PathBuf], devices: &[u32]) -> Result<Vec<Card>> {
    let devices: &[u32] = if devices.is_empty() { &[0] } else { devices };
    if programs.len() > 1 {
        if programs.len() != devices.len() {
            anyhow::bail!(
                "{} program images but {} device indices; give one device index per program",
                programs.len(),
                devices.len()
            );
        }
        return Ok(programs
            .iter()
            .zip(devices)
            .map(|(program, &index)| Card {
                index,
                program: Some(program.clone()),
            })
            .collect());
    }
    Ok(devices
        .iter()
        .map(|&index| Card {
            index,
            program: programs.first().cloned(),
        })
        .collect())
}

/// Kernel spec that worker number `worker` runs under `layout`.
///
/// - `single`: `name` as given.
/// - `mc`: `name` bound to its compute unit `worker mod units`.
/// - `mk`: kernel `name_<k>` for the `worker mod kernels`-th instance.
pub fn place_kernel(
    device: &dyn Device,
    name: &str,
    layout: CuLayout,
    worker: usize,
) -> Result<String, DeviceError> {
    match layout {
        CuLayout::Single => Ok(name.to_string()),
        CuLayout::MultiCu => {
            let units = device.compute_units(name)?;
            units
                .get(worker % units.len().max(1))
                .map(|unit| Kernel::on_unit(name, unit).to_string())
                .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))
        }
        CuLayout::MultiKernel => {
            let mut instances: Vec<(u32, String)> = device
                .kernels()
                .into_iter()
                .filter_map(|kernel| {
                    let k = kernel.strip_prefix(name)?.strip_prefix('_')?.parse().ok()?;
                    Some((k, kernel))
                })
                .collect();
            instances.sort();
            instances
                .get(worker % instances.len().max(1))
                .map(|(_, kernel)| kernel.clone())
                .ok_or_else(|| DeviceError::UnknownKernel(format!("{}_1", name)))
        }
    }
}

/// Configuration of one benchmark run.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    /// Device opened by in-process runs: the first card.
    pub device: DeviceConfig,
    /// Every card of the run; more than one makes the run multi-card.
    pub cards: Vec<Card>,
    pub cu_layout: CuLayout,
    /// Global index of this process's first worker.
    pub worker_offset: usize,
    pub command: CommandKind,
    pub payload_size: u64,
    pub processes: usize,
    pub threads: usize,
    /// Requested window depth; see [`BenchmarkConfig::effective_bulk`].
    pub bulk: usize,
    pub limit: RunLimit,
    /// Measure per-command latency.
    pub latency: bool,
    /// Fail the run when any command completes with an error status.
    pub strict: bool,
    pub poll_timeout: Duration,
    /// Base core for worker pinning.
    pub cpu_affinity: Option<usize>,
    pub percentiles: Vec<f64>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            cards: vec![Card {
                index: 0,
                program: None,
            }],
            cu_layout: CuLayout::Single,
            worker_offset: 0,
            command: CommandKind::Kernel(crate::defaults::KERNEL.to_string()),
            payload_size: 4096,
            processes: crate::defaults::PROCESSES,
            threads: crate::defaults::THREADS,
            bulk: crate::defaults::BULK,
            limit: RunLimit::Count(crate::defaults::COUNT),
            latency: false,
            strict: false,
            poll_timeout: crate::defaults::POLL_TIMEOUT,
            cpu_affinity: None,
            percentiles: vec![50.0, 95.0, 99.0],
        }
    }
}

/// A helper struct to provide a consistent, single source of truth for displaying
/// the benchmark configuration.
pub struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
}

impl<'a> std::fmt::Display for BenchmarkConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark for: {}", c.command)?;
        let indices: Vec<String> = c.cards.iter().map(|card| card.index.to_string()).collect();
        writeln!(f, "  Device Index:       {}", indices.join(","))?;
        let programs: Vec<String> = c
            .cards
            .iter()
            .filter_map(|card| card.program.as_ref())
            .map(|p| p.display().to_string())
            .collect();
        let programs = if programs.is_empty() {
            "Not set".to_string()
        } else {
            programs.join(",")
        };
        writeln!(f, "  Program:            {}", programs)?;
        writeln!(f, "  CU Layout:          {}", c.cu_layout)?;
        if c.is_multi_card() {
            writeln!(f, "  Process(es):        {} per card", c.processes)?;
        } else {
            writeln!(f, "  Process(es):        {}", c.processes)?;
        }
        writeln!(f, "  Thread(s)/Process:  {}", c.threads)?;
        if c.command.is_dma() {
            writeln!(f, "  Buffer Size:        {}", format_bytes(c.payload_size))?;
        } else {
            writeln!(f, "  Queue Length:       {}", c.effective_bulk())?;
            writeln!(f, "  Payload Size:       {}", format_bytes(c.payload_size))?;
        }
        match c.limit {
            RunLimit::Count(n) => writeln!(f, "  Execution Count:    {} per thread", n)?,
            RunLimit::Time(d) => writeln!(f, "  Test Duration:      {}", format_duration(d))?,
        }
        writeln!(
            f,
            "  Metric:             {}",
            if c.latency { "latency" } else { "throughput" }
        )?;
        let affinity = c
            .cpu_affinity
            .map_or("Not set".to_string(), |core| core.to_string());
        writeln!(f, "  CPU Affinity:       {}", affinity)?;
        if c.strict {
            writeln!(f, "  Error Completions:  Fatal (strict)")?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

impl BenchmarkConfig {
    /// Create benchmark configuration from CLI arguments
    ///
    /// Validates every parameter and resolves the derived ones. For DMA runs
    /// the DMA direction is the first of `--dma-dir`; callers that expand
    /// `both` override it per run.
    pub fn from_args(args: &Args) -> Result<Self> {
        validate_bulk(args.bulk)?;
        validate_parallelism("Thread", args.threads)?;
        validate_parallelism("Process", args.processes)?;
        validate_payload_size(args.payload_size)?;
        validate_percentiles(&args.percentiles)?;
        if args.poll_timeout.is_zero() {
            anyhow::bail!("Poll timeout must be greater than zero");
        }

        let command = match args.run_type {
            RunType::Kernel => CommandKind::Kernel(args.kernel.clone()),
            RunType::Pipeline => CommandKind::Pipeline,
            RunType::Dma => CommandKind::Dma(
                args.dma_dir
                    .directions()
                    .first()
                    .copied()
                    .unwrap_or(SyncDirection::ToDevice),
            ),
        };

        let limit = match (args.time, args.count) {
            (Some(time), _) => {
                if time.is_zero() {
                    anyhow::bail!("Test duration must be greater than zero");
                }
                RunLimit::Time(time)
            }
            (None, Some(0)) => anyhow::bail!("Execution count cannot be zero"),
            (None, Some(count)) => {
                if count.checked_mul(args.threads as u64).is_none() {
                    anyhow::bail!(
                        "Execution count {} times {} thread(s) overflows the completion counter",
                        count,
                        args.threads
                    );
                }
                RunLimit::Count(count)
            }
            (None, None) if command.is_dma() => {
                RunLimit::Count(dma_count_for_size(args.payload_size))
            }
            (None, None) => RunLimit::Count(crate::defaults::COUNT),
        };

        let cards = resolve_cards(&args.programs, &args.devices)?;
        let first = cards
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No device selected"))?;
        if args.cu_layout != CuLayout::Single && !matches!(command, CommandKind::Kernel(_)) {
            warn!(
                "Compute unit layout '{}' applies to kernel runs only; ignored for {}",
                args.cu_layout, command
            );
        }

        let profile = SimProfile {
            devices: args.sim_devices,
            compute_units: args.sim_compute_units,
            kernel_time: args.sim_kernel_time,
            submit_overhead: args.sim_submit_overhead,
            dma_bandwidth_mbps: args.sim_dma_bandwidth,
            failure_rate: args.sim_failure_rate,
            jitter: args.sim_jitter,
        };
        profile.validate().context("Invalid simulated device options")?;

        Ok(Self {
            device: DeviceConfig {
                index: first.index,
                program: first.program,
                profile,
            },
            cards,
            cu_layout: args.cu_layout,
            worker_offset: args.internal_worker_offset,
            command,
            payload_size: args.payload_size,
            processes: args.processes,
            threads: args.threads,
            bulk: args.bulk,
            limit,
            latency: args.latency,
            strict: args.strict,
            poll_timeout: args.poll_timeout,
            cpu_affinity: args.cpu_affinity,
            percentiles: args.percentiles.clone(),
        })
    }

    pub fn is_multi_card(&self) -> bool {
        self.cards.len() > 1
    }

    /// Processes of the whole run, over all cards.
    pub fn total_processes(&self) -> usize {
        self.processes * self.cards.len()
    }

    /// Window depth actually used: never deeper than the per-worker count.
    pub fn effective_bulk(&self) -> usize {
        match self.limit {
            RunLimit::Count(n) => self.bulk.min(usize::try_from(n).unwrap_or(usize::MAX)),
            RunLimit::Time(_) => self.bulk,
        }
    }

    /// Per-worker target; 0 means the run is time-governed.
    pub fn target_per_worker(&self) -> u64 {
        self.limit.count().unwrap_or(0)
    }

    /// Completions the process must report in fixed-count mode.
    pub fn expected_total(&self) -> Option<u64> {
        self.limit
            .count()
            .map(|n| n.saturating_mul(self.threads as u64))
    }

    pub fn display(&self) -> BenchmarkConfigDisplay<'_> {
        BenchmarkConfigDisplay { config: self }
    }

    /// Command line that makes a child process run this configuration as a
    /// single process on `card`, starting at global worker `worker_offset`.
    pub fn to_child_args(&self, card: &Card, worker_offset: usize) -> Vec<String> {
        let mut args = vec![CHILD_FLAG.to_string(), "-q".to_string()];
        push_opt(&mut args, "-d", card.index);
        if let Some(program) = &card.program {
            push_opt(&mut args, "-k", program.to_string_lossy());
        }
        push_opt(&mut args, "-c", self.cu_layout);
        push_opt(&mut args, "--internal-worker-offset", worker_offset);
        match &self.command {
            CommandKind::Kernel(name) => {
                push_opt(&mut args, "-K", "kernel");
                push_opt(&mut args, "-N", name);
            }
            CommandKind::Pipeline => push_opt(&mut args, "-K", "pipeline"),
            CommandKind::Dma(direction) => {
                push_opt(&mut args, "-K", "dma");
                push_opt(&mut args, "-D", DmaDirection::from(*direction));
            }
        }
        push_opt(&mut args, "-s", self.payload_size);
        push_opt(&mut args, "-b", self.bulk);
        push_opt(&mut args, "-t", self.threads);
        push_opt(&mut args, "-p", 1);
        match self.limit {
            RunLimit::Count(n) => push_opt(&mut args, "-n", n),
            RunLimit::Time(d) => push_opt(&mut args, "-T", nanos_arg(d)),
        }
        if self.latency {
            args.push("-L".to_string());
        }
        if self.strict {
            args.push("--strict".to_string());
        }
        push_opt(&mut args, "--poll-timeout", nanos_arg(self.poll_timeout));
        if let Some(core) = self.cpu_affinity {
            push_opt(&mut args, "--cpu-affinity", core);
        }
        let percentiles: Vec<String> = self.percentiles.iter().map(|p| p.to_string()).collect();
        push_opt(&mut args, "--percentiles", percentiles.join(","));

        let profile = &self.device.profile;
        push_opt(&mut args, "--sim-devices", profile.devices);
        push_opt(&mut args, "--sim-compute-units", profile.compute_units);
        push_opt(&mut args, "--sim-kernel-time", nanos_arg(profile.kernel_time));
        push_opt(&mut args, "--sim-submit-overhead", nanos_arg(profile.submit_overhead));
        push_opt(&mut args, "--sim-dma-bandwidth", profile.dma_bandwidth_mbps);
        push_opt(&mut args, "--sim-failure-rate", profile.failure_rate);
        push_opt(&mut args, "--sim-jitter", profile.jitter);
        args
    }
}

fn push_opt(args: &mut Vec<String>, flag: &str, value: impl std::fmt::Display) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

fn nanos_arg(d: Duration) -> String {
    format!("{}ns", d.as_nanos())
}

/// Benchmark runner that executes one configuration
///
/// ## Usage Pattern
///
/// ```rust,no_run
/// # use accel_bench::{BenchmarkConfig, BenchmarkRunner};
/// # fn main() -> anyhow::Result<()> {
/// let runner = BenchmarkRunner::new(BenchmarkConfig::default());
/// let report = runner.run(false)?;
/// println!("{:.0} ops/s", report.throughput_ops);
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Run the configuration and build its report.
    ///
    /// With `isolated` every process of the configuration is a spawned child;
    /// otherwise the workers run inside this process.
    pub fn run(&self, isolated: bool) -> Result<RunReport> {
        if isolated {
            let summary = self.run_isolated()?;
            Ok(RunReport::from_cross_process(&self.config, &summary))
        } else {
            let summary = self.run_in_process()?;
            Ok(RunReport::from_process(&self.config, &summary))
        }
    }

    /// Run every worker of the configuration in this process.
    pub fn run_in_process(&self) -> Result<ProcessSummary> {
        let load_started = Instant::now();
        let device = DeviceFactory::open(&self.config.device).map_err(|e| {
            BenchError::setup(format!("opening device {}", self.config.device.index), e)
        })?;
        info!(
            "Test running... (pid {}, {} opened in {})",
            std::process::id(),
            device.describe(),
            format_duration(load_started.elapsed())
        );

        let workers = self.build_workers(&device)?;
        let clock = RunClock::start(self.config.limit.budget());
        let results = run_workers(workers, &clock)?;
        debug!("All workers joined after {}", format_duration(clock.elapsed()));

        let summary = aggregate_workers(
            results,
            self.config.expected_total(),
            &self.config.percentiles,
        )?;

        if summary.failures > 0 {
            if self.config.strict {
                return Err(BenchError::DeviceFailures {
                    failures: summary.failures,
                    completions: summary.completions,
                }
                .into());
            }
            warn!(
                "{} of {} commands completed with an error status (counted as completions)",
                summary.failures, summary.completions
            );
        }
        Ok(summary)
    }

    /// Run each process of every card as a spawned child and merge their
    /// mailbox entries.
    pub fn run_isolated(&self) -> Result<CrossProcessSummary> {
        let config = &self.config;
        let mut manager = ProcessManager::new()?;
        for card in &config.cards {
            for process in 0..config.processes {
                let args = config.to_child_args(card, process * config.threads);
                debug!("Child arguments for device {}: {:?}", card.index, args);
                manager.spawn(&args)?;
            }
        }
        let spawned = manager.spawned();
        let entries = manager.collect(self.config.strict)?;
        aggregate_entries(&entries).ok_or_else(|| BenchError::NoResults { spawned }.into())
    }

    fn build_workers(&self, device: &Arc<dyn Device>) -> Result<Vec<Worker>, BenchError> {
        let config = &self.config;
        let bulk = config.effective_bulk();
        let target = config.target_per_worker();

        let cores = config
            .cpu_affinity
            .and_then(|_| core_affinity::get_core_ids())
            .filter(|ids| !ids.is_empty());
        if config.cpu_affinity.is_some() && cores.is_none() {
            warn!("CPU affinity requested but core ids are unavailable; workers are not pinned");
        }

        (0..config.threads)
            .map(|id| -> Result<Worker, BenchError> {
                let command = self.worker_command(device.as_ref(), id)?;
                let slots = (0..bulk)
                    .map(|_| {
                        CommandSlot::new(
                            Arc::clone(device),
                            &command,
                            config.payload_size,
                            config.latency,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let mut driver = WindowDriver::new(slots, config.poll_timeout);
                if config.latency {
                    driver = driver.with_collector(LatencyCollector::new()?);
                }
                let mut worker = Worker::new(id, driver, target);
                if let (Some(base), Some(ids)) = (config.cpu_affinity, cores.as_ref()) {
                    worker = worker.pin_to(ids[(base + id) % ids.len()]);
                }
                Ok(worker)
            })
            .collect()
    }

    /// Command of worker `id` after compute unit placement.
    fn worker_command(&self, device: &dyn Device, id: usize) -> Result<CommandKind, BenchError> {
        let config = &self.config;
        let name = match &config.command {
            CommandKind::Kernel(name) if config.cu_layout != CuLayout::Single => name,
            command => return Ok(command.clone()),
        };
        let worker = config.worker_offset + id;
        let spec = place_kernel(device, name, config.cu_layout, worker).map_err(|e| {
            BenchError::setup(
                format!("placing worker {} with layout '{}'", worker, config.cu_layout),
                e,
            )
        })?;
        debug!("Worker {} runs {}", worker, spec);
        Ok(CommandKind::Kernel(spec))
    }
}

fn run_workers(workers: Vec<Worker>, clock: &RunClock) -> Result<Vec<WorkerResult>> {
    if workers.len() == 1 {
        return workers
            .into_iter()
            .map(|worker| worker.run(clock).map_err(anyhow::Error::from))
            .collect();
    }

    let results = crossbeam::thread::scope(|scope| -> Result<Vec<WorkerResult>> {
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let id = worker.id();
            let handle = scope
                .builder()
                .name(format!("worker-{}", id))
                .spawn(move |_| worker.run(clock))
                .with_context(|| format!("Failed to spawn worker thread {}", id))?;
            handles.push((id, handle));
        }

        handles
            .into_iter()
            .map(|(id, handle)| -> Result<WorkerResult> {
                let result = handle.join().map_err(|_| BenchError::WorkerPanic(id))?;
                Ok(result?)
            })
            .collect()
    })
    .map_err(|_| anyhow::anyhow!("worker thread scope panicked"))??;
    Ok(results)
}

/// Entry point of a spawned child: run in-process and publish the summary on
/// stdout.
pub fn run_child(config: BenchmarkConfig) -> Result<()> {
    let summary = BenchmarkRunner::new(config).run_in_process()?;
    let entry = MailboxEntry::from_summary(&summary);
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    publish(&entry, &mut handle).context("Failed to publish result to parent process")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn fast_args(extra: &[&str]) -> Args {
        let mut argv = vec!["accel-bench", "--sim-kernel-time", "20us", "--sim-submit-overhead", "1us"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_from_args_defaults() {
        let config = BenchmarkConfig::from_args(&Args::default()).unwrap();
        assert_eq!(config.limit, RunLimit::Count(30000));
        assert_eq!(config.bulk, 32);
        assert_eq!(config.command, CommandKind::Kernel("hello".into()));
        assert_eq!(config.expected_total(), Some(30000));
    }

    #[test]
    fn test_from_args_validation() {
        assert!(BenchmarkConfig::from_args(&fast_args(&["-b", "0"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-t", "0"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-p", "0"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-n", "0"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-T", "0s"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["--sim-failure-rate", "2"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["--percentiles", "0"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-n", "18446744073709551615", "-t", "2"])).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-n", "18446744073709551615"])).is_ok());
    }

    #[test]
    fn test_dma_count_is_regulated() {
        let config = BenchmarkConfig::from_args(&fast_args(&["-K", "dma", "-s", "64m"])).unwrap();
        assert_eq!(config.limit, RunLimit::Count(64));
        assert_eq!(config.command, CommandKind::Dma(SyncDirection::ToDevice));

        let explicit =
            BenchmarkConfig::from_args(&fast_args(&["-K", "dma", "-s", "64m", "-n", "3"])).unwrap();
        assert_eq!(explicit.limit, RunLimit::Count(3));
    }

    #[test]
    fn test_effective_bulk_clamped_by_count() {
        let config = BenchmarkConfig::from_args(&fast_args(&["-b", "32", "-n", "5"])).unwrap();
        assert_eq!(config.effective_bulk(), 5);

        let timed = BenchmarkConfig::from_args(&fast_args(&["-b", "32", "-T", "1s"])).unwrap();
        assert_eq!(timed.effective_bulk(), 32);
        assert_eq!(timed.target_per_worker(), 0);
        assert_eq!(timed.expected_total(), None);
    }

    #[test]
    fn test_child_args_reproduce_config() {
        let config = BenchmarkConfig::from_args(&fast_args(&[
            "-K", "dma", "-D", "from-device", "-s", "1m", "-T", "1.5s", "-t", "3", "-p", "4",
            "-L", "--strict", "--cpu-affinity", "2", "--percentiles", "50,99.9",
            "--sim-failure-rate", "0.25", "-c", "mk", "--sim-compute-units", "3",
        ]))
        .unwrap();

        let card = config.cards[0].clone();
        let child_argv: Vec<String> = std::iter::once("accel-bench".to_string())
            .chain(config.to_child_args(&card, 6))
            .collect();
        let child_args = Args::parse_from(child_argv);
        assert!(child_args.internal_run_as_child);
        assert!(child_args.quiet);

        let child = BenchmarkConfig::from_args(&child_args).unwrap();
        assert_eq!(child.processes, 1);
        assert_eq!(
            child,
            BenchmarkConfig {
                processes: 1,
                worker_offset: 6,
                ..config
            }
        );
    }

    #[test]
    fn test_child_args_select_their_card() {
        let config = BenchmarkConfig::from_args(&fast_args(&[
            "-k", "a.bin,b.bin", "-d", "2,5", "-p", "2",
        ]))
        .unwrap();
        assert!(config.is_multi_card());
        assert_eq!(config.total_processes(), 4);

        let child_args = Args::parse_from(
            std::iter::once("accel-bench".to_string()).chain(config.to_child_args(&config.cards[1], 0)),
        );
        let child = BenchmarkConfig::from_args(&child_args).unwrap();
        assert!(!child.is_multi_card());
        assert_eq!(child.device.index, 5);
        assert_eq!(child.device.program, Some(PathBuf::from("b.bin")));
    }

    #[test]
    fn test_card_resolution() {
        let one = |index| Card {
            index,
            program: Some(PathBuf::from("p.bin")),
        };
        assert_eq!(
            resolve_cards(&[PathBuf::from("p.bin")], &[0, 1]).unwrap(),
            vec![one(0), one(1)]
        );
        assert_eq!(
            resolve_cards(&[], &[3]).unwrap(),
            vec![Card {
                index: 3,
                program: None
            }]
        );

        let paired = resolve_cards(&[PathBuf::from("a.bin"), PathBuf::from("b.bin")], &[4, 7]).unwrap();
        assert_eq!(paired[1].index, 7);
        assert_eq!(paired[1].program, Some(PathBuf::from("b.bin")));

        assert!(resolve_cards(&[PathBuf::from("a.bin"), PathBuf::from("b.bin")], &[0]).is_err());
        assert!(BenchmarkConfig::from_args(&fast_args(&["-k", "a.bin,b.bin,c.bin", "-d", "0,1"])).is_err());
    }

    #[test]
    fn test_place_kernel_layouts() {
        let device = DeviceFactory::open(&DeviceConfig {
            profile: SimProfile {
                compute_units: 3,
                ..SimProfile::default()
            },
            ..DeviceConfig::default()
        })
        .unwrap();
        let device = device.as_ref();

        assert_eq!(place_kernel(device, "hello", CuLayout::Single, 7).unwrap(), "hello");

        let mc: Vec<String> = (0..4)
            .map(|w| place_kernel(device, "hello", CuLayout::MultiCu, w).unwrap())
            .collect();
        assert_eq!(mc, ["hello:{hello_1}", "hello:{hello_2}", "hello:{hello_3}", "hello:{hello_1}"]);

        let mk: Vec<String> = (0..4)
            .map(|w| place_kernel(device, "hello", CuLayout::MultiKernel, w).unwrap())
            .collect();
        assert_eq!(mk, ["hello_1", "hello_2", "hello_3", "hello_1"]);

        assert!(matches!(
            place_kernel(device, "vadd", CuLayout::MultiKernel, 0),
            Err(DeviceError::UnknownKernel(name)) if name == "vadd_1"
        ));
        assert!(place_kernel(device, "vadd", CuLayout::MultiCu, 0).is_err());
    }

    #[test]
    fn test_workers_continue_placement_across_processes() {
        let config = BenchmarkConfig::from_args(&fast_args(&[
            "-t", "2", "-c", "mc", "--sim-compute-units", "4", "--internal-worker-offset", "2",
        ]))
        .unwrap();
        let runner = BenchmarkRunner::new(config);
        let device = DeviceFactory::open(&runner.config().device).unwrap();
        assert_eq!(
            runner.worker_command(device.as_ref(), 0).unwrap(),
            CommandKind::Kernel("hello:{hello_3}".into())
        );
        assert_eq!(
            runner.worker_command(device.as_ref(), 1).unwrap(),
            CommandKind::Kernel("hello:{hello_4}".into())
        );
    }

    #[test]
    fn test_run_in_process_over_compute_units() {
        let config = BenchmarkConfig::from_args(&fast_args(&[
            "-t", "2", "-b", "4", "-n", "100", "-c", "mk", "--sim-compute-units", "2",
        ]))
        .unwrap();
        let summary = BenchmarkRunner::new(config).run_in_process().unwrap();
        assert_eq!(summary.completions, 200);
    }

    #[test]
    fn test_run_in_process_count_mode() {
        let config = BenchmarkConfig::from_args(&fast_args(&["-t", "2", "-b", "4", "-n", "200"])).unwrap();
        let summary = BenchmarkRunner::new(config).run_in_process().unwrap();
        assert_eq!(summary.workers, 2);
        assert_eq!(summary.completions, 400);
        assert!(summary.window.duration_ns() > 0);
    }

    #[test]
    fn test_run_in_process_latency_percentiles() {
        let config = BenchmarkConfig::from_args(&fast_args(&["-b", "2", "-n", "100", "-L"])).unwrap();
        let summary = BenchmarkRunner::new(config).run_in_process().unwrap();
        assert_eq!(summary.latency.count(), 100);
        assert_eq!(summary.percentiles.len(), 3);
        // Every command spends at least the simulated kernel time on the device.
        assert!(summary.latency.min_ns().unwrap() >= 20_000);
        for p in &summary.percentiles {
            assert!(p.value_ns >= 20_000, "p{} = {} ns", p.percentile, p.value_ns);
        }
    }

    #[test]
    fn test_setup_error_for_missing_device() {
        let config = BenchmarkConfig::from_args(&fast_args(&["-d", "5"])).unwrap();
        let err = BenchmarkRunner::new(config).run_in_process().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::Setup { .. })
        ));
    }

    #[test]
    fn test_strict_mode_rejects_failures() {
        let config = BenchmarkConfig::from_args(&fast_args(&[
            "-n", "20", "-b", "2", "--sim-failure-rate", "1", "--strict",
        ]))
        .unwrap();
        let err = BenchmarkRunner::new(config).run_in_process().unwrap_err();
        assert_eq!(err.downcast_ref::<BenchError>().map(|e| e.exit_code()), Some(4));
    }

    #[test]
    fn test_lenient_mode_counts_failures() {
        let config = BenchmarkConfig::from_args(&fast_args(&[
            "-n", "20", "-b", "2", "--sim-failure-rate", "1",
        ]))
        .unwrap();
        let summary = BenchmarkRunner::new(config).run_in_process().unwrap();
        assert_eq!(summary.completions, 20);
        assert_eq!(summary.failures, 20);
    }

    #[test]
    fn test_config_display() {
        let text = BenchmarkConfig::default().display().to_string();
        assert!(text.contains("Queue Length:       32"));
        assert!(text.contains("Execution Count:    30000 per thread"));
        assert!(text.contains("CU Layout:          single"));
    }
}
