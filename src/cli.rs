use crate::device::SyncDirection;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Accelerator Benchmark - throughput and latency of device command pipelines
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Program image(s) to load, comma-separated for a multi-card run
    #[clap(short = 'k', long = "program", value_delimiter = ',', help_heading = "Device Options")]
    pub programs: Vec<PathBuf>,

    /// Device index(es), comma-separated for a multi-card run
    #[clap(short = 'd', long = "device", value_delimiter = ',', default_values_t = vec![0], help_heading = "Device Options")]
    pub devices: Vec<u32>,

    /// How workers are spread over compute units (mc, mk or single)
    #[clap(short = 'c', long, value_enum, default_value_t = CuLayout::Single, help_heading = "Device Options")]
    pub cu_layout: CuLayout,

    /// What each command executes
    #[clap(short = 'K', long, value_enum, default_value_t = RunType::Kernel, help_heading = "Core Options")]
    pub run_type: RunType,

    /// Kernel name for single-stage kernel runs
    #[clap(short = 'N', long, default_value = crate::defaults::KERNEL, help_heading = "Core Options")]
    pub kernel: String,

    /// DMA transfer direction
    #[clap(short = 'D', long, value_enum, default_value_t = DmaDirection::Both, help_heading = "Core Options")]
    pub dma_dir: DmaDirection,

    /// Payload size per command (plain bytes or with b/k/m/g suffix, max 4g)
    #[clap(short = 's', long, value_parser = parse_size, default_value = crate::defaults::PAYLOAD_SIZE, help_heading = "Core Options")]
    pub payload_size: u64,

    /// Commands kept outstanding per worker
    #[clap(short = 'b', long, default_value_t = crate::defaults::BULK, help_heading = "Core Options")]
    pub bulk: usize,

    /// Commands executed per worker [default: 30000, or regulated by payload size for DMA]
    #[clap(short = 'n', long, conflicts_with = "time", help_heading = "Core Options")]
    pub count: Option<u64>,

    /// Run for a fixed time instead of a fixed count (e.g. 500ms, 10s, 1m)
    #[clap(short = 'T', long, value_parser = parse_duration, help_heading = "Core Options")]
    pub time: Option<Duration>,

    /// Worker threads per process
    #[clap(short = 't', long, default_value_t = crate::defaults::THREADS, help_heading = "Core Options")]
    pub threads: usize,

    /// Benchmark processes
    #[clap(short = 'p', long, default_value_t = crate::defaults::PROCESSES, help_heading = "Core Options")]
    pub processes: usize,

    /// Test mode
    #[clap(short = 'm', long, value_enum, default_value_t = TestMode::Single, help_heading = "Core Options")]
    pub mode: TestMode,

    /// Measure per-command latency instead of throughput
    #[clap(short = 'L', long, default_value_t = false, help_heading = "Core Options")]
    pub latency: bool,

    /// Treat commands that complete with an error status as fatal
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub strict: bool,

    /// Upper bound on a single completion poll
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Core Options")]
    pub poll_timeout: Duration,

    /// Pin worker i to core (CORE + i) modulo the core count
    #[clap(long, value_name = "CORE", help_heading = "Core Options")]
    pub cpu_affinity: Option<usize>,

    /// Percentiles to report in latency mode
    #[clap(long, value_delimiter = ',', default_values_t = vec![50.0, 95.0, 99.0], help_heading = "Output Options")]
    pub percentiles: Vec<f64>,

    /// Do not print or record results
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output Options")]
    pub quiet: bool,

    /// File that receives one JSON record per run
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Output Options")]
    pub output_file: PathBuf,

    /// File that receives the best result of a throughput sweep
    #[clap(long, default_value = crate::defaults::HISTORY_FILE, help_heading = "Output Options")]
    pub history_file: PathBuf,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false, help_heading = "Output Options")]
    pub verbose: bool,

    /// Write logs to this file instead of stderr
    #[clap(long, help_heading = "Output Options")]
    pub log_file: Option<PathBuf>,

    /// Number of simulated devices present
    #[clap(long, default_value_t = 1, help_heading = "Simulated Device")]
    pub sim_devices: u32,

    /// Compute units per simulated kernel
    #[clap(long, default_value_t = 1, help_heading = "Simulated Device")]
    pub sim_compute_units: u32,

    /// Execution time of one simulated kernel run
    #[clap(long, value_parser = parse_duration, default_value = "50us", help_heading = "Simulated Device")]
    pub sim_kernel_time: Duration,

    /// Host-side cost of submitting one command
    #[clap(long, value_parser = parse_duration, default_value = "5us", help_heading = "Simulated Device")]
    pub sim_submit_overhead: Duration,

    /// Simulated DMA bandwidth in MB/s
    #[clap(long, default_value_t = 2000, help_heading = "Simulated Device")]
    pub sim_dma_bandwidth: u64,

    /// Probability that a simulated command completes with an error status
    #[clap(long, default_value_t = 0.0, help_heading = "Simulated Device")]
    pub sim_failure_rate: f64,

    /// Relative spread of the simulated kernel time, in [0, 1)
    #[clap(long, default_value_t = 0.0, help_heading = "Simulated Device")]
    pub sim_jitter: f64,

    /// Run as a spawned child: execute one configuration in-process and
    /// publish the result on stdout.
    #[clap(long, hide = true, default_value_t = false)]
    pub internal_run_as_child: bool,

    /// Global index of this process's first worker, for compute unit placement
    #[clap(long, hide = true, default_value_t = 0)]
    pub internal_worker_offset: usize,
}

impl Default for Args {
    fn default() -> Self {
        Args::parse_from(["accel-bench"])
    }
}

/// Benchmark modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TestMode {
    /// One configuration, run once
    #[clap(name = "single")]
    Single,

    /// Sweep the window depth 1..256 (payload size for DMA)
    #[clap(name = "tput")]
    Tput,

    /// Sweep the process count over powers of two
    #[clap(name = "mp")]
    Mp,

    /// Sweep the thread count over powers of two
    #[clap(name = "mt")]
    Mt,
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestMode::Single => write!(f, "Single Run"),
            TestMode::Tput => write!(f, "Throughput Sweep"),
            TestMode::Mp => write!(f, "Process Sweep"),
            TestMode::Mt => write!(f, "Thread Sweep"),
        }
    }
}

/// Compute unit layouts of the loaded program
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum CuLayout {
    /// Several compute units in one kernel; each worker takes a different unit
    #[clap(name = "mc", alias = "1")]
    MultiCu,

    /// Several kernels with one compute unit each; each worker takes a different kernel
    #[clap(name = "mk", alias = "2")]
    MultiKernel,

    /// Every worker runs the kernel named by -N
    #[clap(name = "single", alias = "3")]
    Single,
}

impl std::fmt::Display for CuLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CuLayout::MultiCu => write!(f, "mc"),
            CuLayout::MultiKernel => write!(f, "mk"),
            CuLayout::Single => write!(f, "single"),
        }
    }
}

/// Command kinds selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum RunType {
    #[clap(name = "kernel")]
    Kernel,

    #[clap(name = "pipeline")]
    Pipeline,

    #[clap(name = "dma")]
    Dma,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::Kernel => write!(f, "Kernel"),
            RunType::Pipeline => write!(f, "Pipeline"),
            RunType::Dma => write!(f, "DMA"),
        }
    }
}

/// DMA directions selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DmaDirection {
    #[clap(name = "to-device")]
    ToDevice,

    #[clap(name = "from-device")]
    FromDevice,

    /// To device, then from device
    #[clap(name = "both")]
    Both,
}

impl DmaDirection {
    /// Expand to the transfer directions to run, in order.
    pub fn directions(self) -> Vec<SyncDirection> {
        match self {
            DmaDirection::ToDevice => vec![SyncDirection::ToDevice],
            DmaDirection::FromDevice => vec![SyncDirection::FromDevice],
            DmaDirection::Both => vec![SyncDirection::ToDevice, SyncDirection::FromDevice],
        }
    }
}

impl From<SyncDirection> for DmaDirection {
    fn from(direction: SyncDirection) -> Self {
        match direction {
            SyncDirection::ToDevice => DmaDirection::ToDevice,
            SyncDirection::FromDevice => DmaDirection::FromDevice,
        }
    }
}

impl std::fmt::Display for DmaDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DmaDirection::ToDevice => write!(f, "to-device"),
            DmaDirection::FromDevice => write!(f, "from-device"),
            DmaDirection::Both => write!(f, "both"),
        }
    }
}

/// Parse duration from string (e.g., "250us", "10s", "5m", "1h")
///
/// Bare numbers are seconds; fractional values are accepted ("0.5" is 500ms).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, scale_ns) = if let Some(stripped) = s.strip_suffix("ns") {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix("us") {
        (stripped, 1e3)
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1e6)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1e9)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60e9)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600e9)
    } else {
        (s, 1e9) // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Invalid duration: {}", s));
    }

    Ok(Duration::from_nanos((num * scale_ns).round() as u64))
}

/// Parse a payload size: plain bytes or a b/k/m/g suffix (binary multiples)
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }

    let (num_str, multiplier) = match s.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('b') => (&s[..s.len() - 1], 1u64),
        Some('k') => (&s[..s.len() - 1], 1 << 10),
        Some('m') => (&s[..s.len() - 1], 1 << 20),
        Some('g') => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in size: {}", num_str))?;
    let bytes = num
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Size {} is too large", s))?;
    if bytes > crate::utils::MAX_PAYLOAD_SIZE {
        return Err(format!("Size {} exceeds the 4g maximum", s));
    }
    Ok(bytes)
}
