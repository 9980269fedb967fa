//! # Accelerator Command Pipeline Benchmark Library
//!
//! A micro-benchmark harness that measures how fast an accelerator accepts,
//! executes and retires commands. Throughput and latency are measured for
//! three kinds of commands:
//!
//! - **Kernel execution**: a single-stage kernel run, restarted in place
//! - **Pipeline**: two streaming kernels (`m2s` then `s2m`) started as a pair
//! - **DMA**: a blocking buffer transfer to or from the device
//!
//! ## Architecture Overview
//!
//! - `command`: command slots, one reusable unit of outstanding work each
//! - `window`: the window driver that keeps `bulk` commands in flight, and
//!   the worker thread that owns one driver
//! - `metrics`: latency statistics, HDR histograms and the in-process merge
//! - `coordination`: child process spawning and the pipe-backed mailbox that
//!   carries each process's result back to the parent
//! - `sweep`: test modes and the best-result accumulator
//! - `benchmark`: configuration and execution of one run
//! - `device`: the device traits and the simulated accelerator backend
//! - `results`, `cli`, `logging`, `utils`, `error`: the ambient pieces
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use accel_bench::{BenchmarkConfig, BenchmarkRunner, CommandKind};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         command: CommandKind::Pipeline,
//!         threads: 2,
//!         bulk: 16,
//!         ..Default::default()
//!     };
//!
//!     let summary = BenchmarkRunner::new(config).run_in_process()?;
//!     println!("{:.0} ops/s", summary.throughput().ops_per_second);
//!     Ok(())
//! }
//! ```

/// Benchmark configuration and execution of one run
pub mod benchmark;

/// Command-line interface and configuration
///
/// Provides argument parsing using clap, including human-readable durations
/// ("500ms", "1.5s") and sizes ("4k", "64m").
pub mod cli;

pub mod command;

/// Child processes and the cross-process mailbox
pub mod coordination;

pub mod device;

pub mod error;

/// Log formatting and subscriber setup
pub mod logging;

pub mod metrics;

/// Result records, console output and the append-only report files
pub mod results;

pub mod sweep;

/// Utility functions for formatting, validation, and system information
pub mod utils;

pub mod window;

pub use benchmark::{BenchmarkConfig, BenchmarkRunner, RunLimit};

pub use cli::{Args, TestMode};

pub use command::{CommandKind, CommandSlot};

pub use error::{BenchError, DeviceError, MailboxError};

pub use metrics::{LatencyStats, ProcessSummary, ThroughputMetrics, WorkerResult};

pub use results::{ResultsManager, RunReport};

pub use sweep::{SweepBest, SweepController};

/// Current version of the benchmark suite
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default window depth per worker
    pub const BULK: usize = 32;

    /// Default executions per worker
    ///
    /// DMA runs without `-n` use a count regulated by the payload size
    /// instead, see [`crate::utils::dma_count_for_size`].
    pub const COUNT: u64 = 30000;

    pub const THREADS: usize = 1;

    pub const PROCESSES: usize = 1;

    /// Default single-stage kernel
    pub const KERNEL: &str = "hello";

    pub const PAYLOAD_SIZE: &str = "4k";

    /// Upper bound on one completion poll
    pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

    /// One JSON record per run is appended here
    pub const OUTPUT_FILE: &str = "data_points.jsonl";

    /// Best throughput-sweep results are appended here
    pub const HISTORY_FILE: &str = "tput_history.log";
}
