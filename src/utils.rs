//! # Utility Functions and Helper Module
//!
//! This module provides utility functions used throughout the accelerator
//! benchmark harness: clocks, formatters for human-readable output, validation
//! of configuration parameters, and the power-of-two progressions used by the
//! sweeps.
//!
//! ## Key Functionality Categories
//!
//! - **Clocks**: a monotonic timestamp comparable across processes
//! - **Formatting**: Human-readable display of durations, bytes, and rates
//! - **Validation**: Input parameter validation with clear error messages
//! - **Run Shaping**: Sweep progressions and DMA execution counts
//! - **System Information**: Host name and CPU detection
//!
//! ## Usage Examples
//!
//! ```rust
//! use accel_bench::utils::*;
//! use std::time::Duration;
//!
//! // Format durations for display
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! // Format throughput rates
//! let rate_str = format_rate(1048576.0);
//! assert_eq!(rate_str, "1.00 MB/s");
//!
//! // Validate configuration parameters
//! # fn main() -> anyhow::Result<()> {
//! validate_bulk(32)?; // OK
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest payload a single command may carry (4 GiB).
pub const MAX_PAYLOAD_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Largest thread or process count accepted.
pub const MAX_PARALLELISM: usize = 1024;

/// Get current timestamp as nanoseconds since Unix epoch
///
/// Used for wall-clock correlation only. Measurement windows use
/// [`monotonic_now_ns`] instead.
///
/// ## Error Handling
///
/// If the system time is before the Unix epoch (very rare), returns 0
/// to provide a safe fallback rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Read the system-wide monotonic clock in nanoseconds
///
/// Unlike `std::time::Instant`, the value is a plain integer that means the
/// same thing in every process on the host, so windows published by sibling
/// processes can be compared and spanned by the parent.
///
/// ## Platform Notes
///
/// - **Unix**: `CLOCK_MONOTONIC` through `nix::time::clock_gettime`
/// - **Elsewhere**: falls back to wall-clock time since the Unix epoch
pub fn monotonic_now_ns() -> u64 {
    #[cfg(unix)]
    {
        use nix::time::{clock_gettime, ClockId};
        if let Ok(ts) = clock_gettime(ClockId::CLOCK_MONOTONIC) {
            return (ts.tv_sec() as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec() as u64);
        }
    }
    current_timestamp_ns()
}

/// Host name of the machine, or `"unknown"` when it cannot be read.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Some(name) = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
        {
            return name;
        }
    }
    "unknown".to_string()
}

/// Convert nanoseconds to a human-readable duration string
///
/// Convenience wrapper around [`format_duration`].
///
/// ## Examples
///
/// ```rust
/// # use accel_bench::utils::format_duration_ns;
/// assert_eq!(format_duration_ns(500), "500ns");
/// assert_eq!(format_duration_ns(1500), "1.50μs");
/// assert_eq!(format_duration_ns(1500000), "1.50ms");
/// ```
pub fn format_duration_ns(ns: u64) -> String {
    format_duration(Duration::from_nanos(ns))
}

/// Format a duration in a human-readable way
///
/// Converts a Duration to a human-readable string, automatically selecting
/// the most appropriate unit based on the magnitude.
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use accel_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format bytes in a human-readable way
///
/// Uses binary (1024-based) scaling, matching the size suffixes accepted on
/// the command line.
///
/// ## Examples
///
/// ```rust
/// # use accel_bench::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(16 * 1024 * 1024), "16.00 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

/// Format bytes (as f64) in a human-readable way
pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a rate (bytes per second) in a human-readable way
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Format an operation rate in a human-readable way
///
/// Uses decimal scaling (powers of 1000):
/// - Ops/sec: < 1,000 (e.g., "750 ops/s")
/// - Thousands: < 1,000,000 (e.g., "15.50K ops/s")
/// - Millions: ≥ 1,000,000 (e.g., "2.30M ops/s")
pub fn format_op_rate(ops_per_second: f64) -> String {
    if ops_per_second < 1_000.0 {
        format!("{:.0} ops/s", ops_per_second)
    } else if ops_per_second < 1_000_000.0 {
        format!("{:.2}K ops/s", ops_per_second / 1_000.0)
    } else {
        format!("{:.2}M ops/s", ops_per_second / 1_000_000.0)
    }
}

/// Validate the window depth
///
/// ## Validation Rules
///
/// - **Minimum**: 1 (a window of one is synchronous ping-pong)
/// - **Maximum**: 65536 outstanding commands per worker
pub fn validate_bulk(bulk: usize) -> Result<()> {
    if bulk == 0 {
        anyhow::bail!("Bulk depth cannot be zero");
    }
    if bulk > 65536 {
        anyhow::bail!("Bulk depth {} is too large (maximum 65536)", bulk);
    }
    Ok(())
}

/// Validate a thread or process count
///
/// `what` names the parameter in the error message.
///
/// ## Validation Rules
///
/// - **Minimum**: 1
/// - **Maximum**: [`MAX_PARALLELISM`]
pub fn validate_parallelism(what: &str, count: usize) -> Result<()> {
    if count == 0 {
        anyhow::bail!("{} count cannot be zero", what);
    }
    if count > MAX_PARALLELISM {
        anyhow::bail!(
            "{} count {} is too high (maximum {})",
            what,
            count,
            MAX_PARALLELISM
        );
    }
    Ok(())
}

/// Validate that a payload size is reasonable
///
/// ## Validation Rules
///
/// - **Minimum**: 1 byte
/// - **Maximum**: 4 GiB, the largest buffer a device accepts
pub fn validate_payload_size(payload_size: u64) -> Result<()> {
    if payload_size == 0 {
        anyhow::bail!("Payload size cannot be zero");
    }
    if payload_size > MAX_PAYLOAD_SIZE {
        anyhow::bail!(
            "Payload size {} is too large (maximum 4GB)",
            payload_size
        );
    }
    Ok(())
}

/// Validate requested percentiles, each in `(0, 100]`.
pub fn validate_percentiles(percentiles: &[f64]) -> Result<()> {
    for &p in percentiles {
        if !(p > 0.0 && p <= 100.0) {
            anyhow::bail!("Percentile {} is outside (0, 100]", p);
        }
    }
    Ok(())
}

/// Powers of two from 1 up to and including `ceiling`.
///
/// ```rust
/// # use accel_bench::utils::powers_of_two_up_to;
/// assert_eq!(powers_of_two_up_to(8), vec![1, 2, 4, 8]);
/// assert_eq!(powers_of_two_up_to(6), vec![1, 2, 4]);
/// ```
pub fn powers_of_two_up_to(ceiling: usize) -> Vec<usize> {
    std::iter::successors(Some(1usize), |&n| n.checked_mul(2))
        .take_while(|&n| n <= ceiling)
        .collect()
}

/// Default execution count for a DMA transfer of `payload_size` bytes
///
/// Large transfers take long enough that a handful of them is representative;
/// small ones need many repetitions to amortize timer and setup noise.
///
/// | payload      | count |
/// |--------------|-------|
/// | > 1 GiB      | 1     |
/// | > 256 MiB    | 4     |
/// | > 64 MiB     | 16    |
/// | > 16 MiB     | 64    |
/// | > 1 MiB      | 1024  |
/// | otherwise    | 10000 |
pub fn dma_count_for_size(payload_size: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    if payload_size > 1024 * MIB {
        1
    } else if payload_size > 256 * MIB {
        4
    } else if payload_size > 64 * MIB {
        16
    } else if payload_size > 16 * MIB {
        64
    } else if payload_size > MIB {
        1024
    } else {
        10000
    }
}

/// Get the number of CPU cores available
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}
