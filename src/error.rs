//! # Error Taxonomy
//!
//! Typed errors for the measurement core. The orchestration layers wrap these
//! in `anyhow::Error` with context; `main` downcasts back to [`BenchError`] to
//! pick the process exit code.
//!
//! ## Categories
//!
//! - **Setup**: device open, program load, kernel lookup or buffer allocation
//!   failed. The run is aborted before any statistics exist.
//! - **Consistency**: the driver loop produced a completion count that does not
//!   match the configured target. This points at a bug in the harness itself,
//!   not at the environment, and is reported separately.
//! - **Device failures**: commands that completed with an error status. These
//!   are counted as completions and are only fatal with `--strict`.
//! - **Mailbox**: a sibling process left a missing or corrupt entry. Never
//!   fatal; the entry is skipped.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a device backend.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device index {index} not found ({available} device(s) present)")]
    NotFound { index: u32, available: u32 },

    #[error("failed to load program '{}': {reason}", path.display())]
    Program { path: PathBuf, reason: String },

    #[error("kernel '{0}' is not part of the loaded program")]
    UnknownKernel(String),

    #[error("kernel '{kernel}' has no compute unit '{unit}'")]
    UnknownComputeUnit { kernel: String, unit: String },

    #[error("buffer of {requested} bytes exceeds the device limit of {limit} bytes")]
    BufferTooLarge { requested: u64, limit: u64 },

    #[error("invalid device profile: {0}")]
    InvalidProfile(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fatal and reportable conditions of a benchmark run.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Device, program or command construction failed.
    #[error("setup failed while {context}")]
    Setup {
        context: String,
        #[source]
        source: DeviceError,
    },

    /// The completed command count does not match the configured total.
    #[error("consistency check failed: expected {expected} completions, observed {observed}")]
    Consistency { expected: u64, observed: u64 },

    /// Only raised in strict mode.
    #[error("{failures} of {completions} commands completed with an error status")]
    DeviceFailures { failures: u64, completions: u64 },

    #[error("device error while driving commands: {0}")]
    Device(#[from] DeviceError),

    #[error("worker {0} panicked")]
    WorkerPanic(usize),

    #[error("latency histogram error: {0}")]
    Histogram(String),

    #[error("none of the {spawned} spawned process(es) reported a result")]
    NoResults { spawned: usize },
}

impl BenchError {
    pub fn setup(context: impl Into<String>, source: DeviceError) -> Self {
        BenchError::Setup {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Consistency { .. } => 3,
            BenchError::DeviceFailures { .. } => 4,
            _ => 1,
        }
    }
}

/// A mailbox entry that could not be decoded.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("entry is missing the '{0}' field")]
    MissingField(&'static str),

    #[error("field '{field}' is not a decimal integer: '{value}'")]
    Parse { field: &'static str, value: String },

    #[error("failed to read entry: {0}")]
    Io(#[from] io::Error),
}
