//! # Device Command Interface
//!
//! The measurement core never talks to hardware directly. It drives a
//! [`Device`] through three primitives: start a run of a kernel, poll or wait a
//! run handle, and synchronously transfer a buffer. Any accelerator runtime
//! can be plugged in by implementing these traits; the crate ships a
//! software-simulated accelerator ([`sim::SimulatedDevice`]) as its default
//! backend.
//!
//! ## Contract
//!
//! - [`Device::start_run`] constructs *and* starts a command. It is called
//!   once per command slot; afterwards [`RunHandle::restart`] re-issues the
//!   same command in place so construction cost never lands inside the
//!   measured loop.
//! - [`RunHandle::poll`] blocks for at most `timeout` and reports whether the
//!   command is still pending. [`RunHandle::wait`] blocks without a timeout
//!   and is only used while draining.
//! - [`DeviceBuffer::sync`] is a blocking DMA transfer; when it returns the
//!   transfer is complete.

use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod sim;

pub use sim::{SimProfile, SimulatedDevice};

/// Completion status reported by a run handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Completed,
    /// The command finished with an error or abort status.
    Failed,
}

impl CommandState {
    pub fn is_done(self) -> bool {
        !matches!(self, CommandState::Pending)
    }
}

/// Direction of a buffer transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Host memory to device memory (the device reads).
    ToDevice,
    /// Device memory to host memory (the device writes).
    FromDevice,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::ToDevice => write!(f, "to device"),
            SyncDirection::FromDevice => write!(f, "from device"),
        }
    }
}

/// A kernel resolved from the loaded program.
///
/// Without a compute unit the device picks one per run; with one, every run
/// of the kernel executes on that unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    name: Arc<str>,
    compute_unit: Option<Arc<str>>,
}

impl Kernel {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            compute_unit: None,
        }
    }

    /// `name` bound to one of its compute units.
    pub fn on_unit(name: &str, compute_unit: &str) -> Self {
        Self {
            name: Arc::from(name),
            compute_unit: Some(Arc::from(compute_unit)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute_unit(&self) -> Option<&str> {
        self.compute_unit.as_deref()
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.compute_unit {
            Some(cu) => write!(f, "{}:{{{}}}", self.name, cu),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split a kernel spec of the form `name` or `name:{unit}`.
///
/// ```
/// use accel_bench::device::parse_kernel_spec;
///
/// assert_eq!(parse_kernel_spec("hello"), Some(("hello", None)));
/// assert_eq!(parse_kernel_spec("hello:{hello_2}"), Some(("hello", Some("hello_2"))));
/// assert_eq!(parse_kernel_spec("hello:hello_2"), None);
/// ```
pub fn parse_kernel_spec(spec: &str) -> Option<(&str, Option<&str>)> {
    match spec.split_once(':') {
        None if !spec.is_empty() => Some((spec, None)),
        None => None,
        Some((name, unit)) => {
            let unit = unit.strip_prefix('{')?.strip_suffix('}')?;
            if name.is_empty() || unit.is_empty() {
                return None;
            }
            Some((name, Some(unit)))
        }
    }
}

/// An in-flight (or finished) kernel run.
pub trait RunHandle: Send {
    /// Re-issue the same command in place.
    fn restart(&mut self) -> Result<(), DeviceError>;

    /// Wait at most `timeout` for the run to finish.
    fn poll(&mut self, timeout: Duration) -> Result<CommandState, DeviceError>;

    /// Wait for the run to finish, however long that takes.
    fn wait(&mut self) -> Result<CommandState, DeviceError>;
}

/// A device-side buffer.
pub trait DeviceBuffer: Send {
    fn size(&self) -> u64;

    /// Blocking transfer of the whole buffer in `direction`.
    fn sync(&mut self, direction: SyncDirection) -> Result<(), DeviceError>;
}

/// An opened device with its program loaded.
///
/// Devices are shared by every worker thread of a process, so implementations
/// must be `Send + Sync`. Handles and buffers they return are owned by a single
/// command slot.
pub trait Device: Send + Sync {
    /// Human-readable identification used in logs.
    fn describe(&self) -> String;

    /// Resolve a kernel by spec, `name` or `name:{unit}`.
    fn kernel(&self, spec: &str) -> Result<Kernel, DeviceError>;

    /// Names of every kernel in the loaded program.
    fn kernels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Compute units of kernel `name`, in index order.
    fn compute_units(&self, name: &str) -> Result<Vec<String>, DeviceError> {
        let kernel = self.kernel(name)?;
        Ok(vec![format!("{}_1", kernel.name())])
    }

    fn alloc_buffer(&self, size: u64) -> Result<Box<dyn DeviceBuffer>, DeviceError>;

    /// Construct and start a run of `kernel`, optionally bound to `buffer`.
    fn start_run(
        &self,
        kernel: &Kernel,
        buffer: Option<&dyn DeviceBuffer>,
    ) -> Result<Box<dyn RunHandle>, DeviceError>;
}

/// Which device to open and what to load onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub index: u32,
    /// Program image. Optional for the simulated backend.
    pub program: Option<PathBuf>,
    pub profile: SimProfile,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            program: None,
            profile: SimProfile::default(),
        }
    }
}

/// Factory for opened devices.
pub struct DeviceFactory;

impl DeviceFactory {
    /// Open the device and load its program.
    pub fn open(config: &DeviceConfig) -> Result<Arc<dyn Device>, DeviceError> {
        let device = SimulatedDevice::open(config)?;
        Ok(Arc::new(device))
    }
}
