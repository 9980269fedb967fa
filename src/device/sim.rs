//! Software-simulated accelerator.
//!
//! Each compute unit executes commands back to back. A command submitted at
//! `now` finishes at `max(now + submit_overhead, unit_busy_until) +
//! service_time`, so a unit saturates at one command per service time and a
//! deeper window hides the submit overhead, which is the behavior the
//! benchmark is built to expose. Buffer transfers are serialized on a single
//! DMA engine.
//!
//! ## Program layout
//!
//! With `compute_units = N` the simulated program holds, for each of `hello`,
//! `m2s` and `s2m`:
//!
//! - the kernel itself with units `<name>_1 ..= <name>_N`, and
//! - kernels `<name>_1 ..= <name>_N` with a single unit `<name>_<k>_1` each.
//!
//! A run of a kernel that is not bound to a unit goes to whichever of its
//! units frees up first.
//!
//! Buffers are bookkeeping only; no host memory is allocated for them.

use super::{
    parse_kernel_spec, CommandState, Device, DeviceBuffer, DeviceConfig, Kernel, RunHandle,
    SyncDirection,
};
use crate::error::DeviceError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Largest buffer the simulated device accepts.
pub const MAX_BUFFER_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Remaining time below which waiting spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Kernels in the simulated program and whether they stream their buffer.
const KERNELS: &[(&str, bool)] = &[("hello", false), ("m2s", true), ("s2m", true)];

/// Most compute units the simulated program carries per kernel.
pub const MAX_COMPUTE_UNITS: u32 = 64;

/// Timing model of the simulated device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimProfile {
    /// Number of devices present.
    pub devices: u32,
    /// Compute units per kernel.
    pub compute_units: u32,
    /// Execution time of one kernel run.
    pub kernel_time: Duration,
    /// Host-side cost of submitting one command.
    pub submit_overhead: Duration,
    /// DMA bandwidth in MB/s (10^6 bytes).
    pub dma_bandwidth_mbps: u64,
    /// Probability that a run completes with an error status.
    pub failure_rate: f64,
    /// Relative spread of the kernel time, uniform in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            devices: 1,
            compute_units: 1,
            kernel_time: Duration::from_micros(50),
            submit_overhead: Duration::from_micros(5),
            dma_bandwidth_mbps: 2000,
            failure_rate: 0.0,
            jitter: 0.0,
        }
    }
}

impl SimProfile {
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.devices == 0 {
            return Err(DeviceError::InvalidProfile(
                "at least one device must be present".into(),
            ));
        }
        if !(1..=MAX_COMPUTE_UNITS).contains(&self.compute_units) {
            return Err(DeviceError::InvalidProfile(format!(
                "compute units per kernel must be between 1 and {}",
                MAX_COMPUTE_UNITS
            )));
        }
        if self.dma_bandwidth_mbps == 0 {
            return Err(DeviceError::InvalidProfile(
                "DMA bandwidth must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(DeviceError::InvalidProfile(format!(
                "failure rate {} is outside [0, 1]",
                self.failure_rate
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(DeviceError::InvalidProfile(format!(
                "jitter {} is outside [0, 1)",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Time to move `bytes` across the DMA engine.
    pub fn transfer_time(&self, bytes: u64) -> Duration {
        if bytes == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / (self.dma_bandwidth_mbps as f64 * 1e6))
    }

    fn service_time(&self, streamed_bytes: u64) -> Duration {
        let mut kernel = self.kernel_time;
        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            kernel = kernel.mul_f64(factor);
        }
        kernel + self.transfer_time(streamed_bytes)
    }

    fn roll_outcome(&self) -> CommandState {
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            CommandState::Failed
        } else {
            CommandState::Completed
        }
    }
}

/// An execution resource that runs one command at a time.
#[derive(Debug)]
struct ComputeUnit {
    busy_until: Mutex<Instant>,
}

impl ComputeUnit {
    fn new() -> Self {
        Self {
            busy_until: Mutex::new(Instant::now()),
        }
    }

    fn busy_until(&self) -> Instant {
        *self.busy_until.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a command and return its completion instant.
    fn schedule(&self, overhead: Duration, service: Duration) -> Instant {
        let mut busy = self.busy_until.lock().unwrap_or_else(|e| e.into_inner());
        let start = (Instant::now() + overhead).max(*busy);
        let done = start + service;
        *busy = done;
        done
    }
}

fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            std::thread::sleep(remaining - SPIN_THRESHOLD);
        } else {
            std::hint::spin_loop();
        }
    }
}

struct SimKernel {
    streams: bool,
    units: Vec<(String, Arc<ComputeUnit>)>,
}

impl SimKernel {
    fn new(streams: bool, unit_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            streams,
            units: unit_names
                .into_iter()
                .map(|name| (name, Arc::new(ComputeUnit::new())))
                .collect(),
        }
    }
}

/// The simulated accelerator.
pub struct SimulatedDevice {
    index: u32,
    profile: SimProfile,
    kernels: HashMap<String, SimKernel>,
    dma: Arc<ComputeUnit>,
}

impl SimulatedDevice {
    pub fn open(config: &DeviceConfig) -> Result<Self, DeviceError> {
        config.profile.validate()?;
        if config.index >= config.profile.devices {
            return Err(DeviceError::NotFound {
                index: config.index,
                available: config.profile.devices,
            });
        }
        if let Some(path) = &config.program {
            let meta = std::fs::metadata(path).map_err(|e| DeviceError::Program {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if meta.len() == 0 {
                return Err(DeviceError::Program {
                    path: path.clone(),
                    reason: "program image is empty".into(),
                });
            }
            debug!("Loaded program image {} ({} bytes)", path.display(), meta.len());
        }

        let n = config.profile.compute_units;
        let mut kernels = HashMap::new();
        for &(base, streams) in KERNELS {
            kernels.insert(
                base.to_string(),
                SimKernel::new(streams, (1..=n).map(|k| format!("{}_{}", base, k))),
            );
            for k in 1..=n {
                let name = format!("{}_{}", base, k);
                let unit = format!("{}_1", name);
                kernels.insert(name, SimKernel::new(streams, [unit]));
            }
        }

        Ok(Self {
            index: config.index,
            profile: config.profile,
            kernels,
            dma: Arc::new(ComputeUnit::new()),
        })
    }
}

impl Device for SimulatedDevice {
    fn describe(&self) -> String {
        format!(
            "simulated accelerator {} ({} CU(s) per kernel, kernel {:?}, submit {:?}, DMA {} MB/s)",
            self.index,
            self.profile.compute_units,
            self.profile.kernel_time,
            self.profile.submit_overhead,
            self.profile.dma_bandwidth_mbps
        )
    }

    fn kernel(&self, spec: &str) -> Result<Kernel, DeviceError> {
        let (name, unit) =
            parse_kernel_spec(spec).ok_or_else(|| DeviceError::UnknownKernel(spec.to_string()))?;
        let kernel = self
            .kernels
            .get(name)
            .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))?;
        match unit {
            None => Ok(Kernel::new(name)),
            Some(unit) if kernel.units.iter().any(|(u, _)| u == unit) => {
                Ok(Kernel::on_unit(name, unit))
            }
            Some(unit) => Err(DeviceError::UnknownComputeUnit {
                kernel: name.to_string(),
                unit: unit.to_string(),
            }),
        }
    }

    fn kernels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kernels.keys().cloned().collect();
        names.sort();
        names
    }

    fn compute_units(&self, name: &str) -> Result<Vec<String>, DeviceError> {
        self.kernels
            .get(name)
            .map(|k| k.units.iter().map(|(u, _)| u.clone()).collect())
            .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))
    }

    fn alloc_buffer(&self, size: u64) -> Result<Box<dyn DeviceBuffer>, DeviceError> {
        if size > MAX_BUFFER_SIZE {
            return Err(DeviceError::BufferTooLarge {
                requested: size,
                limit: MAX_BUFFER_SIZE,
            });
        }
        Ok(Box::new(SimBuffer {
            size,
            profile: self.profile,
            dma: Arc::clone(&self.dma),
        }))
    }

    fn start_run(
        &self,
        kernel: &Kernel,
        buffer: Option<&dyn DeviceBuffer>,
    ) -> Result<Box<dyn RunHandle>, DeviceError> {
        let sim_kernel = self
            .kernels
            .get(kernel.name())
            .ok_or_else(|| DeviceError::UnknownKernel(kernel.name().to_string()))?;
        let units: Vec<Arc<ComputeUnit>> = sim_kernel
            .units
            .iter()
            .filter(|(name, _)| kernel.compute_unit().map_or(true, |cu| cu == name))
            .map(|(_, unit)| Arc::clone(unit))
            .collect();
        if units.is_empty() {
            return Err(DeviceError::UnknownComputeUnit {
                kernel: kernel.name().to_string(),
                unit: kernel.compute_unit().unwrap_or_default().to_string(),
            });
        }
        let streamed_bytes = match buffer {
            Some(buffer) if sim_kernel.streams => buffer.size(),
            _ => 0,
        };
        let mut run = SimRun {
            units,
            profile: self.profile,
            streamed_bytes,
            deadline: Instant::now(),
            outcome: CommandState::Completed,
        };
        run.launch();
        Ok(Box::new(run))
    }
}

struct SimRun {
    /// Units the run may execute on; one when the kernel is bound.
    units: Vec<Arc<ComputeUnit>>,
    profile: SimProfile,
    streamed_bytes: u64,
    deadline: Instant,
    outcome: CommandState,
}

impl SimRun {
    fn launch(&mut self) {
        let service = self.profile.service_time(self.streamed_bytes);
        if let Some(unit) = self.units.iter().min_by_key(|unit| unit.busy_until()) {
            self.deadline = unit.schedule(self.profile.submit_overhead, service);
        }
        self.outcome = self.profile.roll_outcome();
    }
}

impl RunHandle for SimRun {
    fn restart(&mut self) -> Result<(), DeviceError> {
        self.launch();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<CommandState, DeviceError> {
        let now = Instant::now();
        if now >= self.deadline {
            return Ok(self.outcome);
        }
        if self.deadline - now > timeout {
            wait_until(now + timeout);
            return Ok(CommandState::Pending);
        }
        wait_until(self.deadline);
        Ok(self.outcome)
    }

    fn wait(&mut self) -> Result<CommandState, DeviceError> {
        wait_until(self.deadline);
        Ok(self.outcome)
    }
}

struct SimBuffer {
    size: u64,
    profile: SimProfile,
    dma: Arc<ComputeUnit>,
}

impl DeviceBuffer for SimBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn sync(&mut self, _direction: SyncDirection) -> Result<(), DeviceError> {
        let done = self
            .dma
            .schedule(Duration::ZERO, self.profile.transfer_time(self.size));
        wait_until(done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fast_profile() -> SimProfile {
        SimProfile {
            kernel_time: Duration::from_micros(20),
            submit_overhead: Duration::from_micros(1),
            ..Default::default()
        }
    }

    fn open(profile: SimProfile) -> SimulatedDevice {
        SimulatedDevice::open(&DeviceConfig {
            profile,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_profile_validation() {
        assert!(SimProfile::default().validate().is_ok());

        let bad_rate = SimProfile {
            failure_rate: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            bad_rate.validate(),
            Err(DeviceError::InvalidProfile(_))
        ));

        let bad_jitter = SimProfile {
            jitter: 1.0,
            ..Default::default()
        };
        assert!(bad_jitter.validate().is_err());

        let no_units = SimProfile {
            compute_units: 0,
            ..Default::default()
        };
        assert!(no_units.validate().is_err());

        let no_bandwidth = SimProfile {
            dma_bandwidth_mbps: 0,
            ..Default::default()
        };
        assert!(no_bandwidth.validate().is_err());
    }

    #[test]
    fn test_transfer_time() {
        let profile = SimProfile {
            dma_bandwidth_mbps: 1000,
            ..Default::default()
        };
        assert_eq!(profile.transfer_time(0), Duration::ZERO);
        assert_eq!(profile.transfer_time(1_000_000), Duration::from_millis(1));
    }

    #[test]
    fn test_unknown_kernel() {
        let device = open(fast_profile());
        assert!(matches!(
            device.kernel("vadd"),
            Err(DeviceError::UnknownKernel(name)) if name == "vadd"
        ));
    }

    #[test]
    fn test_buffer_limit() {
        let device = open(fast_profile());
        assert!(device.alloc_buffer(MAX_BUFFER_SIZE).is_ok());
        assert!(matches!(
            device.alloc_buffer(MAX_BUFFER_SIZE + 1),
            Err(DeviceError::BufferTooLarge { .. })
        ));
    }

    #[test]
    fn test_program_image_must_exist_and_be_non_empty() {
        let missing = DeviceConfig {
            program: Some("/nonexistent/program.bin".into()),
            ..Default::default()
        };
        assert!(matches!(
            SimulatedDevice::open(&missing),
            Err(DeviceError::Program { .. })
        ));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let config = DeviceConfig {
            program: Some(empty.path().to_path_buf()),
            ..Default::default()
        };
        assert!(SimulatedDevice::open(&config).is_err());

        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(b"\x7fELF").unwrap();
        let config = DeviceConfig {
            program: Some(image.path().to_path_buf()),
            ..Default::default()
        };
        assert!(SimulatedDevice::open(&config).is_ok());
    }

    #[test]
    fn test_run_completes_and_restarts() {
        let device = open(fast_profile());
        let kernel = device.kernel("hello").unwrap();
        let mut run = device.start_run(&kernel, None).unwrap();
        assert_eq!(run.wait().unwrap(), CommandState::Completed);

        run.restart().unwrap();
        assert_eq!(
            run.poll(Duration::from_secs(1)).unwrap(),
            CommandState::Completed
        );
    }

    #[test]
    fn test_poll_times_out_while_pending() {
        let device = open(SimProfile {
            kernel_time: Duration::from_millis(50),
            ..Default::default()
        });
        let kernel = device.kernel("hello").unwrap();
        let mut run = device.start_run(&kernel, None).unwrap();
        assert_eq!(
            run.poll(Duration::from_micros(100)).unwrap(),
            CommandState::Pending
        );
        assert_eq!(run.wait().unwrap(), CommandState::Completed);
    }

    #[test]
    fn test_failure_rate_one_always_fails() {
        let device = open(SimProfile {
            failure_rate: 1.0,
            ..fast_profile()
        });
        let kernel = device.kernel("hello").unwrap();
        let mut run = device.start_run(&kernel, None).unwrap();
        assert_eq!(run.wait().unwrap(), CommandState::Failed);
    }

    #[test]
    fn test_unit_serializes_commands() {
        let device = open(SimProfile {
            kernel_time: Duration::from_millis(2),
            submit_overhead: Duration::ZERO,
            ..Default::default()
        });
        let kernel = device.kernel("hello").unwrap();
        let started = Instant::now();
        let mut runs: Vec<_> = (0..4)
            .map(|_| device.start_run(&kernel, None).unwrap())
            .collect();
        for run in runs.iter_mut() {
            run.wait().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(8));
    }

    #[test]
    fn test_program_layout_with_compute_units() {
        let device = open(SimProfile {
            compute_units: 3,
            ..fast_profile()
        });
        assert_eq!(
            device.compute_units("hello").unwrap(),
            vec!["hello_1", "hello_2", "hello_3"]
        );
        assert_eq!(device.compute_units("hello_2").unwrap(), vec!["hello_2_1"]);
        let kernels = device.kernels();
        assert!(kernels.contains(&"hello_3".to_string()));
        assert!(!kernels.contains(&"hello_4".to_string()));

        let bound = device.kernel("hello:{hello_2}").unwrap();
        assert_eq!(bound.compute_unit(), Some("hello_2"));
        assert!(matches!(
            device.kernel("hello:{hello_4}"),
            Err(DeviceError::UnknownComputeUnit { .. })
        ));
        assert!(matches!(
            device.kernel("hello:hello_1"),
            Err(DeviceError::UnknownKernel(_))
        ));
    }

    #[test]
    fn test_unbound_runs_spread_over_compute_units() {
        let device = open(SimProfile {
            compute_units: 4,
            kernel_time: Duration::from_millis(20),
            submit_overhead: Duration::ZERO,
            ..Default::default()
        });
        let kernel = device.kernel("hello").unwrap();
        let started = Instant::now();
        let mut runs: Vec<_> = (0..4)
            .map(|_| device.start_run(&kernel, None).unwrap())
            .collect();
        for run in runs.iter_mut() {
            run.wait().unwrap();
        }
        // Serialized on one unit this would take 80ms.
        assert!(started.elapsed() < Duration::from_millis(60));
    }

    #[test]
    fn test_bound_runs_share_their_unit() {
        let device = open(SimProfile {
            compute_units: 4,
            kernel_time: Duration::from_millis(2),
            submit_overhead: Duration::ZERO,
            ..Default::default()
        });
        let kernel = device.kernel("hello:{hello_1}").unwrap();
        let started = Instant::now();
        let mut runs: Vec<_> = (0..4)
            .map(|_| device.start_run(&kernel, None).unwrap())
            .collect();
        for run in runs.iter_mut() {
            run.wait().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(8));
    }

    #[test]
    fn test_buffer_sync_blocks_for_transfer() {
        let device = open(SimProfile {
            dma_bandwidth_mbps: 1000,
            ..Default::default()
        });
        let mut buffer = device.alloc_buffer(2_000_000).unwrap();
        let started = Instant::now();
        buffer.sync(SyncDirection::ToDevice).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2));
    }
}
