//! # Command Slots
//!
//! A [`CommandSlot`] is one reusable unit of outstanding device work plus its
//! private latency bookkeeping. A slot is owned by exactly one worker for its
//! whole life and is re-issued in place rather than reallocated.
//!
//! ## Capability set
//!
//! | kind       | issue                                   | completion                                  |
//! |------------|-----------------------------------------|---------------------------------------------|
//! | `kernel`   | start (first) / restart one run          | poll the run                                 |
//! | `pipeline` | start / restart both stages, first then last | poll the last stage, then join the first |
//! | `dma`      | blocking buffer sync                    | done as soon as `issue` returns              |
//!
//! Kernels and buffers are resolved when the slot is built; runs are
//! constructed on the first `issue` and restarted afterwards, so no
//! construction work happens inside the steady-state loop.

use crate::device::{CommandState, Device, DeviceBuffer, Kernel, RunHandle, SyncDirection};
use crate::error::{BenchError, DeviceError};
use crate::metrics::LatencyStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Kernel names of the two pipeline stages.
pub const PIPELINE_FIRST: &str = "m2s";
pub const PIPELINE_LAST: &str = "s2m";

/// What a slot executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    /// A single-stage kernel, by name.
    Kernel(String),
    /// A two-stage streaming pipeline.
    Pipeline,
    /// A raw buffer transfer.
    Dma(SyncDirection),
}

impl CommandKind {
    pub fn is_dma(&self) -> bool {
        matches!(self, CommandKind::Dma(_))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Kernel(name) => write!(f, "kernel execution ({})", name),
            CommandKind::Pipeline => {
                write!(f, "pipeline kernel ({} -> {})", PIPELINE_FIRST, PIPELINE_LAST)
            }
            CommandKind::Dma(SyncDirection::ToDevice) => write!(f, "DMA device read"),
            CommandKind::Dma(SyncDirection::FromDevice) => write!(f, "DMA device write"),
        }
    }
}

/// Result of polling a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Nothing is in flight.
    Idle,
    Pending,
    /// The command finished. `latency` is set only when latency is tracked.
    Done {
        failed: bool,
        latency: Option<Duration>,
    },
}

enum Command {
    Kernel {
        kernel: Kernel,
        run: Option<Box<dyn RunHandle>>,
    },
    Pipeline {
        first: Kernel,
        last: Kernel,
        input: Box<dyn DeviceBuffer>,
        output: Box<dyn DeviceBuffer>,
        runs: Option<(Box<dyn RunHandle>, Box<dyn RunHandle>)>,
    },
    Dma {
        buffer: Box<dyn DeviceBuffer>,
        direction: SyncDirection,
    },
}

/// One outstanding unit of work.
pub struct CommandSlot {
    device: Arc<dyn Device>,
    command: Command,
    track_latency: bool,
    issued_at: Option<Instant>,
    in_flight: bool,
    completions: u64,
    failures: u64,
    latency: LatencyStats,
}

impl CommandSlot {
    /// Resolve kernels and allocate buffers for one slot.
    ///
    /// Failures here are setup errors.
    pub fn new(
        device: Arc<dyn Device>,
        kind: &CommandKind,
        payload_size: u64,
        track_latency: bool,
    ) -> Result<Self, BenchError> {
        let command = match kind {
            CommandKind::Kernel(name) => Command::Kernel {
                kernel: device
                    .kernel(name)
                    .map_err(|e| BenchError::setup(format!("resolving kernel '{}'", name), e))?,
                run: None,
            },
            CommandKind::Pipeline => {
                let resolve = |name: &str| {
                    device.kernel(name).map_err(|e| {
                        BenchError::setup(format!("resolving pipeline stage '{}'", name), e)
                    })
                };
                let alloc = || {
                    device.alloc_buffer(payload_size).map_err(|e| {
                        BenchError::setup(
                            format!("allocating a {} byte pipeline buffer", payload_size),
                            e,
                        )
                    })
                };
                Command::Pipeline {
                    first: resolve(PIPELINE_FIRST)?,
                    last: resolve(PIPELINE_LAST)?,
                    input: alloc()?,
                    output: alloc()?,
                    runs: None,
                }
            }
            CommandKind::Dma(direction) => Command::Dma {
                buffer: device.alloc_buffer(payload_size).map_err(|e| {
                    BenchError::setup(format!("allocating a {} byte DMA buffer", payload_size), e)
                })?,
                direction: *direction,
            },
        };

        Ok(Self {
            device,
            command,
            track_latency,
            issued_at: None,
            in_flight: false,
            completions: 0,
            failures: 0,
            latency: LatencyStats::new(),
        })
    }

    /// Submit the command: construct it on first use, restart it afterwards.
    ///
    /// A DMA slot performs the whole transfer here.
    pub fn issue(&mut self) -> Result<(), DeviceError> {
        if self.track_latency {
            self.issued_at = Some(Instant::now());
        }
        let device = &self.device;
        match &mut self.command {
            Command::Kernel { kernel, run } => match run {
                Some(run) => run.restart()?,
                None => *run = Some(device.start_run(kernel, None)?),
            },
            Command::Pipeline {
                first,
                last,
                input,
                output,
                runs,
            } => match runs {
                Some((first_run, last_run)) => {
                    first_run.restart()?;
                    last_run.restart()?;
                }
                None => {
                    let first_run = device.start_run(first, Some(&**input))?;
                    let last_run = device.start_run(last, Some(&**output))?;
                    *runs = Some((first_run, last_run));
                }
            },
            Command::Dma { buffer, direction } => buffer.sync(*direction)?,
        }
        self.in_flight = true;
        Ok(())
    }

    /// Wait at most `timeout` for the in-flight command.
    ///
    /// On completion the counters and latency accumulator are updated and the
    /// slot becomes idle.
    pub fn poll(&mut self, timeout: Duration) -> Result<SlotStatus, DeviceError> {
        if !self.in_flight {
            return Ok(SlotStatus::Idle);
        }
        let state = match &mut self.command {
            Command::Kernel { run: Some(run), .. } => run.poll(timeout)?,
            Command::Pipeline {
                runs: Some((first_run, last_run)),
                ..
            } => match last_run.poll(timeout)? {
                CommandState::Pending => CommandState::Pending,
                last_state => match first_run.wait()? {
                    CommandState::Failed => CommandState::Failed,
                    _ => last_state,
                },
            },
            Command::Dma { .. } => CommandState::Completed,
            Command::Kernel { run: None, .. } | Command::Pipeline { runs: None, .. } => {
                self.in_flight = false;
                return Ok(SlotStatus::Idle);
            }
        };

        if !state.is_done() {
            return Ok(SlotStatus::Pending);
        }

        let failed = state == CommandState::Failed;
        self.in_flight = false;
        self.completions += 1;
        if failed {
            self.failures += 1;
        }
        let latency = self.issued_at.take().map(|t| t.elapsed());
        if let Some(latency) = latency {
            self.latency.record_duration(latency);
        }
        Ok(SlotStatus::Done { failed, latency })
    }

    /// Wait out the in-flight command without counting it.
    pub fn drain(&mut self) -> Result<(), DeviceError> {
        if !self.in_flight {
            return Ok(());
        }
        match &mut self.command {
            Command::Kernel { run: Some(run), .. } => {
                run.wait()?;
            }
            Command::Pipeline {
                runs: Some((first_run, last_run)),
                ..
            } => {
                last_run.wait()?;
                first_run.wait()?;
            }
            _ => {}
        }
        self.in_flight = false;
        self.issued_at = None;
        Ok(())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn completions(&self) -> u64 {
        self.completions
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn latency(&self) -> &LatencyStats {
        &self.latency
    }
}

impl fmt::Debug for CommandSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSlot")
            .field("in_flight", &self.in_flight)
            .field("completions", &self.completions)
            .field("failures", &self.failures)
            .field("latency", &self.latency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceFactory, SimProfile};

    fn device(profile: SimProfile) -> Arc<dyn Device> {
        DeviceFactory::open(&DeviceConfig {
            profile,
            ..Default::default()
        })
        .unwrap()
    }

    fn fast() -> SimProfile {
        SimProfile {
            kernel_time: Duration::from_micros(10),
            submit_overhead: Duration::from_micros(1),
            ..Default::default()
        }
    }

    fn wait_done(slot: &mut CommandSlot) -> SlotStatus {
        loop {
            match slot.poll(Duration::from_millis(100)).unwrap() {
                SlotStatus::Pending => continue,
                status => return status,
            }
        }
    }

    #[test]
    fn test_kernel_slot_counts_completions() {
        let mut slot =
            CommandSlot::new(device(fast()), &CommandKind::Kernel("hello".into()), 4096, false)
                .unwrap();
        assert_eq!(slot.poll(Duration::ZERO).unwrap(), SlotStatus::Idle);

        for _ in 0..3 {
            slot.issue().unwrap();
            assert!(slot.is_in_flight());
            assert_eq!(
                wait_done(&mut slot),
                SlotStatus::Done {
                    failed: false,
                    latency: None
                }
            );
        }
        assert_eq!(slot.completions(), 3);
        assert!(slot.latency().is_empty());
    }

    #[test]
    fn test_latency_recorded_only_when_tracked() {
        let mut slot =
            CommandSlot::new(device(fast()), &CommandKind::Kernel("hello".into()), 4096, true)
                .unwrap();
        slot.issue().unwrap();
        match wait_done(&mut slot) {
            SlotStatus::Done {
                latency: Some(latency),
                ..
            } => assert!(latency >= Duration::from_micros(10)),
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(slot.latency().count(), 1);
    }

    #[test]
    fn test_failed_completion_still_counts() {
        let profile = SimProfile {
            failure_rate: 1.0,
            ..fast()
        };
        let mut slot =
            CommandSlot::new(device(profile), &CommandKind::Kernel("hello".into()), 4096, false)
                .unwrap();
        slot.issue().unwrap();
        assert!(matches!(
            wait_done(&mut slot),
            SlotStatus::Done { failed: true, .. }
        ));
        assert_eq!(slot.completions(), 1);
        assert_eq!(slot.failures(), 1);
    }

    #[test]
    fn test_pipeline_slot() {
        let mut slot = CommandSlot::new(device(fast()), &CommandKind::Pipeline, 4096, true).unwrap();
        slot.issue().unwrap();
        assert!(matches!(wait_done(&mut slot), SlotStatus::Done { .. }));
        slot.issue().unwrap();
        slot.drain().unwrap();
        assert!(!slot.is_in_flight());
        assert_eq!(slot.completions(), 1);
    }

    #[test]
    fn test_dma_slot_completes_on_issue() {
        let mut slot = CommandSlot::new(
            device(fast()),
            &CommandKind::Dma(SyncDirection::FromDevice),
            1 << 20,
            false,
        )
        .unwrap();
        slot.issue().unwrap();
        assert!(matches!(
            slot.poll(Duration::ZERO).unwrap(),
            SlotStatus::Done { failed: false, .. }
        ));
    }

    #[test]
    fn test_drain_does_not_count() {
        let mut slot =
            CommandSlot::new(device(fast()), &CommandKind::Kernel("hello".into()), 4096, true)
                .unwrap();
        slot.issue().unwrap();
        slot.drain().unwrap();
        assert_eq!(slot.completions(), 0);
        assert!(slot.latency().is_empty());
        assert_eq!(slot.poll(Duration::ZERO).unwrap(), SlotStatus::Idle);
    }

    #[test]
    fn test_unknown_kernel_is_setup_error() {
        let err = CommandSlot::new(device(fast()), &CommandKind::Kernel("vadd".into()), 4096, false)
            .unwrap_err();
        assert!(matches!(err, BenchError::Setup { .. }));
    }

    #[test]
    fn test_command_kind_display() {
        assert_eq!(
            CommandKind::Kernel("hello".into()).to_string(),
            "kernel execution (hello)"
        );
        assert_eq!(
            CommandKind::Dma(SyncDirection::ToDevice).to_string(),
            "DMA device read"
        );
    }
}
