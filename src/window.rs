//! # Window Driver and Worker
//!
//! A [`WindowDriver`] keeps a fixed window of [`CommandSlot`]s ("bulk" depth)
//! busy for one worker thread:
//!
//! 1. Issue every slot once (never more than the target in fixed-count mode).
//! 2. Poll the slots round-robin in index order, each with a bounded timeout,
//!    so one slow command cannot hide the progress of its siblings.
//! 3. Re-issue a slot the moment it completes, unless the target has already
//!    been reached by in-flight issues (count mode) or the deadline has passed
//!    (time mode).
//! 4. After the loop, drain whatever is still in flight. Drained commands are
//!    waited to completion but not counted.
//!
//! A depth of 1 degenerates to synchronous ping-pong: issue, wait, repeat.
//!
//! A [`Worker`] runs one driver on one thread. Workers share only a
//! [`RunClock`], which is `Copy` and never mutated after the threads start, so
//! the hot loop takes no locks.

use crate::command::{CommandSlot, SlotStatus};
use crate::error::BenchError;
use crate::metrics::{LatencyCollector, LatencyStats, TimeWindow, WorkerResult};
use crate::utils::monotonic_now_ns;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Read-only time reference shared by all workers of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
    budget: Option<Duration>,
}

impl RunClock {
    /// Start the clock now. With `budget` set the run is time-governed.
    pub fn start(budget: Option<Duration>) -> Self {
        Self {
            origin: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// `false` forever when there is no budget.
    pub fn expired(&self) -> bool {
        match self.budget {
            Some(budget) => self.origin.elapsed() >= budget,
            None => false,
        }
    }
}

/// Counters from one [`WindowDriver::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveOutcome {
    pub issued: u64,
    pub completed: u64,
    /// Commands still in flight when the loop ended.
    pub drained: u64,
}

/// Drives a window of command slots.
#[derive(Debug)]
pub struct WindowDriver {
    slots: Vec<CommandSlot>,
    poll_timeout: Duration,
    collector: Option<LatencyCollector>,
}

impl WindowDriver {
    pub fn new(slots: Vec<CommandSlot>, poll_timeout: Duration) -> Self {
        Self {
            slots,
            poll_timeout,
            collector: None,
        }
    }

    /// Also feed every measured latency into an HDR histogram.
    pub fn with_collector(mut self, collector: LatencyCollector) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[CommandSlot] {
        &self.slots
    }

    /// Run the window until `target` completions, or until the clock expires
    /// when `target` is 0.
    ///
    /// In time mode the deadline is checked before every slot poll, so the
    /// loop overruns the budget by at most one poll timeout. Whatever is still
    /// in flight afterwards is drained, also when a device error ends the run.
    pub fn run(&mut self, target: u64, clock: &RunClock) -> Result<DriveOutcome, BenchError> {
        let mut outcome = DriveOutcome::default();
        if let Err(e) = self.drive(target, clock, &mut outcome) {
            for slot in self.slots.iter_mut().filter(|s| s.is_in_flight()) {
                if let Err(drain_err) = slot.drain() {
                    warn!("Failed to drain a command after a device error: {}", drain_err);
                }
            }
            return Err(e);
        }

        for slot in self.slots.iter_mut().filter(|s| s.is_in_flight()) {
            slot.drain()?;
            outcome.drained += 1;
        }
        Ok(outcome)
    }

    fn drive(
        &mut self,
        target: u64,
        clock: &RunClock,
        outcome: &mut DriveOutcome,
    ) -> Result<(), BenchError> {
        let counted = target > 0;

        for slot in self.slots.iter_mut() {
            if counted && outcome.issued >= target {
                break;
            }
            slot.issue()?;
            outcome.issued += 1;
        }

        'window: loop {
            if counted && outcome.completed >= target {
                break;
            }

            let mut in_flight = false;
            for slot in self.slots.iter_mut() {
                if !counted && clock.expired() {
                    break 'window;
                }
                match slot.poll(self.poll_timeout)? {
                    SlotStatus::Idle => continue,
                    SlotStatus::Pending => in_flight = true,
                    SlotStatus::Done { latency, .. } => {
                        outcome.completed += 1;
                        if let (Some(collector), Some(latency)) = (self.collector.as_mut(), latency)
                        {
                            collector.record(latency)?;
                        }
                        let reissue = if counted {
                            outcome.issued < target
                        } else {
                            !clock.expired()
                        };
                        if reissue {
                            slot.issue()?;
                            outcome.issued += 1;
                            in_flight = true;
                        }
                    }
                }
            }

            if !in_flight {
                break;
            }
        }
        Ok(())
    }

    /// Merged slot statistics: `(completions, failures, latency, histogram)`.
    pub fn finish(self) -> (u64, u64, LatencyStats, Option<LatencyCollector>) {
        let mut completions = 0;
        let mut failures = 0;
        let mut latency = LatencyStats::new();
        for slot in &self.slots {
            completions += slot.completions();
            failures += slot.failures();
            latency.merge(slot.latency());
        }
        (completions, failures, latency, self.collector)
    }
}

/// One worker thread bound to one window driver.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    driver: WindowDriver,
    target: u64,
    affinity: Option<core_affinity::CoreId>,
}

impl Worker {
    /// `target` of 0 means the run is governed by the clock.
    pub fn new(id: usize, driver: WindowDriver, target: u64) -> Self {
        Self {
            id,
            driver,
            target,
            affinity: None,
        }
    }

    pub fn pin_to(mut self, core: core_affinity::CoreId) -> Self {
        self.affinity = Some(core);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn run(mut self, clock: &RunClock) -> Result<WorkerResult, BenchError> {
        if let Some(core) = self.affinity {
            if core_affinity::set_for_current(core) {
                debug!("Worker {} pinned to core {}", self.id, core.id);
            } else {
                warn!("Worker {} could not be pinned to core {}", self.id, core.id);
            }
        }

        let start_ns = monotonic_now_ns();
        let outcome = self.driver.run(self.target, clock)?;
        let end_ns = monotonic_now_ns();

        debug!(
            "Worker {} finished: {} issued, {} completed, {} drained",
            self.id, outcome.issued, outcome.completed, outcome.drained
        );

        let (completions, failures, latency, histogram) = self.driver.finish();
        Ok(WorkerResult {
            worker_id: self.id,
            completions,
            failures,
            latency,
            histogram,
            window: TimeWindow::new(start_ns, end_ns),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::device::{Device, DeviceConfig, DeviceFactory, SimProfile};
    use std::sync::Arc;

    fn device() -> Arc<dyn Device> {
        DeviceFactory::open(&DeviceConfig {
            profile: SimProfile {
                kernel_time: Duration::from_micros(20),
                submit_overhead: Duration::from_micros(2),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn driver(depth: usize, latency: bool) -> WindowDriver {
        let device = device();
        let slots = (0..depth)
            .map(|_| {
                CommandSlot::new(
                    Arc::clone(&device),
                    &CommandKind::Kernel("hello".into()),
                    4096,
                    latency,
                )
                .unwrap()
            })
            .collect();
        WindowDriver::new(slots, Duration::from_millis(10))
    }

    #[test]
    fn test_clock_without_budget_never_expires() {
        let clock = RunClock::start(None);
        assert!(!clock.expired());
        assert_eq!(clock.budget(), None);
    }

    #[test]
    fn test_clock_expires_after_budget() {
        let clock = RunClock::start(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.expired());
    }

    #[test]
    fn test_count_mode_hits_target_exactly() {
        let mut d = driver(8, false);
        let outcome = d.run(100, &RunClock::start(None)).unwrap();
        assert_eq!(outcome.issued, 100);
        assert_eq!(outcome.completed, 100);
        assert_eq!(outcome.drained, 0);
        let (completions, failures, _, _) = d.finish();
        assert_eq!(completions, 100);
        assert_eq!(failures, 0);
    }

    #[test]
    fn test_window_deeper_than_target() {
        let mut d = driver(8, false);
        let outcome = d.run(3, &RunClock::start(None)).unwrap();
        assert_eq!(outcome.issued, 3);
        assert_eq!(outcome.completed, 3);
    }

    #[test]
    fn test_time_mode_drains_in_flight() {
        let mut d = driver(4, false);
        let clock = RunClock::start(Some(Duration::from_millis(20)));
        let outcome = d.run(0, &clock).unwrap();
        assert!(outcome.completed > 0);
        assert_eq!(outcome.issued, outcome.completed + outcome.drained);
        assert!(d.slots().iter().all(|s| !s.is_in_flight()));
    }

    #[test]
    fn test_worker_reports_window_and_latency() {
        let d = driver(2, true).with_collector(LatencyCollector::new().unwrap());
        let result = Worker::new(3, d, 50).run(&RunClock::start(None)).unwrap();
        assert_eq!(result.worker_id, 3);
        assert_eq!(result.completions, 50);
        assert_eq!(result.latency.count(), 50);
        assert_eq!(result.histogram.map(|h| h.len()), Some(50));
        assert!(result.window.end_ns >= result.window.start_ns);
    }
}
