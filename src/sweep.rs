//! # Sweep Controller
//!
//! A sweep is a scripted series of runs that varies one parameter to find
//! peak throughput. [`plan`] expands a test mode into the list of
//! [`RunPlan`]s; [`SweepController::run`] executes them in order and keeps
//! the best result in an accumulator threaded through the loop.
//!
//! | mode     | varies                      | processes                    |
//! |----------|-----------------------------|------------------------------|
//! | `single` | nothing                     | as given, spawned if > 1     |
//! | `tput`   | bulk 1..=256 (DMA: payload) | forced to 1, in-process      |
//! | `mp`     | processes, powers of two    | always spawned, even `p = 1` |
//! | `mt`     | threads, powers of two      | 1, in-process                |
//!
//! Processes are per card. A multi-card base spawns every run, one child per
//! card and process, whatever the mode.

use crate::{
    benchmark::{BenchmarkConfig, RunLimit},
    cli::TestMode,
    command::CommandKind,
    device::SyncDirection,
    utils::{dma_count_for_size, format_bytes, powers_of_two_up_to},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Deepest window of a throughput sweep.
pub const MAX_SWEEP_BULK: usize = 256;

/// Payload sizes of a DMA throughput sweep.
pub const DMA_SWEEP_SIZES: [u64; 3] = [16 << 20, 64 << 20, 256 << 20];

/// Ceiling used when a process or thread sweep is requested with a count of 1.
pub const DEFAULT_SWEEP_CEILING: usize = 8;

/// One configuration of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub config: BenchmarkConfig,
    /// Run every process as a spawned child.
    pub isolated: bool,
}

impl RunPlan {
    pub fn describe(&self) -> String {
        let c = &self.config;
        if c.command.is_dma() {
            format!(
                "{} process(es), {} thread(s), {} buffer",
                c.processes,
                c.threads,
                format_bytes(c.payload_size)
            )
        } else {
            format!(
                "{} process(es), {} thread(s), queue length {}",
                c.processes,
                c.threads,
                c.effective_bulk()
            )
        }
    }
}

/// Expand `mode` into the runs to execute.
///
/// For DMA configurations every step runs once per entry of `directions`.
pub fn plan(mode: TestMode, base: &BenchmarkConfig, directions: &[SyncDirection]) -> Vec<RunPlan> {
    let commands: Vec<CommandKind> = match base.command {
        CommandKind::Dma(_) if !directions.is_empty() => {
            directions.iter().map(|d| CommandKind::Dma(*d)).collect()
        }
        _ => vec![base.command.clone()],
    };

    let multi_card = base.is_multi_card();
    let mut plans = Vec::new();
    match mode {
        TestMode::Single => {
            for command in commands {
                plans.push(RunPlan {
                    config: BenchmarkConfig {
                        command,
                        ..base.clone()
                    },
                    isolated: base.processes > 1 || multi_card,
                });
            }
        }
        TestMode::Tput => {
            if base.processes > 1 {
                warn!(
                    "Throughput sweep runs a single process; ignoring {} processes",
                    base.processes
                );
            }
            let single = BenchmarkConfig {
                processes: 1,
                ..base.clone()
            };
            if base.command.is_dma() {
                for size in DMA_SWEEP_SIZES {
                    let limit = match base.limit {
                        RunLimit::Time(d) => RunLimit::Time(d),
                        RunLimit::Count(_) => RunLimit::Count(dma_count_for_size(size)),
                    };
                    for command in &commands {
                        plans.push(RunPlan {
                            config: BenchmarkConfig {
                                command: command.clone(),
                                payload_size: size,
                                limit,
                                ..single.clone()
                            },
                            isolated: multi_card,
                        });
                    }
                }
            } else {
                for bulk in powers_of_two_up_to(MAX_SWEEP_BULK) {
                    plans.push(RunPlan {
                        config: BenchmarkConfig {
                            bulk,
                            ..single.clone()
                        },
                        isolated: multi_card,
                    });
                }
            }
        }
        TestMode::Mp => {
            let ceiling = sweep_ceiling(base.processes, "Process");
            for command in &commands {
                for processes in powers_of_two_up_to(ceiling) {
                    plans.push(RunPlan {
                        config: BenchmarkConfig {
                            command: command.clone(),
                            processes,
                            ..base.clone()
                        },
                        isolated: true,
                    });
                }
            }
        }
        TestMode::Mt => {
            let ceiling = sweep_ceiling(base.threads, "Thread");
            for command in &commands {
                for threads in powers_of_two_up_to(ceiling) {
                    plans.push(RunPlan {
                        config: BenchmarkConfig {
                            command: command.clone(),
                            processes: 1,
                            threads,
                            ..base.clone()
                        },
                        isolated: multi_card,
                    });
                }
            }
        }
    }
    plans
}

/// Upper bound of a process or thread sweep.
fn sweep_ceiling(requested: usize, what: &str) -> usize {
    if requested <= 1 {
        warn!(
            "{} sweep requested with a count of 1; sweeping up to {}",
            what, DEFAULT_SWEEP_CEILING
        );
        return DEFAULT_SWEEP_CEILING;
    }
    let ceiling = requested.next_power_of_two();
    info!("{} sweep ceiling: {} (requested {})", what, ceiling, requested);
    ceiling
}

/// Best configuration seen so far in a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepBest {
    pub processes: usize,
    pub threads: usize,
    pub bulk: usize,
    pub payload_size: u64,
    /// MB/s for DMA runs, ops/s otherwise.
    pub throughput: f64,
}

impl SweepBest {
    pub fn from_plan(plan: &RunPlan, throughput: f64) -> Self {
        Self {
            processes: plan.config.processes,
            threads: plan.config.threads,
            bulk: plan.config.effective_bulk(),
            payload_size: plan.config.payload_size,
            throughput,
        }
    }

    /// Replace `best` when `candidate` is strictly faster.
    pub fn keep_best(best: Option<SweepBest>, candidate: SweepBest) -> Option<SweepBest> {
        match best {
            Some(current) if candidate.throughput <= current.throughput => Some(current),
            _ => Some(candidate),
        }
    }

    pub fn describe(&self, label: &str) -> String {
        format!(
            "Best {}: {:.2} with {} process(es), {} thread(s) per process, queue length {}, payload {}",
            label,
            self.throughput,
            self.processes,
            self.threads,
            self.bulk,
            format_bytes(self.payload_size)
        )
    }
}

/// Executes a list of plans and tracks the fastest one.
pub struct SweepController {
    mode: TestMode,
    plans: Vec<RunPlan>,
}

impl SweepController {
    pub fn new(mode: TestMode, plans: Vec<RunPlan>) -> Self {
        Self { mode, plans }
    }

    pub fn plans(&self) -> &[RunPlan] {
        &self.plans
    }

    /// Run every plan in order.
    ///
    /// `execute` performs one complete run and returns its throughput. The
    /// first error stops the sweep.
    pub fn run<F>(self, mut execute: F) -> Result<Option<SweepBest>>
    where
        F: FnMut(&RunPlan) -> Result<f64>,
    {
        let total = self.plans.len();
        let mode = self.mode;
        self.plans
            .iter()
            .enumerate()
            .try_fold(None, |best, (i, plan)| -> Result<Option<SweepBest>> {
                info!("{} [{}/{}]: {}", mode, i + 1, total, plan.describe());
                let throughput = execute(plan)?;
                Ok(SweepBest::keep_best(
                    best,
                    SweepBest::from_plan(plan, throughput),
                ))
            })
    }
}
