//! # Accelerator Benchmark - Main Entry Point
//!
//! The binary runs in one of two roles:
//!
//! - **Parent** (normal invocation): expands the test mode into a list of run
//!   plans, executes them one after another, prints and records each result,
//!   and reports the best configuration of a sweep.
//! - **Child** (`--internal-run-as-child`, spawned by a parent): runs exactly
//!   one configuration in-process and writes its mailbox entry to stdout.
//!
//! ## Exit Codes
//!
//! | code | meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | success                                              |
//! | 1    | setup or other failure                               |
//! | 3    | completion count mismatch in fixed-count mode        |
//! | 4    | commands completed with an error status (`--strict`) |

use accel_bench::{
    benchmark::{run_child, BenchmarkConfig, BenchmarkRunner},
    cli::{Args, RunType, TestMode},
    error::BenchError,
    logging,
    results::ResultsManager,
    sweep::{self, SweepController},
    VERSION,
};
use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

fn main() {
    let args = Args::parse();

    let guard = match logging::init(args.verbose, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    let code = match run(args) {
        Ok(()) => 0,
        Err(err) => {
            error!("Test failed (pid {}): {:#}", std::process::id(), err);
            err.chain()
                .find_map(|e| e.downcast_ref::<BenchError>())
                .map_or(1, BenchError::exit_code)
        }
    };

    // Flush buffered log lines before exit() skips destructors.
    drop(guard);
    std::process::exit(code);
}

fn run(args: Args) -> Result<()> {
    let config = BenchmarkConfig::from_args(&args)?;

    if args.internal_run_as_child {
        debug!("Child started: {:?}", config);
        return run_child(config);
    }

    info!("Starting Accelerator Benchmark v{}", VERSION);
    debug!("Configuration: {:?}", args);

    let directions = match args.run_type {
        RunType::Dma => args.dma_dir.directions(),
        _ => Vec::new(),
    };
    let plans = sweep::plan(args.mode, &config, &directions);
    let controller = SweepController::new(args.mode, plans);
    let mut results = ResultsManager::new(&args.output_file, &args.history_file, args.quiet);

    let best = controller.run(|plan| {
        info!("{}", plan.config.display());
        let report = BenchmarkRunner::new(plan.config.clone()).run(plan.isolated)?;
        info!("{}: {}", plan.describe(), report.rate_summary());
        results.record(&report)?;
        Ok(report.headline_rate())
    })?;

    if args.mode != TestMode::Single {
        if let Some(best) = best {
            let label = rate_label(&config);
            results.print_best(&best, &label);
            if args.mode == TestMode::Tput && !config.latency {
                results.append_history(&best, &label, config.device.program.as_deref())?;
            }
        }
    }

    info!("Accelerator Benchmark completed ({} run(s) recorded)", results.recorded());
    Ok(())
}

fn rate_label(config: &BenchmarkConfig) -> String {
    if config.command.is_dma() {
        "DMA bandwidth (MB/s)".to_string()
    } else {
        format!("{} throughput (ops/s)", config.command)
    }
}
