use crate::{
    benchmark::BenchmarkConfig,
    command::CommandKind,
    coordination::CrossProcessSummary,
    metrics::{LatencyStats, PercentileValue, ProcessSummary, ThroughputMetrics},
    sweep::SweepBest,
    utils::{format_bytes, format_duration_ns, format_op_rate, format_rate, get_cpu_cores, hostname},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Latency statistics of one run, in nanoseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ns: i64,
    pub max_ns: i64,
    pub mean_ns: i64,
    /// Empty for multi-process runs; histograms stay inside their process.
    pub percentiles: Vec<PercentileValue>,
}

impl LatencySummary {
    fn from_stats(stats: &LatencyStats, percentiles: Vec<PercentileValue>) -> Option<Self> {
        Some(Self {
            count: stats.count(),
            min_ns: stats.min_ns()?,
            max_ns: stats.max_ns()?,
            mean_ns: stats.mean_ns()?,
            percentiles,
        })
    }
}

/// Result record of one benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// `"throughput"` or `"latency"`.
    pub metric: String,
    pub command: CommandKind,
    pub label: String,
    pub processes: usize,
    /// Devices the processes were spread over.
    #[serde(default = "one_card")]
    pub cards: usize,
    pub threads: usize,
    pub bulk: usize,
    pub payload_size: u64,
    pub completions: u64,
    /// Not known for multi-process runs.
    pub failures: Option<u64>,
    pub elapsed_ns: u64,
    pub throughput_ops: f64,
    /// DMA runs only.
    pub bandwidth_mbps: Option<f64>,
    pub latency: Option<LatencySummary>,
}

fn one_card() -> usize {
    1
}

impl RunReport {
    fn base(config: &BenchmarkConfig, processes: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            metric: if config.latency { "latency" } else { "throughput" }.to_string(),
            command: config.command.clone(),
            label: config.command.to_string(),
            processes,
            cards: 1,
            threads: config.threads,
            bulk: config.effective_bulk(),
            payload_size: config.payload_size,
            completions: 0,
            failures: None,
            elapsed_ns: 0,
            throughput_ops: 0.0,
            bandwidth_mbps: None,
            latency: None,
        }
    }

    fn with_throughput(mut self, config: &BenchmarkConfig, completions: u64, elapsed_ns: u64) -> Self {
        let bytes_per_op = if config.command.is_dma() {
            config.payload_size
        } else {
            0
        };
        let throughput = ThroughputMetrics::new(completions, bytes_per_op, elapsed_ns);
        self.completions = completions;
        self.elapsed_ns = elapsed_ns;
        self.throughput_ops = throughput.ops_per_second;
        if config.command.is_dma() {
            self.bandwidth_mbps = Some(throughput.megabytes_per_second());
        }
        self
    }

    /// Report of a run whose workers all ran in this process.
    pub fn from_process(config: &BenchmarkConfig, summary: &ProcessSummary) -> Self {
        let mut report = Self::base(config, 1).with_throughput(
            config,
            summary.completions,
            summary.window.duration_ns(),
        );
        report.failures = Some(summary.failures);
        if config.latency {
            report.latency =
                LatencySummary::from_stats(&summary.latency, summary.percentiles.clone());
        }
        report
    }

    /// Report of a run merged from the mailbox entries of child processes.
    pub fn from_cross_process(config: &BenchmarkConfig, summary: &CrossProcessSummary) -> Self {
        let mut report = Self::base(config, config.total_processes()).with_throughput(
            config,
            summary.completions,
            summary.window.duration_ns(),
        );
        report.cards = config.cards.len();
        if summary.processes_reported < report.processes {
            report.processes = summary.processes_reported;
        }
        if config.latency {
            report.latency = LatencySummary::from_stats(&summary.latency, Vec::new());
        }
        report
    }

    /// The number a sweep ranks runs by: MB/s for DMA, ops/s otherwise.
    pub fn headline_rate(&self) -> f64 {
        self.bandwidth_mbps.unwrap_or(self.throughput_ops)
    }

    /// One-line summary for logs.
    pub fn rate_summary(&self) -> String {
        let rate = if self.command.is_dma() {
            format_rate(self.throughput_ops * self.payload_size as f64)
        } else {
            format_op_rate(self.throughput_ops)
        };
        format!(
            "{} ({} completions in {})",
            rate,
            self.completions,
            format_duration_ns(self.elapsed_ns)
        )
    }
}

fn ms(ns: i64) -> f64 {
    ns as f64 / 1e6
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.label)?;
        if self.cards > 1 {
            writeln!(f, "  card(s):                {}", self.cards)?;
        }
        writeln!(f, "  process(es):            {}", self.processes)?;
        writeln!(f, "  thread(s) per process:  {}", self.threads)?;
        if self.command.is_dma() {
            writeln!(f, "  bo size:                {}", format_bytes(self.payload_size))?;
        } else {
            writeln!(f, "  queue length:           {}", self.bulk)?;
        }
        let elapsed_ms = self.elapsed_ns as f64 / 1e6;
        match &self.latency {
            Some(latency) => {
                write!(
                    f,
                    "  latency (ms):           count {}, min {:.4}, max {:.4}, avg {:.4}",
                    latency.count,
                    ms(latency.min_ns),
                    ms(latency.max_ns),
                    ms(latency.mean_ns)
                )?;
                for p in &latency.percentiles {
                    write!(f, ", p{} {:.4}", p.percentile, p.value_ns as f64 / 1e6)?;
                }
            }
            None => match self.bandwidth_mbps {
                Some(mbps) => write!(
                    f,
                    "  bandwidth MB/s:         {:.2} ({} transfers in {:.3} ms)",
                    mbps, self.completions, elapsed_ms
                )?,
                None => write!(
                    f,
                    "  throughput ops/s:       {:.0} ({} executions in {:.3} ms)",
                    self.throughput_ops, self.completions, elapsed_ms
                )?,
            },
        }
        if let Some(failures) = self.failures.filter(|&n| n > 0) {
            write!(f, "\n  error completions:      {}", failures)?;
        }
        Ok(())
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub host: String,
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub benchmark_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            host: hostname(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: get_cpu_cores(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// One line of the throughput history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub program: Option<PathBuf>,
    pub label: String,
    pub best: SweepBest,
    pub system: SystemInfo,
}

/// Results manager for console output and the append-only report files
pub struct ResultsManager {
    output_file: PathBuf,
    history_file: PathBuf,
    quiet: bool,
    recorded: usize,
}

impl ResultsManager {
    /// Create a new results manager. Nothing is written until the first record.
    pub fn new(output_file: &Path, history_file: &Path, quiet: bool) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            history_file: history_file.to_path_buf(),
            quiet,
            recorded: 0,
        }
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Print the report and append it to the output file as one JSON line.
    pub fn record(&mut self, report: &RunReport) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("{}", report);
        append_json_line(&self.output_file, report)?;
        self.recorded += 1;
        debug!("Run {} appended to {:?}", report.run_id, self.output_file);
        Ok(())
    }

    /// Print the best configuration of a sweep.
    pub fn print_best(&self, best: &SweepBest, label: &str) {
        if self.quiet {
            return;
        }
        println!("{}", best.describe(label));
    }

    /// Append the best configuration of a throughput sweep to the history file.
    pub fn append_history(
        &self,
        best: &SweepBest,
        label: &str,
        program: Option<&Path>,
    ) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        let record = HistoryRecord {
            timestamp: chrono::Utc::now(),
            program: program.map(Path::to_path_buf),
            label: label.to_string(),
            best: best.clone(),
            system: SystemInfo::collect(),
        };
        append_json_line(&self.history_file, &record)?;
        info!("Best result appended to {:?}", self.history_file);
        Ok(())
    }
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?} for appending", path))?;
    let json = serde_json::to_string(value)?;
    writeln!(file, "{}", json).with_context(|| format!("Failed to write to {:?}", path))?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyncDirection;
    use crate::metrics::TimeWindow;
    use tempfile::TempDir;

    fn summary(completions: u64, duration_ns: u64) -> ProcessSummary {
        let mut latency = LatencyStats::new();
        latency.record(1_000_000);
        latency.record(3_000_000);
        ProcessSummary {
            workers: 1,
            completions,
            failures: 0,
            latency,
            percentiles: Vec::new(),
            window: TimeWindow::new(1_000, 1_000 + duration_ns),
        }
    }

    #[test]
    fn test_report_from_process() {
        let config = BenchmarkConfig::default();
        let report = RunReport::from_process(&config, &summary(1000, 500_000_000));
        assert_eq!(report.completions, 1000);
        assert_eq!(report.throughput_ops, 2000.0);
        assert_eq!(report.bandwidth_mbps, None);
        assert_eq!(report.latency, None);
        assert_eq!(report.headline_rate(), 2000.0);

        let text = report.to_string();
        assert!(text.contains("queue length:           32"));
        assert!(text.contains("throughput ops/s:       2000 (1000 executions in 500.000 ms)"));
        assert_eq!(
            report.rate_summary(),
            "2.00K ops/s (1000 completions in 500.00ms)"
        );
    }

    #[test]
    fn test_dma_report_has_bandwidth() {
        let config = BenchmarkConfig {
            command: CommandKind::Dma(SyncDirection::FromDevice),
            payload_size: 1_000_000,
            ..Default::default()
        };
        let report = RunReport::from_process(&config, &summary(10, 1_000_000_000));
        assert_eq!(report.bandwidth_mbps, Some(10.0));
        assert_eq!(report.headline_rate(), 10.0);
        assert!(report.to_string().contains("bo size:"));
    }

    #[test]
    fn test_latency_report_layout() {
        let config = BenchmarkConfig {
            latency: true,
            ..Default::default()
        };
        let report = RunReport::from_process(&config, &summary(2, 1_000));
        let latency = report.latency.clone().unwrap();
        assert_eq!(latency.mean_ns, 2_000_000);
        assert!(report
            .to_string()
            .contains("count 2, min 1.0000, max 3.0000, avg 2.0000"));
    }

    #[test]
    fn test_cross_process_report() {
        let config = BenchmarkConfig {
            processes: 3,
            ..Default::default()
        };
        let cross = CrossProcessSummary {
            processes_reported: 2,
            completions: 400,
            latency: LatencyStats::new(),
            window: TimeWindow::new(0, 2_000_000_000),
        };
        let report = RunReport::from_cross_process(&config, &cross);
        assert_eq!(report.processes, 2);
        assert_eq!(report.failures, None);
        assert_eq!(report.throughput_ops, 200.0);
    }

    #[test]
    fn test_multi_card_report_counts_every_child() {
        let card = |index| crate::benchmark::Card {
            index,
            program: None,
        };
        let config = BenchmarkConfig {
            processes: 2,
            cards: vec![card(0), card(1)],
            ..Default::default()
        };
        let cross = CrossProcessSummary {
            processes_reported: 4,
            completions: 800,
            latency: LatencyStats::new(),
            window: TimeWindow::new(0, 1_000_000_000),
        };
        let report = RunReport::from_cross_process(&config, &cross);
        assert_eq!(report.processes, 4);
        assert_eq!(report.cards, 2);
        assert!(report.to_string().contains("card(s):                2"));
    }

    #[test]
    fn test_record_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("points.jsonl");
        let mut manager = ResultsManager::new(&output, &dir.path().join("history.log"), false);
        let report = RunReport::from_process(&BenchmarkConfig::default(), &summary(5, 1_000));
        manager.record(&report).unwrap();
        manager.record(&report).unwrap();
        assert_eq!(manager.recorded(), 2);

        let text = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: RunReport = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.completions, 5);
        assert_eq!(parsed.run_id, report.run_id);
    }

    #[test]
    fn test_quiet_manager_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("points.jsonl");
        let history = dir.path().join("history.log");
        let mut manager = ResultsManager::new(&output, &history, true);
        let report = RunReport::from_process(&BenchmarkConfig::default(), &summary(5, 1_000));
        manager.record(&report).unwrap();
        let best = SweepBest {
            processes: 1,
            threads: 1,
            bulk: 4,
            payload_size: 4096,
            throughput: 10.0,
        };
        manager.append_history(&best, "kernel", None).unwrap();
        assert!(!output.exists());
        assert!(!history.exists());
    }

    #[test]
    fn test_history_record() {
        let dir = TempDir::new().unwrap();
        let history = dir.path().join("history.log");
        let manager = ResultsManager::new(&dir.path().join("points.jsonl"), &history, false);
        let best = SweepBest {
            processes: 2,
            threads: 4,
            bulk: 16,
            payload_size: 4096,
            throughput: 12345.0,
        };
        manager
            .append_history(&best, "kernel execution (hello)", Some(Path::new("/tmp/a.bin")))
            .unwrap();

        let text = std::fs::read_to_string(&history).unwrap();
        let record: HistoryRecord = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(record.best, best);
        assert_eq!(record.program, Some(PathBuf::from("/tmp/a.bin")));
        assert!(record.system.cpu_cores > 0);
    }

    #[test]
    fn test_system_info_collect() {
        let info = SystemInfo::collect();
        assert!(!info.os.is_empty());
        assert!(!info.host.is_empty());
        assert_eq!(info.benchmark_version, crate::VERSION);
    }
}
