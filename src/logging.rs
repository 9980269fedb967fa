use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// Every line is prefixed with `[pid N]` so that lines written by a parent and
/// its child benchmark processes can be told apart on a shared terminal. With
/// `ansi` disabled (log files, pipes) the level name is printed instead of a
/// color.
pub struct ColorizedFormatter {
    pid: u32,
    ansi: bool,
}

impl ColorizedFormatter {
    pub fn new(ansi: bool) -> Self {
        Self {
            pid: std::process::id(),
            ansi,
        }
    }
}

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // format_fields writes directly, so buffer to color the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let level = *event.metadata().level();
        if !self.ansi {
            return writeln!(writer, "[pid {}] {} {}", self.pid, level, buffer);
        }

        let line = format!("[pid {}] {}", self.pid, buffer);
        let colored_output = match level {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };
        writeln!(writer, "{}", colored_output)
    }
}

/// Install the global subscriber.
///
/// Logs go to stderr, or to `log_file` (appended, no colors) when given.
/// `RUST_LOG` overrides the level chosen by `verbose`. The returned guard
/// flushes the non-blocking writer on drop and must outlive all logging.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, guard, ansi) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (writer, guard, false)
        }
        None => {
            let ansi = std::io::stderr().is_terminal();
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, ansi)
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .event_format(ColorizedFormatter::new(ansi))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    Ok(guard)
}
