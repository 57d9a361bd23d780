//! Report sinks: human-readable text or line-delimited JSON.

use std::io::Write;

use owo_colors::OwoColorize;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::state::FailureCause;

/// Why a target was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    UpToDate,
}

/// A discrete event handed to a [`Reporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReportRecord {
    /// A line the target wrote to stdout.
    #[serde(rename_all = "camelCase")]
    Info { target: String, line: String },
    /// A line the target wrote to stderr.
    #[serde(rename_all = "camelCase")]
    Error { target: String, line: String },
    #[serde(rename_all = "camelCase")]
    Start { target: String, command: String },
    #[serde(rename_all = "camelCase")]
    Skip { target: String, reason: SkipReason },
    #[serde(rename_all = "camelCase")]
    Success {
        target: String,
        elapsed_ms: u64,
        dry_run: bool,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        target: String,
        exit_code: Option<i32>,
        cause: FailureCause,
    },
    #[serde(rename_all = "camelCase")]
    Summary {
        success: bool,
        done: usize,
        skipped: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

impl ReportRecord {
    pub fn target(&self) -> Option<&str> {
        match self {
            ReportRecord::Info { target, .. }
            | ReportRecord::Error { target, .. }
            | ReportRecord::Start { target, .. }
            | ReportRecord::Skip { target, .. }
            | ReportRecord::Success { target, .. }
            | ReportRecord::Failure { target, .. } => Some(target),
            ReportRecord::Summary { .. } => None,
        }
    }
}

/// Consumes report records and derives the process exit code.
pub trait Reporter: Send {
    fn report(&mut self, record: &ReportRecord) -> Result<()>;

    /// Flushes anything buffered by the sink.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// 0 if no failure was reported, 1 otherwise.
    fn exit_code(&self) -> i32;
}

/// Colored, prefixed text output.
pub struct HumanReporter<W: Write + Send> {
    out: W,
    color: bool,
    verbose: bool,
    failed: bool,
}

impl<W: Write + Send> HumanReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            color: true,
            verbose: false,
            failed: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Also print a line when each target starts.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn prefix(&self, target: &str) -> String {
        let prefix = format!("[{}]", target);
        if self.color {
            prefix.bright_black().bold().to_string()
        } else {
            prefix
        }
    }

    fn paint(&self, text: &str, style: fn(&str) -> String) -> String {
        if self.color {
            style(text)
        } else {
            text.to_string()
        }
    }

    fn render(&self, record: &ReportRecord) -> Option<String> {
        let line = match record {
            ReportRecord::Info { target, line } => format!("{} {}", self.prefix(target), line),
            ReportRecord::Error { target, line } => format!(
                "{} {}",
                self.prefix(target),
                self.paint(line, |s| s.bright_red().to_string())
            ),
            ReportRecord::Start { target, command } => {
                if !self.verbose {
                    return None;
                }
                format!(
                    "{} {} {}",
                    self.paint("→", |s| s.cyan().to_string()),
                    target,
                    self.paint(command, |s| s.bright_black().to_string())
                )
            }
            ReportRecord::Skip { target, .. } => format!(
                "{} {} {}",
                self.paint("⊘", |s| s.bright_black().to_string()),
                target,
                self.paint("skipped (up to date)", |s| s.bright_black().to_string())
            ),
            ReportRecord::Success {
                target,
                elapsed_ms,
                dry_run,
            } => {
                let detail = if *dry_run {
                    "would run (dry run)".to_string()
                } else {
                    format!("done in {}", format_millis(*elapsed_ms))
                };
                format!(
                    "{} {} {}",
                    self.paint("✓", |s| s.green().to_string()),
                    target,
                    self.paint(&detail, |s| s.bright_black().to_string())
                )
            }
            ReportRecord::Failure {
                target,
                exit_code,
                cause,
            } => {
                let detail = match cause {
                    FailureCause::ExitCode => {
                        format!("failed with exit code {}", exit_code.unwrap_or(-1))
                    }
                    FailureCause::Invocation { message } => {
                        format!("could not be run: {}", message)
                    }
                    FailureCause::Dependency { dependency } => {
                        format!("not run: dependency {} failed", dependency)
                    }
                    FailureCause::Aborted => "aborted".to_string(),
                };
                format!(
                    "{} {} {}",
                    self.paint("✗", |s| s.red().to_string()),
                    self.paint(target, |s| s.red().bold().to_string()),
                    self.paint(&detail, |s| s.red().to_string())
                )
            }
            ReportRecord::Summary {
                success,
                done,
                skipped,
                failed,
                elapsed_ms,
            } => {
                let counts = format!(
                    "{} done, {} skipped, {} failed in {}",
                    done,
                    skipped,
                    failed,
                    format_millis(*elapsed_ms)
                );
                if *success {
                    format!("{} {}", self.paint("✓", |s| s.green().to_string()), counts)
                } else {
                    format!(
                        "{} {}",
                        self.paint("✗", |s| s.red().to_string()),
                        self.paint(&counts, |s| s.red().bold().to_string())
                    )
                }
            }
        };
        Some(line)
    }
}

impl<W: Write + Send> Reporter for HumanReporter<W> {
    fn report(&mut self, record: &ReportRecord) -> Result<()> {
        if matches!(record, ReportRecord::Failure { .. }) {
            self.failed = true;
        }
        if let Some(line) = self.render(record) {
            writeln!(self.out, "{}", line).map_err(|e| Error::Reporter(e.to_string()))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| Error::Reporter(e.to_string()))
    }

    fn exit_code(&self) -> i32 {
        i32::from(self.failed)
    }
}

/// One JSON object per line.
pub struct JsonReporter<W: Write + Send> {
    out: W,
    failed: bool,
}

impl<W: Write + Send> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out, failed: false }
    }
}

impl<W: Write + Send> Reporter for JsonReporter<W> {
    fn report(&mut self, record: &ReportRecord) -> Result<()> {
        if matches!(record, ReportRecord::Failure { .. }) {
            self.failed = true;
        }
        serde_json::to_writer(&mut self.out, record)?;
        writeln!(self.out).map_err(|e| Error::Reporter(e.to_string()))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| Error::Reporter(e.to_string()))
    }

    fn exit_code(&self) -> i32 {
        i32::from(self.failed)
    }
}

fn format_millis(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.2}s", ms as f64 / 1000.0)
    }
}
