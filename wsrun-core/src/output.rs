//! Output multiplexing between running targets and the reporter.
//!
//! Invocations publish their lines into a bounded channel; a single consumer
//! task owns the reporter and either forwards lines as they arrive
//! (interlaced) or holds them per target until the target's streams close
//! (buffered). Lifecycle records travel the same channel, so a target's
//! output is always reported before its completion record.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::reporter::{ReportRecord, Reporter};
use crate::target::TargetId;

/// Capacity of the channel between invocations and the multiplexer.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Lines are reported as soon as they are read.
    Interlaced,
    /// Lines are held per target and reported contiguously once it exits.
    #[default]
    Buffered,
}

#[derive(Debug)]
pub enum OutputEvent {
    Line {
        target: TargetId,
        stream: Stream,
        line: String,
    },
    /// Both streams of the target are finished; flush its buffer.
    Closed { target: TargetId },
    Record(ReportRecord),
}

/// Where a process runner writes one of its streams.
///
/// Dropping the sink closes that stream from the runner's side.
#[derive(Debug, Clone)]
pub struct LineSink {
    target: TargetId,
    stream: Stream,
    tx: mpsc::Sender<OutputEvent>,
}

impl LineSink {
    pub fn new(target: TargetId, stream: Stream, tx: mpsc::Sender<OutputEvent>) -> Self {
        Self { target, stream, tx }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub async fn send_line(&self, line: impl Into<String>) -> Result<()> {
        self.tx
            .send(OutputEvent::Line {
                target: self.target,
                stream: self.stream,
                line: line.into(),
            })
            .await
            .map_err(|_| Error::Channel("output multiplexer has shut down".to_string()))
    }
}

pub struct OutputMultiplexer {
    mode: OutputMode,
    names: Arc<[String]>,
    buffers: HashMap<TargetId, Vec<(Stream, String)>>,
    reporter: Box<dyn Reporter>,
}

impl OutputMultiplexer {
    pub fn new(mode: OutputMode, names: Arc<[String]>, reporter: Box<dyn Reporter>) -> Self {
        Self {
            mode,
            names,
            buffers: HashMap::new(),
            reporter,
        }
    }

    /// Spawns the consumer task. It runs until every sender is dropped and
    /// then hands the reporter back.
    pub fn spawn(
        mut self,
        capacity: usize,
    ) -> (
        mpsc::Sender<OutputEvent>,
        JoinHandle<Result<Box<dyn Reporter>>>,
    ) {
        let (tx, mut rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(event)?;
            }
            self.finish()
        });
        (tx, handle)
    }

    pub fn handle(&mut self, event: OutputEvent) -> Result<()> {
        match event {
            OutputEvent::Line {
                target,
                stream,
                line,
            } => match self.mode {
                OutputMode::Interlaced => {
                    let record = self.line_record(target, stream, line);
                    self.reporter.report(&record)
                }
                OutputMode::Buffered => {
                    self.buffers.entry(target).or_default().push((stream, line));
                    Ok(())
                }
            },
            OutputEvent::Closed { target } => self.flush(target),
            OutputEvent::Record(record) => self.reporter.report(&record),
        }
    }

    /// Flushes whatever is still buffered and returns the reporter.
    pub fn finish(mut self) -> Result<Box<dyn Reporter>> {
        let mut pending: Vec<TargetId> = self.buffers.keys().copied().collect();
        pending.sort_unstable();
        for target in pending {
            self.flush(target)?;
        }
        self.reporter.finish()?;
        Ok(self.reporter)
    }

    fn flush(&mut self, target: TargetId) -> Result<()> {
        let Some(lines) = self.buffers.remove(&target) else {
            return Ok(());
        };
        debug!(target_id = target, lines = lines.len(), "flushing buffered output");
        for (stream, line) in lines {
            let record = self.line_record(target, stream, line);
            self.reporter.report(&record)?;
        }
        Ok(())
    }

    fn line_record(&self, target: TargetId, stream: Stream, line: String) -> ReportRecord {
        let target = self
            .names
            .get(target)
            .cloned()
            .unwrap_or_else(|| format!("#{}", target));
        match stream {
            Stream::Stdout => ReportRecord::Info { target, line },
            Stream::Stderr => ReportRecord::Error { target, line },
        }
    }
}
