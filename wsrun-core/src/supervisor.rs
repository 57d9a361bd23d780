//! The run supervisor.
//!
//! A single control loop owns the state arena and the run cache. It releases
//! targets whose dependencies are satisfied, asks the cache whether each one
//! needs to run, starts up to N invocations as spawned tasks and reacts to
//! their completions. Invocations only ever talk back through channels: lines
//! go to the output multiplexer, exit outcomes to the completion queue.
//!
//! Source fingerprints touch the file system, so they are taken on the
//! blocking pool: once for every target before the loop starts, and again
//! after each successful invocation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::options::{FailurePolicy, RunOptions};
use crate::output::{LineSink, OutputEvent, OutputMultiplexer, Stream, OUTPUT_CHANNEL_CAPACITY};
use crate::reporter::{ReportRecord, Reporter, SkipReason};
use crate::run_cache::{fingerprint_blocking, CacheStats, RunCache};
use crate::runner::ProcessRunner;
use crate::state::{FailureCause, StateArena, TargetState, INVOCATION_ERROR_EXIT_CODE};
use crate::target::{TargetCommand, TargetGraph, TargetId};

/// Final outcome of one target.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub name: String,
    pub state: TargetState,
    pub exit_code: Option<i32>,
    pub cause: Option<FailureCause>,
    pub elapsed: Option<Duration>,
    /// Whether a process was spawned (or would have been, in a dry run).
    pub executed: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub records: Vec<RunRecord>,
    pub elapsed: Duration,
    /// Exit code derived by the reporter.
    pub exit_code: i32,
    pub cache_stats: CacheStats,
}

impl RunSummary {
    /// True iff no target failed.
    pub fn success(&self) -> bool {
        self.records.iter().all(|r| r.state != TargetState::Failed)
    }

    pub fn count(&self, state: TargetState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    pub fn get(&self, name: &str) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.name == name)
    }
}

/// What to do with a target once it is ready. Decided when the target
/// becomes ready, which is also when its hash is computed.
#[derive(Debug, Clone)]
enum ReadyAction {
    NoOp,
    Missing,
    Skip,
    Run(String),
}

#[derive(Debug)]
enum InvocationOutcome {
    /// `source` is the fingerprint taken after a zero exit.
    Exited {
        code: i32,
        source: Option<Result<String>>,
    },
    Error(String),
    Aborted,
}

#[derive(Debug)]
struct Completion {
    id: TargetId,
    outcome: InvocationOutcome,
}

struct Channels {
    output: mpsc::Sender<OutputEvent>,
    completions: mpsc::Sender<Completion>,
}

pub struct RunSupervisor {
    graph: TargetGraph,
    cache: RunCache,
    runner: Arc<dyn ProcessRunner>,
    options: RunOptions,
    arena: StateArena,
    /// Own-source fingerprints taken before the run, indexed by target id.
    sources: Vec<Result<String>>,
    ready: BTreeMap<TargetId, ReadyAction>,
    running: HashMap<TargetId, AbortHandle>,
    halted: bool,
}

impl RunSupervisor {
    pub fn new(
        graph: TargetGraph,
        cache: RunCache,
        runner: Arc<dyn ProcessRunner>,
        options: RunOptions,
    ) -> Self {
        let cache = if options.dry_run {
            cache.in_memory_only()
        } else {
            cache
        };
        let arena = StateArena::new(graph.len());
        Self {
            graph,
            cache,
            runner,
            options,
            arena,
            sources: Vec::new(),
            ready: BTreeMap::new(),
            running: HashMap::new(),
            halted: false,
        }
    }

    /// Runs every target to a terminal state.
    pub async fn run(self, reporter: Box<dyn Reporter>) -> Result<RunSummary> {
        self.run_until(reporter, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops early once `shutdown` resolves:
    /// nothing new starts, running invocations are killed and reported as
    /// aborted.
    pub async fn run_until<F>(mut self, reporter: Box<dyn Reporter>, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        self.sources = self.cache.fingerprint_all(&self.graph).await?;
        let names: Arc<[String]> = self.graph.targets().iter().map(|t| t.name.clone()).collect();
        let mux = OutputMultiplexer::new(self.options.output_mode, names, reporter);
        let (output, mux_handle) = mux.spawn(OUTPUT_CHANNEL_CAPACITY);
        let (completions, mut completion_rx) = mpsc::channel(self.graph.len().max(1));
        let channels = Channels {
            output,
            completions,
        };

        info!(
            command = self.graph.command_name(),
            targets = self.graph.len(),
            limit = self.options.concurrency.limit(),
            dry_run = self.options.dry_run,
            "starting run"
        );

        let roots: Vec<TargetId> = self
            .graph
            .targets()
            .iter()
            .filter(|t| t.deps.is_empty())
            .map(|t| t.id)
            .collect();
        for id in roots {
            self.release(id, &channels).await?;
        }

        tokio::pin!(shutdown);
        let mut shutdown_seen = false;

        loop {
            self.dispatch(&channels).await?;
            if self.running.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut shutdown, if !shutdown_seen => {
                    shutdown_seen = true;
                    warn!(running = self.running.len(), "run aborted; stopping running targets");
                    self.halt(&channels).await?;
                    for handle in self.running.values() {
                        handle.abort();
                    }
                }
                Some(completion) = completion_rx.recv() => {
                    self.complete(completion, &channels).await?;
                }
                else => break,
            }
        }

        // Anything still pending here could never become ready.
        for id in 0..self.graph.len() {
            if !self.arena.state(id).is_terminal() {
                self.arena.mark_failed(id, None, FailureCause::Aborted);
                self.emit_failure(id, &channels).await?;
            }
        }

        let elapsed = start.elapsed();
        let summary_record = ReportRecord::Summary {
            success: self.arena.count(TargetState::Failed) == 0,
            done: self.arena.count(TargetState::Done),
            skipped: self.arena.count(TargetState::Skipped),
            failed: self.arena.count(TargetState::Failed),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        self.emit(summary_record, &channels).await?;
        drop(channels);

        let reporter = mux_handle
            .await
            .map_err(|e| Error::Channel(format!("output multiplexer task failed: {}", e)))??;

        let records = self
            .graph
            .targets()
            .iter()
            .map(|t| {
                let record = self.arena.get(t.id);
                RunRecord {
                    name: t.name.clone(),
                    state: record.state,
                    exit_code: record.exit_code,
                    cause: record.cause.clone(),
                    elapsed: record.elapsed,
                    executed: record.executed,
                }
            })
            .collect();

        let summary = RunSummary {
            records,
            elapsed,
            exit_code: reporter.exit_code(),
            cache_stats: self.cache.stats(),
        };
        info!(
            success = summary.success(),
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    /// PENDING → READY: computes the hash and decides what the target needs.
    async fn release(&mut self, id: TargetId, channels: &Channels) -> Result<()> {
        if self.arena.state(id) != TargetState::Pending {
            return Ok(());
        }
        self.arena.mark_ready(id);

        let hashed = match &self.sources[id] {
            Ok(source) => self
                .cache
                .compute_hash(&self.graph, &self.arena, id, source)
                .map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let hash = match hashed {
            Ok(hash) => hash,
            Err(err) => {
                let message = format!("could not hash inputs: {}", err);
                return self
                    .fail(id, Some(INVOCATION_ERROR_EXIT_CODE), FailureCause::Invocation { message }, channels)
                    .await;
            }
        };
        self.arena.set_hash(id, hash.clone());

        let target = self.graph.get(id);
        let action = match &target.command {
            TargetCommand::Absent => ReadyAction::NoOp,
            TargetCommand::Missing => ReadyAction::Missing,
            TargetCommand::Script(command) => {
                if self.cache.should_run(&target.name, &hash) {
                    ReadyAction::Run(command.clone())
                } else {
                    ReadyAction::Skip
                }
            }
        };
        debug!(target = %target.name, action = ?action, "target ready");
        self.ready.insert(id, action);
        Ok(())
    }

    /// Greedily advances ready targets. Targets that need no process never
    /// wait for a slot.
    async fn dispatch(&mut self, channels: &Channels) -> Result<()> {
        let limit = self.options.concurrency.limit();
        loop {
            let slot_free = self.running.len() < limit;
            let dry_run = self.options.dry_run;
            let next = self
                .ready
                .iter()
                .find(|(_, action)| slot_free || dry_run || !matches!(action, ReadyAction::Run(_)))
                .map(|(&id, _)| id);

            let Some(id) = next else {
                return Ok(());
            };
            let Some(action) = self.ready.remove(&id) else {
                return Ok(());
            };
            self.advance(id, action, channels).await?;
        }
    }

    async fn advance(&mut self, id: TargetId, action: ReadyAction, channels: &Channels) -> Result<()> {
        let name = self.graph.get(id).name.clone();
        match action {
            ReadyAction::NoOp => {
                debug!(target = %name, "no script declared; nothing to run");
                self.arena.mark_done_synthetic(id, false);
                self.on_satisfied(id, channels).await
            }
            ReadyAction::Missing => {
                let message = format!("script '{}' is not declared", self.graph.command_name());
                self.fail(id, Some(INVOCATION_ERROR_EXIT_CODE), FailureCause::Invocation { message }, channels)
                    .await
            }
            ReadyAction::Skip => {
                self.arena.mark_skipped(id);
                self.emit(
                    ReportRecord::Skip {
                        target: name,
                        reason: SkipReason::UpToDate,
                    },
                    channels,
                )
                .await?;
                self.on_satisfied(id, channels).await
            }
            ReadyAction::Run(_) if self.options.dry_run => {
                self.arena.mark_done_synthetic(id, true);
                self.commit(id);
                self.emit(
                    ReportRecord::Success {
                        target: name,
                        elapsed_ms: 0,
                        dry_run: true,
                    },
                    channels,
                )
                .await?;
                self.on_satisfied(id, channels).await
            }
            ReadyAction::Run(command) => {
                self.arena.mark_running(id);
                self.emit(
                    ReportRecord::Start {
                        target: name,
                        command: command.clone(),
                    },
                    channels,
                )
                .await?;
                self.spawn_invocation(id, command, channels);
                Ok(())
            }
        }
    }

    fn spawn_invocation(&mut self, id: TargetId, command: String, channels: &Channels) {
        let target = self.graph.get(id).clone();
        let fingerprint = self.cache.fingerprinter();
        let runner = Arc::clone(&self.runner);
        let cwd = target.cwd.clone();
        let stdout = LineSink::new(id, Stream::Stdout, channels.output.clone());
        let stderr = LineSink::new(id, Stream::Stderr, channels.output.clone());

        let invocation =
            tokio::spawn(async move { runner.invoke(&command, &cwd, stdout, stderr).await });
        let abort = invocation.abort_handle();

        let output = channels.output.clone();
        let completions = channels.completions.clone();
        tokio::spawn(async move {
            let outcome = match invocation.await {
                Ok(Ok(0)) => InvocationOutcome::Exited {
                    code: 0,
                    source: Some(fingerprint_blocking(fingerprint, target).await),
                },
                Ok(Ok(code)) => InvocationOutcome::Exited { code, source: None },
                Ok(Err(err)) => InvocationOutcome::Error(err.to_string()),
                Err(join) if join.is_cancelled() => InvocationOutcome::Aborted,
                Err(join) => InvocationOutcome::Error(format!("invocation panicked: {}", join)),
            };
            // The buffer is finalized whatever the outcome.
            if let Err(err) = output.send(OutputEvent::Closed { target: id }).await {
                debug!(target_id = id, error = %err, "output multiplexer gone; close dropped");
            }
            if let Err(err) = completions.send(Completion { id, outcome }).await {
                debug!(target_id = id, error = %err, "supervisor gone; completion dropped");
            }
        });

        self.running.insert(id, abort);
    }

    async fn complete(&mut self, completion: Completion, channels: &Channels) -> Result<()> {
        let Completion { id, outcome } = completion;
        self.running.remove(&id);

        match outcome {
            InvocationOutcome::Exited { code, source } => match self.arena.mark_exited(id, code) {
                TargetState::Done => {
                    if let Some(source) = source {
                        self.rehash(id, source);
                    }
                    self.commit(id);
                    let record = self.arena.get(id);
                    let elapsed_ms = record.elapsed.unwrap_or_default().as_millis() as u64;
                    self.emit(
                        ReportRecord::Success {
                            target: self.graph.get(id).name.clone(),
                            elapsed_ms,
                            dry_run: false,
                        },
                        channels,
                    )
                    .await?;
                    self.on_satisfied(id, channels).await
                }
                _ => self.after_failure(id, channels).await,
            },
            InvocationOutcome::Error(message) => {
                self.fail(
                    id,
                    Some(INVOCATION_ERROR_EXIT_CODE),
                    FailureCause::Invocation { message },
                    channels,
                )
                .await
            }
            InvocationOutcome::Aborted => self.fail(id, None, FailureCause::Aborted, channels).await,
        }
    }

    /// Replaces the hash of a finished target with one built from the
    /// fingerprint taken after it ran, so files it wrote into its own
    /// directory don't count as changed inputs next time.
    fn rehash(&mut self, id: TargetId, source: Result<String>) {
        let rehashed = source
            .and_then(|source| self.cache.compute_hash(&self.graph, &self.arena, id, &source));
        match rehashed {
            Ok(hash) => self.arena.set_hash(id, hash),
            Err(err) => warn!(
                target = %self.graph.get(id).name,
                error = %err,
                "could not fingerprint after run; keeping the pre-run hash"
            ),
        }
    }

    fn commit(&mut self, id: TargetId) {
        let Some(hash) = self.arena.get(id).hash.clone() else {
            return;
        };
        let name = &self.graph.get(id).name;
        if let Err(err) = self.cache.commit(name, &hash) {
            warn!(target = %name, error = %err, "failed to persist run cache");
        }
    }

    /// Releases dependents of `id` whose dependencies are now all satisfied.
    async fn on_satisfied(&mut self, id: TargetId, channels: &Channels) -> Result<()> {
        let dependents = self.graph.get(id).dependents.clone();
        for dependent in dependents {
            if self.arena.state(dependent) == TargetState::Pending
                && self.arena.deps_satisfied(&self.graph, dependent)
            {
                self.release(dependent, channels).await?;
            }
        }
        Ok(())
    }

    async fn fail(
        &mut self,
        id: TargetId,
        exit_code: Option<i32>,
        cause: FailureCause,
        channels: &Channels,
    ) -> Result<()> {
        self.ready.remove(&id);
        self.arena.mark_failed(id, exit_code, cause);
        self.after_failure(id, channels).await
    }

    /// Reports a failed target, fails its transitive dependents and, under
    /// fail-fast, stops the rest of the run.
    async fn after_failure(&mut self, id: TargetId, channels: &Channels) -> Result<()> {
        self.emit_failure(id, channels).await?;

        let failed_name = self.graph.get(id).name.clone();
        let mut queue: VecDeque<TargetId> = self.graph.get(id).dependents.iter().copied().collect();
        while let Some(dependent) = queue.pop_front() {
            if !matches!(
                self.arena.state(dependent),
                TargetState::Pending | TargetState::Ready
            ) {
                continue;
            }
            self.ready.remove(&dependent);
            self.arena.mark_failed(
                dependent,
                None,
                FailureCause::Dependency {
                    dependency: failed_name.clone(),
                },
            );
            self.emit_failure(dependent, channels).await?;
            queue.extend(self.graph.get(dependent).dependents.iter().copied());
        }

        if self.options.failure_policy == FailurePolicy::FailFast {
            self.halt(channels).await?;
        }
        Ok(())
    }

    /// Fails every target that hasn't started yet. Running targets are left
    /// alone.
    async fn halt(&mut self, channels: &Channels) -> Result<()> {
        if self.halted {
            return Ok(());
        }
        self.halted = true;
        self.ready.clear();

        for id in 0..self.graph.len() {
            if matches!(
                self.arena.state(id),
                TargetState::Pending | TargetState::Ready
            ) {
                debug!(
                    target = %self.graph.get(id).name,
                    state = self.arena.view(&self.graph, id).as_str(),
                    "not started; aborting"
                );
                self.arena.mark_failed(id, None, FailureCause::Aborted);
                self.emit_failure(id, channels).await?;
            }
        }
        Ok(())
    }

    async fn emit_failure(&self, id: TargetId, channels: &Channels) -> Result<()> {
        let record = self.arena.get(id);
        self.emit(
            ReportRecord::Failure {
                target: self.graph.get(id).name.clone(),
                exit_code: record.exit_code,
                cause: record.cause.clone().unwrap_or(FailureCause::Aborted),
            },
            channels,
        )
        .await
    }

    async fn emit(&self, record: ReportRecord, channels: &Channels) -> Result<()> {
        channels
            .output
            .send(OutputEvent::Record(record))
            .await
            .map_err(|_| Error::Channel("output multiplexer has shut down".to_string()))
    }
}
