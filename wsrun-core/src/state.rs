//! Per-target execution state, owned by the supervisor.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::target::{TargetGraph, TargetId};

/// Exit code recorded when the process invocation itself fails.
pub const INVOCATION_ERROR_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Pending,
    /// A pending target with at least one unfinished dependency. Never
    /// stored, only reported by [`StateArena::view`].
    Blocked,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

impl TargetState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TargetState::Done | TargetState::Failed | TargetState::Skipped
        )
    }

    /// Whether dependents may treat this target as satisfied.
    #[inline]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, TargetState::Done | TargetState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Blocked => "blocked",
            TargetState::Ready => "ready",
            TargetState::Running => "running",
            TargetState::Done => "done",
            TargetState::Failed => "failed",
            TargetState::Skipped => "skipped",
        }
    }
}

/// Why a target ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureCause {
    /// The process exited with a non-zero code.
    ExitCode,
    /// The process could not be spawned or awaited.
    Invocation { message: String },
    /// A (transitive) dependency failed; the target never ran.
    Dependency { dependency: String },
    /// The run was stopped before this target could finish.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub state: TargetState,
    /// Content hash; final once the target has left `Ready`.
    pub hash: Option<String>,
    pub exit_code: Option<i32>,
    pub cause: Option<FailureCause>,
    started_at: Option<Instant>,
    pub elapsed: Option<Duration>,
    /// Whether a process was (or, in a dry run, would have been) spawned.
    pub executed: bool,
}

impl Default for TargetRecord {
    fn default() -> Self {
        Self {
            state: TargetState::Pending,
            hash: None,
            exit_code: None,
            cause: None,
            started_at: None,
            elapsed: None,
            executed: false,
        }
    }
}

/// Flat table of target records indexed by [`TargetId`].
#[derive(Debug)]
pub struct StateArena {
    records: Vec<TargetRecord>,
}

impl StateArena {
    pub fn new(len: usize) -> Self {
        Self {
            records: vec![TargetRecord::default(); len],
        }
    }

    #[inline]
    pub fn get(&self, id: TargetId) -> &TargetRecord {
        &self.records[id]
    }

    #[inline]
    pub fn state(&self, id: TargetId) -> TargetState {
        self.records[id].state
    }

    /// State as presented to observers: pending targets waiting on an
    /// unfinished dependency read as `Blocked`.
    pub fn view(&self, graph: &TargetGraph, id: TargetId) -> TargetState {
        let state = self.state(id);
        if state == TargetState::Pending && !self.deps_satisfied(graph, id) {
            TargetState::Blocked
        } else {
            state
        }
    }

    pub fn deps_satisfied(&self, graph: &TargetGraph, id: TargetId) -> bool {
        graph
            .get(id)
            .deps
            .iter()
            .all(|&dep| self.state(dep).is_satisfied())
    }

    pub fn count(&self, state: TargetState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    pub fn set_hash(&mut self, id: TargetId, hash: String) {
        self.records[id].hash = Some(hash);
    }

    pub fn mark_ready(&mut self, id: TargetId) {
        debug_assert_eq!(self.records[id].state, TargetState::Pending);
        self.transition(id, TargetState::Ready);
    }

    pub fn mark_running(&mut self, id: TargetId) {
        debug_assert_eq!(self.records[id].state, TargetState::Ready);
        let record = &mut self.records[id];
        record.started_at = Some(Instant::now());
        record.executed = true;
        self.transition(id, TargetState::Running);
    }

    /// Success without a process: no-op targets and dry-run targets.
    pub fn mark_done_synthetic(&mut self, id: TargetId, executed: bool) {
        let record = &mut self.records[id];
        record.exit_code = Some(0);
        record.executed = executed;
        record.elapsed = Some(Duration::ZERO);
        self.transition(id, TargetState::Done);
    }

    pub fn mark_skipped(&mut self, id: TargetId) {
        self.transition(id, TargetState::Skipped);
    }

    /// Records the exit of a running target and returns its new state.
    pub fn mark_exited(&mut self, id: TargetId, exit_code: i32) -> TargetState {
        let record = &mut self.records[id];
        record.exit_code = Some(exit_code);
        record.elapsed = record.started_at.map(|t| t.elapsed());
        if exit_code == 0 {
            self.transition(id, TargetState::Done);
            TargetState::Done
        } else {
            record.cause = Some(FailureCause::ExitCode);
            self.transition(id, TargetState::Failed);
            TargetState::Failed
        }
    }

    pub fn mark_failed(&mut self, id: TargetId, exit_code: Option<i32>, cause: FailureCause) {
        let record = &mut self.records[id];
        if exit_code.is_some() {
            record.exit_code = exit_code;
        }
        if record.elapsed.is_none() {
            record.elapsed = record.started_at.map(|t| t.elapsed());
        }
        record.cause = Some(cause);
        self.transition(id, TargetState::Failed);
    }

    fn transition(&mut self, id: TargetId, to: TargetState) {
        let from = self.records[id].state;
        debug!(target_id = id, from = from.as_str(), to = to.as_str(), "target state transition");
        self.records[id].state = to;
    }
}
