//! Run configuration shared by every verb.

use std::num::NonZeroUsize;

use crate::output::OutputMode;

/// How many targets may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Serial,
    /// `None` means unbounded.
    Parallel(Option<NonZeroUsize>),
}

impl Concurrency {
    pub fn limit(&self) -> usize {
        match self {
            Concurrency::Serial => 1,
            Concurrency::Parallel(Some(n)) => n.get(),
            Concurrency::Parallel(None) => usize::MAX,
        }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Parallel(None)
    }
}

/// What happens to the rest of the run once a target fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Dependents fail and nothing new is started; running targets finish.
    #[default]
    FailFast,
    /// Only dependents of the failed target fail; independent subgraphs
    /// keep going.
    Continue,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub concurrency: Concurrency,
    pub output_mode: OutputMode,
    pub dry_run: bool,
    pub failure_policy: FailurePolicy,
}

/// The per-verb differences between `build` and `test`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunProfile {
    pub default_command: &'static str,
    pub allows_dry_run: bool,
    /// Invoke every reachable package, even those that don't declare the
    /// command.
    pub unconditional: bool,
    /// Skip targets whose inputs are unchanged. When false every target
    /// runs, as with `--ignore-cache`; successful runs are still recorded.
    pub uses_cache: bool,
}

impl RunProfile {
    pub const BUILD: RunProfile = RunProfile {
        default_command: "build",
        allows_dry_run: true,
        unconditional: false,
        uses_cache: true,
    };

    pub const TEST: RunProfile = RunProfile {
        default_command: "test",
        allows_dry_run: false,
        unconditional: true,
        uses_cache: false,
    };

    /// Whether a run under this profile bypasses the cache.
    pub fn ignores_cache(&self, requested: bool) -> bool {
        requested || !self.uses_cache
    }
}
