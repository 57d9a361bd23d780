//! Dependency-ordered, cached command runner for multi-package repositories.

pub mod config;
pub mod error;
pub mod graph;
pub mod options;
pub mod output;
pub mod package;
pub mod reporter;
pub mod run_cache;
pub mod runner;
pub mod scanner;
pub mod state;
pub mod supervisor;
pub mod target;

pub use config::{Config, WorkspaceConfig};
pub use error::{Error, Result};
pub use graph::DependencyGraph;
pub use options::{Concurrency, FailurePolicy, RunOptions, RunProfile};
pub use output::{LineSink, OutputMode, Stream};
pub use package::{Package, Script};
pub use reporter::{HumanReporter, JsonReporter, ReportRecord, Reporter};
pub use run_cache::{
    default_cache_dir, DirectoryFingerprint, FileHashStore, HashStore, RunCache, SourceFingerprint,
};
pub use runner::{ProcessRunner, ShellRunner};
pub use scanner::Scanner;
pub use state::{FailureCause, TargetState};
pub use supervisor::{RunRecord, RunSummary, RunSupervisor};
pub use target::{Target, TargetCommand, TargetGraph, TargetId};
