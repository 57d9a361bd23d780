//! The `build` and `test` verbs.

use std::fs;
use std::io::{self, IsTerminal};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};
use wsrun_core::{
    default_cache_dir, Concurrency, DependencyGraph, DirectoryFingerprint, FailurePolicy,
    FileHashStore, HumanReporter, JsonReporter, OutputMode, Reporter, RunCache, RunOptions,
    RunProfile, RunSummary, RunSupervisor, Scanner, ShellRunner, TargetGraph, TargetState,
    WorkspaceConfig,
};

use crate::formatting::{
    format_duration, print_results_table, print_section_header, print_separator_with_spacing,
    print_success, print_summary_box, print_warning, SectionStyle,
};

/// Everything a verb needs, after flag parsing.
pub struct RunRequest {
    pub packages_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    /// Package name or path; `None` runs every package.
    pub root: Option<String>,
    pub command: String,
    pub json: bool,
    pub parallel: bool,
    pub jobs: Option<NonZeroUsize>,
    pub interlaced: bool,
    pub verbose: bool,
    pub dry_run: bool,
    pub ignore_cache: bool,
    pub continue_on_error: bool,
}

impl RunRequest {
    fn options(&self, workspace: Option<&WorkspaceConfig>) -> RunOptions {
        let concurrency = if self.parallel {
            let configured = workspace
                .and_then(|w| w.default_parallel)
                .and_then(NonZeroUsize::new);
            Concurrency::Parallel(self.jobs.or(configured))
        } else {
            Concurrency::Serial
        };

        RunOptions {
            concurrency,
            output_mode: if self.interlaced {
                OutputMode::Interlaced
            } else {
                OutputMode::Buffered
            },
            dry_run: self.dry_run,
            failure_policy: if self.continue_on_error {
                FailurePolicy::Continue
            } else {
                FailurePolicy::FailFast
            },
        }
    }

    fn cache_dir(&self, workspace: Option<&WorkspaceConfig>) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(|| workspace.and_then(WorkspaceConfig::resolved_cache_dir))
            .unwrap_or_else(default_cache_dir)
    }

    fn reporter(&self) -> Box<dyn Reporter> {
        if self.json {
            Box::new(JsonReporter::new(io::stdout()))
        } else {
            Box::new(
                HumanReporter::new(io::stdout())
                    .with_color(io::stdout().is_terminal())
                    .with_verbose(self.verbose),
            )
        }
    }
}

/// Runs `request.command` over the selected packages and returns the
/// process exit code.
pub fn cmd_run(profile: RunProfile, request: RunRequest) -> Result<i32> {
    if request.dry_run && !profile.allows_dry_run {
        bail!("--dry-run is not supported for '{}'", profile.default_command);
    }

    let scanner = Scanner::new(&request.packages_dir)?;
    let packages = scanner.scan()?;
    if packages.is_empty() {
        warn!(dir = %request.packages_dir.display(), "no packages found");
    }
    let workspace = scanner.workspace_config();

    let graph = DependencyGraph::new(packages)?;
    let targets = TargetGraph::build(
        &graph,
        &request.packages_dir,
        request.root.as_deref(),
        &request.command,
        profile.unconditional,
    )?;

    let cache_dir = request.cache_dir(workspace);
    fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache directory {}", cache_dir.display()))?;
    let store = FileHashStore::new(&cache_dir, &request.packages_dir, &request.command);
    debug!(path = %store.path().display(), "using run cache");
    let fingerprint = DirectoryFingerprint::new().exclude(&cache_dir);
    let cache = RunCache::open(
        Box::new(store),
        Arc::new(fingerprint),
        profile.ignores_cache(request.ignore_cache),
    );

    let options = request.options(workspace);
    let supervisor = RunSupervisor::new(targets, cache, Arc::new(ShellRunner::new()), options);

    if !request.json {
        let title = if request.dry_run {
            format!("Running '{}' (dry run)", request.command)
        } else {
            format!("Running '{}'", request.command)
        };
        print_section_header(&title, SectionStyle::Primary);
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| anyhow::anyhow!("Failed to create tokio runtime: {}", e))?;
    let summary = runtime.block_on(supervisor.run_until(request.reporter(), interrupted()))?;

    if !request.json {
        print_report(&request, &summary);
    }

    Ok(summary.exit_code)
}

/// Resolves on Ctrl-C. Never resolves if the handler can't be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn print_report(request: &RunRequest, summary: &RunSummary) {
    print_separator_with_spacing();
    print_section_header("Results", SectionStyle::Secondary);
    print_results_table(&summary.records);
    println!();

    let failed = summary.count(TargetState::Failed);
    if failed == 0 {
        print_success(&format!("'{}' succeeded", request.command));
    } else {
        print_warning(&format!("{} package(s) failed", failed));
    }
    println!();

    let stats = summary.cache_stats;
    print_summary_box(
        "Summary",
        &[
            ("Duration", format_duration(summary.elapsed)),
            ("Done", summary.count(TargetState::Done).to_string()),
            ("Skipped", summary.count(TargetState::Skipped).to_string()),
            ("Failed", failed.to_string()),
            (
                "Cache",
                format!(
                    "{:.0}% ({} hits, {} misses)",
                    stats.hit_rate() * 100.0,
                    stats.hits,
                    stats.misses
                ),
            ),
        ],
    );
    println!();
}
