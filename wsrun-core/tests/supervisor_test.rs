mod common;

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use common::{graph, targets, Behaviour, Event, Harness, Recorder};
use wsrun_core::reporter::SkipReason;
use wsrun_core::{
    Concurrency, FailureCause, FailurePolicy, OutputMode, ReportRecord, RunOptions, TargetGraph,
    TargetState,
};

fn serial() -> RunOptions {
    RunOptions {
        concurrency: Concurrency::Serial,
        ..RunOptions::default()
    }
}

fn parallel(limit: usize) -> RunOptions {
    RunOptions {
        concurrency: Concurrency::Parallel(NonZeroUsize::new(limit)),
        ..RunOptions::default()
    }
}

/// a depends on b depends on c.
fn chain() -> wsrun_core::DependencyGraph {
    graph(&[
        ("a", &["b"], true),
        ("b", &["c"], true),
        ("c", &[], true),
    ])
}

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let harness = Harness::new();
    let (summary, recorder) = harness.run(&chain(), serial(), false).await;

    assert!(summary.success());
    assert_eq!(summary.exit_code, 0);
    assert_eq!(harness.runner.started(), vec!["c", "b", "a"]);
    assert_eq!(summary.count(TargetState::Done), 3);

    let last = recorder.records().last().cloned();
    assert!(matches!(
        last,
        Some(ReportRecord::Summary {
            success: true,
            done: 3,
            ..
        })
    ));
}

#[tokio::test]
async fn test_dependency_finishes_before_dependent_starts() {
    let harness = Harness::new();
    harness
        .runner
        .set("c", Behaviour::default().delayed(Duration::from_millis(30)));
    let (summary, _) = harness.run(&chain(), parallel(4), false).await;

    assert!(summary.success());
    let events = harness.runner.events();
    let end_c = events.iter().position(|e| *e == Event::End("c".into())).unwrap();
    let start_b = events.iter().position(|e| *e == Event::Start("b".into())).unwrap();
    let end_b = events.iter().position(|e| *e == Event::End("b".into())).unwrap();
    let start_a = events.iter().position(|e| *e == Event::Start("a".into())).unwrap();
    assert!(end_c < start_b);
    assert!(end_b < start_a);
}

#[tokio::test]
async fn test_failure_fails_dependents_without_running_them() {
    let harness = Harness::new();
    harness.runner.set("c", Behaviour::exit(1));

    let (summary, recorder) = harness.run(&chain(), serial(), false).await;

    assert!(!summary.success());
    assert_eq!(summary.exit_code, 1);
    assert_eq!(harness.runner.started(), vec!["c"]);

    let c = summary.get("c").unwrap();
    assert_eq!(c.state, TargetState::Failed);
    assert_eq!(c.exit_code, Some(1));
    assert_eq!(c.cause, Some(FailureCause::ExitCode));

    for name in ["a", "b"] {
        let record = summary.get(name).unwrap();
        assert_eq!(record.state, TargetState::Failed);
        assert!(!record.executed);
        assert_eq!(
            record.cause,
            Some(FailureCause::Dependency {
                dependency: "c".to_string()
            })
        );
    }

    let failures = recorder
        .records()
        .into_iter()
        .filter(|r| matches!(r, ReportRecord::Failure { .. }))
        .count();
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn test_second_run_skips_everything() {
    let harness = Harness::new();
    let graph = chain();

    let (first, _) = harness.run(&graph, serial(), false).await;
    assert!(first.success());
    harness.runner.clear();

    let (second, recorder) = harness.run(&graph, serial(), false).await;

    assert!(second.success());
    assert!(harness.runner.started().is_empty());
    assert_eq!(second.count(TargetState::Skipped), 3);
    assert_eq!(second.cache_stats.hits, 3);

    let skips: Vec<_> = recorder
        .records()
        .into_iter()
        .filter_map(|r| match r {
            ReportRecord::Skip { target, reason } => Some((target, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(
        skips,
        vec![
            ("c".to_string(), SkipReason::UpToDate),
            ("b".to_string(), SkipReason::UpToDate),
            ("a".to_string(), SkipReason::UpToDate),
        ]
    );
}

#[tokio::test]
async fn test_source_change_reruns_target_and_dependents() {
    let harness = Harness::new();
    let graph = chain();
    harness.run(&graph, serial(), false).await;
    harness.runner.clear();

    harness.fingerprint.set("b", "edited");
    let (summary, _) = harness.run(&graph, serial(), false).await;

    assert!(summary.success());
    assert_eq!(harness.runner.started(), vec!["b", "a"]);
    assert_eq!(summary.get("c").unwrap().state, TargetState::Skipped);
}

#[tokio::test]
async fn test_fingerprints_stay_off_the_control_loop() {
    let harness = Harness::new();
    let control_thread = std::thread::current().id();

    let (summary, _) = harness.run(&chain(), serial(), false).await;

    assert!(summary.success());
    let threads = harness.fingerprint.threads();
    // Once before the run and once after each successful invocation.
    assert_eq!(threads.len(), 6);
    assert!(threads.iter().all(|&id| id != control_thread));
}

#[tokio::test]
async fn test_ignore_cache_reruns_everything() {
    let harness = Harness::new();
    let graph = chain();
    harness.run(&graph, serial(), false).await;
    harness.runner.clear();

    let (summary, _) = harness.run(&graph, serial(), true).await;

    assert!(summary.success());
    assert_eq!(harness.runner.started(), vec!["c", "b", "a"]);
    assert_eq!(summary.count(TargetState::Skipped), 0);
}

#[tokio::test]
async fn test_failed_target_is_not_committed() {
    let harness = Harness::new();
    let graph = graph(&[("a", &[], true)]);
    harness.runner.set("a", Behaviour::exit(3));

    harness.run(&graph, serial(), false).await;
    assert!(harness.store.get("a").is_none());

    harness.runner.clear();
    harness.runner.set("a", Behaviour::exit(0));
    let (summary, _) = harness.run(&graph, serial(), false).await;

    assert_eq!(harness.runner.started(), vec!["a"]);
    assert_eq!(summary.get("a").unwrap().state, TargetState::Done);
    assert!(harness.store.get("a").is_some());
}

#[tokio::test]
async fn test_invocation_error_uses_exit_code_two() {
    let harness = Harness::new();
    harness.runner.set("c", Behaviour::error("no such shell"));

    let (summary, _) = harness.run(&chain(), serial(), false).await;

    let c = summary.get("c").unwrap();
    assert_eq!(c.state, TargetState::Failed);
    assert_eq!(c.exit_code, Some(2));
    assert!(matches!(c.cause, Some(FailureCause::Invocation { .. })));
    assert_eq!(summary.get("a").unwrap().state, TargetState::Failed);
}

#[tokio::test]
async fn test_buffered_output_is_contiguous_per_target() {
    let harness = Harness::new();
    let graph = graph(&[("x", &[], true), ("y", &[], true), ("z", &[], true)]);
    for name in ["x", "y", "z"] {
        let lines: Vec<String> = (0..5).map(|i| format!("{} line {}", name, i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        harness.runner.set(name, Behaviour::lines(&refs));
    }

    let (summary, recorder) = harness.run(&graph, parallel(3), false).await;
    assert!(summary.success());

    let lines = recorder.lines();
    assert_eq!(lines.len(), 15);
    for chunk in lines.chunks(5) {
        let owner = &chunk[0].0;
        assert!(chunk.iter().all(|(target, _)| target == owner));
        let expected: Vec<String> = (0..5).map(|i| format!("{} line {}", owner, i)).collect();
        let got: Vec<String> = chunk.iter().map(|(_, line)| line.clone()).collect();
        assert_eq!(got, expected);
    }
}

#[tokio::test]
async fn test_buffered_output_lands_between_start_and_result() {
    let harness = Harness::new();
    let graph = graph(&[("x", &[], true)]);
    harness.runner.set("x", Behaviour::lines(&["one", "two"]));

    let (_, recorder) = harness.run(&graph, serial(), false).await;
    let kinds: Vec<&'static str> = recorder
        .records()
        .iter()
        .map(|r| match r {
            ReportRecord::Start { .. } => "start",
            ReportRecord::Info { .. } => "info",
            ReportRecord::Success { .. } => "success",
            ReportRecord::Summary { .. } => "summary",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["start", "info", "info", "success", "summary"]);
}

#[tokio::test]
async fn test_interlaced_output_keeps_attribution_and_order() {
    let harness = Harness::new();
    let graph = graph(&[("x", &[], true), ("y", &[], true)]);
    harness.runner.set("x", Behaviour::lines(&["x1", "x2", "x3"]));
    harness.runner.set("y", Behaviour::lines(&["y1", "y2", "y3"]));

    let options = RunOptions {
        output_mode: OutputMode::Interlaced,
        ..parallel(2)
    };
    let (_, recorder) = harness.run(&graph, options, false).await;

    let lines = recorder.lines();
    assert_eq!(lines.len(), 6);
    for (target, line) in &lines {
        assert!(line.starts_with(target.as_str()));
    }
    let xs: Vec<_> = lines.iter().filter(|(t, _)| t == "x").map(|(_, l)| l.as_str()).collect();
    assert_eq!(xs, vec!["x1", "x2", "x3"]);
}

#[tokio::test]
async fn test_stderr_lines_become_error_records() {
    let harness = Harness::new();
    let graph = graph(&[("x", &[], true)]);
    harness.runner.set(
        "x",
        Behaviour {
            stderr: vec!["warning: unused".to_string()],
            ..Behaviour::default()
        },
    );

    let (_, recorder) = harness.run(&graph, serial(), false).await;
    assert!(recorder.records().contains(&ReportRecord::Error {
        target: "x".to_string(),
        line: "warning: unused".to_string(),
    }));
}

#[tokio::test]
async fn test_dry_run_spawns_nothing_and_persists_nothing() {
    let harness = Harness::new();
    let options = RunOptions {
        dry_run: true,
        ..serial()
    };

    let (summary, recorder) = harness.run(&chain(), options, false).await;

    assert!(summary.success());
    assert!(harness.runner.started().is_empty());
    assert_eq!(summary.count(TargetState::Done), 3);
    assert!(summary.records.iter().all(|r| r.executed));
    assert!(harness.store.get("a").is_none());

    let dry: Vec<_> = recorder
        .records()
        .into_iter()
        .filter(|r| matches!(r, ReportRecord::Success { dry_run: true, .. }))
        .collect();
    assert_eq!(dry.len(), 3);
}

#[tokio::test]
async fn test_dry_run_reports_up_to_date_targets_as_skipped() {
    let harness = Harness::new();
    let graph = chain();
    harness.run(&graph, serial(), false).await;
    harness.fingerprint.set("a", "edited");

    let options = RunOptions {
        dry_run: true,
        ..serial()
    };
    let (summary, _) = harness.run(&graph, options, false).await;

    assert_eq!(summary.get("c").unwrap().state, TargetState::Skipped);
    assert_eq!(summary.get("b").unwrap().state, TargetState::Skipped);
    assert_eq!(summary.get("a").unwrap().state, TargetState::Done);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let harness = Harness::new();
    let names: Vec<String> = (0..8).map(|i| format!("p{}", i)).collect();
    let layout: Vec<(&str, &[&str], bool)> = names.iter().map(|n| (n.as_str(), &[][..], true)).collect();
    let graph = graph(&layout);
    for name in &names {
        harness
            .runner
            .set(name, Behaviour::default().delayed(Duration::from_millis(10)));
    }

    let (summary, _) = harness.run(&graph, parallel(2), false).await;

    assert!(summary.success());
    assert_eq!(harness.runner.started().len(), 8);
    assert!(harness.runner.max_concurrent() <= 2);
}

#[tokio::test]
async fn test_serial_runs_one_at_a_time() {
    let harness = Harness::new();
    let graph = graph(&[("x", &[], true), ("y", &[], true), ("z", &[], true)]);
    for name in ["x", "y", "z"] {
        harness
            .runner
            .set(name, Behaviour::default().delayed(Duration::from_millis(5)));
    }

    harness.run(&graph, serial(), false).await;
    assert_eq!(harness.runner.max_concurrent(), 1);
}

/// x fails right away while w is still running; y waits on w.
fn diamond_for_policies() -> wsrun_core::DependencyGraph {
    graph(&[("x", &[], true), ("w", &[], true), ("y", &["w"], true)])
}

#[tokio::test]
async fn test_fail_fast_aborts_unstarted_targets() {
    let harness = Harness::new();
    harness.runner.set("x", Behaviour::exit(1));
    harness
        .runner
        .set("w", Behaviour::default().delayed(Duration::from_millis(100)));

    let (summary, _) = harness.run(&diamond_for_policies(), parallel(2), false).await;

    assert_eq!(summary.get("x").unwrap().state, TargetState::Failed);
    assert_eq!(summary.get("w").unwrap().state, TargetState::Done);
    let y = summary.get("y").unwrap();
    assert_eq!(y.state, TargetState::Failed);
    assert_eq!(y.cause, Some(FailureCause::Aborted));
    assert!(!harness.runner.started().contains(&"y".to_string()));
}

#[tokio::test]
async fn test_continue_on_error_keeps_independent_targets_going() {
    let harness = Harness::new();
    harness.runner.set("x", Behaviour::exit(1));
    harness
        .runner
        .set("w", Behaviour::default().delayed(Duration::from_millis(100)));

    let options = RunOptions {
        failure_policy: FailurePolicy::Continue,
        ..parallel(2)
    };
    let (summary, _) = harness.run(&diamond_for_policies(), options, false).await;

    assert!(!summary.success());
    assert_eq!(summary.get("x").unwrap().state, TargetState::Failed);
    assert_eq!(summary.get("w").unwrap().state, TargetState::Done);
    assert_eq!(summary.get("y").unwrap().state, TargetState::Done);
}

#[tokio::test]
async fn test_packages_without_script_are_pass_through() {
    let harness = Harness::new();
    let graph = graph(&[("app", &["types"], true), ("types", &[], false)]);

    let (summary, recorder) = harness.run(&graph, serial(), false).await;

    assert!(summary.success());
    assert_eq!(harness.runner.started(), vec!["app"]);
    let types = summary.get("types").unwrap();
    assert_eq!(types.state, TargetState::Done);
    assert!(!types.executed);
    assert!(recorder
        .records()
        .iter()
        .all(|r| r.target() != Some("types")));
}

#[tokio::test]
async fn test_unconditional_mode_fails_missing_scripts() {
    let harness = Harness::new();
    let graph = graph(&[("app", &["types"], true), ("types", &[], false)]);
    let targets =
        TargetGraph::build(&graph, Path::new("/workspace"), None, "build", true).unwrap();

    let summary = harness
        .supervisor(targets, serial(), false)
        .run(Box::new(Recorder::default()))
        .await
        .unwrap();

    let types = summary.get("types").unwrap();
    assert_eq!(types.state, TargetState::Failed);
    assert_eq!(types.exit_code, Some(2));
    assert!(matches!(
        &types.cause,
        Some(FailureCause::Invocation { message }) if message.contains("build")
    ));
    assert_eq!(summary.get("app").unwrap().state, TargetState::Failed);
    assert!(harness.runner.started().is_empty());
}

#[tokio::test]
async fn test_root_limits_run_to_its_closure() {
    let harness = Harness::new();
    let graph = graph(&[
        ("app", &["lib"], true),
        ("lib", &[], true),
        ("other", &[], true),
    ]);
    let targets =
        TargetGraph::build(&graph, Path::new("/workspace"), Some("app"), "build", false).unwrap();

    let summary = harness
        .supervisor(targets, serial(), false)
        .run(Box::new(Recorder::default()))
        .await
        .unwrap();

    assert_eq!(summary.records.len(), 2);
    assert_eq!(harness.runner.started(), vec!["lib", "app"]);
}

#[tokio::test]
async fn test_shutdown_aborts_running_targets() {
    let harness = Harness::new();
    harness
        .runner
        .set("c", Behaviour::default().delayed(Duration::from_secs(30)));

    let recorder = Recorder::default();
    let summary = harness
        .supervisor(targets(&chain()), serial(), false)
        .run_until(
            Box::new(recorder.clone()),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    for name in ["a", "b", "c"] {
        let record = summary.get(name).unwrap();
        assert_eq!(record.state, TargetState::Failed, "{}", name);
    }
    assert_eq!(summary.get("c").unwrap().cause, Some(FailureCause::Aborted));
    assert!(harness.store.get("c").is_none());
    assert_eq!(summary.exit_code, 1);
    assert!(summary.elapsed < Duration::from_secs(30));
}

#[tokio::test]
async fn test_empty_graph_succeeds() {
    let harness = Harness::new();
    let graph = graph(&[]);

    let (summary, recorder) = harness.run(&graph, RunOptions::default(), false).await;

    assert!(summary.success());
    assert!(summary.records.is_empty());
    assert_eq!(recorder.records().len(), 1);
}
