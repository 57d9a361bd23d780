#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use async_trait::async_trait;
use wsrun_core::run_cache::MemoryHashStore;
use wsrun_core::{
    DependencyGraph, Error, LineSink, Package, ProcessRunner, ReportRecord, Reporter, Result,
    RunCache, RunOptions, RunSummary, RunSupervisor, Script, SourceFingerprint, Target,
    TargetGraph,
};

/// What the fake runner does for one package.
#[derive(Clone)]
pub struct Behaviour {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit: std::result::Result<i32, String>,
    pub delay: Duration,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: Ok(0),
            delay: Duration::ZERO,
        }
    }
}

impl Behaviour {
    pub fn exit(code: i32) -> Self {
        Self {
            exit: Ok(code),
            ..Self::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            exit: Err(message.to_string()),
            ..Self::default()
        }
    }

    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    End(String),
}

#[derive(Default)]
struct FakeInner {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    events: Mutex<Vec<Event>>,
    current: AtomicUsize,
    max: AtomicUsize,
}

/// In-process runner. Commands are `build <package>`; the package name picks
/// the behaviour.
#[derive(Clone, Default)]
pub struct FakeRunner {
    inner: Arc<FakeInner>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, package: &str, behaviour: Behaviour) {
        self.inner
            .behaviours
            .lock()
            .unwrap()
            .insert(package.to_string(), behaviour);
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start(name) => Some(name),
                Event::End(_) => None,
            })
            .collect()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn invoke(
        &self,
        command: &str,
        _cwd: &Path,
        stdout: LineSink,
        stderr: LineSink,
    ) -> Result<i32> {
        let package = command.split_whitespace().last().unwrap_or_default().to_string();
        let behaviour = self
            .inner
            .behaviours
            .lock()
            .unwrap()
            .get(&package)
            .cloned()
            .unwrap_or_default();

        self.inner.events.lock().unwrap().push(Event::Start(package.clone()));
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max.fetch_max(now, Ordering::SeqCst);

        for line in &behaviour.stdout {
            stdout.send_line(line.clone()).await?;
            tokio::task::yield_now().await;
        }
        for line in &behaviour.stderr {
            stderr.send_line(line.clone()).await?;
            tokio::task::yield_now().await;
        }
        if !behaviour.delay.is_zero() {
            tokio::time::sleep(behaviour.delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.inner.current.fetch_sub(1, Ordering::SeqCst);
        self.inner.events.lock().unwrap().push(Event::End(package.clone()));

        behaviour.exit.map_err(|message| Error::Invocation {
            target: package,
            message,
        })
    }
}

/// Fingerprints from a mutable in-memory table; unknown packages hash to "".
/// Remembers which threads it was called on.
#[derive(Clone, Default)]
pub struct FakeFingerprint {
    sources: Arc<Mutex<HashMap<String, String>>>,
    threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl FakeFingerprint {
    pub fn set(&self, package: &str, content: &str) {
        self.sources
            .lock()
            .unwrap()
            .insert(package.to_string(), content.to_string());
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().unwrap().clone()
    }
}

impl SourceFingerprint for FakeFingerprint {
    fn fingerprint(&self, target: &Target) -> Result<String> {
        self.threads.lock().unwrap().push(thread::current().id());
        Ok(self
            .sources
            .lock()
            .unwrap()
            .get(&target.name)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    records: Arc<Mutex<Vec<ReportRecord>>>,
}

impl Recorder {
    pub fn records(&self) -> Vec<ReportRecord> {
        self.records.lock().unwrap().clone()
    }

    /// `(target, line)` for every output line, in report order.
    pub fn lines(&self) -> Vec<(String, String)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                ReportRecord::Info { target, line } | ReportRecord::Error { target, line } => {
                    Some((target, line))
                }
                _ => None,
            })
            .collect()
    }
}

impl Reporter for Recorder {
    fn report(&mut self, record: &ReportRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn exit_code(&self) -> i32 {
        let failed = self
            .records
            .lock()
            .unwrap()
            .iter()
            .any(|r| matches!(r, ReportRecord::Failure { .. }));
        i32::from(failed)
    }
}

/// `(name, deps, declares build)`.
pub fn graph(layout: &[(&str, &[&str], bool)]) -> DependencyGraph {
    let packages = layout
        .iter()
        .map(|(name, deps, build)| {
            let scripts = if *build {
                vec![Script {
                    name: "build".to_string(),
                    command: format!("build {}", name),
                }]
            } else {
                vec![]
            };
            Package::new(
                name.to_string(),
                name.into(),
                deps.iter().map(|d| d.to_string()).collect(),
                scripts,
            )
        })
        .collect();
    DependencyGraph::new(packages).unwrap()
}

pub fn targets(graph: &DependencyGraph) -> TargetGraph {
    TargetGraph::build(graph, Path::new("/workspace"), None, "build", false).unwrap()
}

pub struct Harness {
    pub runner: FakeRunner,
    pub store: MemoryHashStore,
    pub fingerprint: FakeFingerprint,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            runner: FakeRunner::new(),
            store: MemoryHashStore::new(),
            fingerprint: FakeFingerprint::default(),
        }
    }

    pub fn supervisor(
        &self,
        targets: TargetGraph,
        options: RunOptions,
        ignore_cache: bool,
    ) -> RunSupervisor {
        let cache = RunCache::open(
            Box::new(self.store.clone()),
            Arc::new(self.fingerprint.clone()),
            ignore_cache,
        );
        RunSupervisor::new(targets, cache, Arc::new(self.runner.clone()), options)
    }

    pub async fn run(
        &self,
        graph: &DependencyGraph,
        options: RunOptions,
        ignore_cache: bool,
    ) -> (RunSummary, Recorder) {
        let recorder = Recorder::default();
        let summary = self
            .supervisor(targets(graph), options, ignore_cache)
            .run(Box::new(recorder.clone()))
            .await
            .unwrap();
        (summary, recorder)
    }
}
