//! Target graph construction.
//!
//! A target is one package's invocation of the requested command. The target
//! graph is the dependency closure of the root package, with edges taken
//! from the package graph and stored as dense indices so the supervisor can
//! keep its per-target state in a flat arena.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use smallvec::SmallVec;
use tracing::debug;

use crate::error::Result;
use crate::graph::DependencyGraph;

/// Dense index of a target inside a [`TargetGraph`].
pub type TargetId = usize;

/// What running a target actually means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCommand {
    /// The package declares the script; run this shell command line.
    Script(String),
    /// The package doesn't declare the script. It still orders its
    /// dependents but its execution is a no-op that succeeds.
    Absent,
    /// Unconditional mode and the package doesn't declare the script: the
    /// invocation fails.
    Missing,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub id: TargetId,
    /// Package name; unique within the project.
    pub name: String,
    /// Absolute (or packages-dir joined) working directory.
    pub cwd: PathBuf,
    pub command: TargetCommand,
    /// Output paths and patterns, relative to `cwd`.
    pub outputs: Vec<String>,
    pub deps: SmallVec<[TargetId; 4]>,
    pub dependents: SmallVec<[TargetId; 4]>,
}

/// The targets of a run and the edges between them.
#[derive(Debug)]
pub struct TargetGraph {
    command_name: String,
    targets: Vec<Target>,
    by_name: HashMap<String, TargetId>,
}

impl TargetGraph {
    /// Builds the targets reachable from `root` (or every package when `root`
    /// is `None`) for `command_name`.
    ///
    /// In unconditional mode packages without the script get
    /// [`TargetCommand::Missing`] instead of [`TargetCommand::Absent`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PackageNotFound`] if `root` can't be resolved.
    pub fn build(
        graph: &DependencyGraph,
        packages_dir: &Path,
        root: Option<&str>,
        command_name: &str,
        unconditional: bool,
    ) -> Result<Self> {
        let closure = match root {
            Some(query) => {
                let root_package = graph.resolve_root(query)?;
                Some(graph.closure(&root_package.name)?)
            }
            None => None,
        };

        let mut targets = Vec::new();
        let mut by_name = HashMap::new();

        for name in graph.topological_order() {
            if let Some(ref closure) = closure {
                if !closure.contains(name) {
                    continue;
                }
            }
            let Some(package) = graph.get_package(name) else {
                continue;
            };

            let command = match package.get_script(command_name) {
                Some(script) => TargetCommand::Script(script.command.clone()),
                None if unconditional => TargetCommand::Missing,
                None => TargetCommand::Absent,
            };

            let id = targets.len();
            by_name.insert(name.clone(), id);
            targets.push(Target {
                id,
                name: name.clone(),
                cwd: packages_dir.join(&package.path),
                command,
                outputs: package.outputs.clone(),
                deps: SmallVec::new(),
                dependents: SmallVec::new(),
            });
        }

        // Dependents outside the closure are dropped; every dependency of a
        // member is a member.
        let member_ids = |names: Vec<String>| -> SmallVec<[TargetId; 4]> {
            let mut ids: SmallVec<[TargetId; 4]> =
                names.iter().filter_map(|n| by_name.get(n).copied()).collect();
            ids.sort_unstable();
            ids
        };
        for target in &mut targets {
            target.deps = member_ids(graph.dependencies(&target.name)?);
            target.dependents = member_ids(graph.dependents(&target.name)?);
        }

        debug!(
            command = command_name,
            targets = targets.len(),
            root = root.unwrap_or("<all>"),
            "built target graph"
        );

        Ok(Self {
            command_name: command_name.to_string(),
            targets,
            by_name,
        })
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Targets in topological order: a target's id is always greater than
    /// the ids of its dependencies.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn get(&self, id: TargetId) -> &Target {
        &self.targets[id]
    }

    pub fn find(&self, name: &str) -> Option<&Target> {
        self.by_name.get(name).map(|&id| &self.targets[id])
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
