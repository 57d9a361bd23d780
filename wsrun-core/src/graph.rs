//! Dependency graph management using petgraph.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::package::Package;

/// Directed acyclic graph of package dependencies.
///
/// Edges point from a dependent to its dependency.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    packages: HashMap<NodeIndex, Package>,
    cached_topological_order: Vec<String>,
}

impl DependencyGraph {
    /// Creates a new dependency graph from a list of packages.
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency names an unknown package or if
    /// circular dependencies are detected.
    pub fn new(packages: Vec<Package>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        for package in &packages {
            if node_map.contains_key(&package.name) {
                return Err(Error::Graph(format!(
                    "Duplicate package name: {}",
                    package.name
                )));
            }
            let node = graph.add_node(package.name.clone());
            node_map.insert(package.name.clone(), node);
        }

        for package in &packages {
            let from_node = node_map[&package.name];
            for dep_name in &package.deps {
                let to_node = node_map.get(dep_name).ok_or_else(|| Error::PackageNotFound {
                    name: dep_name.clone(),
                    available: Self::available(&node_map),
                })?;
                graph.add_edge(from_node, *to_node, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let cycle_node = graph[cycle.node_id()].clone();
            Error::CircularDependency(format!("Cycle detected involving: {}", cycle_node))
        })?;

        let topological_order: Vec<String> = sorted
            .into_iter()
            .rev()
            .map(|idx| graph[idx].clone())
            .collect();

        let packages_map = packages
            .into_iter()
            .map(|p| (node_map[&p.name], p))
            .collect();

        Ok(Self {
            graph,
            node_map,
            packages: packages_map,
            cached_topological_order: topological_order,
        })
    }

    fn available(node_map: &HashMap<String, NodeIndex>) -> String {
        let mut names: Vec<&str> = node_map.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }

    fn node(&self, package_name: &str) -> Result<NodeIndex> {
        self.node_map
            .get(package_name)
            .copied()
            .ok_or_else(|| Error::PackageNotFound {
                name: package_name.to_string(),
                available: Self::available(&self.node_map),
            })
    }

    /// Retrieves a package by name.
    #[inline]
    pub fn get_package(&self, name: &str) -> Option<&Package> {
        self.node_map
            .get(name)
            .and_then(|idx| self.packages.get(idx))
    }

    /// Resolves a user-supplied root, first as a package name and then as a
    /// path relative to the packages directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PackageNotFound`] when nothing matches.
    pub fn resolve_root(&self, query: &str) -> Result<&Package> {
        if let Some(package) = self.get_package(query) {
            return Ok(package);
        }

        let wanted = normalize(Path::new(query));
        self.packages
            .values()
            .find(|p| normalize(&p.path) == wanted)
            .ok_or_else(|| Error::PackageNotFound {
                name: query.to_string(),
                available: Self::available(&self.node_map),
            })
    }

    /// Returns packages in topological order (dependencies before dependents).
    ///
    /// This is cached during graph construction for fast access.
    #[inline]
    pub fn topological_order(&self) -> &[String] {
        &self.cached_topological_order
    }

    /// Returns direct dependencies of a package.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is not found in the graph.
    pub fn dependencies(&self, package_name: &str) -> Result<Vec<String>> {
        let node = self.node(package_name)?;
        Ok(self.neighbors(node, Direction::Outgoing))
    }

    /// Returns direct dependents of a package (packages that depend on it).
    ///
    /// # Errors
    ///
    /// Returns an error if the package is not found in the graph.
    pub fn dependents(&self, package_name: &str) -> Result<Vec<String>> {
        let node = self.node(package_name)?;
        Ok(self.neighbors(node, Direction::Incoming))
    }

    fn neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<String> {
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|idx| self.graph[idx].clone())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Returns the package and everything it transitively depends on.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is not found in the graph.
    pub fn closure(&self, package_name: &str) -> Result<HashSet<String>> {
        let mut result = HashSet::new();
        let mut stack = vec![self.node(package_name)?];

        while let Some(current) = stack.pop() {
            if !result.insert(self.graph[current].clone()) {
                continue;
            }
            for dep in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if !result.contains(&self.graph[dep]) {
                    stack.push(dep);
                }
            }
        }

        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
