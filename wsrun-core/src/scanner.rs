//! Repository scanner for discovering packages.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::{Config, WorkspaceConfig, MANIFEST_FILE};
use crate::error::{Error, Result};
use crate::package::Package;

/// Directories never descended into while looking for manifests.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Scans a directory for packages.
///
/// Looks for `wsrun.toml` files one level below the packages directory and
/// parses them into `Package` structures. Workspace-level scripts are merged
/// into packages that don't declare their own.
pub struct Scanner {
    packages_dir: PathBuf,
    workspace_config: Option<WorkspaceConfig>,
}

impl Scanner {
    pub fn new(packages_dir: impl AsRef<Path>) -> Result<Self> {
        let packages_dir = packages_dir.as_ref().to_path_buf();
        let workspace_config = WorkspaceConfig::discover(&packages_dir)?;
        Ok(Self {
            packages_dir,
            workspace_config,
        })
    }

    pub fn with_workspace_config(
        packages_dir: impl AsRef<Path>,
        workspace_config: Option<WorkspaceConfig>,
    ) -> Self {
        Self {
            packages_dir: packages_dir.as_ref().to_path_buf(),
            workspace_config,
        }
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    pub fn workspace_config(&self) -> Option<&WorkspaceConfig> {
        self.workspace_config.as_ref()
    }

    pub fn scan(&self) -> Result<Vec<Package>> {
        let config_files: Vec<PathBuf> = WalkDir::new(&self.packages_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|name| !SKIPPED_DIRS.contains(&name))
                    .unwrap_or(true)
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() == MANIFEST_FILE)
            .map(|e| e.path().to_path_buf())
            .collect();

        let workspace_scripts = self
            .workspace_config
            .as_ref()
            .map(|wc| wc.to_scripts())
            .unwrap_or_default();
        let default_outputs = self
            .workspace_config
            .as_ref()
            .map(|wc| wc.outputs.clone())
            .unwrap_or_default();

        let packages: Result<Vec<Package>> = config_files
            .into_par_iter()
            .map(|config_path| {
                let package_path = config_path
                    .parent()
                    .ok_or_else(|| Error::ConfigNotFound(config_path.clone()))?;

                let content = std::fs::read_to_string(&config_path)?;
                let config: Config = toml::from_str(&content).map_err(|error| Error::Toml {
                    error,
                    context: config_path.display().to_string(),
                })?;

                let relative_path = package_path
                    .strip_prefix(&self.packages_dir)
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|_| package_path.to_path_buf());

                let mut scripts = config.to_scripts();
                for script in &workspace_scripts {
                    if !scripts.iter().any(|s| s.name == script.name) {
                        scripts.push(script.clone());
                    }
                }

                let outputs = config.outputs_or(&default_outputs);
                Ok(Package::new(
                    config.name,
                    relative_path,
                    config.deps.internal,
                    scripts,
                )
                .with_outputs(outputs))
            })
            .collect();

        let mut packages = packages?;
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = packages.len(), dir = %self.packages_dir.display(), "scanned packages");
        Ok(packages)
    }
}
