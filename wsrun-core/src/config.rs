//! TOML configuration parsing for package and workspace manifests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::package::Script;

/// Name of the manifest file, both for packages and for the workspace root.
pub const MANIFEST_FILE: &str = "wsrun.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Simple(String),
    Complex { command: String },
}

impl ScriptValue {
    pub fn command(&self) -> &str {
        match self {
            ScriptValue::Simple(command) => command,
            ScriptValue::Complex { command } => command,
        }
    }
}

/// Package configuration as defined in `wsrun.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub deps: Deps,
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptValue>,
    /// Paths the package's scripts write, relative to the package directory.
    /// They are left out of the package fingerprint. `None` falls back to the
    /// workspace default.
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
}

/// Package dependencies configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deps {
    /// Names of packages inside this repository that this one depends on.
    #[serde(default)]
    pub internal: Vec<String>,
}

/// Workspace-level configuration, read from the `[workspace]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Cache directory path, relative to the workspace manifest if not absolute.
    pub cache_dir: Option<String>,
    /// Default number of concurrently running targets.
    pub default_parallel: Option<usize>,
    /// Scripts every package inherits unless it declares its own.
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptValue>,
    /// Outputs of packages that don't list their own.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(skip)]
    pub workspace_config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceManifest {
    workspace: Option<WorkspaceConfig>,
}

fn to_scripts(scripts: &BTreeMap<String, ScriptValue>) -> Vec<Script> {
    scripts
        .iter()
        .map(|(name, value)| Script {
            name: name.clone(),
            command: value.command().to_string(),
        })
        .collect()
}

impl Config {
    pub fn to_scripts(&self) -> Vec<Script> {
        to_scripts(&self.scripts)
    }

    /// Declared outputs, or `default` when the manifest has no `outputs` key.
    pub fn outputs_or(&self, default: &[String]) -> Vec<String> {
        self.outputs.clone().unwrap_or_else(|| default.to_vec())
    }
}

impl WorkspaceConfig {
    pub fn to_scripts(&self) -> Vec<Script> {
        to_scripts(&self.scripts)
    }

    /// Parses a workspace manifest. Returns `None` when the file has no
    /// `[workspace]` table.
    pub fn parse(content: &str, path: &Path) -> Result<Option<Self>> {
        let manifest: WorkspaceManifest =
            toml::from_str(content).map_err(|error| crate::Error::Toml {
                error,
                context: path.display().to_string(),
            })?;
        Ok(manifest.workspace.map(|mut config| {
            config.workspace_config_path = Some(path.to_path_buf());
            config
        }))
    }

    /// Walks up from `packages_dir` looking for a workspace manifest, stopping
    /// at the repository root (a directory containing `.git`).
    pub fn discover(packages_dir: &Path) -> Result<Option<Self>> {
        let mut current = packages_dir.parent();

        while let Some(dir) = current {
            let manifest = dir.join(MANIFEST_FILE);
            if manifest.is_file() {
                let content = std::fs::read_to_string(&manifest)?;
                if let Some(config) = Self::parse(&content, &manifest)? {
                    return Ok(Some(config));
                }
            }

            if dir.join(".git").exists() {
                break;
            }
            current = dir.parent();
        }

        Ok(None)
    }

    /// Resolves `cache_dir` against the manifest's directory.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        let raw = PathBuf::from(self.cache_dir.as_ref()?);
        if raw.is_absolute() {
            return Some(raw);
        }
        let base = self
            .workspace_config_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Some(base.join(raw))
    }
}
