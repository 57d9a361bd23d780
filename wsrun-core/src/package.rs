//! Package data models.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A named script a package declares, e.g. `build = "cargo build"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub command: String,
}

/// Represents a package in the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Directory of the package, relative to the packages directory.
    pub path: PathBuf,
    #[serde(
        deserialize_with = "deserialize_deps",
        serialize_with = "serialize_deps"
    )]
    pub deps: SmallVec<[String; 4]>,
    pub scripts: Vec<Script>,
    /// Paths the package's scripts write, relative to its directory. A
    /// trailing-name pattern such as `*.tsbuildinfo` matches files anywhere
    /// in the package.
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn deserialize_deps<'de, D>(deserializer: D) -> Result<SmallVec<[String; 4]>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let vec: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(SmallVec::from_vec(vec))
}

fn serialize_deps<S>(deps: &SmallVec<[String; 4]>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let vec: Vec<&String> = deps.iter().collect();
    vec.serialize(serializer)
}

impl Package {
    pub fn new(name: String, path: PathBuf, deps: Vec<String>, scripts: Vec<Script>) -> Self {
        Self {
            name,
            path,
            deps: SmallVec::from_vec(deps),
            scripts,
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    #[inline]
    pub fn get_script(&self, name: &str) -> Option<&Script> {
        self.scripts.iter().find(|s| s.name == name)
    }
}
