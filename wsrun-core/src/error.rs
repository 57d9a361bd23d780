//! Error types and result aliases.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error in {context}: {error}")]
    Toml {
        error: toml::de::Error,
        context: String,
    },

    #[error("Package not found: {name}. Available packages: {available}")]
    PackageNotFound { name: String, available: String },

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Config file not found: {0}. Expected 'wsrun.toml' in package directory.")]
    ConfigNotFound(PathBuf),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Invocation failed for {target}: {message}")]
    Invocation { target: String, message: String },

    #[error("Run cache error: {0}")]
    Cache(String),

    #[error("Reporter error: {0}")]
    Reporter(String),

    #[error("Channel closed: {0}")]
    Channel(String),
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Toml {
            error,
            context: "wsrun.toml".to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Reporter(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
