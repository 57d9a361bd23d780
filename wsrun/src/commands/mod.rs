//! Command implementations for the CLI.

mod run;

pub use run::{cmd_run, RunRequest};
