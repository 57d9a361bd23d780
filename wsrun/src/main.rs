mod commands;
mod formatting;

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use wsrun_core::RunProfile;

use commands::RunRequest;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wsrun")]
#[command(about = "Run package scripts across a multi-package repository in dependency order")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, default_value = "./packages")]
    packages_dir: PathBuf,

    /// Where run hashes are kept [default: the user cache directory]
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script in a package and everything it depends on
    Build {
        #[command(flatten)]
        run: RunArgs,

        /// Script to run in each package
        #[arg(short = 'c', long, default_value = RunProfile::BUILD.default_command)]
        build_command: String,

        /// Report what would run without starting anything
        #[arg(short, long, action)]
        dry_run: bool,
    },
    /// Run the `test` script in a package and everything it depends on
    Test {
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Package name or path under the packages directory [default: all]
    path: Option<String>,

    /// Emit one JSON record per line
    #[arg(long, action)]
    json: bool,

    /// Run independent packages at the same time (the default)
    #[arg(short, long, action, overrides_with = "no_parallel")]
    parallel: bool,

    /// Run one package at a time
    #[arg(long, action, overrides_with = "parallel")]
    no_parallel: bool,

    /// Maximum number of packages running at once
    #[arg(short, long)]
    jobs: Option<NonZeroUsize>,

    /// Print output lines as they arrive instead of per package
    #[arg(short, long, action)]
    interlaced: bool,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Run every package even if its inputs are unchanged
    #[arg(long, action)]
    ignore_cache: bool,

    /// Keep running packages that don't depend on a failed one
    #[arg(long, action)]
    continue_on_error: bool,
}

impl RunArgs {
    fn into_request(self, packages_dir: PathBuf, cache_dir: Option<PathBuf>) -> RunRequest {
        RunRequest {
            packages_dir,
            cache_dir,
            root: self.path,
            command: String::new(),
            json: self.json,
            parallel: self.parallel || !self.no_parallel,
            jobs: self.jobs,
            interlaced: self.interlaced,
            verbose: self.verbose > 0,
            dry_run: false,
            ignore_cache: self.ignore_cache,
            continue_on_error: self.continue_on_error,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (profile, request) = match cli.command {
        Commands::Build {
            run,
            build_command,
            dry_run,
        } => {
            init_tracing(run.verbose);
            let mut request = run.into_request(cli.packages_dir, cli.cache_dir);
            request.command = build_command;
            request.dry_run = dry_run;
            (RunProfile::BUILD, request)
        }
        Commands::Test { run } => {
            init_tracing(run.verbose);
            let mut request = run.into_request(cli.packages_dir, cli.cache_dir);
            request.command = RunProfile::TEST.default_command.to_string();
            (RunProfile::TEST, request)
        }
    };

    let exit_code = commands::cmd_run(profile, request)?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}
