//! hpcprofile - resolve named cluster profiles and manage the result
//!
//! Main entry point: `create` resolves a profile into a running cluster
//! and blocks until it shuts down, `shutdown` stops a running cluster by
//! address, `list` shows the available profiles.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing_subscriber::EnvFilter;

use hpcprofile_core::backend::ClusterHandle;
use hpcprofile_core::client::shutdown_cluster;
use hpcprofile_core::orchestrator::{CreateOptions, Orchestrator};

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "hpcprofile",
    about = "Resolve named cluster profiles and manage the resulting clusters",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Log verbosity (logs go to stderr)
    #[clap(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevel,
}

#[derive(Parser, Debug)]
enum Command {
    /// Set up a new cluster instance and block until it shuts down
    Create {
        /// Name of the cluster profile
        name: String,

        /// Scale to N workers after creation
        #[clap(long)]
        workers: Option<usize>,

        /// Don't print status messages
        #[clap(long)]
        silent: bool,

        /// File to write the scheduler address to; removed on exit
        #[clap(long)]
        pidfile: Option<PathBuf>,

        /// Profile overrides as dotted-path assignments
        /// (e.g. --set cluster.memory=4GiB)
        #[clap(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Print the resolved configuration instead of creating anything
        #[clap(long)]
        dry_run: bool,
    },

    /// Shut down a running cluster
    Shutdown {
        /// The scheduler address (tcp://host:port)
        address: String,

        /// Don't print status messages
        #[clap(long)]
        silent: bool,
    },

    /// List the available cluster profiles
    List,
}

/// Status output channel; muted by --silent. Logging is separate and
/// controlled by --log-level.
struct Console {
    silent: bool,
}

impl Console {
    fn new(silent: bool) -> Self {
        Self { silent }
    }

    fn log(&self, message: impl Display) {
        if !self.silent {
            eprintln!("{message}");
        }
    }
}

/// Removes the scheduler address file on every exit path
struct PidfileGuard {
    path: Option<PathBuf>,
}

impl PidfileGuard {
    fn write(path: Option<PathBuf>, address: &str) -> Result<Self> {
        if let Some(path) = &path {
            std::fs::write(path, address)
                .with_context(|| format!("failed to write pidfile {}", path.display()))?;
        }
        Ok(Self { path })
    }
}

impl Drop for PidfileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Parse a `--set key=value` assignment; the value side is read as YAML so
/// numbers and booleans keep their types.
fn parse_override(assignment: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = assignment
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --set {assignment:?}: expected KEY=VALUE"))?;
    if key.is_empty() {
        return Err(anyhow!("invalid --set {assignment:?}: empty key"));
    }

    let value: serde_json::Value = serde_yaml_ng::from_str(value)
        .with_context(|| format!("invalid --set value in {assignment:?}"))?;
    Ok((key.to_string(), value))
}

fn collect_overrides(assignments: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    assignments.iter().map(|a| parse_override(a)).collect()
}

fn initialize_tracing(log_level: &LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level.to_filter_directive()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_tracing(&cli.log_level);

    match cli.command {
        Command::Create {
            name,
            workers,
            silent,
            pidfile,
            set,
            dry_run,
        } => create_command(name, workers, silent, pidfile, set, dry_run).await,
        Command::Shutdown { address, silent } => shutdown_command(address, silent).await,
        Command::List => list_command(),
    }
}

async fn create_command(
    name: String,
    workers: Option<usize>,
    silent: bool,
    pidfile: Option<PathBuf>,
    set: Vec<String>,
    dry_run: bool,
) -> Result<()> {
    let console = Console::new(silent);
    let overrides = collect_overrides(&set)?;
    tracing::debug!("collected {} overrides for {name:?}", overrides.len());
    let orchestrator = Orchestrator::new();

    if dry_run {
        let resolved = orchestrator.resolve(&name, &overrides)?;
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    console.log(format!("spawning a {name} cluster"));
    let cluster = orchestrator
        .create(
            &name,
            &overrides,
            CreateOptions {
                asynchronous: true,
                runtime: Some(tokio::runtime::Handle::current()),
            },
        )
        .await?;

    let address = cluster.scheduler_address().to_string();
    let _pidfile = PidfileGuard::write(pidfile, &address)?;
    console.log(format!("scheduler address at: {address}"));

    if let Some(workers) = workers {
        scale_and_wait(cluster.as_ref(), &console, workers).await?;
    }

    console.log("running until shutdown ...");
    cluster.finished().await;
    console.log("cluster shut down");

    Ok(())
}

/// Scale the cluster and wait until the workers arrive.
///
/// A target of zero skips the wait; the pool reports workers only when
/// there are some, so waiting would never return.
async fn scale_and_wait(cluster: &dyn ClusterHandle, console: &Console, workers: usize) -> Result<()> {
    console.log(format!("scaling to {workers} workers"));
    cluster.scale(workers).await?;
    if workers > 0 {
        cluster.wait_for_workers(workers).await?;
    }
    Ok(())
}

async fn shutdown_command(address: String, silent: bool) -> Result<()> {
    let console = Console::new(silent);

    console.log(format!("connecting to {address}"));
    shutdown_cluster(&address).await?;
    console.log("successfully shut down the cluster");

    Ok(())
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "Profile")]
    name: String,
    #[tabled(rename = "Type")]
    type_name: String,
}

fn list_command() -> Result<()> {
    let orchestrator = Orchestrator::new();

    let rows = orchestrator
        .available_clusters()?
        .into_iter()
        .map(|(name, type_name)| ProfileRow {
            name,
            type_name: type_name.unwrap_or_else(|| "<malformed>".to_string()),
        })
        .collect::<Vec<_>>();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();
    println!("{table}");

    Ok(())
}
