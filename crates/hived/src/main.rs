//! hived — the Hive daemon.
//!
//! One binary for every role:
//! - `evaluator` / `sampler`: run a pool's task manager, which launches
//!   workers and scales them against queue depth and host load
//! - `worker`: a single worker process (started by the pool manager)
//! - `probe`: print one resource snapshot as JSON
//! - `config`: print a scaffold hive.toml
//!
//! # Usage
//!
//! ```text
//! hived evaluator --config hive.toml --spec-path task.txt
//! hived sampler --config hive.toml --spec-path task.txt --check-interval 60
//! ```

mod pool_mode;
mod worker_mode;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hive_core::{HiveConfig, PoolKind};
use hive_probe::{ResourceProbe, SystemProbe};

const DEFAULT_FILTER: &str = "info,hived=debug,hive=debug";

#[derive(Parser)]
#[command(name = "hived", about = "Hive worker-pool daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Path to hive.toml.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Task specification handed to every worker. Must exist and be non-empty.
    #[arg(long)]
    pub spec_path: PathBuf,

    /// Scaling tick interval in seconds (overrides `[scaling] interval`).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub check_interval: Option<u64>,

    /// Launch the initial workers and keep them, without scaling.
    #[arg(long)]
    pub no_dynamic_scaling: bool,

    /// Workers to start before the control loop (overrides `initial`).
    #[arg(long)]
    pub initial: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long)]
    pub kind: PoolKind,

    #[arg(long, env = "HIVE_BROKER_URL", hide_env_values = true)]
    pub broker_url: String,

    /// How long to wait for the in-flight message after SIGTERM, e.g. "60s".
    #[arg(long, default_value = "60s")]
    pub drain_timeout: String,

    /// `cuda` or `cuda:<index>`. Required for samplers.
    #[arg(long)]
    pub device: Option<String>,

    #[arg(long)]
    pub spec_path: Option<PathBuf>,

    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the evaluator pool manager.
    Evaluator(PoolArgs),
    /// Run the sampler pool manager.
    Sampler(PoolArgs),
    /// Run one worker process.
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Print a resource snapshot as JSON.
    Probe,
    /// Print a scaffold hive.toml.
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Evaluator(args) => pool_mode::run_pool(PoolKind::Evaluator, args).await,
        Command::Sampler(args) => pool_mode::run_pool(PoolKind::Sampler, args).await,
        Command::Worker(args) => worker_mode::run_worker(args).await,
        Command::Probe => print_snapshot().await,
        Command::Config => {
            print!("{}", HiveConfig::scaffold().to_toml_string()?);
            Ok(())
        }
    }
}

/// Load hive.toml, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<HiveConfig> {
    match path {
        Some(path) => HiveConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(HiveConfig::default()),
    }
}

/// Reject a missing or empty task specification file.
pub fn validate_spec_file(path: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("specification file {} not found", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("specification path {} is not a file", path.display());
    }
    if meta.len() == 0 {
        anyhow::bail!("specification file {} is empty", path.display());
    }
    Ok(())
}

async fn print_snapshot() -> anyhow::Result<()> {
    let mut probe = SystemProbe::new()?;
    let snapshot = probe.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_spec_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = validate_spec_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn missing_spec_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_spec_file(&dir.path().join("nope.txt")).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(validate_spec_file(dir.path()).is_err());
    }

    #[test]
    fn non_empty_spec_file_is_accepted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "generate ten haiku").unwrap();
        validate_spec_file(file.path()).unwrap();
    }

    #[test]
    fn config_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[evaluator]\nmax = 3\n").unwrap();
        let settings = load_config(Some(file.path())).unwrap().settings().unwrap();
        assert_eq!(settings.evaluator.thresholds.max, 3);
    }

    #[test]
    fn worker_args_parse() {
        let cli = Cli::try_parse_from([
            "hived",
            "worker",
            "--kind",
            "sampler",
            "--broker-url",
            "amqp://localhost",
            "--drain-timeout",
            "10000ms",
            "--device",
            "cuda:1",
        ])
        .unwrap();
        let Command::Worker(args) = cli.command else {
            panic!("expected worker command");
        };
        assert_eq!(args.kind, PoolKind::Sampler);
        assert_eq!(args.device.as_deref(), Some("cuda:1"));
    }

    #[test]
    fn pool_requires_spec_path() {
        assert!(Cli::try_parse_from(["hived", "evaluator"]).is_err());
        let cli = Cli::try_parse_from([
            "hived",
            "--log-json",
            "sampler",
            "--spec-path",
            "task.txt",
            "--no-dynamic-scaling",
        ])
        .unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Sampler(PoolArgs { no_dynamic_scaling: true, .. })));
    }

    #[test]
    fn check_interval_must_be_positive() {
        let args = |interval: &'static str| {
            Cli::try_parse_from([
                "hived",
                "evaluator",
                "--spec-path",
                "task.txt",
                "--check-interval",
                interval,
            ])
        };
        assert!(args("0").is_err());
        let cli = args("5").unwrap();
        assert!(matches!(cli.command, Command::Evaluator(PoolArgs { check_interval: Some(5), .. })));
    }
}
