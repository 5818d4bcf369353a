//! evcamd: evcam recorder daemon
//!
//! Usage:
//!   evcamd [--config /etc/evcam/config.toml] [run]
//!   evcamd decrypt [--input <dir>] [--output <dir>]
//!
//! Commands:
//!   run      capture, detect and seal pipeline plus the streaming API [default]
//!   decrypt  batch-decrypt every container in the encrypted folder

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use evcam_core::config::EvcamConfig;
use evcam_crypto::{load_or_create_key, process_all, FfmpegBackend};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "evcamd", version, about = "evcam recorder daemon")]
struct Cli {
    /// Path to the evcam TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "EV_CONFIG",
        default_value = "/etc/evcam/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "EV_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "EV_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline and the streaming API (default)
    Run,
    /// Decrypt every container in a folder into playable .mp4 files
    Decrypt {
        /// Folder holding .WattLagGyi containers (default: paths.enc_folder)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output folder (default: paths.dec_out)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "evcamd starting"
    );

    let config = load_config(&cli.config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => evcamd::daemon::run(config).await,
        Command::Decrypt { input, output } => decrypt(config, input, output).await,
    }
}

async fn decrypt(config: EvcamConfig, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let paths = config.paths.resolve();
    let input = input.unwrap_or(paths.enc_folder);
    let output = output.unwrap_or(paths.dec_out);
    let key_path = paths.key_path;

    let report = tokio::task::spawn_blocking(move || {
        let key = load_or_create_key(&key_path)?;
        process_all(&input, &output, &key, &FfmpegBackend::default())
            .with_context(|| format!("decrypting containers in {}", input.display()))
    })
    .await??;

    info!(
        decrypted = report.decrypted.len(),
        empty = report.empty.len(),
        failed = report.failed.len(),
        "batch decrypt finished"
    );
    for path in &report.decrypted {
        println!("{}", path.display());
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} container(s) failed to decrypt", report.failed.len());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<EvcamConfig> {
    let mut config = if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        EvcamConfig::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        EvcamConfig::default()
    };
    config.apply_env()?;
    Ok(config)
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
