use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tidewater_core::{Cache, Config, DataSource, RefreshScheduler, config_file};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod output;
mod report;
mod source;

use output::ColorMode;
use source::JsonFileSource;

/// Tidewater - staleness-aware cache for a daily-published dataset
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the platform/.tidewater.toml cascade
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh once and print the cache status
    Status {
        /// JSON file holding an array of records (or TIDEWATER_SOURCE)
        source: Option<PathBuf>,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep the cache fresh in the background and print a status line periodically
    Watch {
        /// JSON file holding an array of records (or TIDEWATER_SOURCE)
        source: Option<PathBuf>,

        /// Seconds between status lines
        #[arg(long, default_value_t = 30)]
        every: u64,
    },

    /// Write one JSON report per record through the task manager
    Report {
        /// JSON file holding an array of records (or TIDEWATER_SOURCE)
        source: Option<PathBuf>,

        /// Directory the reports are written to
        #[arg(short, long)]
        out_dir: PathBuf,

        /// Record field used as the report id
        #[arg(long, default_value = "id")]
        id_field: String,

        /// Maximum concurrent report tasks (default from config)
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let color = ColorMode(!cli.no_color);

    match cli.command {
        Command::Status { source, json } => {
            status(config, resolve_source(source)?, json, color).await
        }
        Command::Watch { source, every } => {
            watch(config, resolve_source(source)?, every, color).await
        }
        Command::Report {
            source,
            out_dir,
            id_field,
            concurrency,
        } => {
            let cancel = ctrl_c_token();
            let args = report::ReportArgs {
                source: resolve_source(source)?,
                out_dir,
                id_field,
                concurrency,
            };
            let mut stdout = std::io::stdout();
            report::run(config, args, color, &mut stdout, cancel).await
        }
    }
}

/// Resolve configuration: `--config` file > CWD/platform cascade > defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let file = match path {
        Some(p) => config_file::read_from_path(p)
            .with_context(|| format!("Failed to load config from {}", p.display()))?,
        None => config_file::load_config(),
    };
    Ok(Config::from_file(&file))
}

fn resolve_source(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = arg
        .or_else(|| std::env::var("TIDEWATER_SOURCE").ok().map(PathBuf::from))
        .context("No source file given (pass a path or set TIDEWATER_SOURCE)")?;
    if !path.exists() {
        anyhow::bail!("Source file not found: {}", path.display());
    }
    Ok(path)
}

/// Token cancelled on Ctrl+C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });
    cancel
}

async fn status(config: Config, path: PathBuf, json: bool, color: ColorMode) -> anyhow::Result<()> {
    let source = JsonFileSource::new(&path);
    let cache: Cache<Value> = Cache::new(config);
    let result = cache.refresh(&source).await;
    let status = cache.status();

    let mut out = std::io::stdout();
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&status)?)?;
    } else {
        output::print_refresh_outcome(&mut out, source.name(), &result, color)?;
        output::print_status(&mut out, source.name(), &status, color)?;
    }

    if let Err(e) = result
        && !status.has_data
    {
        anyhow::bail!("No data available from {}: {}", source.path().display(), e);
    }
    Ok(())
}

async fn watch(config: Config, path: PathBuf, every: u64, color: ColorMode) -> anyhow::Result<()> {
    let cache: Arc<Cache<Value>> = Arc::new(Cache::new(config));
    let source: Arc<dyn DataSource<Value>> = Arc::new(JsonFileSource::new(&path));
    let cancel = ctrl_c_token();

    let handle = RefreshScheduler::new(cache.clone(), source).spawn(cancel.clone());

    let mut out = std::io::stdout();
    let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                output::print_status_line(&mut out, &cache.status(), color)?;
                out.flush()?;
            }
        }
    }

    handle.await?;
    writeln!(out, "Stopped watching {}", path.display())?;
    Ok(())
}
