use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tablesync::gcp::{self, GcpClient};
use tablesync::{Engine, JsonLinesSink, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Sync GCP resources into typed rows (JSON lines)
#[derive(Parser, Debug)]
#[command(name = "tablesync", version, about, long_about = None)]
struct Args {
    /// Config file (defaults to <config dir>/tablesync/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root tables to sync, glob patterns allowed (repeatable)
    #[arg(short, long = "table")]
    tables: Vec<String>,

    /// Tables to skip, glob patterns allowed (repeatable)
    #[arg(long = "skip-table")]
    skip_tables: Vec<String>,

    /// GCP project to sync (repeatable)
    #[arg(short, long = "project")]
    projects: Vec<String>,

    /// Output file, `-` for stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum in-flight fetches per relation depth
    #[arg(long)]
    concurrency: Option<usize>,

    /// Abort the sync after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the available tables and exit
    #[arg(long)]
    list_tables: bool,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// CLI flags override file values
    fn apply(&self, config: &mut SyncConfig) {
        if !self.tables.is_empty() {
            config.tables = self.tables.clone();
        }
        if !self.skip_tables.is_empty() {
            config.skip_tables = self.skip_tables.clone();
        }
        if !self.projects.is_empty() {
            config.gcp.projects = self.projects.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = Some(timeout);
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn setup_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _guard = setup_logging(args.log_level, args.log_file.as_deref())?;

    let mut config = SyncConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let registry = gcp::registry()?;
    if args.list_tables {
        for table in registry.flatten() {
            println!("{}\t{}", table.name, table.description);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let tables = registry.select(&config.tables, &config.skip_tables)?;
    if config.gcp.projects.is_empty() {
        anyhow::bail!("No GCP projects configured. Pass --project or set gcp.projects in the config file.");
    }

    let client = GcpClient::from_config(&config.gcp)?;
    if config.gcp.access_token().is_none() {
        tracing::warn!(
            "{} is not set, requests will be unauthenticated",
            config.gcp.access_token_env
        );
    }

    let engine = Engine::new(config.engine_config());

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling sync");
                cancel.cancel();
            }
        }
    });

    let result = match args.output.as_deref() {
        Some(path) if path != Path::new("-") => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file {}", path.display()))?;
            let sink = JsonLinesSink::new(tokio::io::BufWriter::new(file));
            engine.sync_with_cancel(&client, &tables, sink, cancel).await
        }
        _ => {
            let sink = JsonLinesSink::new(tokio::io::stdout());
            engine.sync_with_cancel(&client, &tables, sink, cancel).await
        }
    };

    match result {
        Ok(summary) => {
            eprintln!("{}", summary);
            if summary.has_errors() {
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{}", err.summary());
            eprintln!("Error: {}", err);
            Ok(ExitCode::FAILURE)
        }
    }
}
