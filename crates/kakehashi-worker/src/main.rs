//! kakehashi worker binary.
//!
//! Speaks JSON lines on stdin/stdout; logs go to stderr.
//!
//! Usage:
//!   kakehashi-worker
//!   kakehashi-worker --skills-root ./skills --log-level debug
//!   kakehashi-worker --config ~/.config/kakehashi/worker.rhai

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kakehashi_kernel::{WorkerConfig, load_worker_config_file};
use kakehashi_worker::{ExitReason, serve};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Persistent worker running guest code and skill packages for a host process.
#[derive(Parser, Debug)]
#[command(name = "kakehashi-worker", version)]
#[command(about = "JSON-lines worker for guest code, host callbacks and skills")]
struct Args {
    /// Config script (default: <config dir>/kakehashi/worker.rhai when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding skill packages; overrides the config script
    #[arg(long)]
    skills_root: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("kakehashi-worker: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async {
        let _otel_guard = init_tracing(&args.log_level);
        match run(&args).await {
            Ok(reason) => {
                info!(?reason, "worker exiting");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("worker failed: {e:#}");
                ExitCode::FAILURE
            }
        }
    });

    // A guest stuck in a native call must not hold the process open.
    runtime.shutdown_timeout(Duration::from_secs(1));
    code
}

async fn run(args: &Args) -> Result<ExitReason> {
    let config = load_config(args)?;
    serve(config, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

fn load_config(args: &Args) -> Result<WorkerConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| default_config_path().filter(|p| p.is_file()));

    let mut config = match path {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            load_worker_config_file(&path)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => WorkerConfig::default(),
    };

    if let Some(root) = &args.skills_root {
        config.skills_root = root.clone();
    }
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kakehashi").join("worker.rhai"))
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Logs go to stderr without ANSI; stdout carries the protocol.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) -> Option<kakehashi_telemetry::OtelGuard> {
    let registry = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false));

    if !kakehashi_telemetry::otel_enabled() {
        registry.init();
        return None;
    }
    match kakehashi_telemetry::otel_layer("kakehashi-worker") {
        Ok((otel_layer, guard)) => {
            registry.with(otel_layer).init();
            Some(guard)
        }
        Err(e) => {
            registry.init();
            tracing::warn!(error = %e, "OTel export disabled");
            None
        }
    }
}

/// Logs go to stderr without ANSI; stdout carries the protocol.
#[cfg(not(feature = "telemetry"))]
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();
    if kakehashi_telemetry::otel_enabled() {
        tracing::warn!("OTEL_* is set but this build lacks the telemetry feature");
    }
}
