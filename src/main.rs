//! Binary entry point for feedrelay.
//!
//! Loads the configuration, opens the dedup store, and polls feeds on the
//! configured interval until interrupted.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedrelay::config::{self, ConfigWatcher, RelayConfig};
use feedrelay::feed::HttpFeedFetcher;
use feedrelay::observability::{self, InitOptions};
use feedrelay::transport::TelegramTransport;
use feedrelay::{DedupStore, DeliveryPipeline, TemplateRenderer};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Feedrelay - relays new feed items to chat channels.
#[derive(Parser)]
#[command(name = "feedrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = config::CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Poll feeds until interrupted (default).
    Run,

    /// Run a single polling cycle and exit.
    Once,

    /// Check the configuration file and exit.
    Validate,

    /// List the buckets in the dedup store.
    Status,
}

/// Main entry point.
fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    let Some(config_path) = cli.config.clone().or_else(config::default_config_path) else {
        eprintln!("Failed to locate configuration: no --config given and no config directory");
        return ExitCode::FAILURE;
    };

    let relay_config = match RelayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        },
    };

    if matches!(command, Commands::Validate) {
        println!(
            "Configuration {} is valid: {} feed(s)",
            config_path.display(),
            relay_config.feeds.len()
        );
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        },
    };

    let _observability = {
        let _guard = runtime.enter();
        match observability::init_from_settings(
            &relay_config.observability,
            InitOptions {
                verbose: cli.verbose,
                metrics_expose: matches!(command, Commands::Run),
            },
        ) {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("Failed to initialize observability: {e}");
                return ExitCode::FAILURE;
            },
        }
    };

    let result = match command {
        Commands::Status => cmd_status(&config_path, &relay_config),
        Commands::Once => cmd_once(&runtime, &config_path, relay_config),
        Commands::Run | Commands::Validate => cmd_run(&runtime, &config_path, relay_config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Builds the pipeline. Blocking HTTP clients are created here, outside the runtime.
fn build_pipeline(config_path: &Path, config: &RelayConfig) -> Result<DeliveryPipeline> {
    let store_config = config.storage.store_config(config_path);
    let data_dir = store_config.data_dir.clone();
    let store = DedupStore::open(store_config)
        .with_context(|| format!("opening dedup store at {}", data_dir.display()))?;
    info!(data_dir = %data_dir.display(), buckets = store.bucket_count(), "Dedup store opened");

    let telegram = &config.telegram;
    Ok(DeliveryPipeline::new(
        Arc::new(store),
        Arc::new(HttpFeedFetcher::with_timeout(telegram.timeout())),
        Arc::new(TelegramTransport::new(
            telegram.bot_token.clone(),
            telegram.api_base.clone(),
            telegram.timeout(),
        )),
        Arc::new(TemplateRenderer::new()),
        config.delivery,
    ))
}

fn cmd_once(runtime: &tokio::runtime::Runtime, config_path: &Path, config: RelayConfig) -> Result<()> {
    let pipeline = build_pipeline(config_path, &config)?;
    let report = runtime.block_on(pipeline.run_cycle(&config.feeds))?;
    println!(
        "Cycle complete: {} feed(s), {} sent, {} failed send(s), {} backlog item(s) recorded",
        report.feeds_processed, report.items_sent, report.send_failures, report.backlog_suppressed
    );
    Ok(())
}

fn cmd_run(runtime: &tokio::runtime::Runtime, config_path: &Path, config: RelayConfig) -> Result<()> {
    // Dropped after the runtime returns; blocking clients must not be dropped inside it.
    let mut pipeline = build_pipeline(config_path, &config)?;
    let mut watcher = match ConfigWatcher::new(config_path) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Configuration changes will not be picked up until restart");
            None
        },
    };

    runtime.block_on(async {
        // Registered before the first cycle so a signal during a cycle is not lost.
        let shutdown = shutdown_signal();
        pipeline
            .run_until(
                config,
                || watcher.as_mut().and_then(ConfigWatcher::poll),
                shutdown,
            )
            .await;
    });
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Handlers are installed when this is called.
#[cfg(unix)]
fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    let install = |kind: SignalKind, name: &'static str| match signal(kind) {
        Ok(signal) => Some(signal),
        Err(e) => {
            error!(signal = name, error = %e, "Cannot install signal handler");
            None
        },
    };
    let interrupt = install(SignalKind::interrupt(), "SIGINT");
    let terminate = install(SignalKind::terminate(), "SIGTERM");

    async fn recv(signal: Option<Signal>) {
        match signal {
            Some(mut signal) => {
                signal.recv().await;
            },
            None => std::future::pending::<()>().await,
        }
    }

    async move {
        tokio::select! {
            () = recv(interrupt) => {},
            () = recv(terminate) => {},
        }
    }
}

/// Resolves on Ctrl-C.
#[cfg(not(unix))]
fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

fn cmd_status(config_path: &Path, config: &RelayConfig) -> Result<()> {
    let store_config = config.storage.store_config(config_path);
    let store = DedupStore::open(store_config).context("opening dedup store")?;

    println!("Data directory: {}", store.data_dir().display());
    println!("Buckets: {}", store.bucket_count());
    for bucket in store.buckets() {
        println!(
            "  {} -> {} (updated {})",
            bucket.feed_url,
            bucket.channel,
            bucket.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
