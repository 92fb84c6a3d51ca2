// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use harvester::config::{self, parse_level, Config};
use harvester::files::FileManager;
use harvester::orchestrator::Orchestrator;
use harvester::paths::DownloadRoot;
use harvester::poller::{HealthMonitor, Poller};
use harvester::registry::Registry;
use harvester::rpc::{Aria2Client, EngineRpc};
use harvester::server::{AppState, Server};
use harvester::utils::format_bytes;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Service unavailable - the download engine is not reachable
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(version = VERSION)]
#[command(about = "Download orchestration service for the aria2 engine.")]
#[command(long_about = "harvester - Download orchestration for aria2\n\n\
    Submits downloads to a running aria2 daemon over JSON-RPC, tracks their\n\
    progress and serves a REST API for downloads and the files they produce.\n\n\
    Start aria2 first, for example:\n  \
    aria2c --enable-rpc --rpc-listen-port=6800 --rpc-secret=<secret>")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ~/.harvester/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Download root directory
    #[arg(long, global = true, value_name = "DIR")]
    download_dir: Option<PathBuf>,

    /// aria2 JSON-RPC endpoint, e.g. http://127.0.0.1:6800/jsonrpc
    #[arg(long, global = true, value_name = "URL")]
    rpc_url: Option<String>,

    /// Quiet mode: warnings and errors only
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and the engine poller (default)
    #[command(alias = "s")]
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to (use 0.0.0.0 for network access)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Check engine connectivity and the download root
    Doctor,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with secrets masked
    Show,
    /// Print the default config file location
    Path,
}

/// Load config and apply global flag overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(url) = &cli.rpc_url {
        config.rpc_url = Some(url.clone());
    }
    if cli.verbose {
        config.log_level = "debug".to_string();
    } else if cli.quiet {
        config.log_level = "warn".to_string();
    }
    Ok(config)
}

fn init_logging(config: &Config) {
    let level = parse_level(&config.log_level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn print_banner(config: &Config, bind: &str, port: u16) {
    println!();
    println!("{} v{}", "harvester".bright_cyan().bold(), VERSION);
    println!("{}", "Download orchestration for aria2".dimmed());
    println!();
    println!("  {} {}", "Engine:".bold(), config.rpc_endpoint());
    println!("  {} {}", "Downloads:".bold(), config.download_dir.display());
    println!("  {} http://{}:{}", "API:".bold(), bind, port);
    println!();
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Configuration error: {:#}", "[X]".red(), e);
            std::process::exit(CONFIG);
        }
    };

    let result = match cli.command {
        Some(Commands::Config { command }) => handle_config(&config, command),
        Some(Commands::Doctor) => run_async(run_doctor(config)),
        Some(Commands::Serve { port, bind }) => run_async(serve(config, port, bind)),
        None => run_async(serve(config, None, None)),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "[X]".red(), e);
        std::process::exit(ERROR);
    }
}

fn run_async<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(future)
}

fn handle_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            let shown = serde_json::to_string_pretty(&config.redacted())?;
            println!("{}", shown);
        }
        ConfigCommands::Path => {
            println!("{}", config::default_config_path()?.display());
        }
    }
    Ok(())
}

/// Build every component, run the API until a shutdown signal, then stop the poller.
async fn serve(config: Config, port: Option<u16>, bind: Option<String>) -> Result<()> {
    init_logging(&config);

    let port = port.unwrap_or(config.port);
    let bind = bind.unwrap_or_else(|| config.bind_address.clone());

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!("Failed to create download directory {}", config.download_dir.display())
    })?;
    let root = DownloadRoot::new(&config.download_dir)
        .with_context(|| format!("Invalid download directory {}", config.download_dir.display()))?;

    let client = Aria2Client::new(config.rpc_settings()).context("Failed to create RPC client")?;
    tracing::debug!("RPC client: {:?}", client);
    let engine: Arc<dyn EngineRpc> = Arc::new(client);

    match engine.get_version().await {
        Ok(version) => tracing::info!("Connected to aria2 {}", version.version),
        Err(e) if e.is_fatal() => {
            return Err(e).context("aria2 rejected the configured RPC secret");
        }
        Err(e) => tracing::warn!("aria2 is not reachable yet, will keep polling: {}", e),
    }

    let registry = Arc::new(Registry::new());
    let health = Arc::new(HealthMonitor::new());

    let orchestrator = Orchestrator::new(Arc::clone(&engine), Arc::clone(&registry), root.clone())
        .with_max_retries(config.max_retries)
        .with_default_options(config.default_engine_options());
    let files = FileManager::new(root, Arc::clone(&registry));

    let poller = Poller::new(Arc::clone(&engine), Arc::clone(&registry), Arc::clone(&health))
        .with_interval(config.poll_interval())
        .with_retention(config.retention())
        .spawn();

    let state = Arc::new(
        AppState::new(orchestrator, files, health)
            .with_max_concurrent_downloads(config.max_concurrent_downloads),
    );

    print_banner(&config, &bind, port);

    let result = Server::new(state, port)
        .with_bind_address(bind)
        .with_rate_limit(config.rate_limit_per_minute)
        .start()
        .await;

    poller.shutdown().await;
    tracing::info!("Shutdown complete");
    result
}

/// Check that the root exists and accepts writes.
fn check_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".harvester-write-test");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

async fn run_doctor(config: Config) -> Result<()> {
    println!();
    println!("{}", "Running diagnostics...".bold());
    println!();

    let mut engine_ok = false;
    match Aria2Client::new(config.rpc_settings().with_max_attempts(1)) {
        Ok(client) => match client.get_version().await {
            Ok(version) => {
                engine_ok = true;
                println!("{} aria2: Running (v{}) at {}", "[OK]".green(), version.version, client.endpoint());
                if let Ok(stat) = client.get_global_stat().await {
                    println!(
                        "     {} active, {} waiting, {} stopped",
                        stat.num_active, stat.num_waiting, stat.num_stopped
                    );
                }
            }
            Err(e) if e.is_fatal() => {
                println!("{} aria2: Secret rejected", "[X]".red());
                println!("   {} Set rpc_secret or {} to match --rpc-secret", "Fix:".yellow(), config::ENV_RPC_SECRET);
            }
            Err(e) => {
                println!("{} aria2: Not reachable at {} ({})", "[X]".red(), client.endpoint(), e);
                println!("   {} aria2c --enable-rpc --rpc-listen-port={}", "Fix:".yellow(), config.rpc_port);
            }
        },
        Err(e) => println!("{} aria2: {}", "[X]".red(), e),
    }

    let dir = &config.download_dir;
    match check_writable(dir) {
        Ok(()) => {
            let used: u64 = std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok()?.metadata().ok())
                        .filter(|m| m.is_file())
                        .map(|m| m.len())
                        .sum()
                })
                .unwrap_or(0);
            println!("{} Download root: {} ({})", "[OK]".green(), dir.display(), format_bytes(used));
        }
        Err(e) => {
            println!("{} Download root: {} is not writable ({})", "[X]".red(), dir.display(), e);
        }
    }

    println!("{} Config: valid", "[OK]".green());
    println!();

    if !engine_ok {
        std::process::exit(SERVICE_UNAVAILABLE);
    }
    Ok(())
}
