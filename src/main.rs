//! nginx-console - Main Entry Point
//!
//! Runs the console core against a broker, or performs one-shot operations
//! (a single command, a presence snapshot) from the command line.

use nginx_console::config::ConsoleConfig;
use nginx_console::observability::logging::{parse_level, LogFormat};
use nginx_console::observability::{init_default_logging, init_logging, HealthServer};
use nginx_console::{AgentPresence, Console};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// MQTT command/response console for nginx agents
#[derive(Parser)]
#[command(name = "nginx-console")]
#[command(about = "Send commands to nginx agents over MQTT and track their presence")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and follow agent presence until interrupted
    Run,
    /// Send one command to an agent and print the response
    Send {
        /// Target agent id
        #[arg(short, long)]
        agent: String,
        /// Command name, e.g. reload_nginx
        #[arg(long = "command", value_name = "NAME")]
        name: String,
        /// Command parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,
        /// Response timeout; defaults to commands.default_timeout_ms
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// How long to wait for the broker connection
        #[arg(long, default_value_t = 10)]
        connect_timeout_secs: u64,
    },
    /// Print the presence table after listening for a while
    Presence {
        /// Seconds to collect heartbeats before printing
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
    /// Validate the configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(parse_level("DEBUG"), LogFormat::Pretty, false),
        _ => init_logging(parse_level("TRACE"), LogFormat::Pretty, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_console(config).await,
        Commands::Send {
            agent,
            name,
            params,
            timeout_ms,
            connect_timeout_secs,
        } => {
            let code = send_command(
                config,
                &agent,
                &name,
                &params,
                timeout_ms.map(Duration::from_millis),
                Duration::from_secs(connect_timeout_secs),
            )
            .await;
            process::exit(code);
        }
        Commands::Presence { wait_secs } => {
            print_presence(config, Duration::from_secs(wait_secs)).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ConsoleConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ConsoleConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["console.toml", "config/console.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ConsoleConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create console.toml".into())
        }
    }
}

async fn run_console(config: ConsoleConfig) -> Result<(), Box<dyn std::error::Error>> {
    let console = Arc::new(Console::from_config(&config)?);
    info!(
        "Console starting with client ID: {} (v{})",
        console.client_id(),
        env!("CARGO_PKG_VERSION")
    );

    if config.health.enabled {
        let health_server = HealthServer::new(Arc::clone(&console), config.health.port);
        tokio::spawn(health_server.start());
    }

    console.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut changes = console.presence_changes();

    info!("Console is running; following agent presence");
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    let snapshot = console.presence_snapshot();
                    let online = snapshot.values().filter(|agent| agent.online).count();
                    info!(
                        generation = change.generation,
                        changes = change.changes,
                        online,
                        known = snapshot.len(),
                        "Presence updated"
                    );
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Presence notifications lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    console.shutdown().await?;
    info!("Application shutdown complete");
    Ok(())
}

/// Exit code: 0 success, 2 timeout, 1 anything else
async fn send_command(
    config: ConsoleConfig,
    agent_id: &str,
    command: &str,
    params: &str,
    timeout: Option<Duration>,
    connect_timeout: Duration,
) -> i32 {
    let params: Value = match serde_json::from_str(params) {
        Ok(params) => params,
        Err(e) => {
            error!("--params is not valid JSON: {}", e);
            return 1;
        }
    };

    let console = match Console::from_config(&config) {
        Ok(console) => console,
        Err(e) => {
            error!("Failed to create console: {}", e);
            return 1;
        }
    };
    if let Err(e) = console.start().await {
        error!("Failed to start console: {}", e);
        return 1;
    }
    if let Err(e) = console.wait_connected(connect_timeout).await {
        error!("Broker not reachable: {}", e);
        let _ = console.shutdown().await;
        return 1;
    }

    let code = match console.send(agent_id, command, params, timeout).await {
        Ok(response) => match serde_json::to_string_pretty(&response) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                error!("Failed to encode response: {}", e);
                1
            }
        },
        Err(e) => {
            eprintln!("{}", e.user_message());
            if e.is_timeout() { 2 } else { 1 }
        }
    };

    if let Err(e) = console.shutdown().await {
        warn!("Error during shutdown: {}", e);
    }
    code
}

async fn print_presence(
    config: ConsoleConfig,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let console = Console::from_config(&config)?;
    console.start().await?;
    console.wait_connected(Duration::from_secs(10)).await?;

    tokio::time::sleep(wait).await;

    let agents: BTreeMap<String, AgentPresence> = console.presence_snapshot().into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&agents)?);

    console.shutdown().await?;
    Ok(())
}

fn handle_config_command(config: &ConsoleConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
