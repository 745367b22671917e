//! robobar daemon
//!
//! Connects to the robot, then reads one request per line from stdin and
//! feeds it to the resolver. Every signal, audit entry and usage fact is
//! written to stdout as a JSON line; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use robobar::json_output::{self, output};
use robobar::{Config, ConnectionState, DrinkId, IngredientId, JsonAudit, RobotService, StaticCatalog};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "robobar")]
#[command(about = "Drink robot daemon - queues robot programs and follows the status feed")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Script catalog, overrides `catalog.path` from the configuration
    #[arg(long)]
    catalog: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("ROBOBAR_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

/// One line of stdin
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Scripts(Vec<String>),
    Drink(DrinkId),
    Ingredients(Vec<IngredientId>),
    Event(Option<u32>),
    Stop,
    Status,
    Reconnect,
}

impl FromStr for Request {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty request".to_string())?;
        let args: Vec<&str> = words.collect();

        let no_args = |request: Request| {
            if args.is_empty() {
                Ok(request)
            } else {
                Err(format!("'{}' takes no arguments", verb))
            }
        };

        match verb {
            "scripts" => {
                if args.is_empty() {
                    return Err("usage: scripts <name>...".to_string());
                }
                Ok(Request::Scripts(args.iter().map(|s| s.to_string()).collect()))
            }
            "drink" => match args.as_slice() {
                [id] => Ok(Request::Drink(parse_id(id)?)),
                _ => Err("usage: drink <id>".to_string()),
            },
            "ingredients" => {
                if args.is_empty() {
                    return Err("usage: ingredients <id>...".to_string());
                }
                let ids = args.iter().map(|id| parse_id(id)).collect::<std::result::Result<_, _>>()?;
                Ok(Request::Ingredients(ids))
            }
            "event" => match args.as_slice() {
                ["none"] => Ok(Request::Event(None)),
                [id] => Ok(Request::Event(Some(parse_id(id)?))),
                _ => Err("usage: event <id>|none".to_string()),
            },
            "stop" => no_args(Request::Stop),
            "status" => no_args(Request::Status),
            "reconnect" => no_args(Request::Reconnect),
            other => Err(format!("unknown request '{}'", other)),
        }
    }
}

fn parse_id(text: &str) -> std::result::Result<u32, String> {
    text.parse().map_err(|_| format!("'{}' is not a valid id", text))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("robobar daemon");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;

    let catalog = match args.catalog.as_deref().or(config.catalog.path.as_deref()) {
        Some(path) => {
            let catalog = StaticCatalog::load_from_path(path)
                .with_context(|| format!("Failed to load script catalog from {}", path))?;
            info!(
                "Loaded {} drink(s) and {} ingredient(s) from {}",
                catalog.drink_count(),
                catalog.ingredient_count(),
                path
            );
            catalog
        }
        None => {
            warn!("No script catalog configured, only 'scripts' requests will resolve");
            StaticCatalog::new()
        }
    };

    let service = RobotService::new(config, Arc::new(catalog), Arc::new(JsonAudit), Arc::new(JsonAudit))
        .context("Failed to create robot service")?;

    let mut observer = service.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(signal) = observer.recv().await {
            output::signal(signal);
        }
    });

    match service.start().await {
        ConnectionState::Connected => info!("Robot ready for requests"),
        _ => {
            error!("Status feed unavailable, requests are still queued");
            error!("Make sure:");
            error!("   - Robot simulator/hardware is running");
            error!("   - Network connectivity is available");
            error!("   - 'reconnect' is sent once the robot is up");
        }
    }

    let result = tokio::select! {
        result = async {
            run_requests(&service).await?;
            finish_queued_work(&service).await;
            Ok::<(), anyhow::Error>(())
        } => result,
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    info!("Performing graceful shutdown");
    service.shutdown();
    drop(service);
    // Signals still in flight are printed before exiting
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    info!("Shutdown complete");
    result
}

/// Read requests from stdin until EOF
async fn run_requests(service: &RobotService) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read from stdin")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.parse::<Request>() {
            Ok(request) => {
                if let Err(e) = handle_request(service, request).await {
                    error!("Request '{}' failed: {}", line, e);
                    if e.is_connection() {
                        error!("Robot command endpoint unreachable, check the robot is powered and in remote control");
                    }
                    output::error(&e.to_string(), Some(line));
                }
            }
            Err(e) => {
                warn!("Rejected request '{}': {}", line, e);
                output::error(&e, Some(line));
            }
        }
    }

    info!("End of input");
    Ok(())
}

/// Let accepted orders run to completion after stdin closes
async fn finish_queued_work(service: &RobotService) {
    let snapshot = service.queue().snapshot();
    if snapshot.is_idle() {
        return;
    }
    let remaining = snapshot.pending.len() + usize::from(snapshot.busy());
    info!(
        "Waiting for {} queued script(s) to finish, Ctrl+C abandons them",
        remaining
    );
    service.queue().wait_idle().await;
    info!("Queue drained");
}

async fn handle_request(service: &RobotService, request: Request) -> robobar::Result<()> {
    let resolver = service.resolver();
    match request {
        Request::Scripts(names) => {
            resolver.run_scripts(names).await?;
        }
        Request::Drink(id) => {
            resolver.run_for_drink(id).await?;
        }
        Request::Ingredients(ids) => {
            resolver.run_for_ingredients(&ids).await?;
        }
        Request::Event(id) => resolver.set_event_context(id),
        Request::Stop => service.stop_robot().await?,
        Request::Status => {
            let snapshot = service.queue().snapshot();
            json_output::output_event(&serde_json::json!({
                "timestamp": json_output::current_timestamp(),
                "type": "status",
                "status_connection": service.status_state(),
                "command_connection": service.command_state(),
                "event_id": resolver.event_context(),
                "pending": snapshot.pending,
                "dispatching": snapshot.dispatching,
                "running": snapshot.running,
                "current": snapshot.progress.current,
                "total": snapshot.progress.total,
            }));
        }
        Request::Reconnect => {
            service.start().await;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
