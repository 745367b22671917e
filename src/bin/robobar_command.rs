//! robobar command client
//!
//! Sends a single `load`, `play` or `stop` straight to the robot's command
//! endpoint, bypassing the daemon and its queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use robobar::{CommandChannel, Config, DashboardChannel, RobotCommand, Signals};
use tracing::info;

#[derive(Parser)]
#[command(name = "robobar-command")]
#[command(about = "Send one command to the robot's command endpoint")]
#[command(version)]
struct Args {
    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the daemon configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Robot host, used with default ports instead of a configuration file
    #[arg(long, global = true, conflicts_with = "config")]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a program by name
    Load {
        /// Program file on the robot, e.g. home.urp
        name: String,
    },
    /// Start the loaded program
    Play,
    /// Stop the running program
    Stop,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        if let Some(host) = &self.host {
            return Ok(Config::for_host(host));
        }
        let path = self
            .config
            .clone()
            .or_else(|| std::env::var("ROBOBAR_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string());
        Config::load_from_path(&path).with_context(|| format!("Failed to load configuration from {}", path))
    }
}

impl From<Commands> for RobotCommand {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Load { name } => RobotCommand::Load(name),
            Commands::Play => RobotCommand::Play,
            Commands::Stop => RobotCommand::Stop,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("robobar=debug,robobar_command=debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("robobar=warn")
            .with_writer(std::io::stderr)
            .init();
    }

    let config = args.load_config()?;
    let channel = DashboardChannel::new(&config.command_address(), config.connect_timeout(), Signals::new());

    let command = RobotCommand::from(args.command);
    info!("Sending '{}' to {}", command, channel.address());
    channel
        .send(command.clone())
        .await
        .with_context(|| format!("Failed to send '{}' to {}", command, channel.address()))?;

    println!("✓ Sent: {}", command);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_subcommand() {
        let args = Args::parse_from(["robobar-command", "--host", "10.0.0.5", "load", "home.urp"]);
        let config = args.load_config().unwrap();

        assert_eq!(config.command_address(), "10.0.0.5:29999");
        assert_eq!(RobotCommand::from(args.command), RobotCommand::Load("home.urp".to_string()));
    }

    #[test]
    fn test_host_conflicts_with_config() {
        let parsed = Args::try_parse_from(["robobar-command", "--host", "a", "--config", "b.yaml", "stop"]);
        assert!(parsed.is_err());
    }
}
