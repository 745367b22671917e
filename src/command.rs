//! Command Channel
//!
//! Fire-and-forget delivery of `load <name>`, `play` and `stop`. Every
//! command opens its own connection, writes one newline-terminated line and
//! closes. Nothing is read back: success means the write completed.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::connection::{connect_with_timeout, ConnectionState, ConnectionTracker};
use crate::signals::{Channel, Signals};
use crate::{Result, RobotError};

/// A single textual command understood by the command endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotCommand {
    Load(String),
    Play,
    Stop,
}

impl RobotCommand {
    /// Bytes written to the socket
    pub fn to_wire(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for RobotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobotCommand::Load(program) => write!(f, "load {}", program),
            RobotCommand::Play => write!(f, "play"),
            RobotCommand::Stop => write!(f, "stop"),
        }
    }
}

/// Transport for robot commands. The execution queue is the only caller
/// allowed to load and play programs.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send(&self, command: RobotCommand) -> Result<()>;

    async fn load_program(&self, name: &str) -> Result<()> {
        self.send(RobotCommand::Load(name.to_string())).await
    }

    async fn play(&self) -> Result<()> {
        self.send(RobotCommand::Play).await
    }

    async fn stop(&self) -> Result<()> {
        self.send(RobotCommand::Stop).await
    }
}

/// TCP command channel, one connection per command
pub struct DashboardChannel {
    address: String,
    connect_timeout: Duration,
    tracker: ConnectionTracker,
}

impl DashboardChannel {
    pub fn new(address: &str, connect_timeout: Duration, signals: Signals) -> Self {
        Self {
            address: address.to_string(),
            connect_timeout,
            tracker: ConnectionTracker::new(Channel::Command, signals),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }
}

#[async_trait]
impl CommandChannel for DashboardChannel {
    async fn send(&self, command: RobotCommand) -> Result<()> {
        self.tracker.transition(ConnectionState::Connecting);

        let mut stream = match connect_with_timeout(&self.address, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Command '{}' not delivered: {}", command, e);
                self.tracker.transition(ConnectionState::Failed);
                return Err(e);
            }
        };
        self.tracker.transition(ConnectionState::Connected);

        let result = async {
            stream.write_all(command.to_wire().as_bytes()).await?;
            stream.flush().await?;
            stream.shutdown().await?;
            Ok::<(), RobotError>(())
        }
        .await;

        self.tracker
            .transition_from(ConnectionState::Connected, ConnectionState::Disconnected);

        match &result {
            Ok(()) => debug!("Sent '{}' to {}", command, self.address),
            Err(e) => error!("Failed to write '{}' to {}: {}", command, self.address, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn receive_one(server: &TcpListener) -> String {
        let (mut socket, _) = server.accept().await.unwrap();
        let mut received = String::new();
        socket.read_to_string(&mut received).await.unwrap();
        received
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(RobotCommand::Load("pour_A.urp".to_string()).to_wire(), "load pour_A.urp\n");
        assert_eq!(RobotCommand::Play.to_wire(), "play\n");
        assert_eq!(RobotCommand::Stop.to_wire(), "stop\n");
    }

    #[tokio::test]
    async fn test_each_command_uses_its_own_connection() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        let channel = DashboardChannel::new(&address, Duration::from_secs(2), Signals::new());

        let (sent, received) = tokio::join!(
            async {
                channel.load_program("home.urp").await?;
                channel.play().await?;
                channel.stop().await
            },
            async {
                vec![
                    receive_one(&server).await,
                    receive_one(&server).await,
                    receive_one(&server).await,
                ]
            }
        );

        sent.unwrap();
        assert_eq!(received, vec!["load home.urp\n", "play\n", "stop\n"]);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_surfaces_error() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        drop(server);

        let channel = DashboardChannel::new(&address, Duration::from_secs(2), Signals::new());
        let result = channel.play().await;

        assert!(matches!(result, Err(RobotError::ConnectionFailed { .. })));
        assert_eq!(channel.state(), ConnectionState::Failed);
    }
}
