//! Per-channel connection state
//!
//! A channel moves Disconnected → Connecting → {Connected, Failed} and
//! Connected → Disconnected. A failed channel may be retried
//! (Failed → Connecting). Nothing else is accepted.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::signals::{Channel, Signal, Signals};
use crate::{Result, RobotError};

/// Open a TCP connection to `address`, giving up after `timeout`
pub async fn connect_with_timeout(address: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RobotError::ConnectionFailed {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(RobotError::ConnectionTimeout {
            address: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
        )
    }
}

/// Owns the state of one channel and publishes every accepted transition
pub struct ConnectionTracker {
    channel: Channel,
    state: Mutex<ConnectionState>,
    signals: Signals,
}

impl ConnectionTracker {
    pub fn new(channel: Channel, signals: Signals) -> Self {
        Self {
            channel,
            state: Mutex::new(ConnectionState::Disconnected),
            signals,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `next`; returns false (and leaves the state alone) if the move is not allowed
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.apply(&mut state, next)
    }

    /// Move to `next` only if the channel is currently in `expected`
    pub fn transition_from(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != expected {
            return false;
        }
        self.apply(&mut state, next)
    }

    fn apply(&self, state: &mut ConnectionState, next: ConnectionState) -> bool {
        if !state.can_transition_to(next) {
            warn!("Refusing {} channel transition {:?} -> {:?}", self.channel, *state, next);
            return false;
        }
        debug!("{} channel {:?} -> {:?}", self.channel, *state, next);
        *state = next;
        self.signals.emit(Signal::ConnectionState {
            channel: self.channel,
            state: next,
        });
        true
    }
}
