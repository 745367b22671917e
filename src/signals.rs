//! Observable signals
//!
//! Every observer registers once and gets its own unbounded receiver, so
//! delivery is lossless and each observer sees signals in the order they
//! were raised. Emission happens under the registry lock, which keeps that
//! order identical across observers even with concurrent emitters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::connection::ConnectionState;

/// Which robot endpoint a connection signal refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Status,
    Command,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Status => write!(f, "status"),
            Channel::Command => write!(f, "command"),
        }
    }
}

/// Signals raised by the robot link and the execution queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Every decoded status line, before classification
    LineReceived { text: String },
    /// A `textmsg` line from the robot
    Message { text: String },
    /// Fault, protective stop, emergency stop or safety violation
    ErrorCondition { text: String },
    ConnectionFailed {
        channel: Channel,
        address: String,
        reason: String,
    },
    ConnectionState {
        channel: Channel,
        state: ConnectionState,
    },
    Progress { current: usize, total: usize },
    BatchComplete { total: usize },
}

pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

/// Observer registry shared by every component that raises signals
#[derive(Clone, Default)]
pub struct Signals {
    observers: Arc<Mutex<Vec<mpsc::UnboundedSender<Signal>>>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer
    pub fn subscribe(&self) -> SignalReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
        receiver
    }

    /// Deliver `signal` to every live observer; dropped observers are pruned
    pub fn emit(&self, signal: Signal) {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.retain(|observer| observer.send(signal.clone()).is_ok());
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
