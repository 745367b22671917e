//! Status Listener for the robot's line-oriented status feed
//!
//! Holds one long-lived connection, splits the byte stream into lines,
//! classifies each line and publishes the result. Classified events go to
//! the coordinator through a dedicated channel; observers get signals.
//!
//! The listener never reconnects on its own. After a drop the feed stays
//! disconnected until someone calls [`StatusListener::start`] again.

use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{connect_with_timeout, ConnectionState, ConnectionTracker};
use crate::signals::{Channel, Signal, Signals};
use crate::Result;

const READ_BUFFER_SIZE: usize = 4096;
/// Longest status line kept; anything longer is discarded up to its newline
const MAX_LINE_LENGTH: usize = READ_BUFFER_SIZE * 16;

/// Classified outcome of one status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotEvent {
    Message(String),
    ErrorCondition(String),
    ProgramFinished,
}

pub type RobotEventReceiver = mpsc::UnboundedReceiver<RobotEvent>;

/// Priority-ordered, case-insensitive line classification.
///
/// Error keywords win over completion keywords, which win over `textmsg`.
/// Anything else yields no event.
pub struct LineClassifier {
    error: Regex,
    finished: Regex,
    message: Regex,
}

impl LineClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            error: Regex::new(r"(?i)protect|fault|emergency|violation")?,
            finished: Regex::new(r"(?i)finished|stopped")?,
            message: Regex::new(r"(?i)textmsg")?,
        })
    }

    pub fn classify(&self, line: &str) -> Option<RobotEvent> {
        if self.error.is_match(line) {
            Some(RobotEvent::ErrorCondition(line.to_string()))
        } else if self.finished.is_match(line) {
            Some(RobotEvent::ProgramFinished)
        } else if self.message.is_match(line) {
            Some(RobotEvent::Message(line.to_string()))
        } else {
            None
        }
    }
}

/// Reassembles lines from arbitrarily chunked reads
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    overflowed: bool,
}

impl LineDecoder {
    /// Feed raw bytes, returning every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if std::mem::take(&mut self.overflowed) {
                    continue;
                }
                let raw = std::mem::take(&mut self.pending);
                if let Some(line) = Self::decode(&raw) {
                    lines.push(line);
                }
            } else if self.overflowed {
                continue;
            } else if self.pending.len() >= MAX_LINE_LENGTH {
                warn!("Status line longer than {} bytes discarded", MAX_LINE_LENGTH);
                self.pending = Vec::new();
                self.overflowed = true;
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush a trailing unterminated line when the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.overflowed) {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Self::decode(&raw)
    }

    fn decode(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

/// State shared between the listener handle and its read loop
struct Feed {
    tracker: ConnectionTracker,
    signals: Signals,
    events: mpsc::UnboundedSender<RobotEvent>,
    classifier: LineClassifier,
}

impl Feed {
    fn dispatch_line(&self, line: String) {
        self.signals.emit(Signal::LineReceived { text: line.clone() });

        let Some(event) = self.classifier.classify(&line) else {
            debug!("Dropping unclassified status line: {}", line);
            return;
        };

        match &event {
            RobotEvent::Message(text) => {
                info!("Robot message: {}", text);
                self.signals.emit(Signal::Message { text: text.clone() });
            }
            RobotEvent::ErrorCondition(text) => {
                warn!("Robot error condition: {}", text);
                self.signals.emit(Signal::ErrorCondition { text: text.clone() });
            }
            RobotEvent::ProgramFinished => {
                debug!("Program finished: {}", line);
            }
        }

        if self.events.send(event).is_err() {
            debug!("No coordinator attached to the status feed");
        }
    }
}

/// Owns the connection to the robot's status endpoint
pub struct StatusListener {
    feed: Arc<Feed>,
    connect_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl StatusListener {
    /// Create a listener plus the receiver its classified events are delivered to
    pub fn new(signals: Signals, connect_timeout: Duration) -> Result<(Self, RobotEventReceiver)> {
        let (events, receiver) = mpsc::unbounded_channel();
        let feed = Feed {
            tracker: ConnectionTracker::new(Channel::Status, signals.clone()),
            signals,
            events,
            classifier: LineClassifier::new()?,
        };

        let listener = Self {
            feed: Arc::new(feed),
            connect_timeout,
            reader: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        };
        Ok((listener, receiver))
    }

    pub fn state(&self) -> ConnectionState {
        self.feed.tracker.state()
    }

    /// Connect to `address` and start reading.
    ///
    /// A timeout or refusal leaves the listener `Failed`, raises exactly one
    /// `ConnectionFailed` signal and returns normally so the caller can keep
    /// running without a robot link.
    pub async fn start(&self, address: &str) -> ConnectionState {
        let _guard = self.start_lock.lock().await;
        self.stop();

        if !self.feed.tracker.transition(ConnectionState::Connecting) {
            return self.state();
        }
        info!("Connecting to status feed at {}", address);

        let stream = match connect_with_timeout(address, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Status feed unavailable: {}", e);
                self.feed.tracker.transition(ConnectionState::Failed);
                self.feed.signals.emit(Signal::ConnectionFailed {
                    channel: Channel::Status,
                    address: address.to_string(),
                    reason: e.to_string(),
                });
                return ConnectionState::Failed;
            }
        };

        self.feed.tracker.transition(ConnectionState::Connected);
        info!("Connected to status feed at {}", address);

        let handle = tokio::spawn(read_loop(stream, Arc::clone(&self.feed), address.to_string()));
        *self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        ConnectionState::Connected
    }

    /// Cancel the read loop, if one is running
    pub fn stop(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(handle) = handle {
            handle.abort();
            if self
                .feed
                .tracker
                .transition_from(ConnectionState::Connected, ConnectionState::Disconnected)
            {
                info!("Status feed stopped");
            }
        }
    }
}

impl Drop for StatusListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop(mut stream: TcpStream, feed: Arc<Feed>, address: String) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut decoder = LineDecoder::default();

    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => {
                if let Some(line) = decoder.finish() {
                    feed.dispatch_line(line);
                }
                warn!("Status feed at {} closed by robot", address);
                break;
            }
            Ok(n) => {
                for line in decoder.push(&buffer[..n]) {
                    feed.dispatch_line(line);
                }
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) => {
                error!("Status feed at {} failed: {}", address, e);
                break;
            }
        }
    }

    feed.tracker
        .transition_from(ConnectionState::Connected, ConnectionState::Disconnected);
}
