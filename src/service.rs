//! Robot Service - wires the robot link, queue and resolver together
//!
//! Embedders build one [`RobotService`] per robot and talk to the resolver;
//! observers subscribe to the shared signal registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditSink, UsageSink};
use crate::catalog::ScriptCatalog;
use crate::command::{CommandChannel, DashboardChannel};
use crate::config::Config;
use crate::connection::ConnectionState;
use crate::error::Result;
use crate::queue::ExecutionQueue;
use crate::resolver::ScriptResolver;
use crate::signals::{SignalReceiver, Signals};
use crate::status::StatusListener;

pub struct RobotService {
    config: Config,
    signals: Signals,
    listener: StatusListener,
    commands: Arc<DashboardChannel>,
    queue: ExecutionQueue,
    resolver: ScriptResolver,
    audit: Arc<dyn AuditSink>,
    event_pump: JoinHandle<()>,
    shutdown_signal: AtomicBool,
}

impl RobotService {
    /// Build every component; nothing touches the network until [`start`](Self::start)
    pub fn new(
        config: Config,
        catalog: Arc<dyn ScriptCatalog>,
        audit: Arc<dyn AuditSink>,
        usage: Arc<dyn UsageSink>,
    ) -> Result<Self> {
        info!("Initializing robot service for {}", config.robot.host);

        let signals = Signals::new();
        let (listener, events) = StatusListener::new(signals.clone(), config.connect_timeout())?;
        let commands = Arc::new(DashboardChannel::new(
            &config.command_address(),
            config.connect_timeout(),
            signals.clone(),
        ));

        let queue = ExecutionQueue::spawn(
            commands.clone(),
            signals.clone(),
            Arc::clone(&audit),
            config.queue.finish_timeout(),
        );
        let event_pump = queue.attach(events);

        let resolver = ScriptResolver::new(queue.clone(), catalog, usage);
        if let Some(event_id) = config.session.event_id {
            resolver.set_event_context(Some(event_id));
        }

        Ok(Self {
            config,
            signals,
            listener,
            commands,
            queue,
            resolver,
            audit,
            event_pump,
            shutdown_signal: AtomicBool::new(false),
        })
    }

    /// Connect (or reconnect) the status feed.
    ///
    /// An unreachable robot is reported through signals and the audit log;
    /// the service stays usable either way.
    pub async fn start(&self) -> ConnectionState {
        let address = self.config.status_address();
        let state = self.listener.start(&address).await;
        if state == ConnectionState::Failed {
            let message = format!("Status feed at {} unreachable", address);
            if let Err(e) = self.audit.record(&message, AuditCategory::Connection).await {
                warn!("Failed to record audit entry: {}", e);
            }
        }
        state
    }

    /// Send `stop` to the robot right away, bypassing the queue
    pub async fn stop_robot(&self) -> Result<()> {
        info!("Stopping robot program");
        self.commands.stop().await
    }

    pub fn subscribe(&self) -> SignalReceiver {
        self.signals.subscribe()
    }

    pub fn resolver(&self) -> &ScriptResolver {
        &self.resolver
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status_state(&self) -> ConnectionState {
        self.listener.state()
    }

    pub fn command_state(&self) -> ConnectionState {
        self.commands.state()
    }

    pub fn shutdown(&self) {
        if self.shutdown_signal.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Shutting down robot service");
        self.listener.stop();
        self.event_pump.abort();
        self.queue.shutdown();
    }
}

impl Drop for RobotService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
