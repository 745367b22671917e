//! robobar - robot communication and script execution for a drink robot
//!
//! Talks to a single robot over two TCP endpoints: a line-oriented status
//! feed that is read continuously and a command endpoint that takes one
//! short-lived connection per command. On top of that sits a FIFO of robot
//! programs that runs one program at a time, and a resolver that expands
//! drink and ingredient requests into program lists.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use robobar::{Config, RobotService, StaticCatalog, TracingAudit};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/default_config.yaml")?;
//!     let catalog = StaticCatalog::load_from_path("config/catalog.yaml")?;
//!
//!     let service = RobotService::new(
//!         config,
//!         Arc::new(catalog),
//!         Arc::new(TracingAudit),
//!         Arc::new(TracingAudit),
//!     )?;
//!     service.start().await;
//!
//!     let scripts = service.resolver().run_for_drink(1).await?;
//!     println!("Queued {:?}", scripts);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **StatusListener**: reads and classifies the status feed
//! - **DashboardChannel**: sends `load`/`play`/`stop`
//! - **ExecutionQueue**: serializes program runs
//! - **ScriptResolver**: drink/ingredient lookup and usage recording
//! - **RobotService**: wires the above together

pub mod audit;
pub mod catalog;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod json_output;
pub mod queue;
pub mod resolver;
pub mod service;
pub mod signals;
pub mod status;

pub use audit::{AuditCategory, AuditSink, JsonAudit, MemoryAudit, TracingAudit, UsageRecord, UsageSink, UsageSubject};
pub use catalog::{DrinkId, DrinkScripts, IngredientId, IngredientScripts, ScriptCatalog, ScriptStep, StaticCatalog};
pub use command::{CommandChannel, DashboardChannel, RobotCommand};
pub use config::Config;
pub use connection::ConnectionState;
pub use error::{Result, RobotError};
pub use queue::{ExecutionProgress, ExecutionQueue, QueueSnapshot};
pub use resolver::ScriptResolver;
pub use service::RobotService;
pub use signals::{Channel, Signal, SignalReceiver, Signals};
pub use status::{LineClassifier, RobotEvent, StatusListener};
