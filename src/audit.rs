//! Audit and usage sinks
//!
//! Outbound collaborator interfaces. The core reports robot error
//! conditions and queue events to an [`AuditSink`] and accepted drink or
//! ingredient requests to a [`UsageSink`], without caring where they end up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::catalog::{DrinkId, IngredientId};
use crate::json_output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    RobotError,
    ScriptError,
    Queue,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSubject {
    Drink(DrinkId),
    Ingredient(IngredientId),
}

/// Append-only fact: this drink or ingredient was requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub subject: UsageSubject,
    pub context_id: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub message: String,
    pub category: AuditCategory,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, message: &str, category: AuditCategory) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

/// Writes audit entries and usage facts to the log only
#[derive(Debug, Clone, Default)]
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, message: &str, category: AuditCategory) -> anyhow::Result<()> {
        match category {
            AuditCategory::RobotError | AuditCategory::ScriptError => warn!(target: "robobar::audit", ?category, "{}", message),
            _ => info!(target: "robobar::audit", ?category, "{}", message),
        }
        Ok(())
    }
}

#[async_trait]
impl UsageSink for TracingAudit {
    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()> {
        info!(
            target: "robobar::usage",
            subject = ?record.subject,
            context = ?record.context_id,
            "Usage recorded at {}",
            record.recorded_at
        );
        Ok(())
    }
}

/// Prints audit entries and usage facts as JSON lines on stdout
#[derive(Debug, Clone, Default)]
pub struct JsonAudit;

#[async_trait]
impl AuditSink for JsonAudit {
    async fn record(&self, message: &str, category: AuditCategory) -> anyhow::Result<()> {
        json_output::output::audit(message, category);
        Ok(())
    }
}

#[async_trait]
impl UsageSink for JsonAudit {
    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()> {
        json_output::output::usage(record.clone());
        Ok(())
    }
}

/// Keeps everything in memory so it can be inspected later
#[derive(Debug, Default)]
pub struct MemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn usage(&self) -> Vec<UsageRecord> {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Usage facts recorded for one subject
    pub fn usage_count(&self, subject: UsageSubject) -> usize {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|record| record.subject == subject)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, message: &str, category: AuditCategory) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(AuditEntry {
                message: message.to_string(),
                category,
            });
        Ok(())
    }
}

#[async_trait]
impl UsageSink for MemoryAudit {
    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()> {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}
