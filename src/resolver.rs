//! Script Resolver - turns drink and ingredient requests into queue entries
//!
//! Looks up the programs for a request in the [`ScriptCatalog`], orders them
//! by sequence number, hands them to the [`ExecutionQueue`] and records which
//! drinks and ingredients were asked for.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::audit::{UsageRecord, UsageSink, UsageSubject};
use crate::catalog::{DrinkId, IngredientId, ScriptCatalog, ScriptStep};
use crate::queue::ExecutionQueue;
use crate::{Result, RobotError};

pub struct ScriptResolver {
    queue: ExecutionQueue,
    catalog: Arc<dyn ScriptCatalog>,
    usage: Arc<dyn UsageSink>,
    /// Event id attached to usage facts
    context: RwLock<Option<u32>>,
}

impl ScriptResolver {
    pub fn new(queue: ExecutionQueue, catalog: Arc<dyn ScriptCatalog>, usage: Arc<dyn UsageSink>) -> Self {
        Self {
            queue,
            catalog,
            usage,
            context: RwLock::new(None),
        }
    }

    pub fn set_event_context(&self, event_id: Option<u32>) {
        *self
            .context
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = event_id;
        match event_id {
            Some(id) => info!("Usage now attributed to event {}", id),
            None => info!("Usage no longer attributed to an event"),
        }
    }

    pub fn event_context(&self) -> Option<u32> {
        *self.context.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submit explicit program names, in the order given
    pub async fn run_scripts<I, S>(&self, names: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(RobotError::InvalidRequest("no scripts given".to_string()));
        }
        if let Some(blank) = names.iter().position(|name| name.trim().is_empty()) {
            return Err(RobotError::InvalidRequest(format!("script name {} is blank", blank + 1)));
        }

        let names: Vec<String> = names.iter().map(|name| name.trim().to_string()).collect();
        self.queue.submit(names.clone()).await;
        Ok(names)
    }

    /// Submit the programs for each ingredient, one ingredient after another
    pub async fn run_for_ingredients(&self, ids: &[IngredientId]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Err(RobotError::InvalidRequest("no ingredient ids given".to_string()));
        }

        let found = self.catalog.ingredients(ids).await?;
        if found.is_empty() {
            return Err(RobotError::InvalidRequest(format!(
                "no scripts for ingredients {:?}",
                ids
            )));
        }
        if found.len() < ids.len() {
            warn!("Some of ingredients {:?} are unknown and were skipped", ids);
        }

        let known: Vec<IngredientId> = found.iter().map(|ingredient| ingredient.id).collect();
        let scripts: Vec<String> = found
            .into_iter()
            .flat_map(|ingredient| ordered(ingredient.scripts))
            .collect();
        if scripts.is_empty() {
            return Err(RobotError::InvalidRequest(format!(
                "no scripts for ingredients {:?}",
                ids
            )));
        }

        self.queue.submit(scripts.clone()).await;
        self.record(known.into_iter().map(UsageSubject::Ingredient)).await;
        Ok(scripts)
    }

    /// Submit the programs that make one drink
    pub async fn run_for_drink(&self, drink_id: DrinkId) -> Result<Vec<String>> {
        let drink = self
            .catalog
            .drink(drink_id)
            .await?
            .ok_or_else(|| RobotError::NotFound(format!("drink {}", drink_id)))?;

        let scripts = ordered(drink.scripts);
        if scripts.is_empty() {
            return Err(RobotError::InvalidRequest(format!("drink {} has no scripts", drink_id)));
        }

        info!(
            "Pouring drink {}{}",
            drink_id,
            drink.name.map(|name| format!(" ({})", name)).unwrap_or_default()
        );
        self.queue.submit(scripts.clone()).await;

        let subjects = std::iter::once(UsageSubject::Drink(drink_id))
            .chain(drink.ingredients.into_iter().map(UsageSubject::Ingredient));
        self.record(subjects).await;
        Ok(scripts)
    }

    /// Record one usage fact per distinct subject
    async fn record<I: IntoIterator<Item = UsageSubject>>(&self, subjects: I) {
        let context_id = self.event_context();
        let recorded_at = Utc::now();
        let mut seen = HashSet::new();

        for subject in subjects {
            if !seen.insert(subject) {
                continue;
            }
            let record = UsageRecord {
                subject,
                context_id,
                recorded_at,
            };
            if let Err(e) = self.usage.record_usage(&record).await {
                warn!("Failed to record usage of {:?}: {}", subject, e);
            }
        }
    }
}

/// Program names sorted by sequence number; ties keep catalog order
fn ordered(mut steps: Vec<ScriptStep>) -> Vec<String> {
    steps.sort_by_key(|step| step.sequence);
    steps.into_iter().map(|step| step.name).collect()
}
