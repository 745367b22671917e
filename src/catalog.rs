//! Read-only script catalog
//!
//! Inbound collaborator interface: for a drink or a set of ingredients,
//! return the robot programs to run with their sequence numbers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use crate::{Result, RobotError};

pub type DrinkId = u32;
pub type IngredientId = u32;

/// One program in a drink or ingredient recipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub name: String,
    pub sequence: u32,
}

/// Everything needed to pour one drink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrinkScripts {
    pub id: DrinkId,
    #[serde(default)]
    pub name: Option<String>,
    /// Contents of the drink; the same ingredient may appear more than once
    #[serde(default)]
    pub ingredients: Vec<IngredientId>,
    pub scripts: Vec<ScriptStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngredientScripts {
    pub id: IngredientId,
    #[serde(default)]
    pub name: Option<String>,
    pub scripts: Vec<ScriptStep>,
}

#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    /// The drink's recipe, or `None` if the id is unknown
    async fn drink(&self, drink_id: DrinkId) -> Result<Option<DrinkScripts>>;

    /// Recipes for the known ids among `ids`; unknown ids are left out
    async fn ingredients(&self, ids: &[IngredientId]) -> Result<Vec<IngredientScripts>>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CatalogFile {
    #[serde(default)]
    drinks: Vec<DrinkScripts>,
    #[serde(default)]
    ingredients: Vec<IngredientScripts>,
}

/// In-memory catalog, optionally loaded from YAML
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    drinks: HashMap<DrinkId, DrinkScripts>,
    ingredients: HashMap<IngredientId, IngredientScripts>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_path(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RobotError::Catalog(format!("Failed to read {}: {}", path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(contents)?;

        let mut catalog = Self::new();
        for ingredient in file.ingredients {
            if catalog.ingredients.contains_key(&ingredient.id) {
                return Err(RobotError::Catalog(format!("Duplicate ingredient id {}", ingredient.id)));
            }
            catalog = catalog.with_ingredient(ingredient);
        }
        for drink in file.drinks {
            if catalog.drinks.contains_key(&drink.id) {
                return Err(RobotError::Catalog(format!("Duplicate drink id {}", drink.id)));
            }
            catalog = catalog.with_drink(drink);
        }
        Ok(catalog)
    }

    pub fn with_drink(mut self, drink: DrinkScripts) -> Self {
        self.drinks.insert(drink.id, drink);
        self
    }

    pub fn with_ingredient(mut self, ingredient: IngredientScripts) -> Self {
        self.ingredients.insert(ingredient.id, ingredient);
        self
    }

    pub fn drink_count(&self) -> usize {
        self.drinks.len()
    }

    pub fn ingredient_count(&self) -> usize {
        self.ingredients.len()
    }
}

#[async_trait]
impl ScriptCatalog for StaticCatalog {
    async fn drink(&self, drink_id: DrinkId) -> Result<Option<DrinkScripts>> {
        Ok(self.drinks.get(&drink_id).cloned())
    }

    async fn ingredients(&self, ids: &[IngredientId]) -> Result<Vec<IngredientScripts>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.ingredients.get(id).cloned())
            .collect())
    }
}
