//! Bottle state manager (BSM).

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use raind_common::{Document, JsonStore, RaindError, RaindResult};
use raind_network::policy::PolicyKind;
use serde::{Deserialize, Serialize};

use crate::spec::ServiceSpec;

/// A policy installed on behalf of a bottle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottlePolicy {
    /// Policy id in the policy store.
    pub id: String,
    /// Policy list.
    #[serde(rename = "type")]
    pub kind: PolicyKind,
}

/// A recorded bottle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
    /// Bottle id.
    pub bottle_id: String,
    /// Unique name.
    pub bottle_name: String,
    /// Declared services.
    pub services: BTreeMap<String, ServiceSpec>,
    /// Dependency order.
    pub start_order: Vec<String>,
    /// Container id per service.
    #[serde(default)]
    pub containers: BTreeMap<String, String>,
    /// Policies installed for the bottle.
    #[serde(default)]
    pub policies: Vec<BottlePolicy>,
    /// When the bottle was recorded.
    pub created_at: DateTime<Utc>,
}

/// The BSM document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleDocument {
    /// Schema version.
    pub version: String,
    /// Bottles by id.
    #[serde(default)]
    pub bottles: BTreeMap<String, Bottle>,
}

impl Default for BottleDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            bottles: BTreeMap::new(),
        }
    }
}

impl Document for BottleDocument {
    const VERSION: &'static str = "1";
}

/// File-backed bottle store.
#[derive(Debug)]
pub struct BottleStore {
    store: JsonStore<BottleDocument>,
}

impl BottleStore {
    /// Open the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Record a bottle.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::AlreadyUsed`] when the name is taken.
    pub fn insert(&self, bottle: Bottle) -> RaindResult<()> {
        self.store.update(|doc| {
            if doc
                .bottles
                .values()
                .any(|b| b.bottle_name == bottle.bottle_name)
            {
                return Err(RaindError::AlreadyUsed {
                    kind: "bottle",
                    name: bottle.bottle_name.clone(),
                });
            }
            doc.bottles.insert(bottle.bottle_id.clone(), bottle);
            Ok(())
        })
    }

    /// Whether a bottle is called `name`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn is_name_already_used(&self, name: &str) -> RaindResult<bool> {
        self.store
            .read(|doc| Ok(doc.bottles.values().any(|b| b.bottle_name == name)))
    }

    /// Bottle by id, falling back to name.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when nothing matches.
    pub fn resolve(&self, name_or_id: &str) -> RaindResult<Bottle> {
        self.store.read(|doc| {
            doc.bottles
                .get(name_or_id)
                .or_else(|| doc.bottles.values().find(|b| b.bottle_name == name_or_id))
                .cloned()
                .ok_or_else(|| RaindError::not_found("bottle", name_or_id))
        })
    }

    /// All bottles.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<Bottle>> {
        self.store.read(|doc| Ok(doc.bottles.values().cloned().collect()))
    }

    /// Replace the container map of a bottle.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn set_containers(&self, bottle_id: &str, containers: BTreeMap<String, String>) -> RaindResult<()> {
        self.store.update(|doc| {
            let bottle = doc
                .bottles
                .get_mut(bottle_id)
                .ok_or_else(|| RaindError::not_found("bottle", bottle_id))?;
            bottle.containers = containers;
            Ok(())
        })
    }

    /// Remove a bottle record.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn remove(&self, bottle_id: &str) -> RaindResult<Option<Bottle>> {
        self.store.update(|doc| Ok(doc.bottles.remove(bottle_id)))
    }
}
