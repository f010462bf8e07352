//! Content catalog seam.
//!
//! Pricing metadata belongs to the catalog; the ledger only reads it.

use serde::Deserialize;
use std::collections::HashMap;

use crate::gate::GatePolicy;
use crate::model::ContentUnitId;

/// Read-only pricing metadata for content units.
pub trait Catalog: Send + Sync {
    /// `None` when the unit does not exist.
    fn gate_policy(&self, unit: &str) -> Option<GatePolicy>;

    /// Whether the unit is the designated free unit of its story.
    fn is_free_unit(&self, unit: &str) -> bool;

    /// 1-based position of the unit in its story (chapter or message index).
    fn progress_index(&self, unit: &str) -> Option<u32>;
}

/// One content unit as configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentUnit {
    pub id: ContentUnitId,
    #[serde(default = "first_position")]
    pub position: u32,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub policy: GatePolicy,
}

fn first_position() -> u32 {
    1
}

/// In-memory catalog, loaded from configuration or built in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    units: HashMap<ContentUnitId, ContentUnit>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: ContentUnit) -> Self {
        self.insert(unit);
        self
    }

    /// Returns the unit previously registered under the same id.
    pub fn insert(&mut self, unit: ContentUnit) -> Option<ContentUnit> {
        self.units.insert(unit.id.clone(), unit)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl FromIterator<ContentUnit> for StaticCatalog {
    fn from_iter<I: IntoIterator<Item = ContentUnit>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for unit in iter {
            catalog.insert(unit);
        }
        catalog
    }
}

impl Catalog for StaticCatalog {
    fn gate_policy(&self, unit: &str) -> Option<GatePolicy> {
        self.units.get(unit).map(|u| u.policy.clone())
    }

    fn is_free_unit(&self, unit: &str) -> bool {
        self.units.get(unit).is_some_and(|u| u.free)
    }

    fn progress_index(&self, unit: &str) -> Option<u32> {
        self.units.get(unit).map(|u| u.position)
    }
}
