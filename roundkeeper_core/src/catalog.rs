//! Entity Catalog - symbolic item ids to spawnable templates.
//!
//! The catalog itself is an external collaborator (an asset table in a real
//! deployment). The host only depends on the [`EntityCatalog`] trait;
//! [`StaticCatalog`] is the config-backed implementation used by the
//! simulation harness and tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::CatalogConfig;
use crate::geometry::Pose;

/// Index of a template in the catalog; this is what goes over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateIndex(pub u32);

impl std::fmt::Display for TemplateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named attachment point on a template, relative to the template origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub name: String,

    #[serde(default)]
    pub local: Pose,
}

/// A spawnable template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// Wire index
    pub index: TemplateIndex,

    /// Symbolic identifier (e.g. "crate_small")
    pub item_id: String,

    /// Attachment points exposed by entities spawned from this template
    pub anchors: Vec<Anchor>,
}

impl Template {
    /// Finds an anchor by exact name.
    pub fn anchor(&self, name: &str) -> Option<&Anchor> {
        self.anchors.iter().find(|a| a.name == name)
    }
}

/// Catalog lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("Unknown item: {0}")]
    UnknownItem(String),

    #[error("Unknown template index: {0}")]
    UnknownIndex(TemplateIndex),

    #[error("Duplicate item id: {0}")]
    DuplicateItem(String),
}

/// Maps symbolic ids to templates.
pub trait EntityCatalog: Send + Sync {
    /// Resolves a symbolic id to its template.
    fn resolve(&self, item_id: &str) -> Result<&Template, CatalogError>;

    /// Looks up a template by wire index.
    fn template(&self, index: TemplateIndex) -> Result<&Template, CatalogError>;

    /// Number of templates.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory catalog; template index = position in the entry list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    templates: Vec<Template>,
    by_id: HashMap<String, usize>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from configuration.
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for entry in &config.entries {
            catalog.register(&entry.item_id, entry.anchors.clone())?;
        }
        Ok(catalog)
    }

    /// Adds a template and returns its index.
    pub fn register(
        &mut self,
        item_id: &str,
        anchors: Vec<Anchor>,
    ) -> Result<TemplateIndex, CatalogError> {
        if self.by_id.contains_key(item_id) {
            return Err(CatalogError::DuplicateItem(item_id.to_string()));
        }

        let index = TemplateIndex(self.templates.len() as u32);
        self.by_id.insert(item_id.to_string(), self.templates.len());
        self.templates.push(Template {
            index,
            item_id: item_id.to_string(),
            anchors,
        });
        Ok(index)
    }
}

impl EntityCatalog for StaticCatalog {
    fn resolve(&self, item_id: &str) -> Result<&Template, CatalogError> {
        self.by_id
            .get(item_id)
            .and_then(|&i| self.templates.get(i))
            .ok_or_else(|| CatalogError::UnknownItem(item_id.to_string()))
    }

    fn template(&self, index: TemplateIndex) -> Result<&Template, CatalogError> {
        self.templates
            .get(index.0 as usize)
            .ok_or(CatalogError::UnknownIndex(index))
    }

    fn len(&self) -> usize {
        self.templates.len()
    }
}
