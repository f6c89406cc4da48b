//! Bundles: a cascade run packaged for clients.
//!
//! | operation | result |
//! |-----------|--------|
//! | [`Bundle::cascade`] | flat or hierarchy closure, picked by [`ViewMode`] |
//! | [`Bundle::entries`] | serialized concepts then mappings |
//! | [`Bundle::to_json`] | `searchset` envelope |
//! | [`clone_into`] | copy of a closure into another source |

pub mod clone;
pub mod serializer;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::cascade::{CascadeEngine, CascadeError, CascadeNode, CascadeOptions};
use crate::error::LifecycleError;
use crate::store::GraphStore;
use crate::types::{Concept, ContainerId, Mapping, ResourceId};

pub use crate::cascade::ViewMode;
pub use clone::{clone_into, CloneBundle, CloneFailure};
pub use serializer::{DefaultEntrySerializer, EntrySerializer, Verbosity};

/// Errors that abort a whole bundle run.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Cascade failure.
    #[error(transparent)]
    Cascade(#[from] CascadeError),
    /// Lifecycle failure outside per-item clone work.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Clone destination is not a source HEAD.
    #[error("Cannot clone into {0}: destination must be the HEAD of a source")]
    InvalidDestination(ContainerId),
    /// Store failure.
    #[error("Store error: {0}")]
    Store(String),
    /// Options could not be fingerprinted.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BundleError {
    /// Create a store error from any error type.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::Store(e.to_string())
    }
}

/// Bundle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleMeta {
    /// Last update of the root concept.
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

/// Result of one cascade, ready to render.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Root concept.
    pub root: Concept,
    /// Options the bundle was computed with.
    pub options: CascadeOptions,
    /// Flat concepts. Empty in hierarchy view.
    pub concepts: Vec<Concept>,
    /// Flat mappings. Empty in hierarchy view.
    pub mappings: Vec<Mapping>,
    /// Tree. Set in hierarchy view only.
    pub hierarchy: Option<CascadeNode>,
    /// Entry detail level.
    pub verbosity: Verbosity,
    /// Url of the request that produced the bundle.
    pub requested_url: Option<String>,
}

impl Bundle {
    /// Run the cascade picked by `options.view`.
    pub async fn cascade<S: GraphStore>(
        engine: &CascadeEngine<S>,
        container: &ContainerId,
        root: &ResourceId,
        options: CascadeOptions,
    ) -> Result<Self, BundleError> {
        let bundle = match options.view {
            ViewMode::Flat => {
                let result = engine.cascade(container, root, &options).await?;
                Self {
                    root: result.root,
                    concepts: result.concepts,
                    mappings: result.mappings,
                    hierarchy: None,
                    options,
                    verbosity: Verbosity::default(),
                    requested_url: None,
                }
            }
            ViewMode::Hierarchy => {
                let tree = engine.cascade_as_hierarchy(container, root, &options).await?;
                Self {
                    root: tree.concept.clone(),
                    concepts: Vec::new(),
                    mappings: Vec::new(),
                    hierarchy: Some(tree),
                    options,
                    verbosity: Verbosity::default(),
                    requested_url: None,
                }
            }
        };
        tracing::debug!(
            root = %bundle.root.mnemonic,
            view = ?bundle.options.view,
            total = bundle.total(),
            "Bundle computed"
        );
        Ok(bundle)
    }

    /// Set the entry detail level.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set the requesting url.
    pub fn with_requested_url(mut self, url: impl Into<String>) -> Self {
        self.requested_url = Some(url.into());
        self
    }

    /// Bundle id: the root mnemonic.
    pub fn id(&self) -> &str {
        &self.root.mnemonic
    }

    /// Concepts plus mappings. Zero in hierarchy view.
    pub fn total(&self) -> usize {
        self.concepts.len() + self.mappings.len()
    }

    /// Flat concepts.
    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    /// Flat mappings.
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Metadata block.
    pub fn meta(&self) -> BundleMeta {
        BundleMeta {
            last_updated: self.root.info.updated_at,
        }
    }

    /// Cache key: root plus the options fingerprint.
    pub fn cache_key(&self) -> Result<String, BundleError> {
        Ok(format!("{}:{}", self.root.versioned_object_id(), self.options.params_hash()?))
    }

    /// Serialized concepts, then mappings.
    pub fn entries(&self, serializer: &dyn EntrySerializer) -> Vec<Value> {
        self.concepts
            .iter()
            .map(|c| serializer.concept(c, self.verbosity))
            .chain(self.mappings.iter().map(|m| serializer.mapping(m, self.verbosity)))
            .collect()
    }

    /// The `searchset` envelope.
    pub fn to_json(&self, serializer: &dyn EntrySerializer) -> Value {
        let mut envelope = Map::new();
        envelope.insert("resourceType".into(), json!("Bundle"));
        envelope.insert("type".into(), json!("searchset"));
        envelope.insert("id".into(), json!(self.id()));
        envelope.insert("meta".into(), json!(self.meta()));
        envelope.insert("total".into(), json!(self.total()));
        match &self.hierarchy {
            Some(tree) => {
                envelope.insert("hierarchy".into(), serializer.node(tree, self.verbosity));
            }
            None => {
                envelope.insert("entry".into(), Value::Array(self.entries(serializer)));
            }
        }
        envelope.insert("requested_url".into(), json!(self.requested_url));
        Value::Object(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::KernelConfig;
    use crate::store::InMemoryStore;
    use crate::types::{ConceptRef, Container};

    async fn bundle(view: ViewMode) -> Bundle {
        let store = InMemoryStore::new();
        let source = Container::source("S", "/orgs/O/sources/S/");
        store.add_container(source.clone());
        let a = Concept::new(source.id, "A", "Misc", "N/A");
        let b = Concept::new(source.id, "B", "Misc", "N/A");
        store.put(a.clone());
        store.put(b.clone());
        store.put(Mapping::new(source.id, "M1", "SAME-AS", ConceptRef::local(&a), ConceptRef::local(&b)));

        let engine = CascadeEngine::new(Arc::new(store), KernelConfig::default());
        let options = CascadeOptions {
            view,
            ..CascadeOptions::default()
        };
        Bundle::cascade(&engine, &source.id, &a.versioned_object_id(), options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_flat_envelope() {
        let bundle = bundle(ViewMode::Flat).await.with_requested_url("/concepts/A/$cascade/");
        let json = bundle.to_json(&DefaultEntrySerializer);
        assert_eq!(json["resourceType"], "Bundle");
        assert_eq!(json["type"], "searchset");
        assert_eq!(json["id"], "A");
        assert_eq!(json["total"], 3);
        let entries = json["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2]["type"], "Mapping");
        assert!(json.get("hierarchy").is_none());
        assert_eq!(json["requested_url"], "/concepts/A/$cascade/");
        assert!(json["meta"]["lastUpdated"].is_string());
    }

    #[tokio::test]
    async fn test_hierarchy_envelope() {
        let bundle = bundle(ViewMode::Hierarchy).await.with_verbosity(Verbosity::Brief);
        let json = bundle.to_json(&DefaultEntrySerializer);
        assert_eq!(json["total"], 0);
        assert!(json.get("entry").is_none());
        let root = &json["hierarchy"];
        assert_eq!(root["id"], "A");
        assert_eq!(root["terminal"], false);
        let entries = root["entries"].as_array().unwrap();
        assert_eq!(entries[0]["type"], "Mapping");
        assert_eq!(entries[1]["id"], "B");
        assert_eq!(entries[1]["terminal"], true);
    }

    #[tokio::test]
    async fn test_cache_key_tracks_options() {
        let flat = bundle(ViewMode::Flat).await;
        let tree = bundle(ViewMode::Hierarchy).await;
        assert_ne!(flat.cache_key().unwrap(), tree.cache_key().unwrap());
    }
}
