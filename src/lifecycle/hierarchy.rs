//! Hierarchy repair strategies, keyed by resource kind.
//!
//! A strategy runs inside the version transaction whenever a new version's
//! structural relationships differ from the previous latest version. A
//! validation failure aborts the version cleanly; a fatal failure is
//! propagated as-is since partial hierarchy state must not be masked.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LifecycleError, ValidationErrors};
use crate::store::StoreTransaction;
use crate::types::{Resource, ResourceKind};

/// Field that hierarchy validation errors are reported under.
pub const PARENT_FIELD: &str = "parent_concept_urls";

/// Failure of a repair pass.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// Malformed relationships; the version is rejected.
    #[error("invalid hierarchy: {0}")]
    Validation(ValidationErrors),
    /// Inconsistent state that must not be masked.
    #[error("{0}")]
    Fatal(String),
}

impl From<RepairError> for LifecycleError {
    fn from(e: RepairError) -> Self {
        match e {
            RepairError::Validation(errors) => Self::Validation(errors),
            RepairError::Fatal(message) => Self::Fatal(message),
        }
    }
}

/// Resource-kind-specific hierarchy repair.
#[async_trait]
pub trait HierarchyRepair<Tx: StoreTransaction>: Send + Sync {
    /// Reconcile relationships of `current` (and `previous`, if any) in `tx`.
    async fn repair(
        &self,
        tx: &mut Tx,
        previous: Option<&Resource>,
        current: &Resource,
    ) -> Result<(), RepairError>;
}

/// Concept hierarchy strategy.
///
/// Parents are logical ids, so children keep pointing at their parent group
/// across versions and nothing needs rewriting. The pass checks that every
/// parent is a concept owned by the same container and is not the concept
/// itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConceptHierarchyRepair;

#[async_trait]
impl<Tx: StoreTransaction> HierarchyRepair<Tx> for ConceptHierarchyRepair {
    async fn repair(
        &self,
        tx: &mut Tx,
        previous: Option<&Resource>,
        current: &Resource,
    ) -> Result<(), RepairError> {
        let Resource::Concept(concept) = current else {
            return Ok(());
        };
        let known_parents = previous
            .and_then(Resource::as_concept)
            .map(|p| p.parent_concepts.clone())
            .unwrap_or_default();

        let mut errors = ValidationErrors::new();
        for parent in &concept.parent_concepts {
            if *parent == concept.versioned_object_id() {
                errors.add(PARENT_FIELD, "A concept cannot be its own parent.");
                continue;
            }
            let row = tx
                .get(parent)
                .await
                .map_err(|e| RepairError::Fatal(e.to_string()))?;
            match row {
                Some(Resource::Concept(p)) if p.info.parent == concept.info.parent => {}
                Some(Resource::Concept(p)) => {
                    errors.add(
                        PARENT_FIELD,
                        format!("Parent concept {} must belong to the same source.", p.mnemonic),
                    );
                }
                Some(Resource::Mapping(_)) => {
                    errors.add(PARENT_FIELD, format!("{parent} is not a concept."));
                }
                None if known_parents.contains(parent) => {
                    return Err(RepairError::Fatal(format!(
                        "parent concept {parent} of {} vanished during version creation",
                        concept.mnemonic
                    )));
                }
                None => {
                    errors.add(PARENT_FIELD, format!("Parent concept {parent} does not exist."));
                }
            }
        }
        errors.into_result().map_err(RepairError::Validation)
    }
}

/// Strategies by resource kind.
pub struct HierarchyRepairRegistry<Tx: StoreTransaction> {
    strategies: BTreeMap<ResourceKind, Arc<dyn HierarchyRepair<Tx>>>,
}

impl<Tx: StoreTransaction> HierarchyRepairRegistry<Tx> {
    /// Registry with no strategies.
    pub fn empty() -> Self {
        Self { strategies: BTreeMap::new() }
    }

    /// Registry with the concept strategy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(ResourceKind::Concept, Arc::new(ConceptHierarchyRepair));
        registry
    }

    /// Set the strategy for a kind, replacing any previous one.
    pub fn register(&mut self, kind: ResourceKind, strategy: Arc<dyn HierarchyRepair<Tx>>) {
        self.strategies.insert(kind, strategy);
    }

    /// Strategy for a kind.
    pub fn get(&self, kind: ResourceKind) -> Option<&Arc<dyn HierarchyRepair<Tx>>> {
        self.strategies.get(&kind)
    }
}

impl<Tx: StoreTransaction> Default for HierarchyRepairRegistry<Tx> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, InMemoryTransaction, ResourceStore};
    use crate::types::{Concept, Container, LocalizedText};

    #[tokio::test]
    async fn test_concept_parents_validated() {
        let store = InMemoryStore::new();
        let source = Container::source("S", "/orgs/O/sources/S/");
        let other = Container::source("T", "/orgs/O/sources/T/");
        let parent = Concept::new(source.id, "P", "Misc", "N/A");
        let foreign = Concept::new(other.id, "F", "Misc", "N/A");
        store.put(parent.clone());
        store.put(foreign.clone());

        let mut child = Concept::new(source.id, "C", "Misc", "N/A").with_parent(parent.versioned_object_id());
        let repair = ConceptHierarchyRepair;
        let mut tx: InMemoryTransaction = store.begin().await.unwrap();
        repair.repair(&mut tx, None, &child.clone().into()).await.unwrap();

        child = child.with_parent(foreign.versioned_object_id());
        let self_id = child.versioned_object_id();
        child = child.with_parent(self_id);
        let err = repair.repair(&mut tx, None, &child.into()).await.unwrap_err();
        let RepairError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert_eq!(errors.get(PARENT_FIELD).map(|m| m.len()), Some(2));
    }

    #[tokio::test]
    async fn test_vanished_parent_is_fatal() {
        let store = InMemoryStore::new();
        let source = Container::source("S", "/orgs/O/sources/S/");
        let ghost = Concept::new(source.id, "G", "Misc", "N/A");
        let previous = Concept::new(source.id, "C", "Misc", "N/A").with_parent(ghost.versioned_object_id());
        let current = previous.clone().with_description(LocalizedText::new("en", "changed"));

        let mut tx = store.begin().await.unwrap();
        let err = ConceptHierarchyRepair
            .repair(&mut tx, Some(&previous.into()), &current.into())
            .await
            .unwrap_err();
        assert!(matches!(err, RepairError::Fatal(_)));

        let registry: HierarchyRepairRegistry<InMemoryTransaction> = HierarchyRepairRegistry::with_defaults();
        assert!(registry.get(ResourceKind::Concept).is_some());
        assert!(registry.get(ResourceKind::Mapping).is_none());
    }
}
