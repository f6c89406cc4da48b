//! Cloning a concept's closure into another source.
//!
//! Best-effort per item: each concept and mapping goes through
//! [`VersionManager::create`] in its own transaction. Items whose mnemonic
//! already exists in the destination are skipped; failures are collected and
//! do not undo items already cloned.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::cascade::{CascadeEngine, CascadeError, CascadeOptions, ViewMode};
use crate::error::{LifecycleError, ValidationErrors, ALL_FIELDS};
use crate::lifecycle::VersionManager;
use crate::store::ResourceStore;
use crate::types::{
    Concept, ConceptRef, Container, ContainerId, Mapping, ResourceId, ResourceKind, VersionInfo,
};
use super::BundleError;

/// One item that could not be cloned.
#[derive(Debug, Clone, Serialize)]
pub struct CloneFailure {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Mnemonic in the source.
    pub mnemonic: String,
    /// Field errors, or a single `__all__` message.
    pub errors: ValidationErrors,
}

impl CloneFailure {
    fn new(kind: ResourceKind, mnemonic: &str, error: &LifecycleError) -> Self {
        Self {
            kind,
            mnemonic: mnemonic.to_string(),
            errors: error
                .field_errors()
                .unwrap_or_else(|| ValidationErrors::single(ALL_FIELDS, error.to_string())),
        }
    }
}

/// Outcome of a clone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CloneBundle {
    /// Destination counterpart of the cloned concept.
    pub root: Option<Concept>,
    /// HEAD rows created in the destination.
    pub added_concepts: Vec<Concept>,
    /// HEAD rows created in the destination.
    pub added_mappings: Vec<Mapping>,
    /// Mnemonics already present in the destination.
    pub skipped: Vec<String>,
    /// Items that failed.
    pub failures: Vec<CloneFailure>,
}

impl CloneBundle {
    /// Number of items added.
    pub fn total(&self) -> usize {
        self.added_concepts.len() + self.added_mappings.len()
    }

    /// True if no item failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Order concepts so that parents come before their children.
///
/// Parents outside the set are ignored. Members of a parent cycle keep their
/// input order after everything else.
fn parents_first(concepts: Vec<Concept>) -> Vec<Concept> {
    let ids: BTreeSet<ResourceId> = concepts.iter().map(Concept::versioned_object_id).collect();
    let mut pending: Vec<usize> = concepts
        .iter()
        .map(|c| c.parent_concepts.iter().filter(|p| ids.contains(p)).count())
        .collect();
    let mut children: HashMap<ResourceId, Vec<usize>> = HashMap::new();
    for (idx, concept) in concepts.iter().enumerate() {
        for parent in concept.parent_concepts.iter().filter(|p| ids.contains(p)) {
            children.entry(*parent).or_default().push(idx);
        }
    }

    let mut ready: VecDeque<usize> = (0..concepts.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(concepts.len());
    let mut placed = vec![false; concepts.len()];
    while let Some(idx) = ready.pop_front() {
        placed[idx] = true;
        order.push(idx);
        for &child in children.get(&concepts[idx].versioned_object_id()).into_iter().flatten() {
            pending[child] -= 1;
            if pending[child] == 0 {
                ready.push_back(child);
            }
        }
    }
    order.extend((0..concepts.len()).filter(|&i| !placed[i]));

    let mut slots: Vec<Option<Concept>> = concepts.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn remap_endpoint(
    endpoint: &ConceptRef,
    ids: &BTreeMap<ResourceId, ResourceId>,
    origin: &Container,
) -> ConceptRef {
    match endpoint.concept {
        Some(concept) => match ids.get(&concept) {
            Some(mapped) => ConceptRef {
                concept: Some(*mapped),
                source_url: None,
                source_version: None,
                code: endpoint.code.clone(),
                name: endpoint.name.clone(),
            },
            None => ConceptRef {
                concept: None,
                source_url: Some(endpoint.source_url.clone().unwrap_or_else(|| origin.url.clone())),
                source_version: endpoint.source_version.clone(),
                code: endpoint.code.clone(),
                name: endpoint.name.clone(),
            },
        },
        None => endpoint.clone(),
    }
}

/// Clone the flat closure of `concept` in `origin` into the source HEAD `destination`.
pub async fn clone_into<S: ResourceStore>(
    engine: &CascadeEngine<S>,
    manager: &VersionManager<S>,
    origin: &ContainerId,
    concept: &ResourceId,
    destination: &ContainerId,
    options: &CascadeOptions,
    user: &str,
) -> Result<CloneBundle, BundleError> {
    let store = engine.store();
    let target = store
        .get_container(destination)
        .await
        .map_err(BundleError::from_store)?
        .ok_or(BundleError::InvalidDestination(*destination))?;
    if !(target.is_source() && target.is_head()) {
        return Err(BundleError::InvalidDestination(*destination));
    }
    let origin_row = store
        .get_container(origin)
        .await
        .map_err(BundleError::from_store)?
        .ok_or(CascadeError::ContainerNotFound(*origin))?;

    let options = CascadeOptions {
        view: ViewMode::Flat,
        include_self: true,
        ..options.clone()
    };
    let closure = engine.cascade(origin, concept, &options).await?;

    let existing_concepts: BTreeMap<String, ResourceId> = store
        .container_concepts(destination)
        .await
        .map_err(BundleError::from_store)?
        .into_iter()
        .map(|c| (c.mnemonic.clone(), c.versioned_object_id()))
        .collect();
    let existing_mappings: BTreeSet<String> = store
        .container_mappings(destination)
        .await
        .map_err(BundleError::from_store)?
        .into_iter()
        .map(|m| m.mnemonic)
        .collect();

    let mut outcome = CloneBundle::default();
    let mut ids: BTreeMap<ResourceId, ResourceId> = BTreeMap::new();
    let mut pending = Vec::new();
    for original in closure.concepts {
        match existing_concepts.get(&original.mnemonic) {
            Some(existing) => {
                ids.insert(original.versioned_object_id(), *existing);
                outcome.skipped.push(original.mnemonic);
            }
            None => pending.push(original),
        }
    }

    let ordered = parents_first(pending);
    let drafts: Vec<(ResourceId, Concept)> = ordered
        .into_iter()
        .map(|original| {
            let vid = original.versioned_object_id();
            let mut draft = original;
            let retired = draft.info.retired;
            draft.info = VersionInfo::new(target.id);
            draft.info.retired = retired;
            ids.insert(vid, draft.info.id);
            (vid, draft)
        })
        .collect();

    for (vid, mut draft) in drafts {
        let parents = std::mem::take(&mut draft.parent_concepts);
        draft.parent_concepts = parents.iter().filter_map(|p| ids.get(p).copied()).collect();
        let mnemonic = draft.mnemonic.clone();
        match manager.create(draft, Some(user)).await {
            Ok(head) => outcome.added_concepts.push(head),
            Err(e) => {
                tracing::warn!(kind = "Concept", mnemonic = %mnemonic, error = %e, "Clone item failed");
                ids.remove(&vid);
                outcome.failures.push(CloneFailure::new(ResourceKind::Concept, &mnemonic, &e));
            }
        }
    }

    for original in closure.mappings {
        if existing_mappings.contains(&original.mnemonic) {
            outcome.skipped.push(original.mnemonic.clone());
            continue;
        }
        let mut draft = original;
        let retired = draft.info.retired;
        draft.info = VersionInfo::new(target.id);
        draft.info.retired = retired;
        draft.from_concept = remap_endpoint(&draft.from_concept, &ids, &origin_row);
        draft.to_concept = remap_endpoint(&draft.to_concept, &ids, &origin_row);
        let mnemonic = draft.mnemonic.clone();
        match manager.create(draft, Some(user)).await {
            Ok(head) => outcome.added_mappings.push(head),
            Err(e) => {
                tracing::warn!(kind = "Mapping", mnemonic = %mnemonic, error = %e, "Clone item failed");
                outcome.failures.push(CloneFailure::new(ResourceKind::Mapping, &mnemonic, &e));
            }
        }
    }

    if let Some(root) = ids.get(&closure.root.versioned_object_id()) {
        outcome.root = store
            .resolve_concept(destination, root)
            .await
            .map_err(BundleError::from_store)?;
    }

    tracing::info!(
        destination = %target.url,
        added = outcome.total(),
        skipped = outcome.skipped.len(),
        failed = outcome.failures.len(),
        "Cloned closure"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents_first_ordering() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let root = Concept::new(source.id, "ROOT", "Misc", "N/A");
        let mid = Concept::new(source.id, "MID", "Misc", "N/A").with_parent(root.versioned_object_id());
        let leaf = Concept::new(source.id, "LEAF", "Misc", "N/A")
            .with_parent(mid.versioned_object_id())
            .with_parent(ResourceId::generate());

        let ordered = parents_first(vec![leaf, mid, root]);
        let mnemonics: Vec<&str> = ordered.iter().map(|c| c.mnemonic.as_str()).collect();
        assert_eq!(mnemonics, vec!["ROOT", "MID", "LEAF"]);
    }

    #[test]
    fn test_parent_cycle_keeps_everything() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let mut a = Concept::new(source.id, "A", "Misc", "N/A");
        let b = Concept::new(source.id, "B", "Misc", "N/A").with_parent(a.versioned_object_id());
        a = a.with_parent(b.versioned_object_id());
        let free = Concept::new(source.id, "F", "Misc", "N/A");
        let ordered = parents_first(vec![a, b, free]);
        let mnemonics: Vec<&str> = ordered.iter().map(|c| c.mnemonic.as_str()).collect();
        assert_eq!(mnemonics, vec!["F", "A", "B"]);
    }

    #[test]
    fn test_unmapped_endpoint_becomes_external() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let a = Concept::new(source.id, "A", "Misc", "N/A");
        let local = ConceptRef::local(&a);

        let external = remap_endpoint(&local, &BTreeMap::new(), &source);
        assert_eq!(external.concept, None);
        assert_eq!(external.source_url.as_deref(), Some("/orgs/O/sources/S/"));
        assert_eq!(external.code, "A");

        let new_id = ResourceId::generate();
        let ids = BTreeMap::from([(a.versioned_object_id(), new_id)]);
        assert_eq!(remap_endpoint(&local, &ids, &source).concept, Some(new_id));
    }
}
