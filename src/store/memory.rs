//! In-memory resource store for testing and embedding.
//!
//! Committed state lives behind a `parking_lot::RwLock`. A transaction keeps
//! its writes in a private overlay and applies them atomically on commit,
//! after checking the latest-version constraint for every group it touched.
//! Writer locks are `tokio` mutexes held until the transaction ends; an entry
//! leaves the lock table once no transaction holds or awaits it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use crate::types::{
    Concept, Container, ContainerId, Direction, Mapping, Resource, ResourceId, ResourceKind,
};
use super::{GraphStore, ResourceStore, StoreFailure, StoreTransaction};

/// Error type for the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryError {
    /// Resource row not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),
    /// Container not found.
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),
    /// A row with this id already exists.
    #[error("Resource already exists: {0}")]
    DuplicateId(ResourceId),
    /// Commit would leave more than one latest version in a group.
    #[error("More than one latest version for {0}")]
    LatestVersionConflict(ResourceId),
}

impl StoreFailure for InMemoryError {
    fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::DuplicateId(_) | Self::LatestVersionConflict(_))
    }
}

/// What a writer lock guards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum LockKey {
    Group(ResourceId),
    Mnemonic(ContainerId, ResourceKind, String),
}

type LockTable = Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<ContainerId, Container>,
    rows: BTreeMap<ResourceId, Resource>,
    members: BTreeMap<ContainerId, BTreeSet<ResourceId>>,
}

impl MemoryState {
    fn container(&self, id: &ContainerId) -> Result<&Container, InMemoryError> {
        self.containers.get(id).ok_or(InMemoryError::ContainerNotFound(*id))
    }

    /// Rows visible through a container, ordered by mnemonic then id.
    fn member_rows(&self, id: &ContainerId) -> Result<Vec<&Resource>, InMemoryError> {
        let container = self.container(id)?;
        let mut rows: Vec<&Resource> = if container.is_head() && container.is_source() {
            self.rows
                .values()
                .filter(|r| r.info().parent == container.id && r.info().is_head())
                .collect()
        } else {
            self.members
                .get(id)
                .map(|ids| ids.iter().filter_map(|rid| self.rows.get(rid)).collect())
                .unwrap_or_default()
        };
        rows.sort_by(|a, b| a.mnemonic().cmp(b.mnemonic()).then_with(|| a.id().cmp(&b.id())));
        Ok(rows)
    }

    fn concepts(&self, id: &ContainerId) -> Result<Vec<Concept>, InMemoryError> {
        Ok(self.member_rows(id)?.into_iter().filter_map(|r| r.as_concept().cloned()).collect())
    }

    fn mappings(&self, id: &ContainerId) -> Result<Vec<Mapping>, InMemoryError> {
        Ok(self.member_rows(id)?.into_iter().filter_map(|r| r.as_mapping().cloned()).collect())
    }
}

fn newest(mut concepts: Vec<Concept>) -> Option<Concept> {
    concepts.sort_by(|a, b| {
        b.info.is_latest_version
            .cmp(&a.info.is_latest_version)
            .then_with(|| b.info.updated_at.cmp(&a.info.updated_at))
    });
    concepts.into_iter().next()
}

/// In-memory resource store.
///
/// Cloning shares the underlying state. Uses BTreeMap/BTreeSet for
/// deterministic iteration order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    locks: LockTable,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a container row.
    pub fn add_container(&self, container: Container) {
        self.state.write().containers.insert(container.id, container);
    }

    /// Insert or replace a row directly, bypassing transactions.
    pub fn put(&self, resource: impl Into<Resource>) {
        let resource = resource.into();
        self.state.write().rows.insert(resource.id(), resource);
    }

    /// Add a row to a container's explicit membership.
    pub fn add_member(&self, container: &ContainerId, id: &ResourceId) {
        self.state.write().members.entry(*container).or_default().insert(*id);
    }

    /// Number of stored rows.
    pub fn num_rows(&self) -> usize {
        self.state.read().rows.len()
    }

    /// Entries in the writer lock table.
    pub fn lock_table_len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Explicit members of a container.
    pub fn members_of(&self, container: &ContainerId) -> BTreeSet<ResourceId> {
        self.state.read().members.get(container).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    type Error = InMemoryError;

    async fn get_container(&self, id: &ContainerId) -> Result<Option<Container>, Self::Error> {
        Ok(self.state.read().containers.get(id).cloned())
    }

    async fn get_resource(&self, id: &ResourceId) -> Result<Option<Resource>, Self::Error> {
        Ok(self.state.read().rows.get(id).cloned())
    }

    async fn versions_of(&self, versioned_object_id: &ResourceId) -> Result<Vec<Resource>, Self::Error> {
        let state = self.state.read();
        let mut rows: Vec<Resource> = state
            .rows
            .values()
            .filter(|r| r.versioned_object_id() == *versioned_object_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.info().created_at.cmp(&b.info().created_at).then_with(|| a.id().cmp(&b.id()))
        });
        Ok(rows)
    }

    async fn container_concepts(&self, container: &ContainerId) -> Result<Vec<Concept>, Self::Error> {
        self.state.read().concepts(container)
    }

    async fn container_mappings(&self, container: &ContainerId) -> Result<Vec<Mapping>, Self::Error> {
        self.state.read().mappings(container)
    }

    async fn resolve_concept(
        &self,
        container: &ContainerId,
        versioned_object_id: &ResourceId,
    ) -> Result<Option<Concept>, Self::Error> {
        let concepts = self.state.read().concepts(container)?;
        Ok(newest(
            concepts.into_iter().filter(|c| c.versioned_object_id() == *versioned_object_id).collect(),
        ))
    }

    async fn resolve_concept_by_mnemonic(
        &self,
        container: &ContainerId,
        mnemonic: &str,
    ) -> Result<Option<Concept>, Self::Error> {
        let concepts = self.state.read().concepts(container)?;
        Ok(newest(concepts.into_iter().filter(|c| c.mnemonic == mnemonic).collect()))
    }

    async fn resolve_mapping_by_mnemonic(
        &self,
        container: &ContainerId,
        mnemonic: &str,
    ) -> Result<Option<Mapping>, Self::Error> {
        let mappings = self.state.read().mappings(container)?;
        Ok(mappings.into_iter().find(|m| m.mnemonic == mnemonic))
    }

    async fn mappings_for(
        &self,
        container: &ContainerId,
        concept: &ResourceId,
        direction: Direction,
    ) -> Result<Vec<Mapping>, Self::Error> {
        let mappings = self.state.read().mappings(container)?;
        Ok(mappings
            .into_iter()
            .filter(|m| m.origin(direction).concept == Some(*concept))
            .collect())
    }

    async fn hierarchy_neighbors(
        &self,
        container: &ContainerId,
        concept: &Concept,
        direction: Direction,
    ) -> Result<Vec<Concept>, Self::Error> {
        let vid = concept.versioned_object_id();
        let concepts = self.state.read().concepts(container)?;
        Ok(concepts
            .into_iter()
            .filter(|c| match direction {
                Direction::Forward => c.parent_concepts.contains(&vid),
                Direction::Reverse => concept.parent_concepts.contains(&c.versioned_object_id()),
            })
            .collect())
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            locks: Arc::clone(&self.locks),
            writes: BTreeMap::new(),
            inserted: BTreeSet::new(),
            membership: Vec::new(),
            held: BTreeMap::new(),
        })
    }
}

#[derive(Debug, Clone)]
enum MembershipOp {
    Add(ContainerId, ResourceId),
    Remove(ContainerId, ResourceId),
}

/// Transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    locks: LockTable,
    /// Pending row writes. `None` marks a delete.
    writes: BTreeMap<ResourceId, Option<Resource>>,
    inserted: BTreeSet<ResourceId>,
    membership: Vec<MembershipOp>,
    held: BTreeMap<LockKey, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    async fn acquire(&mut self, key: LockKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    fn visible(&self, id: &ResourceId) -> Option<Resource> {
        match self.writes.get(id) {
            Some(pending) => pending.clone(),
            None => self.state.read().rows.get(id).cloned(),
        }
    }

    /// Rows of a group after applying this transaction's writes to `rows`.
    fn group_after<'a>(
        &'a self,
        rows: &'a BTreeMap<ResourceId, Resource>,
        vid: ResourceId,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        let committed = rows
            .values()
            .filter(move |r| r.versioned_object_id() == vid && !self.writes.contains_key(&r.id()));
        let pending = self
            .writes
            .values()
            .flatten()
            .filter(move |r| r.versioned_object_id() == vid);
        committed.chain(pending)
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    type Error = InMemoryError;

    async fn lock_versioned_object(&mut self, versioned_object_id: &ResourceId) -> Result<(), Self::Error> {
        self.acquire(LockKey::Group(*versioned_object_id)).await;
        Ok(())
    }

    async fn lock_mnemonic(
        &mut self,
        container: &ContainerId,
        kind: ResourceKind,
        mnemonic: &str,
    ) -> Result<(), Self::Error> {
        self.acquire(LockKey::Mnemonic(*container, kind, mnemonic.to_string())).await;
        Ok(())
    }

    async fn get(&mut self, id: &ResourceId) -> Result<Option<Resource>, Self::Error> {
        Ok(self.visible(id))
    }

    async fn latest_version(
        &mut self,
        versioned_object_id: &ResourceId,
        exclude: Option<&ResourceId>,
    ) -> Result<Option<Resource>, Self::Error> {
        let state = self.state.read();
        let latest = self
            .group_after(&state.rows, *versioned_object_id)
            .filter(|r| r.info().is_latest_version && Some(&r.id()) != exclude)
            .min_by_key(|r| r.id())
            .cloned();
        Ok(latest)
    }

    async fn insert(&mut self, resource: &Resource) -> Result<(), Self::Error> {
        let id = resource.id();
        if self.visible(&id).is_some() {
            return Err(InMemoryError::DuplicateId(id));
        }
        self.inserted.insert(id);
        self.writes.insert(id, Some(resource.clone()));
        Ok(())
    }

    async fn update(&mut self, resource: &Resource) -> Result<(), Self::Error> {
        let id = resource.id();
        if self.visible(&id).is_none() {
            return Err(InMemoryError::ResourceNotFound(id));
        }
        self.writes.insert(id, Some(resource.clone()));
        Ok(())
    }

    async fn delete(&mut self, id: &ResourceId) -> Result<(), Self::Error> {
        if self.visible(id).is_none() {
            return Err(InMemoryError::ResourceNotFound(*id));
        }
        self.writes.insert(*id, None);
        self.inserted.remove(id);
        Ok(())
    }

    async fn add_member(&mut self, container: &ContainerId, id: &ResourceId) -> Result<(), Self::Error> {
        if !self.state.read().containers.contains_key(container) {
            return Err(InMemoryError::ContainerNotFound(*container));
        }
        self.membership.push(MembershipOp::Add(*container, *id));
        Ok(())
    }

    async fn remove_member(&mut self, container: &ContainerId, id: &ResourceId) -> Result<(), Self::Error> {
        self.membership.push(MembershipOp::Remove(*container, *id));
        Ok(())
    }

    async fn commit(self) -> Result<(), Self::Error> {
        let mut state = self.state.write();

        // Ids inserted here may have been taken by a concurrent commit.
        if let Some(id) = self.inserted.iter().find(|id| state.rows.contains_key(id)) {
            return Err(InMemoryError::DuplicateId(*id));
        }

        let touched: BTreeSet<ResourceId> = self
            .writes
            .iter()
            .filter_map(|(id, pending)| match pending {
                Some(r) => Some(r.versioned_object_id()),
                None => state.rows.get(id).map(Resource::versioned_object_id),
            })
            .collect();
        for vid in touched {
            let latest = self
                .group_after(&state.rows, vid)
                .filter(|r| r.info().is_latest_version)
                .count();
            if latest > 1 {
                return Err(InMemoryError::LatestVersionConflict(vid));
            }
        }

        for (id, pending) in &self.writes {
            match pending {
                Some(resource) => {
                    state.rows.insert(*id, resource.clone());
                }
                None => {
                    state.rows.remove(id);
                    for members in state.members.values_mut() {
                        members.remove(id);
                    }
                }
            }
        }
        for op in &self.membership {
            match op {
                MembershipOp::Add(container, id) => {
                    state.members.entry(*container).or_default().insert(*id);
                }
                MembershipOp::Remove(container, id) => {
                    if let Some(members) = state.members.get_mut(container) {
                        members.remove(id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        let keys: Vec<LockKey> = held.keys().cloned().collect();
        drop(held);

        // The table's own reference is the last one once nobody holds or awaits the lock.
        let mut locks = self.locks.lock();
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConceptRef, LocalizedText, Versioned};

    fn seeded() -> (InMemoryStore, Container, Concept, Concept) {
        let store = InMemoryStore::new();
        let source = Container::source("CIEL", "/orgs/CIEL/sources/CIEL/");
        store.add_container(source.clone());
        let parent = Concept::new(source.id, "P", "Misc", "N/A")
            .with_name(LocalizedText::new("en", "Parent"));
        let child = Concept::new(source.id, "C", "Misc", "N/A").with_parent(parent.versioned_object_id());
        store.put(parent.clone());
        store.put(child.clone());
        (store, source, parent, child)
    }

    #[tokio::test]
    async fn test_head_source_resolves_owned_heads() {
        let (store, source, parent, child) = seeded();
        let mut version = child.clone_as_new_version();
        version.info.version = "1".into();
        store.put(version);

        let concepts = store.container_concepts(&source.id).await.unwrap();
        let mnemonics: Vec<_> = concepts.iter().map(|c| c.mnemonic.as_str()).collect();
        assert_eq!(mnemonics, vec!["C", "P"]);

        let children = store.hierarchy_neighbors(&source.id, &parent, Direction::Forward).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id(), child.id());

        let parents = store.hierarchy_neighbors(&source.id, &child, Direction::Reverse).await.unwrap();
        assert_eq!(parents[0].id(), parent.id());
    }

    #[tokio::test]
    async fn test_version_container_uses_membership() {
        let (store, source, parent, _) = seeded();
        let v1 = source.new_version("v1");
        store.add_container(v1.clone());
        store.add_member(&v1.id, &parent.id());

        let concepts = store.container_concepts(&v1.id).await.unwrap();
        assert_eq!(concepts.len(), 1);
        assert_eq!(concepts[0].mnemonic, "P");

        let missing = store.container_concepts(&ContainerId::generate()).await;
        assert!(matches!(missing, Err(InMemoryError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn test_mappings_for_direction() {
        let (store, source, parent, child) = seeded();
        let mapping = Mapping::new(source.id, "M1", "SAME-AS", ConceptRef::local(&parent), ConceptRef::local(&child));
        store.put(mapping);

        let out = store.mappings_for(&source.id, &parent.id(), Direction::Forward).await.unwrap();
        assert_eq!(out.len(), 1);
        let inbound = store.mappings_for(&source.id, &child.id(), Direction::Reverse).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert!(store.mappings_for(&source.id, &child.id(), Direction::Forward).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (store, source, parent, _) = seeded();
        let mut tx = store.begin().await.unwrap();
        let mut version = parent.clone_as_new_version();
        version.info.version = "1".into();
        tx.insert(&version.clone().into()).await.unwrap();
        tx.add_member(&source.id, &version.id()).await.unwrap();
        assert!(tx.get(&version.id()).await.unwrap().is_some());
        tx.rollback().await.unwrap();

        assert!(store.get_resource(&version.id()).await.unwrap().is_none());
        assert!(store.members_of(&source.id).is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejects_two_latest_versions() {
        let (store, _, parent, _) = seeded();
        let mut first = parent.clone_as_new_version();
        first.info.is_latest_version = true;
        let mut second = parent.clone_as_new_version();
        second.info.is_latest_version = true;

        let mut tx1 = store.begin().await.unwrap();
        let mut tx2 = store.begin().await.unwrap();
        tx1.insert(&first.into()).await.unwrap();
        tx2.insert(&second.into()).await.unwrap();
        tx1.commit().await.unwrap();

        let err = tx2.commit().await.unwrap_err();
        assert!(err.is_integrity_violation());
        assert_eq!(err, InMemoryError::LatestVersionConflict(parent.versioned_object_id()));
    }

    #[tokio::test]
    async fn test_latest_version_sees_overlay() {
        let (store, _, parent, _) = seeded();
        let mut v1 = parent.clone_as_new_version();
        v1.info.is_latest_version = true;
        store.put(v1.clone());

        let mut tx = store.begin().await.unwrap();
        let found = tx.latest_version(&parent.versioned_object_id(), None).await.unwrap();
        assert_eq!(found.map(|r| r.id()), Some(v1.id()));

        v1.info.is_latest_version = false;
        tx.update(&v1.clone().into()).await.unwrap();
        assert!(tx.latest_version(&parent.versioned_object_id(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_lock_serializes_transactions() {
        let (store, _, parent, _) = seeded();
        let vid = parent.versioned_object_id();
        let mut tx1 = store.begin().await.unwrap();
        tx1.lock_versioned_object(&vid).await.unwrap();

        let store2 = store.clone();
        let waiter = tokio::spawn(async move {
            let mut tx2 = store2.begin().await.unwrap();
            tx2.lock_versioned_object(&vid).await.unwrap();
            tx2.rollback().await.unwrap();
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx1.commit().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_mnemonic_lock_serializes_creators() {
        let (store, source, _, _) = seeded();
        let mut tx1 = store.begin().await.unwrap();
        tx1.lock_mnemonic(&source.id, ResourceKind::Concept, "NEW").await.unwrap();

        let store2 = store.clone();
        let container = source.id;
        let waiter = tokio::spawn(async move {
            let mut tx2 = store2.begin().await.unwrap();
            tx2.lock_mnemonic(&container, ResourceKind::Concept, "NEW").await.unwrap();
            tx2.rollback().await.unwrap();
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut other = store.begin().await.unwrap();
        other.lock_mnemonic(&source.id, ResourceKind::Mapping, "NEW").await.unwrap();
        other.rollback().await.unwrap();

        tx1.rollback().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_locks_leave_the_table() {
        let (store, source, parent, child) = seeded();
        let mut tx = store.begin().await.unwrap();
        tx.lock_versioned_object(&parent.versioned_object_id()).await.unwrap();
        tx.lock_versioned_object(&child.versioned_object_id()).await.unwrap();
        tx.lock_mnemonic(&source.id, ResourceKind::Concept, "P").await.unwrap();
        assert_eq!(store.lock_table_len(), 3);
        tx.commit().await.unwrap();
        assert_eq!(store.lock_table_len(), 0);

        let mut tx = store.begin().await.unwrap();
        tx.lock_versioned_object(&parent.versioned_object_id()).await.unwrap();
        drop(tx);
        assert_eq!(store.lock_table_len(), 0);
    }
}
