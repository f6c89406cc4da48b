//! Versioned resource lifecycle.
//!
//! Each logical resource is a group of rows sharing a `versioned_object_id`:
//! one mutable HEAD (`id == versioned_object_id`) plus an append-only history
//! of immutable versions, exactly one of which is the latest.
//!
//! | operation | effect |
//! |-----------|--------|
//! | [`VersionManager::create`] | HEAD + initial latest version in one transaction |
//! | [`VersionManager::save_as_new_version`] | append a version, demote the previous latest, sync HEAD |
//! | [`VersionManager::retire`] / [`VersionManager::unretire`] | new version with the `retired` flag flipped |
//!
//! ## Version Protocol
//!
//! 1. Require an acting user; give the row a temporary label; validate.
//! 2. Open a transaction, lock the group, pause indexing. A create also
//!    locks its mnemonic and checks it is free before anything is written.
//! 3. Insert the row as latest; relabel it with its id.
//! 4. Find the previous latest; compute checksums; reject duplicates.
//! 5. Demote the previous latest and move container membership.
//! 6. Sync HEAD; run the kind's hierarchy repair when parents changed.
//! 7. On failure restore the previous latest, delete the new row and roll
//!    back. Indexing resumes before the transaction ends on every path.
//! 8. After commit, schedule reindex of the demoted and the new row.

pub mod hierarchy;
pub mod hooks;

use std::sync::Arc;

use chrono::Utc;

use crate::checksum::{checksum, get_checksums};
use crate::config::KernelConfig;
use crate::error::{
    LifecycleError, ValidationErrors, NON_FIELD_ERRORS, PERSIST_NEW_VERSION_ERROR, SPECIFY_USER_ERROR,
};
use crate::store::{GraphStore, ResourceStore, StoreFailure, StoreTransaction};
use crate::types::{generate_temp_version, Resource, ResourceId, ResourceKind, Versioned, HEAD};

pub use hierarchy::{
    ConceptHierarchyRepair, HierarchyRepair, HierarchyRepairRegistry, RepairError, PARENT_FIELD,
};
pub use hooks::{IndexControl, IndexEvent, IndexingPause, NoOpIndexer, RecordingIndexer, ReindexScheduler};

/// Field that missing-user errors are reported under.
pub const VERSION_CREATED_BY_FIELD: &str = "version_created_by";

/// Options for [`VersionManager::save_as_new_version`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Internal pass issued by hierarchy repair. Skips duplicate detection.
    pub hierarchy_repair_pass: bool,
}

impl SaveOptions {
    /// Options for an internal hierarchy-repair save.
    pub fn repair_pass() -> Self {
        Self { hierarchy_repair_pass: true }
    }
}

fn store_error<E: StoreFailure>(e: E) -> LifecycleError {
    if e.is_integrity_violation() {
        tracing::warn!(error = %e, "Integrity violation while saving version");
        ValidationErrors::single(NON_FIELD_ERRORS, PERSIST_NEW_VERSION_ERROR).into()
    } else {
        LifecycleError::from_store(e)
    }
}

fn require_user(user: Option<&str>) -> Result<String, LifecycleError> {
    match user.map(str::trim) {
        Some(user) if !user.is_empty() => Ok(user.to_string()),
        _ => Err(ValidationErrors::single(VERSION_CREATED_BY_FIELD, SPECIFY_USER_ERROR).into()),
    }
}

/// Writes to reverse if a version transaction fails midway.
#[derive(Default)]
struct Undo {
    inserted: Vec<ResourceId>,
    demoted: Option<Resource>,
}

impl Undo {
    async fn run<Tx: StoreTransaction>(self, tx: &mut Tx) {
        if let Some(previous) = self.demoted {
            if let Err(e) = tx.update(&previous).await {
                tracing::warn!(id = %previous.id(), error = %e, "Failed to restore previous latest version");
            }
        }
        for id in self.inserted.iter().rev() {
            if let Err(e) = tx.delete(id).await {
                tracing::warn!(id = %id, error = %e, "Failed to delete partial version");
            }
        }
    }
}

/// Drives the version lifecycle against a [`ResourceStore`].
pub struct VersionManager<S: ResourceStore> {
    store: Arc<S>,
    config: KernelConfig,
    index: Arc<dyn IndexControl>,
    scheduler: Arc<dyn ReindexScheduler>,
    repairs: HierarchyRepairRegistry<S::Transaction>,
}

impl<S: ResourceStore> VersionManager<S> {
    /// Create a manager with no-op index hooks and the default repair strategies.
    pub fn new(store: Arc<S>, config: KernelConfig) -> Self {
        Self {
            store,
            config,
            index: Arc::new(NoOpIndexer),
            scheduler: Arc::new(NoOpIndexer),
            repairs: HierarchyRepairRegistry::with_defaults(),
        }
    }

    /// Use an index-control hook.
    pub fn with_index_control(mut self, index: Arc<dyn IndexControl>) -> Self {
        self.index = index;
        self
    }

    /// Use a reindex scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn ReindexScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Register a hierarchy repair strategy for a kind.
    pub fn with_hierarchy_repair(
        mut self,
        kind: ResourceKind,
        strategy: Arc<dyn HierarchyRepair<S::Transaction>>,
    ) -> Self {
        self.repairs.register(kind, strategy);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a new resource group: its HEAD row and an initial latest version.
    ///
    /// Returns the HEAD row.
    pub async fn create<R: Versioned>(&self, resource: R, user: Option<&str>) -> Result<R, LifecycleError> {
        let user = require_user(user)?;
        let now = Utc::now();
        let mut head = resource;
        {
            let info = head.info_mut();
            info.versioned_object_id = info.id;
            info.version = HEAD.to_string();
            info.is_latest_version = false;
            info.created_by = user.clone();
            info.updated_by = user;
            info.created_at = now;
            info.updated_at = now;
            info.checksums.clear();
        }
        head.validate(&self.config)?;

        let mut version = head.clone_as_new_version();
        {
            let info = version.info_mut();
            info.version = info.id.to_string();
            info.is_latest_version = true;
        }
        get_checksums(&mut head, &self.config);
        get_checksums(&mut version, &self.config);

        let mut tx = self.store.begin().await.map_err(store_error)?;
        let outcome = self.persist_new(&mut tx, &head, &version).await;
        self.finish(tx, outcome).await?;

        self.scheduler.schedule_reindex(R::KIND, head.info().id);
        self.scheduler.schedule_reindex(R::KIND, version.info().id);
        tracing::info!(
            kind = %R::KIND,
            versioned_object_id = %head.info().id,
            mnemonic = head.mnemonic(),
            "Created resource"
        );
        Ok(head)
    }

    /// Persist `version` as the new latest version of its group.
    ///
    /// A HEAD row passed in is first cloned into a new version. Returns the
    /// persisted version with its final label and checksums.
    pub async fn save_as_new_version<R: Versioned>(
        &self,
        version: R,
        user: Option<&str>,
        options: SaveOptions,
    ) -> Result<R, LifecycleError> {
        let user = require_user(user)?;
        let mut version = if version.is_head() { version.clone_as_new_version() } else { version };
        let now = Utc::now();
        {
            let info = version.info_mut();
            if info.version.is_empty() {
                info.version = generate_temp_version();
            }
            info.is_latest_version = true;
            info.created_by = user.clone();
            info.updated_by = user;
            info.created_at = now;
            info.updated_at = now;
            info.checksums.clear();
        }
        version.validate(&self.config)?;

        let mut tx = self.store.begin().await.map_err(store_error)?;
        let outcome = self.persist_version(&mut tx, version, options).await;
        let (version, previous) = self.finish(tx, outcome).await?;

        if let Some(previous) = &previous {
            self.scheduler.schedule_reindex(R::KIND, previous.info().id);
        }
        self.scheduler.schedule_reindex(R::KIND, version.info().id);
        tracing::info!(
            kind = %R::KIND,
            id = %version.info().id,
            versioned_object_id = %version.info().versioned_object_id,
            version = %version.info().version,
            "Committed new version"
        );
        Ok(version)
    }

    /// Retire a resource group by saving a retired copy of its latest version.
    pub async fn retire<R: Versioned>(
        &self,
        versioned_object_id: &ResourceId,
        user: Option<&str>,
        comment: Option<&str>,
    ) -> Result<R, LifecycleError> {
        self.set_retired(versioned_object_id, true, user, comment).await
    }

    /// Un-retire a resource group.
    pub async fn unretire<R: Versioned>(
        &self,
        versioned_object_id: &ResourceId,
        user: Option<&str>,
        comment: Option<&str>,
    ) -> Result<R, LifecycleError> {
        self.set_retired(versioned_object_id, false, user, comment).await
    }

    /// The group's HEAD row.
    pub async fn head<R: Versioned>(&self, versioned_object_id: &ResourceId) -> Result<Option<R>, LifecycleError> {
        Ok(self
            .store
            .get_resource(versioned_object_id)
            .await
            .map_err(store_error)?
            .and_then(R::from_resource)
            .filter(|r| r.is_head()))
    }

    /// The group's latest immutable version.
    pub async fn latest_version<R: Versioned>(
        &self,
        versioned_object_id: &ResourceId,
    ) -> Result<Option<R>, LifecycleError> {
        Ok(self
            .versions::<R>(versioned_object_id)
            .await?
            .into_iter()
            .find(|r| r.info().is_latest_version))
    }

    /// All immutable versions of the group, oldest first. HEAD is excluded.
    pub async fn versions<R: Versioned>(&self, versioned_object_id: &ResourceId) -> Result<Vec<R>, LifecycleError> {
        Ok(self
            .store
            .versions_of(versioned_object_id)
            .await
            .map_err(store_error)?
            .into_iter()
            .filter_map(R::from_resource)
            .filter(|r| !r.is_head())
            .collect())
    }

    async fn set_retired<R: Versioned>(
        &self,
        versioned_object_id: &ResourceId,
        retired: bool,
        user: Option<&str>,
        comment: Option<&str>,
    ) -> Result<R, LifecycleError> {
        let head: R = self
            .head(versioned_object_id)
            .await?
            .ok_or(LifecycleError::NotFound(*versioned_object_id))?;
        if head.info().retired == retired {
            return Err(if retired {
                LifecycleError::AlreadyRetired(R::KIND)
            } else {
                LifecycleError::AlreadyNotRetired(R::KIND)
            });
        }

        let base = self.latest_version::<R>(versioned_object_id).await?.unwrap_or(head);
        let mut next = base.clone_as_new_version();
        let comment = match comment {
            Some(comment) => comment.to_string(),
            None if retired => format!("{} was retired", R::KIND),
            None => format!("{} was un-retired", R::KIND),
        };
        let info = next.info_mut();
        info.retired = retired;
        info.comment = Some(comment);
        self.save_as_new_version(next, user, SaveOptions::default()).await
    }

    async fn ensure_unique_mnemonic<R: Versioned>(&self, head: &R) -> Result<(), LifecycleError> {
        let parent = head.info().parent;
        let exists = match R::KIND {
            ResourceKind::Concept => self
                .store
                .resolve_concept_by_mnemonic(&parent, head.mnemonic())
                .await
                .map_err(store_error)?
                .is_some(),
            ResourceKind::Mapping => self
                .store
                .resolve_mapping_by_mnemonic(&parent, head.mnemonic())
                .await
                .map_err(store_error)?
                .is_some(),
        };
        if exists {
            return Err(ValidationErrors::single(
                "mnemonic",
                format!("{} with mnemonic {} already exists in this source.", R::KIND, head.mnemonic()),
            )
            .into());
        }
        Ok(())
    }

    async fn finish<T>(
        &self,
        tx: S::Transaction,
        outcome: Result<T, LifecycleError>,
    ) -> Result<T, LifecycleError> {
        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(store_error)?;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rolling back version transaction");
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn persist_new<R: Versioned>(
        &self,
        tx: &mut S::Transaction,
        head: &R,
        version: &R,
    ) -> Result<(), LifecycleError> {
        let parent = head.info().parent;
        tx.lock_mnemonic(&parent, R::KIND, head.mnemonic()).await.map_err(store_error)?;
        self.ensure_unique_mnemonic(head).await?;

        let _pause = IndexingPause::new(Arc::clone(&self.index));
        tx.lock_versioned_object(&head.info().id).await.map_err(store_error)?;
        tx.insert(&head.clone().into_resource()).await.map_err(store_error)?;
        tx.insert(&version.clone().into_resource()).await.map_err(store_error)?;
        tx.add_member(&parent, &head.info().id).await.map_err(store_error)?;
        tx.add_member(&parent, &version.info().id).await.map_err(store_error)?;
        if version.hierarchy_changed(None) {
            self.repair(R::KIND, tx, None, &version.clone().into_resource()).await?;
        }
        tracing::debug!(id = %version.info().id, version = %version.info().version, "Persisted initial version");
        Ok(())
    }

    async fn persist_version<R: Versioned>(
        &self,
        tx: &mut S::Transaction,
        version: R,
        options: SaveOptions,
    ) -> Result<(R, Option<R>), LifecycleError> {
        let _pause = IndexingPause::new(Arc::clone(&self.index));
        let vid = version.info().versioned_object_id;
        tx.lock_versioned_object(&vid).await.map_err(store_error)?;
        let head = tx
            .get(&vid)
            .await
            .map_err(store_error)?
            .and_then(R::from_resource)
            .ok_or(LifecycleError::NotFound(vid))?;

        let mut undo = Undo::default();
        let outcome = self.apply_version(tx, head, version, options, &mut undo).await;
        if outcome.is_err() {
            undo.run(tx).await;
        }
        outcome
    }

    async fn apply_version<R: Versioned>(
        &self,
        tx: &mut S::Transaction,
        mut head: R,
        mut version: R,
        options: SaveOptions,
        undo: &mut Undo,
    ) -> Result<(R, Option<R>), LifecycleError> {
        let vid = version.info().versioned_object_id;
        tx.insert(&version.clone().into_resource()).await.map_err(store_error)?;
        undo.inserted.push(version.info().id);
        if version.info().has_temp_version() {
            let label = version.info().id.to_string();
            version.info_mut().version = label;
        }

        let previous = tx
            .latest_version(&vid, Some(&version.info().id))
            .await
            .map_err(store_error)?
            .and_then(R::from_resource);

        get_checksums(&mut version, &self.config);
        if self.config.duplicate_prevention_active() && !options.hierarchy_repair_pass {
            if let (Some(ours), Some(previous)) = (version.checksums().standard(), previous.as_ref()) {
                let mut theirs = previous.clone();
                if checksum(&mut theirs, &self.config).as_deref() == Some(ours) {
                    return Err(LifecycleError::DuplicateVersion { checksum: ours.to_string() });
                }
            }
        }
        tx.update(&version.clone().into_resource()).await.map_err(store_error)?;

        if let Some(previous) = &previous {
            let mut demoted = previous.clone();
            demoted.info_mut().is_latest_version = false;
            tx.update(&demoted.into_resource()).await.map_err(store_error)?;
            undo.demoted = Some(previous.clone().into_resource());
            tx.remove_member(&previous.info().parent, &previous.info().id)
                .await
                .map_err(store_error)?;
        }
        tx.add_member(&version.info().parent, &version.info().id)
            .await
            .map_err(store_error)?;

        version.sync_head(&mut head);
        *head.checksums_mut() = version.checksums().clone();
        tx.update(&head.into_resource()).await.map_err(store_error)?;

        if version.hierarchy_changed(previous.as_ref()) {
            let before = previous.clone().map(Versioned::into_resource);
            self.repair(R::KIND, tx, before.as_ref(), &version.clone().into_resource()).await?;
        }

        tracing::debug!(
            id = %version.info().id,
            version = %version.info().version,
            previous = ?previous.as_ref().map(|p| p.info().id),
            "Persisted new version"
        );
        Ok((version, previous))
    }

    async fn repair(
        &self,
        kind: ResourceKind,
        tx: &mut S::Transaction,
        previous: Option<&Resource>,
        current: &Resource,
    ) -> Result<(), LifecycleError> {
        match self.repairs.get(kind) {
            Some(strategy) => Ok(strategy.repair(tx, previous, current).await?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ALL_FIELDS, DUPLICATE_VERSION_ERROR};
    use crate::store::InMemoryStore;
    use crate::types::{Concept, Container, LocalizedText};

    async fn setup() -> (VersionManager<InMemoryStore>, Arc<RecordingIndexer>, Container) {
        let store = Arc::new(InMemoryStore::new());
        let source = Container::source("CIEL", "/orgs/CIEL/sources/CIEL/");
        store.add_container(source.clone());
        let recorder = Arc::new(RecordingIndexer::new());
        let manager = VersionManager::new(store, KernelConfig::default())
            .with_index_control(recorder.clone())
            .with_scheduler(recorder.clone());
        (manager, recorder, source)
    }

    fn malaria(source: &Container) -> Concept {
        Concept::new(source.id, "C1", "Diagnosis", "N/A")
            .with_name(LocalizedText::new("en", "Malaria").with_type("FULLY_SPECIFIED"))
    }

    #[tokio::test]
    async fn test_create_writes_head_and_latest() {
        let (manager, recorder, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        assert!(head.is_head());
        assert_eq!(head.info.version, HEAD);
        assert!(head.info.checksums.standard().is_some());

        let versions = manager.versions::<Concept>(&head.id()).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].info.is_latest_version);
        assert_eq!(versions[0].info.version, versions[0].id().to_string());
        assert!(recorder.is_balanced());
        assert_eq!(recorder.reindexed(), vec![head.id(), versions[0].id()]);
    }

    #[tokio::test]
    async fn test_create_rejects_taken_mnemonic() {
        let (manager, _, source) = setup().await;
        manager.create(malaria(&source), Some("admin")).await.unwrap();
        let err = manager.create(malaria(&source), Some("admin")).await.unwrap_err();
        assert!(err.field_errors().unwrap().contains("mnemonic"));
    }

    #[tokio::test]
    async fn test_save_requires_user() {
        let (manager, _, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        let err = manager
            .save_as_new_version(head.clone_as_new_version(), None, SaveOptions::default())
            .await
            .unwrap_err();
        assert!(err.field_errors().unwrap().contains(VERSION_CREATED_BY_FIELD));
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let (manager, recorder, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        recorder.clear();

        let err = manager
            .save_as_new_version(head.clone_as_new_version(), Some("admin"), SaveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateVersion { .. }));
        assert_eq!(err.field_errors().unwrap().get(ALL_FIELDS).unwrap(), &[DUPLICATE_VERSION_ERROR.to_string()]);
        assert_eq!(manager.versions::<Concept>(&head.id()).await.unwrap().len(), 1);
        assert!(recorder.is_balanced());
        assert!(recorder.reindexed().is_empty());
    }

    #[tokio::test]
    async fn test_repair_pass_skips_duplicate_check() {
        let (manager, _, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        manager
            .save_as_new_version(head.clone_as_new_version(), Some("admin"), SaveOptions::repair_pass())
            .await
            .unwrap();
        assert_eq!(manager.versions::<Concept>(&head.id()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_new_version_demotes_previous_and_syncs_head() {
        let (manager, recorder, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        let first = manager.latest_version::<Concept>(&head.id()).await.unwrap().unwrap();
        recorder.clear();

        let mut edit = first.clone_as_new_version();
        edit.datatype = "Coded".into();
        let saved = manager.save_as_new_version(edit, Some("editor"), SaveOptions::default()).await.unwrap();
        assert_eq!(saved.info.version, saved.id().to_string());

        let versions = manager.versions::<Concept>(&head.id()).await.unwrap();
        let latest: Vec<_> = versions.iter().filter(|v| v.info.is_latest_version).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id(), saved.id());

        let head = manager.head::<Concept>(&head.id()).await.unwrap().unwrap();
        assert_eq!(head.datatype, "Coded");
        assert_eq!(head.info.updated_by, "editor");
        assert_eq!(recorder.reindexed(), vec![first.id(), saved.id()]);
    }

    #[tokio::test]
    async fn test_retire_then_retire_again() {
        let (manager, _, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();

        let retired = manager.retire::<Concept>(&head.id(), Some("admin"), None).await.unwrap();
        assert!(retired.info.retired);
        assert_eq!(retired.info.comment.as_deref(), Some("Concept was retired"));

        let err = manager.retire::<Concept>(&head.id(), Some("admin"), None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRetired(ResourceKind::Concept)));
        assert_eq!(manager.versions::<Concept>(&head.id()).await.unwrap().len(), 2);

        let back = manager.unretire::<Concept>(&head.id(), Some("admin"), Some("restored")).await.unwrap();
        assert!(!back.info.retired);
        assert_eq!(back.info.comment.as_deref(), Some("restored"));
        let err = manager.unretire::<Concept>(&head.id(), Some("admin"), None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyNotRetired(ResourceKind::Concept)));
    }

    #[tokio::test]
    async fn test_invalid_parent_rolls_back() {
        let (manager, recorder, source) = setup().await;
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        let first = manager.latest_version::<Concept>(&head.id()).await.unwrap().unwrap();

        let edit = first.clone_as_new_version().with_parent(ResourceId::generate());
        let err = manager.save_as_new_version(edit, Some("admin"), SaveOptions::default()).await.unwrap_err();
        assert!(err.field_errors().unwrap().contains(PARENT_FIELD));

        let latest = manager.latest_version::<Concept>(&head.id()).await.unwrap().unwrap();
        assert_eq!(latest.id(), first.id());
        assert_eq!(manager.versions::<Concept>(&head.id()).await.unwrap().len(), 1);
        let head = manager.head::<Concept>(&head.id()).await.unwrap().unwrap();
        assert!(head.parent_concepts.is_empty());
        assert!(recorder.is_balanced());
    }

    #[tokio::test]
    async fn test_unknown_group_not_found() {
        let (manager, _, _) = setup().await;
        let missing = ResourceId::generate();
        let err = manager.retire::<Concept>(&missing, Some("admin"), None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_checksums_disabled_allows_identical_versions() {
        let store = Arc::new(InMemoryStore::new());
        let source = Container::source("S", "/orgs/O/sources/S/");
        store.add_container(source.clone());
        let manager = VersionManager::new(store, KernelConfig::without_checksums());
        let head = manager.create(malaria(&source), Some("admin")).await.unwrap();
        assert!(head.info.checksums.is_empty());
        manager
            .save_as_new_version(head.clone_as_new_version(), Some("admin"), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(manager.versions::<Concept>(&head.id()).await.unwrap().len(), 2);
    }
}
