//! Resource storage backends.
//!
//! Two seams:
//!
//! - [`GraphStore`]: read-only graph queries used by the cascade engine and
//!   bundles. Traversal runs without locks.
//! - [`ResourceStore`] / [`StoreTransaction`]: transactional writes used by
//!   the version lifecycle.
//!
//! ## Container Resolution
//!
//! A source HEAD resolves to the HEAD rows it owns. Every other container
//! (source versions, collections) resolves to its explicit members.
//!
//! ## Latest-Version Constraint
//!
//! Backends must reject a commit that would leave two rows of one
//! `versioned_object_id` with `is_latest_version = true`, and report it as an
//! integrity violation (see [`StoreFailure::is_integrity_violation`]).

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::types::{Concept, Container, ContainerId, Direction, Mapping, Resource, ResourceId, ResourceKind};

/// Classification of backend errors.
pub trait StoreFailure: std::error::Error + Send + Sync + 'static {
    /// True for unique/exclusion constraint violations (e.g. a lost race on
    /// the latest-version flag).
    fn is_integrity_violation(&self) -> bool {
        false
    }
}

/// Read-side graph queries.
///
/// Implementations must return results in a deterministic order
/// (mnemonic, then row id).
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Error type for store operations.
    type Error: StoreFailure;

    /// Fetch a container row.
    async fn get_container(&self, id: &ContainerId) -> Result<Option<Container>, Self::Error>;

    /// Fetch a resource row by id. The HEAD row of a group has `id == versioned_object_id`.
    async fn get_resource(&self, id: &ResourceId) -> Result<Option<Resource>, Self::Error>;

    /// All rows of a group, HEAD included, oldest first.
    async fn versions_of(&self, versioned_object_id: &ResourceId) -> Result<Vec<Resource>, Self::Error>;

    /// Concepts in a container.
    async fn container_concepts(&self, container: &ContainerId) -> Result<Vec<Concept>, Self::Error>;

    /// Mappings in a container.
    async fn container_mappings(&self, container: &ContainerId) -> Result<Vec<Mapping>, Self::Error>;

    /// The container's row for a logical concept.
    async fn resolve_concept(
        &self,
        container: &ContainerId,
        versioned_object_id: &ResourceId,
    ) -> Result<Option<Concept>, Self::Error>;

    /// The container's concept with this mnemonic.
    async fn resolve_concept_by_mnemonic(
        &self,
        container: &ContainerId,
        mnemonic: &str,
    ) -> Result<Option<Concept>, Self::Error>;

    /// The container's mapping with this mnemonic.
    async fn resolve_mapping_by_mnemonic(
        &self,
        container: &ContainerId,
        mnemonic: &str,
    ) -> Result<Option<Mapping>, Self::Error>;

    /// Mappings in the container whose origin (for `direction`) is the concept.
    async fn mappings_for(
        &self,
        container: &ContainerId,
        concept: &ResourceId,
        direction: Direction,
    ) -> Result<Vec<Mapping>, Self::Error>;

    /// Hierarchy children (forward) or parents (reverse) of a concept within the container.
    async fn hierarchy_neighbors(
        &self,
        container: &ContainerId,
        concept: &Concept,
        direction: Direction,
    ) -> Result<Vec<Concept>, Self::Error>;
}

/// A store that supports transactional writes.
#[async_trait]
pub trait ResourceStore: GraphStore {
    /// Transaction handle.
    type Transaction: StoreTransaction<Error = Self::Error>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;
}

/// A write transaction.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send + 'static {
    /// Error type.
    type Error: StoreFailure;

    /// Serialize writers of one logical resource until the transaction ends.
    async fn lock_versioned_object(&mut self, versioned_object_id: &ResourceId) -> Result<(), Self::Error>;

    /// Serialize creators of one mnemonic within a container until the
    /// transaction ends. Held while checking that the mnemonic is free.
    async fn lock_mnemonic(
        &mut self,
        container: &ContainerId,
        kind: ResourceKind,
        mnemonic: &str,
    ) -> Result<(), Self::Error>;

    /// Fetch a row as seen by this transaction.
    async fn get(&mut self, id: &ResourceId) -> Result<Option<Resource>, Self::Error>;

    /// The group's latest version as seen by this transaction, ignoring `exclude`.
    async fn latest_version(
        &mut self,
        versioned_object_id: &ResourceId,
        exclude: Option<&ResourceId>,
    ) -> Result<Option<Resource>, Self::Error>;

    /// Insert a new row.
    async fn insert(&mut self, resource: &Resource) -> Result<(), Self::Error>;

    /// Overwrite an existing row.
    async fn update(&mut self, resource: &Resource) -> Result<(), Self::Error>;

    /// Delete a row and its memberships.
    async fn delete(&mut self, id: &ResourceId) -> Result<(), Self::Error>;

    /// Add a row to a container.
    async fn add_member(&mut self, container: &ContainerId, id: &ResourceId) -> Result<(), Self::Error>;

    /// Remove a row from a container.
    async fn remove_member(&mut self, container: &ContainerId, id: &ResourceId) -> Result<(), Self::Error>;

    /// Commit. Constraint violations surface here.
    async fn commit(self) -> Result<(), Self::Error>;

    /// Discard all writes.
    async fn rollback(self) -> Result<(), Self::Error>;
}

pub use memory::{InMemoryError, InMemoryStore, InMemoryTransaction};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresError, PostgresStore};
