//! # terminology-kernel
//!
//! Versioned terminology resources with checksum-guarded history, and
//! closure computation over concept graphs.
//!
//! The kernel answers two questions:
//!
//! > Did this concept or mapping **actually change**, and if so, which row is now latest?
//!
//! > Starting from a concept, which concepts and mappings does it **pull in**?
//!
//! ## Core Contract
//!
//! 1. Every logical resource has one mutable HEAD and an append-only history
//!    with exactly one latest version
//! 2. Content checksums are deterministic and reject no-op versions
//! 3. Cascades terminate on cyclic graphs and honour their depth bound
//!
//! ## Architecture
//!
//! ```text
//! VersionManager ──► ResourceStore (transactions, per-group locks)
//!        │                 │
//!   checksums          GraphStore (Postgres or Memory)
//!                          │
//! Bundle ──► CascadeEngine ┘
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same field content → identical checksum, regardless of key or list order
//! - Store queries order by mnemonic, then row id
//! - Same root + same options + same graph state → identical cascade result

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod canonical;
pub mod checksum;
pub mod config;
pub mod error;
pub mod store;
pub mod lifecycle;
pub mod cascade;
pub mod bundle;

// Re-exports
pub use types::{
    Concept, ConceptRef, Container, ContainerId, ContainerKind, Direction, LocalizedText, Mapping,
    Resource, ResourceId, ResourceKind, VersionInfo, Versioned, HEAD,
};
pub use canonical::{canonical_hash, canonical_hash_hex, combine_checksums, generate_checksum};
pub use checksum::{
    checksum_of_many, container_checksums, get_checksums, raw_checksum, ChecksumDiff, ChecksumKind,
    Checksummable, Checksums,
};
pub use config::{DigestAlgorithm, KernelConfig};
pub use error::{LifecycleError, ValidationErrors};
pub use store::{GraphStore, InMemoryStore, ResourceStore, StoreFailure, StoreTransaction};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresStore};
pub use lifecycle::{
    HierarchyRepair, IndexControl, NoOpIndexer, RecordingIndexer, ReindexScheduler, SaveOptions,
    VersionManager,
};
pub use cascade::{
    CascadeEngine, CascadeError, CascadeLevels, CascadeMethod, CascadeNode, CascadeOptions,
    CascadeResult, ReturnMapTypes,
};
pub use bundle::{
    clone_into, Bundle, BundleError, BundleMeta, CloneBundle, CloneFailure, DefaultEntrySerializer,
    EntrySerializer, Verbosity, ViewMode,
};

/// Schema version of serialized kernel types.
/// Increment on breaking changes to any schema type.
pub const TERMINOLOGY_KERNEL_SCHEMA_VERSION: &str = "1.0.0";
