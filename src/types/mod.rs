//! Core types for the terminology kernel.

pub mod resource;
pub mod concept;
pub mod mapping;
pub mod container;

pub use resource::{
    generate_temp_version, is_temp_version, ContainerId, Resource, ResourceId, ResourceKind,
    VersionInfo, Versioned, HEAD, TEMP_VERSION_PREFIX,
};
pub use concept::{is_fully_specified_type, Concept, LocalizedText, FULLY_SPECIFIED};
pub use mapping::{ConceptRef, Direction, Mapping};
pub use container::{Container, ContainerKind};
