//! Concept closure over mapping and hierarchy edges.
//!
//! ## Flat Cascade
//!
//! Breadth-first, one level per iteration:
//!
//! 1. Start from the root (optionally included in the result).
//! 2. Expand every frontier node: eligible mappings (direction, type filters,
//!    retirement), their resolved targets, and hierarchy neighbors.
//! 3. Unvisited concepts form the next frontier.
//! 4. Stop when the frontier is empty, the depth bound is reached, or the
//!    result cap is hit before a new level.
//!
//! A shared `visited` set makes the walk terminate on cyclic graphs.
//! Equivalency map types are closed over at the level where they are found,
//! so `A SAME-AS B SAME-AS C` lands in one level.
//!
//! ## Hierarchy Cascade
//!
//! Same edge rules, but the result is a tree. Each concept is expanded once;
//! later occurrences are leaves carrying the first expansion's `terminal`
//! flag.

pub mod engine;
pub mod policy;
pub mod tree;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::types::{Concept, ContainerId, Mapping, ResourceId};

pub use engine::CascadeEngine;
pub use policy::{CascadeLevels, CascadeMethod, CascadeOptions, ReturnMapTypes, ViewMode};
pub use tree::CascadeNode;

/// Errors from cascade runs.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    /// Root concept does not resolve in the container.
    #[error("Root concept not found: {0}")]
    RootNotFound(ResourceId),
    /// Container (traversal or omit) does not exist.
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),
    /// Unparseable query parameter.
    #[error("Invalid value for {name}: {value}")]
    InvalidParam {
        /// Parameter name.
        name: String,
        /// Raw value.
        value: String,
    },
    /// Store failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl CascadeError {
    /// Create a store error from any error type.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::Store(e.to_string())
    }

    pub(crate) fn invalid_param(name: &str, value: &str) -> Self {
        Self::InvalidParam {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Deduplicated result of a flat cascade.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeResult {
    /// The root concept, whether or not it is part of `concepts`.
    pub root: Concept,
    /// Concepts in discovery order.
    pub concepts: Vec<Concept>,
    /// Returned mappings, grouped per expanded node.
    pub mappings: Vec<Mapping>,
}

impl CascadeResult {
    /// Number of concepts plus mappings.
    pub fn total(&self) -> usize {
        self.concepts.len() + self.mappings.len()
    }

    /// Logical ids of the concepts.
    pub fn concept_ids(&self) -> BTreeSet<ResourceId> {
        self.concepts.iter().map(Concept::versioned_object_id).collect()
    }

    /// Logical ids of the mappings.
    pub fn mapping_ids(&self) -> BTreeSet<ResourceId> {
        self.mappings.iter().map(Mapping::versioned_object_id).collect()
    }

    /// Concept mnemonics in result order.
    pub fn concept_mnemonics(&self) -> Vec<&str> {
        self.concepts.iter().map(|c| c.mnemonic.as_str()).collect()
    }

    /// Mapping mnemonics in result order.
    pub fn mapping_mnemonics(&self) -> Vec<&str> {
        self.mappings.iter().map(|m| m.mnemonic.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConceptRef, Container};

    #[test]
    fn test_result_total() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let a = Concept::new(source.id, "A", "Misc", "N/A");
        let b = Concept::new(source.id, "B", "Misc", "N/A");
        let m = Mapping::new(source.id, "M1", "SAME-AS", ConceptRef::local(&a), ConceptRef::local(&b));
        let result = CascadeResult {
            root: a.clone(),
            concepts: vec![a.clone(), b],
            mappings: vec![m],
        };
        assert_eq!(result.total(), 3);
        assert_eq!(result.concept_mnemonics(), vec!["A", "B"]);
        assert!(result.concept_ids().contains(&a.versioned_object_id()));
        assert_eq!(result.mapping_mnemonics(), vec!["M1"]);
    }

    #[test]
    fn test_error_messages() {
        let err = CascadeError::invalid_param("cascadeLevels", "x");
        assert_eq!(err.to_string(), "Invalid value for cascadeLevels: x");
    }
}
