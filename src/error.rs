//! Error types shared across the lifecycle, cascade and bundle layers.
//!
//! Validation failures are reported as a field -> messages mapping so callers
//! can surface them next to the offending input. Non-field failures use the
//! [`ALL_FIELDS`] or [`NON_FIELD_ERRORS`] keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ResourceId, ResourceKind};

/// Key for errors that apply to the resource as a whole.
pub const ALL_FIELDS: &str = "__all__";

/// Key for persistence failures that are not tied to a field.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

/// Reported when a version is saved without an acting user.
pub const SPECIFY_USER_ERROR: &str = "Must specify which user is attempting to create a new version.";

/// Generic persistence failure reported on rollback.
pub const PERSIST_NEW_VERSION_ERROR: &str = "An error occurred while saving new version.";

/// Reported when a new version has the same standard checksum as the latest one.
pub const DUPLICATE_VERSION_ERROR: &str = "Duplicate version: no changes detected since the latest version.";

/// Field-level validation errors.
///
/// Ordered by field name so rendered errors are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    /// Create an empty error set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an error set holding one message for one field.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    /// Add a message for a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Merge another error set into this one.
    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    /// True if no errors were recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Messages recorded for a field.
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// True if the field has at least one message.
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Field names with errors, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Borrow the underlying mapping.
    pub fn as_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.0
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}: {}", field, messages.join(" "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors from version creation, retirement and lookups.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The resource group is already retired.
    #[error("{0} is already retired")]
    AlreadyRetired(ResourceKind),
    /// The resource group is not retired.
    #[error("{0} is already not retired")]
    AlreadyNotRetired(ResourceKind),
    /// New version carries the same standard checksum as the latest one.
    #[error("duplicate version (standard checksum {checksum})")]
    DuplicateVersion {
        /// The colliding standard checksum.
        checksum: String,
    },
    /// Field-level validation failure.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    /// The resource group does not exist.
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    /// Hierarchy repair failed in a way that must not be masked.
    #[error("hierarchy repair failed: {0}")]
    Fatal(String),
    /// Unexpected storage failure.
    #[error("store error: {0}")]
    Store(String),
}

impl LifecycleError {
    /// Create a store error from any error type.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::Store(e.to_string())
    }

    /// True for failures that are reported as field errors rather than propagated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRetired(_)
                | Self::AlreadyNotRetired(_)
                | Self::DuplicateVersion { .. }
                | Self::Validation(_)
        )
    }

    /// Render validation-class failures as a field -> messages mapping.
    ///
    /// Returns `None` for not-found, fatal and store errors.
    pub fn field_errors(&self) -> Option<ValidationErrors> {
        match self {
            Self::AlreadyRetired(_) | Self::AlreadyNotRetired(_) => {
                Some(ValidationErrors::single(ALL_FIELDS, self.to_string()))
            }
            Self::DuplicateVersion { .. } => {
                Some(ValidationErrors::single(ALL_FIELDS, DUPLICATE_VERSION_ERROR))
            }
            Self::Validation(errors) => Some(errors.clone()),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for LifecycleError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_are_ordered_by_field() {
        let mut errors = ValidationErrors::new();
        errors.add("names", "too many");
        errors.add("datatype", "required");
        errors.add("names", "duplicate locale");

        let fields: Vec<_> = errors.fields().collect();
        assert_eq!(fields, vec!["datatype", "names"]);
        assert_eq!(errors.get("names").map(|m| m.len()), Some(2));
        assert_eq!(errors.to_string(), "datatype: required; names: too many duplicate locale");
    }

    #[test]
    fn test_serializes_as_plain_mapping() {
        let errors = ValidationErrors::single(NON_FIELD_ERRORS, PERSIST_NEW_VERSION_ERROR);
        let json = serde_json::to_value(&errors).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"non_field_errors": ["An error occurred while saving new version."]})
        );
    }

    #[test]
    fn test_retire_errors_render_as_field_errors() {
        let err = LifecycleError::AlreadyRetired(ResourceKind::Concept);
        assert!(err.is_validation());
        let errors = err.field_errors().unwrap();
        assert_eq!(errors.get(ALL_FIELDS).unwrap(), &["Concept is already retired".to_string()]);

        let err = LifecycleError::Fatal("parent vanished".into());
        assert!(!err.is_validation());
        assert!(err.field_errors().is_none());
    }
}
