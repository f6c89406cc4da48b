//! Containers: sources and collections, each with a HEAD and released versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::resource::{ContainerId, HEAD};

/// Kind of container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Owns concepts and mappings.
    Source,
    /// References concepts and mappings owned elsewhere.
    Collection,
}

/// A source or collection row.
///
/// The HEAD row (`version == "HEAD"`) resolves its concepts and mappings from
/// the HEAD rows it owns; every other version resolves them from explicit
/// membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Row identity.
    pub id: ContainerId,
    /// Logical identity, equal to `id` on the HEAD row.
    pub versioned_object_id: ContainerId,
    /// Source or collection.
    pub kind: ContainerKind,
    /// Short identifier.
    pub mnemonic: String,
    /// Version label.
    pub version: String,
    /// Canonical url.
    pub url: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Released flag.
    #[serde(default)]
    pub released: bool,
    /// Retired flag.
    #[serde(default)]
    pub retired: bool,
    /// Free-form extras.
    #[serde(default)]
    pub extras: Map<String, Value>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Container {
    fn head(kind: ContainerKind, mnemonic: String, url: String) -> Self {
        let id = ContainerId::generate();
        Self {
            id,
            versioned_object_id: id,
            kind,
            mnemonic,
            version: HEAD.to_string(),
            url,
            name: None,
            description: None,
            released: false,
            retired: false,
            extras: Map::new(),
            updated_at: Utc::now(),
        }
    }

    /// A new source HEAD.
    pub fn source(mnemonic: impl Into<String>, url: impl Into<String>) -> Self {
        Self::head(ContainerKind::Source, mnemonic.into(), url.into())
    }

    /// A new collection HEAD.
    pub fn collection(mnemonic: impl Into<String>, url: impl Into<String>) -> Self {
        Self::head(ContainerKind::Collection, mnemonic.into(), url.into())
    }

    /// A new version row of this container.
    pub fn new_version(&self, version: impl Into<String>) -> Self {
        let version = version.into();
        let mut next = self.clone();
        next.id = ContainerId::generate();
        next.url = format!("{}{}/", self.url, version);
        next.version = version;
        next.updated_at = Utc::now();
        next
    }

    /// True on the HEAD row.
    pub fn is_head(&self) -> bool {
        self.version == HEAD
    }

    /// True for sources.
    pub fn is_source(&self) -> bool {
        self.kind == ContainerKind::Source
    }

    /// Scalar metadata hashed into the container's meta checksum.
    pub fn meta_checksum_fields(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("kind".into(), json!(self.kind));
        fields.insert("mnemonic".into(), json!(self.mnemonic));
        fields.insert("version".into(), json!(self.version));
        fields.insert("name".into(), json!(self.name));
        fields.insert("description".into(), json!(self.description));
        fields.insert("released".into(), json!(self.released));
        fields.insert("retired".into(), json!(self.retired));
        fields.insert("extras".into(), Value::Object(self.extras.clone()));
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_share_group() {
        let head = Container::source("CIEL", "/orgs/CIEL/sources/CIEL/");
        assert!(head.is_head());
        assert!(head.is_source());

        let v1 = head.new_version("v1");
        assert!(!v1.is_head());
        assert_ne!(v1.id, head.id);
        assert_eq!(v1.versioned_object_id, head.id);
        assert_eq!(v1.url, "/orgs/CIEL/sources/CIEL/v1/");
    }
}
