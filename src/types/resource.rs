//! Versioned resource identity and lifecycle metadata.
//!
//! Every versioned resource belongs to a logical group identified by its
//! `versioned_object_id`. The row whose `id` equals that id is the mutable
//! HEAD; every other row is an immutable version, and exactly one of them
//! carries `is_latest_version` at rest.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::{Checksummable, Checksums};
use crate::config::KernelConfig;
use crate::error::ValidationErrors;
use super::{Concept, Mapping};

/// Version label reserved for the mutable pointer row.
pub const HEAD: &str = "HEAD";

/// Prefix of placeholder version labels assigned before a row has an id.
pub const TEMP_VERSION_PREFIX: &str = "--TEMP--";

/// Generate a placeholder version label.
pub fn generate_temp_version() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{TEMP_VERSION_PREFIX}{suffix}")
}

/// True for labels produced by [`generate_temp_version`].
pub fn is_temp_version(version: &str) -> bool {
    version.starts_with(TEMP_VERSION_PREFIX)
}

fn mnemonic_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-._@+%\s]+$").ok())
        .as_ref()
}

/// Check a concept or mapping mnemonic, recording problems under `mnemonic`.
pub(crate) fn validate_mnemonic(mnemonic: &str, errors: &mut ValidationErrors) {
    if mnemonic.trim().is_empty() {
        errors.add("mnemonic", "This field may not be blank.");
    } else if let Some(pattern) = mnemonic_pattern() {
        if !pattern.is_match(mnemonic) {
            errors.add("mnemonic", format!("Invalid mnemonic: {mnemonic}"));
        }
    }
}

/// Row identity of a versioned resource.
///
/// Wraps a UUID and implements `Ord` for deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a ResourceId from a UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identity of a container (source or collection) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(Uuid);

impl ContainerId {
    /// Create a ContainerId from a UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for ContainerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ContainerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Kind of versioned resource managed by the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A concept.
    Concept,
    /// A mapping between two concepts.
    Mapping,
}

impl ResourceKind {
    /// Lowercase name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::Mapping => "mapping",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "concept" => Ok(Self::Concept),
            "mapping" => Ok(Self::Mapping),
            other => Err(format!("Invalid resource: {other}")),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concept => write!(f, "Concept"),
            Self::Mapping => write!(f, "Mapping"),
        }
    }
}

/// Lifecycle metadata shared by every versioned resource row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Row identity.
    pub id: ResourceId,
    /// Logical group identity. Equal to `id` on the HEAD row.
    pub versioned_object_id: ResourceId,
    /// Version label.
    pub version: String,
    /// Latest immutable version of the group.
    pub is_latest_version: bool,
    /// Retirement flag, orthogonal to versioning.
    pub retired: bool,
    /// Released flag.
    pub released: bool,
    /// Owning container (the HEAD of a source).
    pub parent: ContainerId,
    /// Free-text change comment.
    pub comment: Option<String>,
    /// User that created the row.
    pub created_by: String,
    /// User that last updated the row.
    pub updated_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Cached checksums.
    #[serde(default)]
    pub checksums: Checksums,
}

impl VersionInfo {
    /// Metadata for a brand new resource group, shaped as its HEAD row.
    pub fn new(parent: ContainerId) -> Self {
        let id = ResourceId::generate();
        let now = Utc::now();
        Self {
            id,
            versioned_object_id: id,
            version: HEAD.to_string(),
            is_latest_version: false,
            retired: false,
            released: false,
            parent,
            comment: None,
            created_by: String::new(),
            updated_by: String::new(),
            created_at: now,
            updated_at: now,
            checksums: Checksums::default(),
        }
    }

    /// True on the mutable pointer row.
    pub fn is_head(&self) -> bool {
        self.id == self.versioned_object_id
    }

    /// True while the version label is a placeholder.
    pub fn has_temp_version(&self) -> bool {
        is_temp_version(&self.version)
    }
}

/// A resource that participates in the version lifecycle.
pub trait Versioned: Checksummable + Clone + Send + Sync + 'static {
    /// Resource kind, used to pick the hierarchy repair strategy.
    const KIND: ResourceKind;

    /// Lifecycle metadata.
    fn info(&self) -> &VersionInfo;

    /// Mutable lifecycle metadata.
    fn info_mut(&mut self) -> &mut VersionInfo;

    /// Human identifier, unique within the owning container.
    fn mnemonic(&self) -> &str;

    /// Wrap into the storage enum.
    fn into_resource(self) -> Resource;

    /// Unwrap from the storage enum. `None` if the kind does not match.
    fn from_resource(resource: Resource) -> Option<Self>;

    /// Copy content fields from this version onto the HEAD row.
    fn sync_head(&self, head: &mut Self);

    /// Field validation run before a version is persisted.
    fn validate(&self, _config: &KernelConfig) -> Result<(), ValidationErrors> {
        Ok(())
    }

    /// True if structural relationships differ from `previous`.
    fn hierarchy_changed(&self, _previous: Option<&Self>) -> bool {
        false
    }

    /// True on the mutable pointer row.
    fn is_head(&self) -> bool {
        self.info().is_head()
    }

    /// A copy of this row as an unsaved new version of the same group.
    fn clone_as_new_version(&self) -> Self {
        let mut next = self.clone();
        let info = next.info_mut();
        info.id = ResourceId::generate();
        info.version = String::new();
        info.is_latest_version = false;
        info.comment = None;
        info.checksums.clear();
        next
    }
}

/// Storage form of any versioned resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Resource {
    /// A concept row.
    Concept(Concept),
    /// A mapping row.
    Mapping(Mapping),
}

impl Resource {
    /// Lifecycle metadata.
    pub fn info(&self) -> &VersionInfo {
        match self {
            Self::Concept(c) => &c.info,
            Self::Mapping(m) => &m.info,
        }
    }

    /// Mutable lifecycle metadata.
    pub fn info_mut(&mut self) -> &mut VersionInfo {
        match self {
            Self::Concept(c) => &mut c.info,
            Self::Mapping(m) => &mut m.info,
        }
    }

    /// Resource kind.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Concept(_) => ResourceKind::Concept,
            Self::Mapping(_) => ResourceKind::Mapping,
        }
    }

    /// Row identity.
    pub fn id(&self) -> ResourceId {
        self.info().id
    }

    /// Logical group identity.
    pub fn versioned_object_id(&self) -> ResourceId {
        self.info().versioned_object_id
    }

    /// Human identifier.
    pub fn mnemonic(&self) -> &str {
        match self {
            Self::Concept(c) => &c.mnemonic,
            Self::Mapping(m) => &m.mnemonic,
        }
    }

    /// Borrow as a concept.
    pub fn as_concept(&self) -> Option<&Concept> {
        match self {
            Self::Concept(c) => Some(c),
            Self::Mapping(_) => None,
        }
    }

    /// Borrow as a mapping.
    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Self::Mapping(m) => Some(m),
            Self::Concept(_) => None,
        }
    }
}

impl From<Concept> for Resource {
    fn from(concept: Concept) -> Self {
        Self::Concept(concept)
    }
}

impl From<Mapping> for Resource {
    fn from(mapping: Mapping) -> Self {
        Self::Mapping(mapping)
    }
}
