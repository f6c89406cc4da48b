//! Content checksums for versioned resources and containers.
//!
//! ## Kinds
//!
//! | kind | covers | used for |
//! |------|--------|----------|
//! | `standard` | every content field of a concept or mapping | duplicate-version detection |
//! | `smart` | clinically significant subset | major/minor change classification |
//! | `meta` | a container's own scalar metadata | container fingerprints |
//! | `all` | `meta` combined with the batch checksums of the content | container fingerprints |
//!
//! Checksums are cached on the resource and recomputed only when a requested
//! kind is missing. When checksums are disabled in [`KernelConfig`] every
//! accessor returns `None`.

pub mod fields;
pub mod diff;
pub mod raw;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{combine_checksums, generate_checksum};
use crate::config::{DigestAlgorithm, KernelConfig};
use crate::store::GraphStore;
use crate::types::{Container, ContainerId};

pub use diff::{ChecksumDiff, DiffCount, DiffReport};
pub use fields::cleanup;
pub use raw::{raw_checksum, RawChecksumError};

/// Checksum kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// All content fields.
    Standard,
    /// Significant content fields only.
    Smart,
    /// Container metadata.
    Meta,
    /// Combination of the other kinds.
    All,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standard => "standard",
            Self::Smart => "smart",
            Self::Meta => "meta",
            Self::All => "all",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for ChecksumKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "smart" => Ok(Self::Smart),
            "meta" | "basic" => Ok(Self::Meta),
            "all" => Ok(Self::All),
            other => Err(format!("Invalid checksum type: {other}")),
        }
    }
}

/// Cached checksums keyed by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksums(BTreeMap<ChecksumKind, String>);

impl Checksums {
    /// Checksum of one kind.
    pub fn get(&self, kind: ChecksumKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    /// Store a checksum.
    pub fn insert(&mut self, kind: ChecksumKind, checksum: String) {
        self.0.insert(kind, checksum);
    }

    /// True if every listed kind is present.
    pub fn has_all(&self, kinds: &[ChecksumKind]) -> bool {
        kinds.iter().all(|k| self.0.contains_key(k))
    }

    /// Drop all cached values.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Standard checksum, if cached.
    pub fn standard(&self) -> Option<&str> {
        self.get(ChecksumKind::Standard)
    }

    /// Smart checksum, if cached.
    pub fn smart(&self) -> Option<&str> {
        self.get(ChecksumKind::Smart)
    }

    /// Iterate cached `(kind, checksum)` pairs in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (ChecksumKind, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// A value that can be fingerprinted by checksum kind.
pub trait Checksummable {
    /// Kinds this type produces.
    const CHECKSUM_KINDS: &'static [ChecksumKind];

    /// Raw field map for a kind, before cleanup. `None` for unsupported kinds.
    fn checksum_fields(&self, kind: ChecksumKind) -> Option<Value>;

    /// Cached checksums.
    fn checksums(&self) -> &Checksums;

    /// Mutable cached checksums.
    fn checksums_mut(&mut self) -> &mut Checksums;
}

/// Compute one checksum kind without touching the cache.
///
/// Returns an empty string for kinds the type does not produce.
pub fn compute_checksum<T: Checksummable>(item: &T, kind: ChecksumKind, digest: DigestAlgorithm) -> String {
    item.checksum_fields(kind)
        .map(|fields| generate_checksum(&cleanup(fields), digest))
        .unwrap_or_default()
}

/// Compute every kind the type produces.
pub fn compute_checksums<T: Checksummable>(item: &T, digest: DigestAlgorithm) -> Checksums {
    let mut checksums = Checksums::default();
    for kind in T::CHECKSUM_KINDS {
        if let Some(fields) = item.checksum_fields(*kind) {
            checksums.insert(*kind, generate_checksum(&cleanup(fields), digest));
        }
    }
    checksums
}

/// Cached checksums if complete, otherwise recompute and cache them.
///
/// `None` when checksums are disabled.
pub fn get_checksums<T: Checksummable>(item: &mut T, config: &KernelConfig) -> Option<Checksums> {
    if !config.checksums_enabled {
        return None;
    }
    if item.checksums().is_empty() || !item.checksums().has_all(T::CHECKSUM_KINDS) {
        *item.checksums_mut() = compute_checksums(item, config.digest);
    }
    Some(item.checksums().clone())
}

/// The standard checksum, computing it if needed.
pub fn checksum<T: Checksummable>(item: &mut T, config: &KernelConfig) -> Option<String> {
    get_checksums(item, config).and_then(|c| c.standard().map(str::to_string))
}

/// One checksum over many items.
///
/// A single item yields its own checksum; several are combined. Empty input
/// and disabled checksums yield `None`. Cached values are used when present.
pub fn checksum_of_many<T: Checksummable>(
    items: &[T],
    kind: ChecksumKind,
    config: &KernelConfig,
) -> Option<String> {
    if !config.checksums_enabled {
        return None;
    }
    let checksums: Vec<String> = items
        .iter()
        .map(|item| match item.checksums().get(kind) {
            Some(cached) => cached.to_string(),
            None => compute_checksum(item, kind, config.digest),
        })
        .collect();
    combine_checksums(&checksums, config.digest)
}

/// Meta checksum of a container's own metadata.
pub fn container_meta_checksum(container: &Container, config: &KernelConfig) -> Option<String> {
    if !config.checksums_enabled {
        return None;
    }
    Some(generate_checksum(&cleanup(container.meta_checksum_fields()), config.digest))
}

/// `meta` and `all` checksums of a container.
///
/// `all` combines the meta checksum with the standard batch checksums of the
/// container's concepts and mappings.
pub async fn container_checksums<S: GraphStore>(
    store: &S,
    container: &ContainerId,
    config: &KernelConfig,
) -> Result<Option<Checksums>, S::Error> {
    if !config.checksums_enabled {
        return Ok(None);
    }
    let Some(row) = store.get_container(container).await? else {
        return Ok(None);
    };
    let concepts = store.container_concepts(container).await?;
    let mappings = store.container_mappings(container).await?;

    let mut checksums = Checksums::default();
    let mut parts = Vec::new();
    if let Some(meta) = container_meta_checksum(&row, config) {
        parts.push(meta.clone());
        checksums.insert(ChecksumKind::Meta, meta);
    }
    parts.extend(checksum_of_many(&concepts, ChecksumKind::Standard, config));
    parts.extend(checksum_of_many(&mappings, ChecksumKind::Standard, config));
    if let Some(all) = combine_checksums(&parts, config.digest) {
        checksums.insert(ChecksumKind::All, all);
    }
    Ok(Some(checksums))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::digest_hex;
    use crate::types::{Concept, LocalizedText};

    fn concept(mnemonic: &str) -> Concept {
        Concept::new(ContainerId::generate(), mnemonic, "Diagnosis", "N/A")
            .with_name(LocalizedText::new("en", mnemonic).with_type("FULLY_SPECIFIED"))
    }

    #[test]
    fn test_get_checksums_caches() {
        let config = KernelConfig::default();
        let mut c = concept("C1");
        let first = get_checksums(&mut c, &config).unwrap();
        assert!(first.has_all(&[ChecksumKind::Standard, ChecksumKind::Smart]));
        assert_eq!(c.info.checksums, first);

        // A stale cached value is returned as long as it is complete.
        c.info.checksums.insert(ChecksumKind::Standard, "cached".into());
        assert_eq!(checksum(&mut c, &config).as_deref(), Some("cached"));

        // Missing kinds trigger a recompute.
        c.info.checksums = Checksums::default();
        c.info.checksums.insert(ChecksumKind::Standard, "partial".into());
        assert_eq!(checksum(&mut c, &config), first.standard().map(str::to_string));
    }

    #[test]
    fn test_disabled_checksums_are_absent() {
        let config = KernelConfig::without_checksums();
        let mut c = concept("C1");
        assert!(get_checksums(&mut c, &config).is_none());
        assert!(checksum(&mut c, &config).is_none());
        assert!(checksum_of_many(&[c.clone()], ChecksumKind::Standard, &config).is_none());
        assert!(c.info.checksums.is_empty());
    }

    #[test]
    fn test_checksum_of_many() {
        let config = KernelConfig::default();
        let a = concept("A");
        let b = concept("B");
        let only_a = checksum_of_many(&[a.clone()], ChecksumKind::Standard, &config).unwrap();
        assert_eq!(only_a, compute_checksum(&a, ChecksumKind::Standard, config.digest));

        let ab = checksum_of_many(&[a.clone(), b.clone()], ChecksumKind::Standard, &config).unwrap();
        let ba = checksum_of_many(&[b.clone(), a.clone()], ChecksumKind::Standard, &config).unwrap();
        assert_eq!(ab, ba);

        let mut sorted = vec![
            compute_checksum(&a, ChecksumKind::Standard, config.digest),
            compute_checksum(&b, ChecksumKind::Standard, config.digest),
        ];
        sorted.sort();
        let expected = digest_hex(format!("[\"{}\",\"{}\"]", sorted[0], sorted[1]).as_bytes(), config.digest);
        assert_eq!(ab, expected);

        let empty: [Concept; 0] = [];
        assert!(checksum_of_many(&empty, ChecksumKind::Standard, &config).is_none());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("basic".parse::<ChecksumKind>(), Ok(ChecksumKind::Meta));
        assert_eq!("Smart".parse::<ChecksumKind>(), Ok(ChecksumKind::Smart));
        assert!("fuzzy".parse::<ChecksumKind>().is_err());
    }

    #[test]
    fn test_unsupported_kind_is_empty() {
        assert_eq!(compute_checksum(&concept("A"), ChecksumKind::Meta, DigestAlgorithm::Md5), "");
    }
}
