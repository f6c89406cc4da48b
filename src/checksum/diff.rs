//! Checksum-based comparison of two resource sets.
//!
//! Resources are matched by mnemonic. A common resource whose smart checksum
//! changed is a major change, one whose only standard checksum changed is a
//! minor change. Retired resources are tracked separately.
//!
//! Verbosity:
//! - `0`: counts only
//! - `1`: also count unchanged resources
//! - `2`: list mnemonics of new, removed and changed resources
//! - `3`: also list mnemonics of unchanged resources

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{ResourceId, Versioned};

#[derive(Debug, Clone)]
struct Entry {
    id: ResourceId,
    standard: Option<String>,
    smart: Option<String>,
}

#[derive(Debug, Default)]
struct Side {
    active: BTreeMap<String, Entry>,
    retired: BTreeMap<String, Entry>,
}

impl Side {
    fn build<R: Versioned>(resources: &[R]) -> Self {
        let mut side = Side::default();
        for resource in resources {
            let checksums = resource.checksums();
            let entry = Entry {
                id: resource.info().id,
                standard: checksums.standard().map(str::to_string),
                smart: checksums.smart().map(str::to_string),
            };
            let bucket = if resource.info().retired { &mut side.retired } else { &mut side.active };
            bucket.insert(resource.mnemonic().to_string(), entry);
        }
        side
    }
}

/// A diff bucket: a bare count, or a count with the matching mnemonics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DiffCount {
    /// Count only.
    Count(usize),
    /// Count and identifiers.
    Detailed {
        /// Number of resources.
        total: usize,
        /// Their mnemonics, sorted.
        mnemonic: Vec<String>,
    },
}

impl DiffCount {
    /// Number of resources in the bucket.
    pub fn total(&self) -> usize {
        match self {
            Self::Count(n) => *n,
            Self::Detailed { total, .. } => *total,
        }
    }
}

/// Result of a [`ChecksumDiff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    /// Present only in the newer set.
    pub new: DiffCount,
    /// Present only in the older set, and not retired in the newer one.
    pub removed: DiffCount,
    /// Sum of retired, major and minor changes.
    pub changed_total: usize,
    /// Newly retired.
    pub changed_retired: DiffCount,
    /// Smart checksum changed.
    pub changed_major: DiffCount,
    /// Only the standard checksum changed.
    pub changed_minor: DiffCount,
    /// Unchanged resources, at verbosity >= 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_total: Option<usize>,
    /// Unchanged by standard checksum, at verbosity >= 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_minor: Option<DiffCount>,
    /// Unchanged by smart checksum, at verbosity >= 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_major: Option<DiffCount>,
}

/// Compares an older and a newer set of resources by checksum.
#[derive(Debug)]
pub struct ChecksumDiff {
    older: Side,
    newer: Side,
    verbosity: u8,
}

impl ChecksumDiff {
    /// Build a diff. Resources should carry cached checksums.
    pub fn new<R: Versioned>(older: &[R], newer: &[R], verbosity: u8) -> Self {
        Self {
            older: Side::build(older),
            newer: Side::build(newer),
            verbosity,
        }
    }

    fn keys(map: &BTreeMap<String, Entry>) -> BTreeSet<&str> {
        map.keys().map(String::as_str).collect()
    }

    /// Mnemonics retired in the newer set only.
    pub fn retired(&self) -> BTreeSet<String> {
        let newer = Self::keys(&self.newer.retired);
        let older = Self::keys(&self.older.retired);
        newer.difference(&older).map(|k| k.to_string()).collect()
    }

    /// Mnemonics active only in the newer set.
    pub fn new_resources(&self) -> BTreeSet<String> {
        let newer = Self::keys(&self.newer.active);
        let older = Self::keys(&self.older.active);
        newer.difference(&older).map(|k| k.to_string()).collect()
    }

    /// Mnemonics active only in the older set that were not retired.
    pub fn removed(&self) -> BTreeSet<String> {
        let retired = self.retired();
        let newer = Self::keys(&self.newer.active);
        Self::keys(&self.older.active)
            .difference(&newer)
            .filter(|k| !retired.contains(**k))
            .map(|k| k.to_string())
            .collect()
    }

    /// Row id of a resource in the diff, preferring the newer set.
    pub fn resource_id(&self, mnemonic: &str) -> Option<ResourceId> {
        self.newer.active.get(mnemonic)
            .or_else(|| self.newer.retired.get(mnemonic))
            .or_else(|| self.older.active.get(mnemonic))
            .or_else(|| self.older.retired.get(mnemonic))
            .map(|e| e.id)
    }

    fn bucket(&self, keys: &BTreeSet<String>, is_same: bool) -> DiffCount {
        let include_ids = if is_same { self.verbosity >= 3 } else { self.verbosity >= 2 };
        if include_ids && !keys.is_empty() {
            DiffCount::Detailed {
                total: keys.len(),
                mnemonic: keys.iter().cloned().collect(),
            }
        } else {
            DiffCount::Count(keys.len())
        }
    }

    /// Run the comparison.
    pub fn process(&self) -> DiffReport {
        let include_same = self.verbosity >= 1;
        let mut changed_major = BTreeSet::new();
        let mut changed_minor = BTreeSet::new();
        let mut same_major = BTreeSet::new();
        let same_minor = BTreeSet::new();

        for (key, older) in &self.older.active {
            let Some(newer) = self.newer.active.get(key) else {
                continue;
            };
            if older.smart != newer.smart {
                changed_major.insert(key.clone());
            } else if older.standard != newer.standard {
                changed_minor.insert(key.clone());
            } else if include_same {
                same_major.insert(key.clone());
            }
        }

        let retired = self.retired();
        let changed_total = retired.len() + changed_major.len() + changed_minor.len();
        DiffReport {
            new: self.bucket(&self.new_resources(), false),
            removed: self.bucket(&self.removed(), false),
            changed_total,
            changed_retired: self.bucket(&retired, false),
            changed_major: self.bucket(&changed_major, false),
            changed_minor: self.bucket(&changed_minor, false),
            same_total: include_same.then(|| same_major.len() + same_minor.len()),
            same_minor: include_same.then(|| self.bucket(&same_minor, true)),
            same_major: include_same.then(|| self.bucket(&same_major, true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksums;
    use crate::config::DigestAlgorithm;
    use crate::types::{Concept, ContainerId, LocalizedText};

    fn concept(source: ContainerId, mnemonic: &str, name: &str) -> Concept {
        let mut c = Concept::new(source, mnemonic, "Diagnosis", "N/A")
            .with_name(LocalizedText::new("en", name).with_type("FULLY_SPECIFIED"));
        c.info.checksums = compute_checksums(&c, DigestAlgorithm::Md5);
        c
    }

    fn rehash(mut c: Concept) -> Concept {
        c.info.checksums = compute_checksums(&c, DigestAlgorithm::Md5);
        c
    }

    fn fixture() -> (Vec<Concept>, Vec<Concept>) {
        let source = ContainerId::generate();
        let same = concept(source, "SAME", "Same");
        let major = concept(source, "MAJOR", "Before");
        let minor = concept(source, "MINOR", "Minor");
        let removed = concept(source, "GONE", "Gone");
        let to_retire = concept(source, "RET", "Retire me");

        let mut major_after = major.clone();
        major_after.names[0].text = "After".into();
        let mut minor_after = minor.clone();
        minor_after.descriptions.push(LocalizedText::new("en", "more detail"));
        let mut retired_after = to_retire.clone();
        retired_after.info.retired = true;
        let added = concept(source, "NEW", "New");

        let older = vec![same.clone(), major, minor, removed, to_retire];
        let newer = vec![
            same,
            rehash(major_after),
            rehash(minor_after),
            rehash(retired_after),
            added,
        ];
        (older, newer)
    }

    #[test]
    fn test_counts() {
        let (older, newer) = fixture();
        let report = ChecksumDiff::new(&older, &newer, 0).process();
        assert_eq!(report.new, DiffCount::Count(1));
        // RET left the active set but was retired, so it is not "removed".
        assert_eq!(report.removed, DiffCount::Count(1));
        assert_eq!(report.changed_retired, DiffCount::Count(1));
        assert_eq!(report.changed_major, DiffCount::Count(1));
        assert_eq!(report.changed_minor, DiffCount::Count(1));
        assert_eq!(report.changed_total, 3);
        assert!(report.same_total.is_none());
    }

    #[test]
    fn test_verbose_lists_identifiers() {
        let (older, newer) = fixture();
        let report = ChecksumDiff::new(&older, &newer, 3).process();
        assert_eq!(
            report.changed_major,
            DiffCount::Detailed { total: 1, mnemonic: vec!["MAJOR".into()] }
        );
        assert_eq!(report.removed.total(), 1);
        assert_eq!(report.same_total, Some(1));
        assert_eq!(
            report.same_major,
            Some(DiffCount::Detailed { total: 1, mnemonic: vec!["SAME".into()] })
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["new"]["mnemonic"][0], "NEW");
    }

    #[test]
    fn test_resource_id_prefers_newer() {
        let (older, newer) = fixture();
        let diff = ChecksumDiff::new(&older, &newer, 0);
        let id = diff.resource_id("NEW").unwrap();
        assert_eq!(id, newer[4].info.id);
        assert!(diff.resource_id("UNKNOWN").is_none());
    }
}
