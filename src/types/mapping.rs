//! Mappings: typed relation edges between concepts.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::checksum::{ChecksumKind, Checksummable, Checksums};
use crate::config::KernelConfig;
use crate::error::ValidationErrors;
use super::concept::Concept;
use super::resource::{
    validate_mnemonic, ContainerId, Resource, ResourceId, ResourceKind, VersionInfo, Versioned,
};

/// Traversal direction over mapping and hierarchy edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Outgoing mappings (`from_concept` side) and hierarchy children.
    #[default]
    Forward,
    /// Incoming mappings (`to_concept` side) and hierarchy parents.
    Reverse,
}

impl Direction {
    /// Direction from a `reverse` flag.
    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            Self::Reverse
        } else {
            Self::Forward
        }
    }
}

/// One endpoint of a mapping.
///
/// `concept` holds the logical id when the endpoint resolves to a concept in
/// this system. External endpoints carry only a source url and a code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptRef {
    /// Logical id of the referenced concept, if local.
    #[serde(default)]
    pub concept: Option<ResourceId>,
    /// Url of the source the code belongs to.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Version of that source.
    #[serde(default)]
    pub source_version: Option<String>,
    /// Concept code.
    pub code: String,
    /// Concept display name.
    #[serde(default)]
    pub name: Option<String>,
}

impl ConceptRef {
    /// Reference a local concept.
    pub fn local(concept: &Concept) -> Self {
        Self {
            concept: Some(concept.versioned_object_id()),
            source_url: None,
            source_version: None,
            code: concept.mnemonic.clone(),
            name: None,
        }
    }

    /// Reference a code in another (possibly unknown) source.
    pub fn external(source_url: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            concept: None,
            source_url: Some(source_url.into()),
            source_version: None,
            code: code.into(),
            name: None,
        }
    }

    /// Set the source url.
    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = Some(source_url.into());
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// True if the endpoint names a local concept.
    pub fn is_resolved(&self) -> bool {
        self.concept.is_some()
    }
}

fn non_empty(value: &Option<String>) -> Value {
    match value {
        Some(s) if !s.is_empty() => json!(s),
        _ => Value::Null,
    }
}

/// A mapping version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Lifecycle metadata.
    pub info: VersionInfo,
    /// Mapping identifier, unique within the owning source.
    pub mnemonic: String,
    /// Relation type, e.g. `SAME-AS`.
    pub map_type: String,
    /// Origin endpoint.
    pub from_concept: ConceptRef,
    /// Target endpoint.
    pub to_concept: ConceptRef,
    /// Ordering weight among mappings of the same type.
    #[serde(default)]
    pub sort_weight: Option<f64>,
    /// External identifier.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Free-form extras.
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl Mapping {
    /// Draft a new mapping owned by `parent`, shaped as its HEAD row.
    pub fn new(
        parent: ContainerId,
        mnemonic: impl Into<String>,
        map_type: impl Into<String>,
        from_concept: ConceptRef,
        to_concept: ConceptRef,
    ) -> Self {
        Self {
            info: VersionInfo::new(parent),
            mnemonic: mnemonic.into(),
            map_type: map_type.into(),
            from_concept,
            to_concept,
            sort_weight: None,
            external_id: None,
            extras: Map::new(),
        }
    }

    /// Set the sort weight.
    pub fn with_sort_weight(mut self, sort_weight: f64) -> Self {
        self.sort_weight = Some(sort_weight);
        self
    }

    /// Set an extra.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Row identity.
    pub fn id(&self) -> ResourceId {
        self.info.id
    }

    /// Logical identity.
    pub fn versioned_object_id(&self) -> ResourceId {
        self.info.versioned_object_id
    }

    /// The endpoint a traversal starts from.
    pub fn origin(&self, direction: Direction) -> &ConceptRef {
        match direction {
            Direction::Forward => &self.from_concept,
            Direction::Reverse => &self.to_concept,
        }
    }

    /// The endpoint a traversal moves to.
    pub fn target(&self, direction: Direction) -> &ConceptRef {
        match direction {
            Direction::Forward => &self.to_concept,
            Direction::Reverse => &self.from_concept,
        }
    }

    /// Result ordering: map type, then sort weight (unset last), then mnemonic.
    pub fn cascade_order(a: &Mapping, b: &Mapping) -> Ordering {
        a.map_type
            .cmp(&b.map_type)
            .then_with(|| match (a.sort_weight, b.sort_weight) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.mnemonic.cmp(&b.mnemonic))
    }
}

impl Checksummable for Mapping {
    const CHECKSUM_KINDS: &'static [ChecksumKind] = &[ChecksumKind::Standard, ChecksumKind::Smart];

    fn checksum_fields(&self, kind: ChecksumKind) -> Option<Value> {
        let mut fields = Map::new();
        fields.insert("map_type".into(), json!(self.map_type));
        fields.insert("from_concept_code".into(), json!(self.from_concept.code));
        fields.insert("to_concept_code".into(), json!(self.to_concept.code));
        fields.insert("from_concept_name".into(), json!(self.from_concept.name));
        fields.insert("to_concept_name".into(), json!(self.to_concept.name));
        fields.insert("retired".into(), json!(self.info.retired));
        match kind {
            ChecksumKind::Smart => {}
            ChecksumKind::Standard => {
                let sort_weight = match self.sort_weight {
                    Some(w) if w != 0.0 => json!(w),
                    _ => Value::Null,
                };
                fields.insert("sort_weight".into(), sort_weight);
                let extras = if self.extras.is_empty() {
                    Value::Null
                } else {
                    Value::Object(self.extras.clone())
                };
                fields.insert("extras".into(), extras);
                fields.insert("external_id".into(), non_empty(&self.external_id));
                fields.insert("from_source_url".into(), non_empty(&self.from_concept.source_url));
                fields.insert("from_source_version".into(), non_empty(&self.from_concept.source_version));
                fields.insert("to_source_url".into(), non_empty(&self.to_concept.source_url));
                fields.insert("to_source_version".into(), non_empty(&self.to_concept.source_version));
            }
            ChecksumKind::Meta | ChecksumKind::All => return None,
        }
        Some(Value::Object(fields))
    }

    fn checksums(&self) -> &Checksums {
        &self.info.checksums
    }

    fn checksums_mut(&mut self) -> &mut Checksums {
        &mut self.info.checksums
    }
}

impl Versioned for Mapping {
    const KIND: ResourceKind = ResourceKind::Mapping;

    fn info(&self) -> &VersionInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut VersionInfo {
        &mut self.info
    }

    fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    fn into_resource(self) -> Resource {
        Resource::Mapping(self)
    }

    fn from_resource(resource: Resource) -> Option<Self> {
        match resource {
            Resource::Mapping(m) => Some(m),
            Resource::Concept(_) => None,
        }
    }

    fn sync_head(&self, head: &mut Self) {
        head.map_type = self.map_type.clone();
        head.from_concept = self.from_concept.clone();
        head.to_concept = self.to_concept.clone();
        head.sort_weight = self.sort_weight;
        head.external_id = self.external_id.clone();
        head.extras = self.extras.clone();
        head.info.retired = self.info.retired;
        head.info.updated_by = self.info.updated_by.clone();
        head.info.updated_at = self.info.updated_at;
    }

    fn validate(&self, _config: &KernelConfig) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        validate_mnemonic(&self.mnemonic, &mut errors);
        if self.map_type.trim().is_empty() {
            errors.add("map_type", "This field may not be blank.");
        }
        if !self.from_concept.is_resolved() && self.from_concept.code.is_empty() {
            errors.add("from_concept_code", "Must specify a from concept or a from concept code.");
        }
        if !self.to_concept.is_resolved() && self.to_concept.code.is_empty() {
            errors.add("to_concept_code", "Must specify a to concept or a to concept code.");
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use crate::config::DigestAlgorithm;

    fn mapping(map_type: &str, weight: Option<f64>) -> Mapping {
        let source = ContainerId::generate();
        let from = Concept::new(source, "A", "Misc", "N/A");
        let mut m = Mapping::new(
            source,
            format!("M-{map_type}"),
            map_type,
            ConceptRef::local(&from),
            ConceptRef::external("/orgs/WHO/sources/ICD-10/", "B54"),
        );
        m.sort_weight = weight;
        m
    }

    #[test]
    fn test_direction_endpoints() {
        let m = mapping("SAME-AS", None);
        assert_eq!(m.origin(Direction::Forward).code, "A");
        assert_eq!(m.target(Direction::Forward).code, "B54");
        assert_eq!(m.origin(Direction::Reverse).code, "B54");
        assert_eq!(Direction::from_reverse(true), Direction::Reverse);
    }

    #[test]
    fn test_cascade_order() {
        let mut mappings = vec![
            mapping("SAME-AS", None),
            mapping("NARROWER-THAN", Some(2.0)),
            mapping("SAME-AS", Some(1.0)),
        ];
        mappings.sort_by(Mapping::cascade_order);
        assert_eq!(mappings[0].map_type, "NARROWER-THAN");
        assert_eq!(mappings[1].sort_weight, Some(1.0));
        assert_eq!(mappings[2].sort_weight, None);
    }

    #[test]
    fn test_zero_sort_weight_hashes_like_unset() {
        let a = mapping("SAME-AS", None);
        let mut b = a.clone();
        b.sort_weight = Some(0.0);
        assert_eq!(
            compute_checksum(&a, ChecksumKind::Standard, DigestAlgorithm::Md5),
            compute_checksum(&b, ChecksumKind::Standard, DigestAlgorithm::Md5)
        );
    }

    #[test]
    fn test_smart_checksum_ignores_extras() {
        let a = mapping("SAME-AS", None);
        let b = a.clone().with_extra("note", json!("reviewed"));
        assert_eq!(
            compute_checksum(&a, ChecksumKind::Smart, DigestAlgorithm::Md5),
            compute_checksum(&b, ChecksumKind::Smart, DigestAlgorithm::Md5)
        );
        assert_ne!(
            compute_checksum(&a, ChecksumKind::Standard, DigestAlgorithm::Md5),
            compute_checksum(&b, ChecksumKind::Standard, DigestAlgorithm::Md5)
        );
    }

    #[test]
    fn test_validation() {
        let mut m = mapping("", None);
        m.to_concept.code.clear();
        let errors = m.validate(&KernelConfig::default()).unwrap_err();
        assert!(errors.contains("map_type"));
        assert!(errors.contains("to_concept_code"));
        assert!(!errors.contains("from_concept_code"));
    }
}
