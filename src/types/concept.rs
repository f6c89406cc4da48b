//! Concepts: terminology nodes with names, descriptions and hierarchy parents.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::checksum::{ChecksumKind, Checksummable, Checksums};
use crate::config::KernelConfig;
use crate::error::ValidationErrors;
use super::resource::{
    validate_mnemonic, ContainerId, Resource, ResourceId, ResourceKind, VersionInfo, Versioned,
};

/// Canonical fully-specified name type.
pub const FULLY_SPECIFIED: &str = "FULLY_SPECIFIED";

/// A localized name or description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    /// Locale code, e.g. `en`.
    pub locale: String,
    /// Preferred in its locale.
    #[serde(default)]
    pub locale_preferred: bool,
    /// The text.
    pub text: String,
    /// Name type or description type.
    #[serde(default)]
    pub text_type: Option<String>,
    /// External identifier.
    #[serde(default)]
    pub external_id: Option<String>,
}

impl LocalizedText {
    /// Create a plain localized text.
    pub fn new(locale: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            locale_preferred: false,
            text: text.into(),
            text_type: None,
            external_id: None,
        }
    }

    /// Mark as locale preferred.
    pub fn preferred(mut self) -> Self {
        self.locale_preferred = true;
        self
    }

    /// Set the type.
    pub fn with_type(mut self, text_type: impl Into<String>) -> Self {
        self.text_type = Some(text_type.into());
        self
    }

    /// True if the type denotes a fully specified name.
    pub fn is_fully_specified(&self) -> bool {
        is_fully_specified_type(self.text_type.as_deref())
    }

    fn checksum_value(&self, text_key: &str, type_key: &str) -> Value {
        let mut map = Map::new();
        map.insert("locale".into(), json!(self.locale));
        map.insert("locale_preferred".into(), json!(self.locale_preferred));
        map.insert(text_key.into(), json!(self.text));
        map.insert(type_key.into(), json!(self.text_type));
        map.insert("external_id".into(), json!(self.external_id));
        Value::Object(map)
    }
}

/// True for any spelling of "fully specified" (`FULLY_SPECIFIED`, `Fully Specified`, `fully-specified`, ...).
pub fn is_fully_specified_type(name_type: Option<&str>) -> bool {
    match name_type {
        None | Some("") => false,
        Some(FULLY_SPECIFIED) | Some("Fully Specified") => true,
        Some(other) => {
            let squashed: String = other.chars().filter(|c| !matches!(c, ' ' | '_' | '-')).collect();
            squashed.to_lowercase() == "fullyspecified"
        }
    }
}

/// A concept version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Lifecycle metadata.
    pub info: VersionInfo,
    /// Concept code, unique within the owning source.
    pub mnemonic: String,
    /// Concept class, e.g. `Diagnosis`.
    pub concept_class: String,
    /// Datatype, e.g. `N/A`, `Numeric`.
    pub datatype: String,
    /// External identifier.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Free-form extras.
    #[serde(default)]
    pub extras: Map<String, Value>,
    /// Names.
    #[serde(default)]
    pub names: Vec<LocalizedText>,
    /// Descriptions.
    #[serde(default)]
    pub descriptions: Vec<LocalizedText>,
    /// Logical ids of hierarchy parents.
    #[serde(default)]
    pub parent_concepts: BTreeSet<ResourceId>,
}

impl Concept {
    /// Draft a new concept owned by `parent`, shaped as its HEAD row.
    pub fn new(
        parent: ContainerId,
        mnemonic: impl Into<String>,
        concept_class: impl Into<String>,
        datatype: impl Into<String>,
    ) -> Self {
        Self {
            info: VersionInfo::new(parent),
            mnemonic: mnemonic.into(),
            concept_class: concept_class.into(),
            datatype: datatype.into(),
            external_id: None,
            extras: Map::new(),
            names: Vec::new(),
            descriptions: Vec::new(),
            parent_concepts: BTreeSet::new(),
        }
    }

    /// Add a name.
    pub fn with_name(mut self, name: LocalizedText) -> Self {
        self.names.push(name);
        self
    }

    /// Add a description.
    pub fn with_description(mut self, description: LocalizedText) -> Self {
        self.descriptions.push(description);
        self
    }

    /// Add a hierarchy parent by logical id.
    pub fn with_parent(mut self, parent: ResourceId) -> Self {
        self.parent_concepts.insert(parent);
        self
    }

    /// Set an extra.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Set the external id.
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
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

    /// Preferred name, else the first fully specified name, else the first name.
    pub fn display_name(&self) -> Option<&str> {
        self.names
            .iter()
            .find(|n| n.locale_preferred)
            .or_else(|| self.names.iter().find(|n| n.is_fully_specified()))
            .or_else(|| self.names.first())
            .map(|n| n.text.as_str())
    }

    fn names_value(&self, fully_specified_only: bool) -> Value {
        Value::Array(
            self.names
                .iter()
                .filter(|n| !fully_specified_only || n.is_fully_specified())
                .map(|n| n.checksum_value("name", "name_type"))
                .collect(),
        )
    }
}

impl Checksummable for Concept {
    const CHECKSUM_KINDS: &'static [ChecksumKind] = &[ChecksumKind::Standard, ChecksumKind::Smart];

    fn checksum_fields(&self, kind: ChecksumKind) -> Option<Value> {
        let mut fields = Map::new();
        fields.insert("concept_class".into(), json!(self.concept_class));
        fields.insert("datatype".into(), json!(self.datatype));
        fields.insert("retired".into(), json!(self.info.retired));
        match kind {
            ChecksumKind::Standard => {
                fields.insert("external_id".into(), json!(self.external_id));
                fields.insert("extras".into(), Value::Object(self.extras.clone()));
                fields.insert("names".into(), self.names_value(false));
                fields.insert(
                    "descriptions".into(),
                    Value::Array(
                        self.descriptions
                            .iter()
                            .map(|d| d.checksum_value("description", "description_type"))
                            .collect(),
                    ),
                );
                fields.insert(
                    "parent_concept_urls".into(),
                    Value::Array(
                        self.parent_concepts
                            .iter()
                            .map(|p| Value::String(p.to_string()))
                            .collect(),
                    ),
                );
            }
            ChecksumKind::Smart => {
                fields.insert("names".into(), self.names_value(true));
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

impl Versioned for Concept {
    const KIND: ResourceKind = ResourceKind::Concept;

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
        Resource::Concept(self)
    }

    fn from_resource(resource: Resource) -> Option<Self> {
        match resource {
            Resource::Concept(c) => Some(c),
            Resource::Mapping(_) => None,
        }
    }

    fn sync_head(&self, head: &mut Self) {
        head.concept_class = self.concept_class.clone();
        head.datatype = self.datatype.clone();
        head.external_id = self.external_id.clone().or_else(|| head.external_id.take());
        head.extras = self.extras.clone();
        head.names = self.names.clone();
        head.descriptions = self.descriptions.clone();
        head.parent_concepts = self.parent_concepts.clone();
        head.info.retired = self.info.retired;
        head.info.updated_by = self.info.updated_by.clone();
        head.info.updated_at = self.info.updated_at;
    }

    fn validate(&self, config: &KernelConfig) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        validate_mnemonic(&self.mnemonic, &mut errors);
        if self.names.len() > config.max_locales {
            errors.add("names", format!("max limit {} of names exceeded", config.max_locales));
        }
        if self.descriptions.len() > config.max_locales {
            errors.add(
                "descriptions",
                format!("max limit {} of descriptions exceeded", config.max_locales),
            );
        }
        errors.into_result()
    }

    fn hierarchy_changed(&self, previous: Option<&Self>) -> bool {
        match previous {
            Some(previous) => previous.parent_concepts != self.parent_concepts,
            None => !self.parent_concepts.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use crate::config::DigestAlgorithm;

    fn concept() -> Concept {
        Concept::new(ContainerId::generate(), "C1", "Diagnosis", "N/A")
            .with_name(LocalizedText::new("en", "Malaria").with_type("FULLY_SPECIFIED").preferred())
            .with_name(LocalizedText::new("fr", "Paludisme").with_type("SHORT"))
    }

    #[test]
    fn test_fully_specified_spellings() {
        assert!(is_fully_specified_type(Some("FULLY_SPECIFIED")));
        assert!(is_fully_specified_type(Some("Fully Specified")));
        assert!(is_fully_specified_type(Some("fully-specified")));
        assert!(is_fully_specified_type(Some("Fully_Specified")));
        assert!(!is_fully_specified_type(Some("SHORT")));
        assert!(!is_fully_specified_type(None));
        assert!(!is_fully_specified_type(Some("")));
    }

    #[test]
    fn test_smart_checksum_ignores_non_fully_specified_names() {
        let a = concept();
        let mut b = a.clone();
        b.names[1].text = "Malaria (fr)".into();
        b.extras.insert("source".into(), json!("import"));

        let smart = |c: &Concept| compute_checksum(c, ChecksumKind::Smart, DigestAlgorithm::Md5);
        let standard = |c: &Concept| compute_checksum(c, ChecksumKind::Standard, DigestAlgorithm::Md5);
        assert_eq!(smart(&a), smart(&b));
        assert_ne!(standard(&a), standard(&b));
    }

    #[test]
    fn test_checksum_ignores_lifecycle_metadata() {
        let a = concept();
        let mut b = a.clone_as_new_version();
        b.info.version = "v2".into();
        b.info.updated_by = "someone-else".into();
        assert_eq!(
            compute_checksum(&a, ChecksumKind::Standard, DigestAlgorithm::Md5),
            compute_checksum(&b, ChecksumKind::Standard, DigestAlgorithm::Md5)
        );
    }

    #[test]
    fn test_locale_limit() {
        let config = KernelConfig::default().with_max_locales(1);
        let errors = concept().validate(&config).unwrap_err();
        assert_eq!(errors.get("names").unwrap(), &["max limit 1 of names exceeded".to_string()]);
        assert!(!errors.contains("descriptions"));
    }

    #[test]
    fn test_display_name_prefers_locale_preferred() {
        assert_eq!(concept().display_name(), Some("Malaria"));
        let bare = Concept::new(ContainerId::generate(), "C2", "Misc", "N/A");
        assert_eq!(bare.display_name(), None);
    }

    #[test]
    fn test_hierarchy_changed() {
        let a = concept();
        assert!(!a.hierarchy_changed(None));
        let b = a.clone().with_parent(ResourceId::generate());
        assert!(b.hierarchy_changed(Some(&a)));
        assert!(b.hierarchy_changed(None));
        assert!(!b.hierarchy_changed(Some(&b)));
    }
}
