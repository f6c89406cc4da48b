//! Checksums over raw resource JSON, in the shape clients exchange.
//!
//! Field selection follows the stored-resource rules, but reads the wire
//! keys (`name`/`name_type`, `from_concept_code`, `sort_weight`, ...)
//! straight from the payload. An array payload yields one checksum per item,
//! combined the same way as [`super::checksum_of_many`].

use serde_json::{Map, Value};

use crate::canonical::{combine_checksums, generate_checksum};
use crate::config::DigestAlgorithm;
use crate::types::{is_fully_specified_type, ResourceKind};
use super::{cleanup, ChecksumKind};

const NAME_FIELDS: &[&str] = &["locale", "locale_preferred", "name", "name_type", "external_id"];
const DESCRIPTION_FIELDS: &[&str] = &[
    "locale",
    "locale_preferred",
    "description",
    "description_type",
    "external_id",
];
const OPTIONAL_MAPPING_FIELDS: &[&str] = &[
    "extras",
    "external_id",
    "from_source_url",
    "from_source_version",
    "to_source_url",
    "to_source_version",
];

/// Failure to checksum a raw payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RawChecksumError {
    /// Only standard and smart checksums exist for resources.
    #[error("Invalid checksum type: {0}")]
    UnsupportedKind(ChecksumKind),
    /// An item was not a JSON object.
    #[error("Expected a JSON object or an array of objects")]
    NotAnObject,
    /// Empty array.
    #[error("Nothing to checksum")]
    Empty,
}

fn get(data: &Map<String, Value>, key: &str) -> Value {
    data.get(key).cloned().unwrap_or(Value::Null)
}

fn truthy_or_null(value: Value) -> Value {
    match &value {
        Value::Null | Value::Bool(false) => Value::Null,
        Value::String(s) if s.is_empty() => Value::Null,
        Value::Array(a) if a.is_empty() => Value::Null,
        Value::Object(o) if o.is_empty() => Value::Null,
        Value::Number(n) if n.as_f64() == Some(0.0) => Value::Null,
        _ => value,
    }
}

fn locales(data: &Map<String, Value>, relation: &str, fields: &[&str], fully_specified_only: bool) -> Value {
    let items = data.get(relation).and_then(Value::as_array).cloned().unwrap_or_default();
    Value::Array(
        items
            .iter()
            .filter_map(Value::as_object)
            .filter(|locale| {
                !fully_specified_only
                    || is_fully_specified_type(locale.get("name_type").and_then(Value::as_str))
            })
            .map(|locale| {
                Value::Object(fields.iter().map(|f| (f.to_string(), get(locale, f))).collect())
            })
            .collect(),
    )
}

/// Checksum field map of a raw concept.
pub fn concept_fields(data: &Map<String, Value>, kind: ChecksumKind) -> Result<Value, RawChecksumError> {
    let mut fields = Map::new();
    fields.insert("concept_class".into(), get(data, "concept_class"));
    fields.insert("datatype".into(), get(data, "datatype"));
    fields.insert("retired".into(), data.get("retired").cloned().unwrap_or(Value::Bool(false)));
    match kind {
        ChecksumKind::Standard => {
            fields.insert("external_id".into(), get(data, "external_id"));
            fields.insert("extras".into(), get(data, "extras"));
            fields.insert("names".into(), locales(data, "names", NAME_FIELDS, false));
            fields.insert("descriptions".into(), locales(data, "descriptions", DESCRIPTION_FIELDS, false));
            for key in ["parent_concept_urls", "child_concept_urls"] {
                fields.insert(key.into(), data.get(key).cloned().unwrap_or(Value::Array(Vec::new())));
            }
        }
        ChecksumKind::Smart => {
            fields.insert("names".into(), locales(data, "names", NAME_FIELDS, true));
        }
        other => return Err(RawChecksumError::UnsupportedKind(other)),
    }
    Ok(Value::Object(fields))
}

/// Checksum field map of a raw mapping.
pub fn mapping_fields(data: &Map<String, Value>, kind: ChecksumKind) -> Result<Value, RawChecksumError> {
    let mut fields = Map::new();
    for key in ["map_type", "from_concept_code", "to_concept_code", "from_concept_name", "to_concept_name"] {
        fields.insert(key.into(), get(data, key));
    }
    fields.insert("retired".into(), data.get("retired").cloned().unwrap_or(Value::Bool(false)));
    match kind {
        ChecksumKind::Smart => {}
        ChecksumKind::Standard => {
            let sort_weight = get(data, "sort_weight")
                .as_f64()
                .filter(|w| *w != 0.0)
                .map_or(Value::Null, Value::from);
            fields.insert("sort_weight".into(), sort_weight);
            for key in OPTIONAL_MAPPING_FIELDS {
                fields.insert(key.to_string(), truthy_or_null(get(data, key)));
            }
        }
        other => return Err(RawChecksumError::UnsupportedKind(other)),
    }
    Ok(Value::Object(fields))
}

/// Checksum of a raw payload: one object, or an array of objects.
pub fn raw_checksum(
    resource: ResourceKind,
    data: &Value,
    kind: ChecksumKind,
    digest: DigestAlgorithm,
) -> Result<String, RawChecksumError> {
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let checksums = items
        .into_iter()
        .map(|item| {
            let map = item.as_object().ok_or(RawChecksumError::NotAnObject)?;
            let fields = match resource {
                ResourceKind::Concept => concept_fields(map, kind)?,
                ResourceKind::Mapping => mapping_fields(map, kind)?,
            };
            Ok(generate_checksum(&cleanup(fields), digest))
        })
        .collect::<Result<Vec<String>, RawChecksumError>>()?;
    combine_checksums(&checksums, digest).ok_or(RawChecksumError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use crate::types::{Concept, ConceptRef, ContainerId, LocalizedText, Mapping};
    use serde_json::json;

    #[test]
    fn test_raw_concept_matches_stored_concept() {
        let concept = Concept::new(ContainerId::generate(), "C1", "Diagnosis", "N/A")
            .with_name(LocalizedText::new("en", "Malaria").with_type("FULLY_SPECIFIED"))
            .with_name(LocalizedText::new("fr", "Paludisme"));
        let raw = json!({
            "concept_class": "Diagnosis",
            "datatype": "N/A",
            "names": [
                {"locale": "en", "locale_preferred": false, "name": "Malaria", "name_type": "FULLY_SPECIFIED"},
                {"locale": "fr", "locale_preferred": false, "name": "Paludisme"}
            ]
        });
        for kind in [ChecksumKind::Standard, ChecksumKind::Smart] {
            assert_eq!(
                raw_checksum(ResourceKind::Concept, &raw, kind, DigestAlgorithm::Md5).unwrap(),
                compute_checksum(&concept, kind, DigestAlgorithm::Md5),
                "{kind}"
            );
        }
    }

    #[test]
    fn test_raw_mapping_matches_stored_mapping() {
        let source = ContainerId::generate();
        let mapping = Mapping::new(
            source,
            "M1",
            "SAME-AS",
            ConceptRef::external("/orgs/O/sources/S/", "A"),
            ConceptRef::external("/orgs/WHO/sources/ICD-10/", "B54"),
        )
        .with_sort_weight(1.0);
        let raw = json!({
            "map_type": "SAME-AS",
            "from_concept_code": "A",
            "to_concept_code": "B54",
            "from_source_url": "/orgs/O/sources/S/",
            "to_source_url": "/orgs/WHO/sources/ICD-10/",
            "sort_weight": 1.0,
            "extras": {}
        });
        assert_eq!(
            raw_checksum(ResourceKind::Mapping, &raw, ChecksumKind::Standard, DigestAlgorithm::Md5).unwrap(),
            compute_checksum(&mapping, ChecksumKind::Standard, DigestAlgorithm::Md5)
        );
    }

    #[test]
    fn test_array_payload_combines() {
        let a = json!({"concept_class": "Misc", "datatype": "N/A"});
        let b = json!({"concept_class": "Drug", "datatype": "N/A"});
        let digest = DigestAlgorithm::Md5;
        let one = raw_checksum(ResourceKind::Concept, &json!([a.clone()]), ChecksumKind::Standard, digest).unwrap();
        assert_eq!(one, raw_checksum(ResourceKind::Concept, &a, ChecksumKind::Standard, digest).unwrap());
        let ab = raw_checksum(ResourceKind::Concept, &json!([a.clone(), b.clone()]), ChecksumKind::Standard, digest);
        let ba = raw_checksum(ResourceKind::Concept, &json!([b, a]), ChecksumKind::Standard, digest);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_rejects_bad_payloads() {
        let digest = DigestAlgorithm::Md5;
        assert_eq!(
            raw_checksum(ResourceKind::Concept, &json!("x"), ChecksumKind::Standard, digest),
            Err(RawChecksumError::NotAnObject)
        );
        assert_eq!(
            raw_checksum(ResourceKind::Concept, &json!([]), ChecksumKind::Standard, digest),
            Err(RawChecksumError::Empty)
        );
        assert_eq!(
            raw_checksum(ResourceKind::Mapping, &json!({}), ChecksumKind::Meta, digest),
            Err(RawChecksumError::UnsupportedKind(ChecksumKind::Meta))
        );
    }
}
