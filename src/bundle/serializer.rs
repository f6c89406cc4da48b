//! Entry serialization for bundles.

use serde_json::{json, Map, Value};

use crate::cascade::CascadeNode;
use crate::types::{Concept, ConceptRef, Mapping};

/// Detail level of serialized entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Verbosity {
    /// Identity only.
    Brief,
    /// Identity plus display fields.
    #[default]
    Listing,
    /// The full resource.
    Verbose,
}

impl Verbosity {
    /// Verbosity from request flags. `brief` wins over `verbose`.
    pub fn from_flags(verbose: bool, brief: bool) -> Self {
        if brief {
            Self::Brief
        } else if verbose {
            Self::Verbose
        } else {
            Self::Listing
        }
    }
}

/// Renders concepts and mappings into bundle entries.
pub trait EntrySerializer: Send + Sync {
    /// Render a concept.
    fn concept(&self, concept: &Concept, verbosity: Verbosity) -> Value;

    /// Render a mapping.
    fn mapping(&self, mapping: &Mapping, verbosity: Verbosity) -> Value;

    /// Render a hierarchy node: the concept plus `terminal` and nested `entries`
    /// (mappings first, then child nodes).
    fn node(&self, node: &CascadeNode, verbosity: Verbosity) -> Value {
        let mut rendered = self.concept(&node.concept, verbosity);
        let mut entries: Vec<Value> = node.mappings.iter().map(|m| self.mapping(m, verbosity)).collect();
        entries.extend(node.children.iter().map(|child| self.node(child, verbosity)));
        if let Value::Object(fields) = &mut rendered {
            fields.insert("terminal".into(), json!(node.terminal));
            fields.insert("entries".into(), Value::Array(entries));
        }
        rendered
    }
}

/// Built-in JSON shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEntrySerializer;

fn endpoint(prefix: &str, endpoint: &ConceptRef, fields: &mut Map<String, Value>) {
    fields.insert(format!("{prefix}_concept_code"), json!(endpoint.code));
    if let Some(concept) = endpoint.concept {
        fields.insert(format!("{prefix}_concept_id"), json!(concept));
    }
    if let Some(url) = &endpoint.source_url {
        fields.insert(format!("{prefix}_source_url"), json!(url));
    }
    if let Some(name) = &endpoint.name {
        fields.insert(format!("{prefix}_concept_name"), json!(name));
    }
}

fn full<T: serde::Serialize>(resource_type: &str, resource: &T) -> Option<Value> {
    let mut value = serde_json::to_value(resource).ok()?;
    value.as_object_mut()?.insert("type".into(), json!(resource_type));
    Some(value)
}

impl EntrySerializer for DefaultEntrySerializer {
    fn concept(&self, concept: &Concept, verbosity: Verbosity) -> Value {
        let mut fields = Map::new();
        fields.insert("type".into(), json!("Concept"));
        fields.insert("id".into(), json!(concept.mnemonic));
        fields.insert("uuid".into(), json!(concept.id()));
        fields.insert("versioned_object_id".into(), json!(concept.versioned_object_id()));
        fields.insert("version".into(), json!(concept.info.version));
        if verbosity == Verbosity::Brief {
            return Value::Object(fields);
        }
        if verbosity == Verbosity::Verbose {
            if let Some(value) = full("Concept", concept) {
                return value;
            }
        }
        fields.insert("concept_class".into(), json!(concept.concept_class));
        fields.insert("datatype".into(), json!(concept.datatype));
        fields.insert("display_name".into(), json!(concept.display_name()));
        fields.insert("retired".into(), json!(concept.info.retired));
        fields.insert("is_latest_version".into(), json!(concept.info.is_latest_version));
        fields.insert("parent_concepts".into(), json!(concept.parent_concepts));
        Value::Object(fields)
    }

    fn mapping(&self, mapping: &Mapping, verbosity: Verbosity) -> Value {
        let mut fields = Map::new();
        fields.insert("type".into(), json!("Mapping"));
        fields.insert("id".into(), json!(mapping.mnemonic));
        fields.insert("uuid".into(), json!(mapping.id()));
        fields.insert("map_type".into(), json!(mapping.map_type));
        fields.insert("from_concept_code".into(), json!(mapping.from_concept.code));
        fields.insert("to_concept_code".into(), json!(mapping.to_concept.code));
        if verbosity == Verbosity::Brief {
            return Value::Object(fields);
        }
        if verbosity == Verbosity::Verbose {
            if let Some(value) = full("Mapping", mapping) {
                return value;
            }
        }
        endpoint("from", &mapping.from_concept, &mut fields);
        endpoint("to", &mapping.to_concept, &mut fields);
        fields.insert("sort_weight".into(), json!(mapping.sort_weight));
        fields.insert("retired".into(), json!(mapping.info.retired));
        fields.insert("version".into(), json!(mapping.info.version));
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Container, LocalizedText};

    #[test]
    fn test_verbosity_flags() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Listing);
        assert_eq!(Verbosity::from_flags(true, false), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Brief);
    }

    #[test]
    fn test_concept_shapes() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let concept = Concept::new(source.id, "C1", "Diagnosis", "N/A")
            .with_name(LocalizedText::new("en", "Malaria").preferred());
        let serializer = DefaultEntrySerializer;

        let brief = serializer.concept(&concept, Verbosity::Brief);
        assert_eq!(brief["id"], "C1");
        assert!(brief.get("concept_class").is_none());

        let listing = serializer.concept(&concept, Verbosity::Listing);
        assert_eq!(listing["display_name"], "Malaria");
        assert_eq!(listing["retired"], false);

        let verbose = serializer.concept(&concept, Verbosity::Verbose);
        assert_eq!(verbose["type"], "Concept");
        assert_eq!(verbose["names"][0]["text"], "Malaria");
    }

    #[test]
    fn test_mapping_endpoints() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let a = Concept::new(source.id, "A", "Misc", "N/A");
        let mapping = Mapping::new(
            source.id,
            "M1",
            "SAME-AS",
            ConceptRef::local(&a),
            ConceptRef::external("/orgs/WHO/sources/ICD-10/", "B54"),
        );
        let listing = DefaultEntrySerializer.mapping(&mapping, Verbosity::Listing);
        assert_eq!(listing["from_concept_code"], "A");
        assert_eq!(listing["to_source_url"], "/orgs/WHO/sources/ICD-10/");
        assert!(listing.get("to_concept_id").is_none());
        assert_eq!(listing["from_concept_id"], json!(a.versioned_object_id()));
    }
}
