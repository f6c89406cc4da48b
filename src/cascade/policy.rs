//! Cascade traversal options and their query-parameter form.
//!
//! | parameter | field | values |
//! |-----------|-------|--------|
//! | `method` | [`CascadeOptions::method`] | `sourcemappings`, `sourcetoconcepts` |
//! | `mapTypes` | [`CascadeOptions::map_types`] | comma list |
//! | `excludeMapTypes` | [`CascadeOptions::exclude_map_types`] | comma list |
//! | `returnMapTypes` | [`CascadeOptions::return_map_types`] | `*`, `false`/`0`, comma list |
//! | `cascadeHierarchy` | [`CascadeOptions::cascade_hierarchy`] | bool |
//! | `cascadeMappings` | [`CascadeOptions::cascade_mappings`] | bool |
//! | `cascadeLevels` | [`CascadeOptions::cascade_levels`] | `*` or integer >= 0 |
//! | `reverse`, `cascadeDirection` | [`CascadeOptions::reverse`] | bool / `forward`, `reverse` |
//! | `includeRetired` | [`CascadeOptions::include_retired`] | bool |
//! | `omitIfExistsIn` | [`CascadeOptions::omit_if_exists_in`] | container id |
//! | `equivalencyMapType(s)` | [`CascadeOptions::equivalency_map_types`] | comma list |
//! | `view` | [`CascadeOptions::view`] | `flat`, `hierarchy` |
//! | `includeSelf` | [`CascadeOptions::include_self`] | bool |
//!
//! Unknown parameters are ignored.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::canonical::canonical_hash_hex;
use crate::types::{ContainerId, Direction};
use super::CascadeError;

/// Whether mappings are followed to their target concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CascadeMethod {
    /// Return a node's mappings without following them.
    #[serde(rename = "sourcemappings")]
    SourceMappings,
    /// Follow mappings to target concepts, and hierarchy edges.
    #[default]
    #[serde(rename = "sourcetoconcepts")]
    SourceToConcepts,
}

impl FromStr for CascadeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let squashed: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();
        match squashed.as_str() {
            "sourcemappings" => Ok(Self::SourceMappings),
            "sourcetoconcepts" | "" => Ok(Self::SourceToConcepts),
            _ => Err(format!("unknown cascade method: {s}")),
        }
    }
}

/// Depth bound of a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CascadeLevels {
    /// No bound.
    #[default]
    Unbounded,
    /// At most this many expansion levels.
    Bounded(usize),
}

impl CascadeLevels {
    /// True if a node at `depth` may still be expanded.
    pub fn allows(&self, depth: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(max) => depth < *max,
        }
    }
}

impl FromStr for CascadeLevels {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" || s.eq_ignore_ascii_case("all") {
            return Ok(Self::Unbounded);
        }
        s.parse::<usize>()
            .map(Self::Bounded)
            .map_err(|_| format!("cascadeLevels must be '*' or a non-negative integer, got {s}"))
    }
}

impl fmt::Display for CascadeLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => write!(f, "*"),
            Self::Bounded(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for CascadeLevels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unbounded => serializer.serialize_str("*"),
            Self::Bounded(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

/// Filter on the mappings returned in a result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReturnMapTypes {
    /// Return every traversed mapping.
    #[default]
    All,
    /// Return no mappings.
    None,
    /// Return mappings of these types only.
    Only(BTreeSet<String>),
}

impl ReturnMapTypes {
    /// True if a mapping of this type is returned.
    pub fn allows(&self, map_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Only(types) => types.contains(map_type),
        }
    }
}

impl FromStr for ReturnMapTypes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "*" => Ok(Self::All),
            "false" | "False" | "0" => Ok(Self::None),
            list => Ok(Self::Only(split_list(list))),
        }
    }
}

impl Serialize for ReturnMapTypes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("*"),
            Self::None => serializer.serialize_bool(false),
            Self::Only(types) => types.serialize(serializer),
        }
    }
}

/// Output shape of a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// Deduplicated concept and mapping lists.
    #[default]
    Flat,
    /// Nested tree rooted at the cascaded concept.
    Hierarchy,
}

impl FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "flat" => Ok(Self::Flat),
            "hierarchy" => Ok(Self::Hierarchy),
            other => Err(format!("unknown view: {other}")),
        }
    }
}

fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, CascadeError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CascadeError::invalid_param(name, raw)),
    }
}

/// Options of one cascade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeOptions {
    /// Mapping handling.
    pub method: CascadeMethod,
    /// Follow incoming edges (mapping sources, hierarchy parents).
    pub reverse: bool,
    /// Map types that may be traversed. `None` allows every type.
    pub map_types: Option<BTreeSet<String>>,
    /// Map types that are never traversed.
    pub exclude_map_types: BTreeSet<String>,
    /// Filter on returned mappings.
    pub return_map_types: ReturnMapTypes,
    /// Traverse mapping edges.
    pub cascade_mappings: bool,
    /// Traverse hierarchy edges.
    pub cascade_hierarchy: bool,
    /// Depth bound.
    pub cascade_levels: CascadeLevels,
    /// Retired concepts and mappings are eligible.
    pub include_retired: bool,
    /// Container whose members are removed from the result.
    pub omit_if_exists_in: Option<ContainerId>,
    /// Map types treated as equivalence relations.
    pub equivalency_map_types: BTreeSet<String>,
    /// Flat or hierarchy output.
    pub view: ViewMode,
    /// Include the root concept in flat results.
    pub include_self: bool,
    /// Stop starting new levels once the result holds this many items.
    pub max_results: Option<usize>,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            method: CascadeMethod::default(),
            reverse: false,
            map_types: None,
            exclude_map_types: BTreeSet::new(),
            return_map_types: ReturnMapTypes::All,
            cascade_mappings: true,
            cascade_hierarchy: true,
            cascade_levels: CascadeLevels::Unbounded,
            include_retired: false,
            omit_if_exists_in: None,
            equivalency_map_types: BTreeSet::new(),
            view: ViewMode::Flat,
            include_self: true,
            max_results: None,
        }
    }
}

impl CascadeOptions {
    /// Parse options from request query parameters.
    pub fn from_params<'a, I>(params: I) -> Result<Self, CascadeError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (name, raw) in params {
            match name {
                "method" => {
                    options.method = raw.parse().map_err(|_| CascadeError::invalid_param(name, raw))?;
                }
                "mapTypes" => {
                    let types = split_list(raw);
                    options.map_types = (!types.is_empty()).then_some(types);
                }
                "excludeMapTypes" => options.exclude_map_types = split_list(raw),
                "returnMapTypes" => {
                    options.return_map_types = raw.parse().map_err(|_| CascadeError::invalid_param(name, raw))?;
                }
                "cascadeHierarchy" => options.cascade_hierarchy = parse_bool(name, raw)?,
                "cascadeMappings" => options.cascade_mappings = parse_bool(name, raw)?,
                "cascadeLevels" => {
                    options.cascade_levels = raw.parse().map_err(|_| CascadeError::invalid_param(name, raw))?;
                }
                "reverse" => options.reverse = parse_bool(name, raw)?,
                "cascadeDirection" => {
                    options.reverse = match raw.trim().to_lowercase().as_str() {
                        "forward" | "" => false,
                        "reverse" => true,
                        _ => return Err(CascadeError::invalid_param(name, raw)),
                    };
                }
                "includeRetired" => options.include_retired = parse_bool(name, raw)?,
                "omitIfExistsIn" => {
                    options.omit_if_exists_in = if raw.trim().is_empty() {
                        None
                    } else {
                        Some(raw.trim().parse().map_err(|_| CascadeError::invalid_param(name, raw))?)
                    };
                }
                "equivalencyMapType" | "equivalencyMapTypes" => {
                    options.equivalency_map_types = split_list(raw);
                }
                "view" => {
                    options.view = raw.parse().map_err(|_| CascadeError::invalid_param(name, raw))?;
                }
                "includeSelf" => options.include_self = parse_bool(name, raw)?,
                _ => {}
            }
        }
        Ok(options)
    }

    /// Traversal direction.
    pub fn direction(&self) -> Direction {
        Direction::from_reverse(self.reverse)
    }

    /// True if a mapping of this type may be traversed.
    pub fn traverses(&self, map_type: &str) -> bool {
        if self.exclude_map_types.contains(map_type) {
            return false;
        }
        self.map_types.as_ref().map_or(true, |allowed| allowed.contains(map_type))
    }

    /// True if a mapping of this type links equivalent concepts.
    pub fn is_equivalency(&self, map_type: &str) -> bool {
        self.equivalency_map_types.contains(map_type) && !self.exclude_map_types.contains(map_type)
    }

    /// xxHash64 fingerprint of the effective options.
    pub fn params_hash(&self) -> Result<String, serde_json::Error> {
        canonical_hash_hex(self)
    }

    /// Set the map-type allow-list.
    pub fn with_map_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.map_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Set the depth bound.
    pub fn with_levels(mut self, levels: CascadeLevels) -> Self {
        self.cascade_levels = levels;
        self
    }

    /// Set the omit container.
    pub fn omitting(mut self, container: ContainerId) -> Self {
        self.omit_if_exists_in = Some(container);
        self
    }

    /// Set the equivalency map types.
    pub fn with_equivalency_map_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.equivalency_map_types = types.into_iter().map(Into::into).collect();
        self
    }
}
