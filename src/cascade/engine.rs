//! Cascade engine over a [`GraphStore`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::config::KernelConfig;
use crate::store::GraphStore;
use crate::types::{Concept, Container, ContainerId, Mapping, ResourceId};
use super::policy::{CascadeMethod, CascadeOptions};
use super::tree::{assemble, ArenaNode, CascadeNode};
use super::{CascadeError, CascadeResult};

/// Members of the omit container, by logical id.
#[derive(Debug, Default)]
struct OmitSet {
    concepts: HashSet<ResourceId>,
    mappings: HashSet<ResourceId>,
}

impl OmitSet {
    fn has_concept(&self, concept: &Concept) -> bool {
        self.concepts.contains(&concept.versioned_object_id())
    }

    fn has_mapping(&self, mapping: &Mapping, options: &CascadeOptions) -> bool {
        self.mappings.contains(&mapping.versioned_object_id())
            || mapping
                .target(options.direction())
                .concept
                .is_some_and(|target| self.concepts.contains(&target))
    }
}

/// Traversal context of one run.
struct Scope {
    container: Container,
    omit: OmitSet,
}

/// Everything one node expands to.
#[derive(Debug, Default)]
struct NodeEntries {
    concepts: Vec<Concept>,
    mappings: Vec<Mapping>,
}

/// Computes concept closures.
///
/// Read-only; runs without locks. Callers bound long walks with
/// `cascade_levels` or a result cap.
pub struct CascadeEngine<S: GraphStore> {
    store: Arc<S>,
    config: KernelConfig,
}

impl<S: GraphStore> Clone for CascadeEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: GraphStore> CascadeEngine<S> {
    /// Create an engine over a store.
    pub fn new(store: Arc<S>, config: KernelConfig) -> Self {
        Self { store, config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Flat closure of `root` inside `container`.
    pub async fn cascade(
        &self,
        container: &ContainerId,
        root: &ResourceId,
        options: &CascadeOptions,
    ) -> Result<CascadeResult, CascadeError> {
        let scope = self.scope(container, options).await?;
        let root = self.root(&scope, root).await?;
        let max_results = options.max_results.or(self.config.cascade_max_results);

        let mut visited: HashSet<ResourceId> = HashSet::from([root.versioned_object_id()]);
        let mut seen_mappings: HashSet<ResourceId> = HashSet::new();
        let mut concepts = Vec::new();
        let mut mappings = Vec::new();
        if options.include_self && !scope.omit.has_concept(&root) {
            concepts.push(root.clone());
        }

        let mut frontier = vec![root.clone()];
        if options.cascade_levels.allows(0) {
            let equivalent = self.equivalents(&scope, &frontier, &mut visited, options).await?;
            Self::collect_mappings(equivalent.mappings, options, &mut seen_mappings, &mut mappings);
            concepts.extend(equivalent.concepts.iter().cloned());
            frontier.extend(equivalent.concepts);
        }

        let mut level = 0;
        while !frontier.is_empty() && options.cascade_levels.allows(level) {
            if level > 0 && max_results.is_some_and(|cap| concepts.len() + mappings.len() >= cap) {
                debug!(level, total = concepts.len() + mappings.len(), "cascade result cap reached");
                break;
            }

            let mut next = Vec::new();
            for node in &frontier {
                let entries = self.expand(&scope, node, options).await?;
                Self::collect_mappings(entries.mappings, options, &mut seen_mappings, &mut mappings);
                for concept in entries.concepts {
                    if visited.insert(concept.versioned_object_id()) {
                        concepts.push(concept.clone());
                        next.push(concept);
                    }
                }
            }

            if !next.is_empty() {
                let equivalent = self.equivalents(&scope, &next, &mut visited, options).await?;
                Self::collect_mappings(equivalent.mappings, options, &mut seen_mappings, &mut mappings);
                concepts.extend(equivalent.concepts.iter().cloned());
                next.extend(equivalent.concepts);
            }

            debug!(
                level,
                frontier = frontier.len(),
                discovered = next.len(),
                concepts = concepts.len(),
                mappings = mappings.len(),
                "cascade level"
            );
            frontier = next;
            level += 1;
        }

        Ok(CascadeResult {
            root,
            concepts,
            mappings,
        })
    }

    /// Tree closure of `root` inside `container`.
    ///
    /// `include_self` and `max_results` do not apply; the root is always the
    /// tree's root. Equivalency types are traversed like any other type.
    pub async fn cascade_as_hierarchy(
        &self,
        container: &ContainerId,
        root: &ResourceId,
        options: &CascadeOptions,
    ) -> Result<CascadeNode, CascadeError> {
        let scope = self.scope(container, options).await?;
        let root = self.root(&scope, root).await?;

        let mut arena = vec![ArenaNode::new(root)];
        let mut expanded: HashMap<ResourceId, bool> = HashMap::new();
        let mut frontier: Vec<usize> = vec![0];
        let mut depth = 0;

        // Level by level, so the shallowest occurrence of a concept is the
        // one expanded and keeps the most depth budget.
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for idx in frontier {
                let vid = arena[idx].concept.versioned_object_id();
                if let Some(had_entries) = expanded.get(&vid) {
                    arena[idx].terminal = Some(!had_entries);
                    continue;
                }
                if !options.cascade_levels.allows(depth) {
                    continue;
                }

                let node = arena[idx].concept.clone();
                let entries = self.expand(&scope, &node, options).await?;
                let node_mappings: Vec<Mapping> = entries
                    .mappings
                    .into_iter()
                    .filter(|m| options.return_map_types.allows(&m.map_type))
                    .collect();
                let children: Vec<Concept> = entries
                    .concepts
                    .into_iter()
                    .filter(|c| c.versioned_object_id() != vid)
                    .collect();

                let had_entries = !children.is_empty() || !node_mappings.is_empty();
                expanded.insert(vid, had_entries);
                arena[idx].terminal = Some(!had_entries);
                arena[idx].mappings = node_mappings;

                let first_child = arena.len();
                for child in children {
                    arena.push(ArenaNode::new(child));
                }
                let child_indices: Vec<usize> = (first_child..arena.len()).collect();
                next.extend(child_indices.iter().copied());
                arena[idx].children = child_indices;

                debug!(depth, concept = %node.mnemonic, children = arena[idx].children.len(), "cascade node expanded");
            }
            frontier = next;
            depth += 1;
        }

        assemble(arena).ok_or_else(|| CascadeError::Store("cascade tree could not be assembled".to_string()))
    }

    async fn scope(&self, container: &ContainerId, options: &CascadeOptions) -> Result<Scope, CascadeError> {
        let container = self
            .store
            .get_container(container)
            .await
            .map_err(CascadeError::from_store)?
            .ok_or(CascadeError::ContainerNotFound(*container))?;
        let omit = match &options.omit_if_exists_in {
            Some(omit) => self.omit_set(omit).await?,
            None => OmitSet::default(),
        };
        Ok(Scope { container, omit })
    }

    async fn root(&self, scope: &Scope, root: &ResourceId) -> Result<Concept, CascadeError> {
        self.store
            .resolve_concept(&scope.container.id, root)
            .await
            .map_err(CascadeError::from_store)?
            .ok_or(CascadeError::RootNotFound(*root))
    }

    async fn omit_set(&self, container: &ContainerId) -> Result<OmitSet, CascadeError> {
        if self
            .store
            .get_container(container)
            .await
            .map_err(CascadeError::from_store)?
            .is_none()
        {
            return Err(CascadeError::ContainerNotFound(*container));
        }
        let concepts = self
            .store
            .container_concepts(container)
            .await
            .map_err(CascadeError::from_store)?;
        let mappings = self
            .store
            .container_mappings(container)
            .await
            .map_err(CascadeError::from_store)?;
        Ok(OmitSet {
            concepts: concepts.iter().map(Concept::versioned_object_id).collect(),
            mappings: mappings.iter().map(Mapping::versioned_object_id).collect(),
        })
    }

    fn collect_mappings(
        found: Vec<Mapping>,
        options: &CascadeOptions,
        seen: &mut HashSet<ResourceId>,
        out: &mut Vec<Mapping>,
    ) {
        for mapping in found {
            if options.return_map_types.allows(&mapping.map_type) && seen.insert(mapping.versioned_object_id()) {
                out.push(mapping);
            }
        }
    }

    /// Mappings of one node that pass the direction, retirement and omit rules.
    async fn node_mappings(
        &self,
        scope: &Scope,
        node: &Concept,
        options: &CascadeOptions,
    ) -> Result<Vec<Mapping>, CascadeError> {
        let mut mappings: Vec<Mapping> = self
            .store
            .mappings_for(&scope.container.id, &node.versioned_object_id(), options.direction())
            .await
            .map_err(CascadeError::from_store)?
            .into_iter()
            .filter(|m| options.include_retired || !m.info.retired)
            .filter(|m| !scope.omit.has_mapping(m, options))
            .collect();
        mappings.sort_by(Mapping::cascade_order);
        Ok(mappings)
    }

    /// The concept a mapping leads to, if it resolves and is eligible.
    async fn resolve_target(
        &self,
        scope: &Scope,
        node: &Concept,
        mapping: &Mapping,
        options: &CascadeOptions,
    ) -> Result<Option<Concept>, CascadeError> {
        let Some(target) = mapping.target(options.direction()).concept else {
            return Ok(None);
        };
        let Some(concept) = self
            .store
            .resolve_concept(&scope.container.id, &target)
            .await
            .map_err(CascadeError::from_store)?
        else {
            return Ok(None);
        };
        if scope.container.is_source() && concept.info.parent != node.info.parent {
            return Ok(None);
        }
        if concept.info.retired && !options.include_retired {
            return Ok(None);
        }
        if scope.omit.has_concept(&concept) {
            return Ok(None);
        }
        Ok(Some(concept))
    }

    /// Eligible mappings and neighbor concepts of one node.
    async fn expand(
        &self,
        scope: &Scope,
        node: &Concept,
        options: &CascadeOptions,
    ) -> Result<NodeEntries, CascadeError> {
        let mut entries = NodeEntries::default();
        let mut seen: HashSet<ResourceId> = HashSet::new();

        if options.cascade_mappings {
            let mappings: Vec<Mapping> = self
                .node_mappings(scope, node, options)
                .await?
                .into_iter()
                .filter(|m| options.traverses(&m.map_type))
                .collect();
            if options.method == CascadeMethod::SourceToConcepts {
                for mapping in &mappings {
                    if let Some(concept) = self.resolve_target(scope, node, mapping, options).await? {
                        if seen.insert(concept.versioned_object_id()) {
                            entries.concepts.push(concept);
                        }
                    }
                }
            }
            entries.mappings = mappings;
        }

        if options.cascade_hierarchy && options.method == CascadeMethod::SourceToConcepts {
            let neighbors = self
                .store
                .hierarchy_neighbors(&scope.container.id, node, options.direction())
                .await
                .map_err(CascadeError::from_store)?;
            for concept in neighbors {
                if (options.include_retired || !concept.info.retired)
                    && !scope.omit.has_concept(&concept)
                    && seen.insert(concept.versioned_object_id())
                {
                    entries.concepts.push(concept);
                }
            }
        }

        Ok(entries)
    }

    /// Closure of `seeds` over equivalency mappings, at no depth cost.
    ///
    /// Newly found concepts are marked visited and returned together with
    /// the equivalency mappings walked.
    async fn equivalents(
        &self,
        scope: &Scope,
        seeds: &[Concept],
        visited: &mut HashSet<ResourceId>,
        options: &CascadeOptions,
    ) -> Result<NodeEntries, CascadeError> {
        let mut found = NodeEntries::default();
        if options.equivalency_map_types.is_empty()
            || !options.cascade_mappings
            || options.method != CascadeMethod::SourceToConcepts
        {
            return Ok(found);
        }

        let mut queue: Vec<Concept> = seeds.to_vec();
        while let Some(node) = queue.pop() {
            let mappings: Vec<Mapping> = self
                .node_mappings(scope, &node, options)
                .await?
                .into_iter()
                .filter(|m| options.is_equivalency(&m.map_type))
                .collect();
            for mapping in mappings {
                if let Some(concept) = self.resolve_target(scope, &node, &mapping, options).await? {
                    if visited.insert(concept.versioned_object_id()) {
                        found.concepts.push(concept.clone());
                        queue.push(concept);
                    }
                }
                found.mappings.push(mapping);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeLevels;
    use crate::store::InMemoryStore;
    use crate::types::ConceptRef;

    struct Graph {
        store: Arc<InMemoryStore>,
        source: Container,
        a: Concept,
        b: Concept,
        c: Concept,
    }

    fn graph() -> Graph {
        let store = InMemoryStore::new();
        let source = Container::source("S", "/orgs/O/sources/S/");
        store.add_container(source.clone());
        let a = Concept::new(source.id, "A", "Misc", "N/A");
        let b = Concept::new(source.id, "B", "Misc", "N/A");
        let c = Concept::new(source.id, "C", "Misc", "N/A");
        let ab = Mapping::new(source.id, "AB", "NARROWER-THAN", ConceptRef::local(&a), ConceptRef::local(&b));
        let bc = Mapping::new(source.id, "BC", "NARROWER-THAN", ConceptRef::local(&b), ConceptRef::local(&c));
        for concept in [&a, &b, &c] {
            store.put(concept.clone());
        }
        store.put(ab);
        store.put(bc);
        Graph {
            store: Arc::new(store),
            source,
            a,
            b,
            c,
        }
    }

    #[tokio::test]
    async fn test_chain_walks_all_levels() {
        let g = graph();
        let engine = CascadeEngine::new(g.store.clone(), KernelConfig::default());
        let result = engine
            .cascade(&g.source.id, &g.a.versioned_object_id(), &CascadeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.concept_mnemonics(), vec!["A", "B", "C"]);
        assert_eq!(result.mapping_mnemonics(), vec!["AB", "BC"]);
        assert_eq!(result.total(), 5);
    }

    #[tokio::test]
    async fn test_levels_bound_the_walk() {
        let g = graph();
        let engine = CascadeEngine::new(g.store.clone(), KernelConfig::default());
        let root = g.a.versioned_object_id();

        let zero = CascadeOptions::default().with_levels(CascadeLevels::Bounded(0));
        let result = engine.cascade(&g.source.id, &root, &zero).await.unwrap();
        assert_eq!(result.concept_mnemonics(), vec!["A"]);
        assert!(result.mappings.is_empty());

        let one = CascadeOptions::default().with_levels(CascadeLevels::Bounded(1));
        let result = engine.cascade(&g.source.id, &root, &one).await.unwrap();
        assert_eq!(result.concept_mnemonics(), vec!["A", "B"]);
        assert!(!result.concept_ids().contains(&g.c.versioned_object_id()));
    }

    #[tokio::test]
    async fn test_reverse_follows_incoming() {
        let g = graph();
        let engine = CascadeEngine::new(g.store.clone(), KernelConfig::default());
        let options = CascadeOptions {
            reverse: true,
            ..CascadeOptions::default()
        };
        let result = engine
            .cascade(&g.source.id, &g.c.versioned_object_id(), &options)
            .await
            .unwrap();
        assert_eq!(result.concept_mnemonics(), vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_source_mappings_method_does_not_follow() {
        let g = graph();
        let engine = CascadeEngine::new(g.store.clone(), KernelConfig::default());
        let options = CascadeOptions {
            method: CascadeMethod::SourceMappings,
            ..CascadeOptions::default()
        };
        let result = engine
            .cascade(&g.source.id, &g.a.versioned_object_id(), &options)
            .await
            .unwrap();
        assert_eq!(result.concept_mnemonics(), vec!["A"]);
        assert_eq!(result.mapping_mnemonics(), vec!["AB"]);
    }

    #[tokio::test]
    async fn test_missing_root_and_container() {
        let g = graph();
        let engine = CascadeEngine::new(g.store.clone(), KernelConfig::default());
        let options = CascadeOptions::default();
        let missing = ResourceId::generate();
        assert!(matches!(
            engine.cascade(&g.source.id, &missing, &options).await,
            Err(CascadeError::RootNotFound(id)) if id == missing
        ));
        let nowhere = ContainerId::generate();
        assert!(matches!(
            engine.cascade(&nowhere, &g.b.versioned_object_id(), &options).await,
            Err(CascadeError::ContainerNotFound(_))
        ));
        let omit_nowhere = CascadeOptions::default().omitting(nowhere);
        assert!(matches!(
            engine.cascade(&g.source.id, &g.a.versioned_object_id(), &omit_nowhere).await,
            Err(CascadeError::ContainerNotFound(id)) if id == nowhere
        ));
    }

    #[tokio::test]
    async fn test_hierarchy_tree_shape() {
        let g = graph();
        let engine = CascadeEngine::new(g.store.clone(), KernelConfig::default());
        let tree = engine
            .cascade_as_hierarchy(&g.source.id, &g.a.versioned_object_id(), &CascadeOptions::default())
            .await
            .unwrap();
        assert_eq!(tree.child_mnemonics(), vec!["B"]);
        assert_eq!(tree.terminal, Some(false));
        let leaf = &tree.children[0].children[0];
        assert_eq!(leaf.concept.mnemonic, "C");
        assert_eq!(leaf.terminal, Some(true));
        assert_eq!(tree.depth(), 2);
    }
}
