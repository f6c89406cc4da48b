//! Tree output of the hierarchy cascade.
//!
//! The engine records nodes in an arena while walking level by level, then
//! assembles the nested tree bottom-up. Children always sit at higher arena
//! indices than their parent, so one reverse pass is enough and neither the
//! walk nor the assembly recurses.

use serde::Serialize;

use crate::types::{Concept, Mapping, ResourceId};

/// One concept in a hierarchy cascade.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeNode {
    /// The concept.
    pub concept: Concept,
    /// `Some(true)`: expanded, nothing found. `Some(false)`: expanded, has
    /// entries. `None`: the depth bound stopped before it was evaluated.
    pub terminal: Option<bool>,
    /// Returned mappings of this node.
    pub mappings: Vec<Mapping>,
    /// Child nodes, in discovery order.
    pub children: Vec<CascadeNode>,
}

impl CascadeNode {
    /// Number of nodes in the tree, this one included.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }

    /// Always false; a tree has at least its root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Longest root-to-leaf edge count.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.children.iter().map(|c| (c, depth + 1)));
        }
        deepest
    }

    /// First node (pre-order) for a logical concept.
    pub fn find(&self, versioned_object_id: &ResourceId) -> Option<&CascadeNode> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.concept.versioned_object_id() == *versioned_object_id {
                return Some(node);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    /// Child mnemonics, in order.
    pub fn child_mnemonics(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.concept.mnemonic.as_str()).collect()
    }
}

/// Flat node record used while walking.
#[derive(Debug)]
pub(crate) struct ArenaNode {
    pub concept: Concept,
    pub terminal: Option<bool>,
    pub mappings: Vec<Mapping>,
    pub children: Vec<usize>,
}

impl ArenaNode {
    pub fn new(concept: Concept) -> Self {
        Self {
            concept,
            terminal: None,
            mappings: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Assemble the tree rooted at arena index 0.
///
/// Returns `None` for an empty arena or a child index that does not point
/// past its parent.
pub(crate) fn assemble(arena: Vec<ArenaNode>) -> Option<CascadeNode> {
    let mut built: Vec<Option<CascadeNode>> = Vec::with_capacity(arena.len());
    built.resize_with(arena.len(), || None);

    for (idx, node) in arena.into_iter().enumerate().rev() {
        let mut children = Vec::with_capacity(node.children.len());
        for child in node.children {
            if child <= idx {
                return None;
            }
            children.push(built.get_mut(child)?.take()?);
        }
        built[idx] = Some(CascadeNode {
            concept: node.concept,
            terminal: node.terminal,
            mappings: node.mappings,
            children,
        });
    }
    built.into_iter().next().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Container;

    fn node(source: &Container, mnemonic: &str) -> ArenaNode {
        ArenaNode::new(Concept::new(source.id, mnemonic, "Misc", "N/A"))
    }

    #[test]
    fn test_assemble_nested() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let mut root = node(&source, "A");
        root.children = vec![1, 3];
        root.terminal = Some(false);
        let mut b = node(&source, "B");
        b.children = vec![2];
        let arena = vec![root, b, node(&source, "C"), node(&source, "D")];

        let tree = assemble(arena).unwrap();
        assert_eq!(tree.child_mnemonics(), vec!["B", "D"]);
        assert_eq!(tree.children[0].child_mnemonics(), vec!["C"]);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.terminal, Some(false));
        let c = tree.children[0].children[0].concept.versioned_object_id();
        assert_eq!(tree.find(&c).map(|n| n.concept.mnemonic.as_str()), Some("C"));
    }

    #[test]
    fn test_assemble_rejects_backward_links() {
        let source = Container::source("S", "/orgs/O/sources/S/");
        let mut a = node(&source, "A");
        let mut b = node(&source, "B");
        a.children = vec![1];
        b.children = vec![0];
        assert!(assemble(vec![a, b]).is_none());
        assert!(assemble(Vec::new()).is_none());
    }
}
