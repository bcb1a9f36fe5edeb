//! Dirty-node scheduling.
//!
//! A [`TreeTraversal`] turns the set of dirty nodes into the branch and node
//! operations one evaluation must perform. Node operations always list both
//! children before their parent.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::tree::Tree;

/// Ordering discipline for node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalType {
    /// Depth-first; a node follows its children immediately.
    #[default]
    PostOrder,
    /// Grouped by depth, deepest level first, for backends that batch a level.
    ReverseLevelOrder,
}

impl fmt::Display for TraversalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TraversalType::PostOrder => f.write_str("post-order"),
            TraversalType::ReverseLevelOrder => f.write_str("reverse-level-order"),
        }
    }
}

impl FromStr for TraversalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "post-order" | "postorder" => Ok(TraversalType::PostOrder),
            "reverse-level-order" | "level-order" => Ok(TraversalType::ReverseLevelOrder),
            other => Err(Error::InvalidConfig(format!(
                "unknown traversal type '{}'",
                other
            ))),
        }
    }
}

/// Recompute the transition matrix of the branch above `branch_number`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchOperation {
    pub branch_number: usize,
    pub branch_length: f64,
    /// Heights of the child and parent ends, for epoch branch models.
    pub node_height: f64,
    pub parent_height: f64,
}

/// Recompute the partials of `node_number` from its two children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOperation {
    pub node_number: usize,
    pub left_child: usize,
    pub right_child: usize,
}

#[derive(Debug, Clone)]
pub struct TreeTraversal {
    traversal_type: TraversalType,
    update_node: Vec<bool>,
    branch_operations: Vec<BranchOperation>,
    node_operations: Vec<NodeOperation>,
    levels: Vec<Vec<NodeOperation>>,
}

impl TreeTraversal {
    /// A traversal with every node dirty.
    pub fn new(node_count: usize, traversal_type: TraversalType) -> Self {
        Self {
            traversal_type,
            update_node: vec![true; node_count],
            branch_operations: Vec::new(),
            node_operations: Vec::new(),
            levels: Vec::new(),
        }
    }

    pub fn traversal_type(&self) -> TraversalType {
        self.traversal_type
    }

    pub fn update_node(&mut self, node: usize) {
        self.update_node[node] = true;
    }

    /// Mark a node and its children; used when a node height moves.
    pub fn update_node_and_children(&mut self, tree: &Tree, node: usize) {
        self.update_node[node] = true;
        for &child in tree.children(node) {
            self.update_node[child] = true;
        }
    }

    pub fn update_all_nodes(&mut self) {
        self.update_node.iter_mut().for_each(|u| *u = true);
    }

    /// Mark every node clean after a successful evaluation.
    pub fn set_all_nodes_updated(&mut self) {
        self.update_node.iter_mut().for_each(|u| *u = false);
    }

    pub fn is_dirty(&self, node: usize) -> bool {
        self.update_node[node]
    }

    pub fn branch_operations(&self) -> &[BranchOperation] {
        &self.branch_operations
    }

    pub fn node_operations(&self) -> &[NodeOperation] {
        &self.node_operations
    }

    /// Rebuild the operation lists from the current dirty set.
    ///
    /// Fails with [`Error::NegativeBranchLength`] if a dirty branch has
    /// inconsistent heights; the lists are then left empty.
    pub fn dispatch(&mut self, tree: &Tree) -> Result<()> {
        self.branch_operations.clear();
        self.node_operations.clear();
        self.levels.iter_mut().for_each(|level| level.clear());

        let outcome = self.traverse(tree, tree.root());
        if let Err(err) = outcome {
            self.branch_operations.clear();
            self.node_operations.clear();
            return Err(err);
        }

        if self.traversal_type == TraversalType::ReverseLevelOrder {
            for level in self.levels.iter().rev() {
                self.node_operations.extend_from_slice(level);
            }
        }
        Ok(())
    }

    /// Returns whether anything at or below `node` changed.
    fn traverse(&mut self, tree: &Tree, node: usize) -> Result<bool> {
        let mut update = false;

        if let Some(parent) = tree.parent(node) {
            if self.update_node[node] {
                self.branch_operations.push(BranchOperation {
                    branch_number: node,
                    branch_length: tree.branch_length(node)?,
                    node_height: tree.height(node),
                    parent_height: tree.height(parent),
                });
                update = true;
            }
        }

        if !tree.is_external(node) {
            let children = tree.children(node);
            let (left, right) = (children[0], children[1]);
            let left_updated = self.traverse(tree, left)?;
            let right_updated = self.traverse(tree, right)?;

            if left_updated || right_updated {
                let operation = NodeOperation {
                    node_number: node,
                    left_child: left,
                    right_child: right,
                };
                match self.traversal_type {
                    TraversalType::PostOrder => self.node_operations.push(operation),
                    TraversalType::ReverseLevelOrder => {
                        let depth = tree.depth(node);
                        if self.levels.len() <= depth {
                            self.levels.resize_with(depth + 1, Vec::new);
                        }
                        self.levels[depth].push(operation);
                    }
                }
                update = true;
            }
        }

        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caterpillar() -> Tree {
        Tree::from_newick("(((A:1,B:1):1,C:2):1,(D:1.5,E:1.5):1.5);").unwrap()
    }

    fn assert_children_first(ops: &[NodeOperation]) {
        for (i, op) in ops.iter().enumerate() {
            for child in [op.left_child, op.right_child] {
                if let Some(j) = ops.iter().position(|o| o.node_number == child) {
                    assert!(j < i, "child {} scheduled after parent {}", child, op.node_number);
                }
            }
        }
    }

    #[test]
    fn test_initial_traversal_covers_everything() {
        let tree = caterpillar();
        for kind in [TraversalType::PostOrder, TraversalType::ReverseLevelOrder] {
            let mut traversal = TreeTraversal::new(tree.node_count(), kind);
            traversal.dispatch(&tree).unwrap();
            assert_eq!(traversal.branch_operations().len(), tree.node_count() - 1);
            assert_eq!(traversal.node_operations().len(), tree.internal_node_count());
            assert_children_first(traversal.node_operations());
            assert_eq!(traversal.node_operations().last().unwrap().node_number, tree.root());
        }
    }

    #[test]
    fn test_single_dirty_tip_touches_path_to_root() {
        let tree = caterpillar();
        let a = tree.tip_index("A").unwrap();
        let mut traversal = TreeTraversal::new(tree.node_count(), TraversalType::PostOrder);
        traversal.set_all_nodes_updated();
        traversal.update_node(a);
        traversal.dispatch(&tree).unwrap();

        let branches: Vec<usize> = traversal
            .branch_operations()
            .iter()
            .map(|b| b.branch_number)
            .collect();
        assert_eq!(branches, vec![a]);

        let mut path = Vec::new();
        let mut node = a;
        while let Some(parent) = tree.parent(node) {
            path.push(parent);
            node = parent;
        }
        let nodes: Vec<usize> = traversal
            .node_operations()
            .iter()
            .map(|n| n.node_number)
            .collect();
        assert_eq!(nodes, path);
    }

    #[test]
    fn test_reverse_level_order_groups_by_depth() {
        let tree = caterpillar();
        let mut traversal = TreeTraversal::new(tree.node_count(), TraversalType::ReverseLevelOrder);
        traversal.dispatch(&tree).unwrap();

        let depths: Vec<usize> = traversal
            .node_operations()
            .iter()
            .map(|op| tree.depth(op.node_number))
            .collect();
        assert!(depths.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_clean_tree_has_no_operations() {
        let tree = caterpillar();
        let mut traversal = TreeTraversal::new(tree.node_count(), TraversalType::PostOrder);
        traversal.set_all_nodes_updated();
        traversal.dispatch(&tree).unwrap();
        assert!(traversal.branch_operations().is_empty());
        assert!(traversal.node_operations().is_empty());
    }

    #[test]
    fn test_negative_length_aborts_dispatch() {
        let mut tree = caterpillar();
        tree.set_node_height(0, 100.0);
        let mut traversal = TreeTraversal::new(tree.node_count(), TraversalType::PostOrder);
        assert!(matches!(
            traversal.dispatch(&tree),
            Err(Error::NegativeBranchLength { node: 0, .. })
        ));
        assert!(traversal.node_operations().is_empty());
    }

    #[test]
    fn test_parse_traversal_type() {
        assert_eq!(
            "reverse_level_order".parse::<TraversalType>().unwrap(),
            TraversalType::ReverseLevelOrder
        );
        assert!("sideways".parse::<TraversalType>().is_err());
    }
}
