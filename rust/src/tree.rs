//! Rooted binary tree consumed by the likelihood engine.
//!
//! Nodes are indexed 0..n_nodes, with tips first, then internal nodes.
//! Branch lengths are derived, never stored: the branch above node `n` has
//! length `rate[n] * (height[parent] - height[n])`.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Tree {
    n_nodes: usize,
    n_tips: usize,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    heights: Vec<f64>,
    branch_rates: Vec<f64>,
    depths: Vec<usize>,
    root_index: usize,
    taxon_names: Vec<String>,
    tip_name_to_idx: HashMap<String, usize>,
    stored_heights: Vec<f64>,
    stored_branch_rates: Vec<f64>,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node (ignored for the root)
    /// * `taxon_names` - One name per tip; tips are nodes `0..taxon_names.len()`
    pub fn from_structure(
        parent_indices: &[i32],
        branch_lengths: &[f64],
        taxon_names: Vec<String>,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();

        if branch_lengths.len() != n_nodes {
            return Err(Error::InvalidTree(
                "parent_indices and branch_lengths must have same length".to_string(),
            ));
        }

        let mut parents = Vec::with_capacity(n_nodes);
        for (node, &parent) in parent_indices.iter().enumerate() {
            parents.push(match parent {
                -1 => None,
                p if p >= 0 && (p as usize) < n_nodes && p as usize != node => Some(p as usize),
                p => {
                    return Err(Error::InvalidTree(format!(
                        "node {} has invalid parent index {}",
                        node, p
                    )))
                }
            });
        }

        Self::build(parents, branch_lengths, taxon_names)
    }

    /// Parse a Newick string such as `((A:0.1,B:0.1):0.1,C:0.2);`.
    ///
    /// Tips are numbered in order of appearance. Internal node labels are
    /// ignored; a missing branch length counts as zero.
    pub fn from_newick(newick: &str) -> Result<Self> {
        let trimmed = newick.trim().trim_end_matches(';');
        let chars: Vec<char> = trimmed.chars().collect();

        // Parse into an arena with the root at 0, then renumber.
        let mut arena_parent: Vec<Option<usize>> = vec![None];
        let mut arena_length: Vec<f64> = vec![0.0];
        let mut arena_label: Vec<String> = vec![String::new()];
        let mut arena_children: Vec<Vec<usize>> = vec![Vec::new()];
        let mut stack: Vec<usize> = Vec::new();
        let mut opened_root = false;
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '(' => {
                    let node = if !opened_root {
                        opened_root = true;
                        0
                    } else {
                        let parent = *stack.last().ok_or_else(|| {
                            Error::InvalidTree("text after the closing parenthesis".to_string())
                        })?;
                        let node = arena_parent.len();
                        arena_parent.push(Some(parent));
                        arena_length.push(0.0);
                        arena_label.push(String::new());
                        arena_children.push(Vec::new());
                        arena_children[parent].push(node);
                        node
                    };
                    stack.push(node);
                    i += 1;
                }
                ')' => {
                    let closed = stack
                        .pop()
                        .ok_or_else(|| Error::InvalidTree("unbalanced ')'".to_string()))?;
                    i += 1;
                    let (label, length, consumed) = parse_label_length(&chars[i..])?;
                    arena_label[closed] = label;
                    arena_length[closed] = length;
                    i += consumed;
                }
                ',' => {
                    i += 1;
                }
                c if c.is_whitespace() => {
                    i += 1;
                }
                _ => {
                    let parent = *stack.last().ok_or_else(|| {
                        Error::InvalidTree("taxon outside of any clade".to_string())
                    })?;
                    let (label, length, consumed) = parse_label_length(&chars[i..])?;
                    if label.is_empty() {
                        return Err(Error::InvalidTree(format!("unlabelled tip at offset {}", i)));
                    }
                    let node = arena_parent.len();
                    arena_parent.push(Some(parent));
                    arena_length.push(length);
                    arena_label.push(label);
                    arena_children.push(Vec::new());
                    arena_children[parent].push(node);
                    i += consumed;
                }
            }
        }

        if !stack.is_empty() || !opened_root {
            return Err(Error::InvalidTree("unbalanced '('".to_string()));
        }

        // Tips in order of appearance, then internal nodes in post-order.
        let mut order = Vec::with_capacity(arena_parent.len());
        arena_post_order(0, &arena_children, &mut order);
        let tips: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&n| arena_children[n].is_empty())
            .collect();
        let internals: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&n| !arena_children[n].is_empty())
            .collect();

        let mut renumber = vec![0usize; arena_parent.len()];
        for (new, &old) in tips.iter().chain(internals.iter()).enumerate() {
            renumber[old] = new;
        }

        let n_nodes = arena_parent.len();
        let mut parents = vec![None; n_nodes];
        let mut lengths = vec![0.0; n_nodes];
        for old in 0..n_nodes {
            parents[renumber[old]] = arena_parent[old].map(|p| renumber[p]);
            lengths[renumber[old]] = arena_length[old];
        }
        let taxon_names = tips.iter().map(|&t| arena_label[t].clone()).collect();

        Self::build(parents, &lengths, taxon_names)
    }

    fn build(
        parents: Vec<Option<usize>>,
        branch_lengths: &[f64],
        taxon_names: Vec<String>,
    ) -> Result<Self> {
        let n_nodes = parents.len();
        let n_tips = taxon_names.len();

        if n_tips < 2 || n_nodes != 2 * n_tips - 1 {
            return Err(Error::InvalidTree(format!(
                "a rooted binary tree with {} tips needs {} nodes, got {}",
                n_tips,
                (2 * n_tips).saturating_sub(1),
                n_nodes
            )));
        }

        let mut children = vec![Vec::new(); n_nodes];
        for (child, parent) in parents.iter().enumerate() {
            if let Some(p) = parent {
                children[*p].push(child);
            }
        }

        let roots: Vec<usize> = (0..n_nodes).filter(|&n| parents[n].is_none()).collect();
        let root_index = match roots.as_slice() {
            [root] => *root,
            [] => return Err(Error::InvalidTree("no root node found".to_string())),
            _ => {
                return Err(Error::InvalidTree(format!(
                    "{} nodes have no parent",
                    roots.len()
                )))
            }
        };

        for node in 0..n_nodes {
            let expected = if node < n_tips { 0 } else { 2 };
            if children[node].len() != expected {
                return Err(Error::InvalidTree(format!(
                    "node {} has {} children; tips must come first and internal nodes must be binary",
                    node,
                    children[node].len()
                )));
            }
            let length = branch_lengths[node];
            if parents[node].is_some() && !(length.is_finite() && length >= 0.0) {
                return Err(Error::InvalidTree(format!(
                    "node {} has invalid branch length {}",
                    node, length
                )));
            }
        }

        // Depths and root-to-node distances, top-down.
        let mut depths = vec![0usize; n_nodes];
        let mut distance = vec![0.0f64; n_nodes];
        let mut visited = 0usize;
        let mut stack = vec![root_index];
        while let Some(node) = stack.pop() {
            visited += 1;
            for &child in &children[node] {
                depths[child] = depths[node] + 1;
                distance[child] = distance[node] + branch_lengths[child];
                stack.push(child);
            }
        }
        if visited != n_nodes {
            return Err(Error::InvalidTree(
                "tree is not connected to its root".to_string(),
            ));
        }

        let max_distance = (0..n_tips).map(|t| distance[t]).fold(0.0, f64::max);
        let heights: Vec<f64> = distance.iter().map(|d| max_distance - d).collect();
        let branch_rates = vec![1.0; n_nodes];

        let mut tip_name_to_idx = HashMap::with_capacity(n_tips);
        for (idx, name) in taxon_names.iter().enumerate() {
            if tip_name_to_idx.insert(name.clone(), idx).is_some() {
                return Err(Error::InvalidTree(format!("duplicate taxon '{}'", name)));
            }
        }

        Ok(Tree {
            n_nodes,
            n_tips,
            parents,
            children,
            stored_heights: heights.clone(),
            stored_branch_rates: branch_rates.clone(),
            heights,
            branch_rates,
            depths,
            root_index,
            taxon_names,
            tip_name_to_idx,
        })
    }

    pub fn node_count(&self) -> usize {
        self.n_nodes
    }

    pub fn tip_count(&self) -> usize {
        self.n_tips
    }

    pub fn internal_node_count(&self) -> usize {
        self.n_nodes - self.n_tips
    }

    pub fn root(&self) -> usize {
        self.root_index
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    pub fn is_external(&self, node: usize) -> bool {
        node < self.n_tips
    }

    /// Number of edges between `node` and the root.
    pub fn depth(&self, node: usize) -> usize {
        self.depths[node]
    }

    pub fn height(&self, node: usize) -> f64 {
        self.heights[node]
    }

    pub fn set_node_height(&mut self, node: usize, height: f64) {
        self.heights[node] = height;
    }

    pub fn branch_rate(&self, node: usize) -> f64 {
        self.branch_rates[node]
    }

    pub fn set_branch_rate(&mut self, node: usize, rate: f64) {
        self.branch_rates[node] = rate;
    }

    /// Length of the branch above `node`; zero for the root.
    pub fn branch_length(&self, node: usize) -> Result<f64> {
        let Some(parent) = self.parents[node] else {
            return Ok(0.0);
        };
        let length = self.branch_rates[node] * (self.heights[parent] - self.heights[node]);
        if length < 0.0 {
            return Err(Error::NegativeBranchLength { node, length });
        }
        Ok(length)
    }

    pub fn taxon_name(&self, tip: usize) -> &str {
        &self.taxon_names[tip]
    }

    pub fn taxon_names(&self) -> &[String] {
        &self.taxon_names
    }

    pub fn tip_index(&self, name: &str) -> Option<usize> {
        self.tip_name_to_idx.get(name).copied()
    }

    /// Take the heights and rates of `other`, which must share this tree's
    /// topology. The checkpoint is left alone.
    pub fn copy_parameters_from(&mut self, other: &Tree) {
        self.heights.copy_from_slice(&other.heights);
        self.branch_rates.copy_from_slice(&other.branch_rates);
    }

    /// Snapshot heights and rates so a rejected proposal can be undone.
    pub fn store_state(&mut self) {
        self.stored_heights.copy_from_slice(&self.heights);
        self.stored_branch_rates.copy_from_slice(&self.branch_rates);
    }

    pub fn restore_state(&mut self) {
        self.heights.copy_from_slice(&self.stored_heights);
        self.branch_rates.copy_from_slice(&self.stored_branch_rates);
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        arena_post_order(self.root_index, &self.children, &mut order);
        order
    }
}

fn arena_post_order(node: usize, children: &[Vec<usize>], order: &mut Vec<usize>) {
    for &child in &children[node] {
        arena_post_order(child, children, order);
    }
    order.push(node);
}

fn parse_label_length(chars: &[char]) -> Result<(String, f64, usize)> {
    let mut label = String::new();
    let mut length = String::new();
    let mut in_length = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '(' | ')' | ',' | ';' => break,
            ':' => {
                in_length = true;
                i += 1;
            }
            c => {
                if in_length {
                    length.push(c);
                } else {
                    label.push(c);
                }
                i += 1;
            }
        }
    }

    let length = if length.trim().is_empty() {
        0.0
    } else {
        length
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::InvalidTree(format!("invalid branch length '{}'", length)))?
    };
    Ok((label.trim().to_string(), length, i))
}
