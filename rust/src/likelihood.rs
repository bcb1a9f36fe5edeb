//! Public evaluation API: tree, dirty-node schedule and delegate together.
//!
//! [`TreeDataLikelihood::evaluate`] owns the retry loop. A delegate that
//! underflows or asks for a full traversal gets every node marked dirty and
//! another attempt, up to the configured underflow cap.
//!
//! Each evaluation context holds its own copy of the tree parameters. Tree
//! edits go to the active context only, so several contexts can evaluate
//! competing proposals; [`TreeDataLikelihood::accept_context`] then makes
//! one of them the state every context continues from.

use tracing::{debug, info, warn};

use crate::config::LikelihoodConfig;
use crate::delegate::LikelihoodDelegate;
use crate::error::{Error, Result};
use crate::traversal::TreeTraversal;
use crate::tree::Tree;

/// Counters accumulated over the lifetime of a likelihood.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Completed evaluations (finite or rejected).
    pub evaluations: usize,
    /// Delegate calls, including retries.
    pub attempts: usize,
    pub underflows: usize,
    pub rescale_requests: usize,
    pub branch_operations: usize,
    pub node_operations: usize,
}

pub struct TreeDataLikelihood<D: LikelihoodDelegate> {
    /// One tree per context, same topology.
    trees: Vec<Tree>,
    traversals: Vec<TreeTraversal>,
    delegate: D,
    max_underflow_retries: usize,
    log_likelihoods: Vec<Option<f64>>,
    stored_log_likelihoods: Vec<Option<f64>>,
    stats: EvaluationStats,
}

impl<D: LikelihoodDelegate> TreeDataLikelihood<D> {
    pub fn new(tree: Tree, delegate: D, config: &LikelihoodConfig) -> Result<Self> {
        config.validate()?;
        let contexts = delegate.context_count();
        let traversal_type = delegate.preferred_traversal();
        let traversals = (0..contexts)
            .map(|_| TreeTraversal::new(tree.node_count(), traversal_type))
            .collect();

        info!(
            taxa = tree.tip_count(),
            contexts,
            traversal = %traversal_type,
            max_underflow_retries = config.max_underflow_retries,
            "created tree data likelihood"
        );

        Ok(Self {
            trees: vec![tree; contexts],
            traversals,
            delegate,
            max_underflow_retries: config.max_underflow_retries,
            log_likelihoods: vec![None; contexts],
            stored_log_likelihoods: vec![None; contexts],
            stats: EvaluationStats::default(),
        })
    }

    /// Tree of the active context.
    pub fn tree(&self) -> &Tree {
        &self.trees[self.delegate.active_context()]
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Direct access to the delegate. Model changes made through it are not
    /// seen by the dirty-node schedule; use [`update_models`](Self::update_models).
    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    pub fn stats(&self) -> EvaluationStats {
        self.stats
    }

    pub fn active_context(&self) -> usize {
        self.delegate.active_context()
    }

    /// Whether `node` will be recomputed by the next evaluation of the
    /// active context.
    pub fn is_node_dirty(&self, node: usize) -> bool {
        self.traversals[self.delegate.active_context()].is_dirty(node)
    }

    /// The log-likelihood of the active context, if still current.
    pub fn cached_log_likelihood(&self) -> Option<f64> {
        self.log_likelihoods[self.delegate.active_context()]
    }

    /// Log-likelihood of the active context, recomputing what is dirty.
    ///
    /// Negative infinity means the state is rejected. An error means the
    /// evaluation failed outright; every node is left dirty.
    pub fn evaluate(&mut self) -> Result<f64> {
        let context = self.delegate.active_context();
        if let Some(log_likelihood) = self.log_likelihoods[context] {
            return Ok(log_likelihood);
        }

        let tree = &self.trees[context];
        let root = tree.root();
        let mut underflows = 0;
        loop {
            let traversal = &mut self.traversals[context];
            if let Err(err) = traversal.dispatch(tree) {
                traversal.update_all_nodes();
                return Err(err);
            }

            self.stats.attempts += 1;
            self.stats.branch_operations += traversal.branch_operations().len();
            self.stats.node_operations += traversal.node_operations().len();

            let result = self.delegate.calculate_likelihood(
                traversal.branch_operations(),
                traversal.node_operations(),
                root,
            );

            match result {
                Ok(log_likelihood) => {
                    traversal.set_all_nodes_updated();
                    self.stats.evaluations += 1;
                    self.log_likelihoods[context] = Some(log_likelihood);
                    return Ok(log_likelihood);
                }
                Err(Error::RescaleRequested) => {
                    self.stats.rescale_requests += 1;
                    traversal.update_all_nodes();
                }
                Err(Error::Underflow { partitions }) => {
                    underflows += 1;
                    self.stats.underflows += 1;
                    traversal.update_all_nodes();
                    if underflows >= self.max_underflow_retries {
                        warn!(attempts = underflows, ?partitions, "underflow retry limit reached");
                        return Err(Error::RetryLimitExceeded {
                            attempts: underflows,
                        });
                    }
                    debug!(attempt = underflows, ?partitions, "retrying after underflow");
                }
                Err(err) => {
                    traversal.update_all_nodes();
                    return Err(err);
                }
            }
        }
    }

    /// Evaluate several contexts, leaving the active context unchanged.
    pub fn prefetch_log_likelihoods(&mut self, contexts: &[usize]) -> Result<Vec<f64>> {
        let active = self.delegate.active_context();
        let mut values = Vec::with_capacity(contexts.len());
        for &context in contexts {
            self.delegate.set_active_context(context);
            match self.evaluate() {
                Ok(value) => values.push(value),
                Err(err) => {
                    self.delegate.set_active_context(active);
                    return Err(err);
                }
            }
        }
        self.delegate.set_active_context(active);
        Ok(values)
    }

    /// Route later tree edits and evaluations to `context`.
    pub fn set_active_context(&mut self, context: usize) {
        self.delegate.set_active_context(context);
    }

    /// Make `context` the live state and the active context.
    ///
    /// Every other context takes its tree parameters and recomputes only
    /// the branches where it differed.
    pub fn accept_context(&mut self, context: usize) {
        self.delegate.set_active_context(context);
        self.sync_contexts(context);
        debug!(context, "accepted context");
    }

    /// Drop the proposals held by every context but the active one.
    pub fn discard_other_contexts(&mut self) {
        let active = self.delegate.active_context();
        self.sync_contexts(active);
    }

    fn sync_contexts(&mut self, source: usize) {
        let (before, rest) = self.trees.split_at_mut(source);
        let Some((source_tree, after)) = rest.split_first_mut() else {
            return;
        };
        let source_tree: &Tree = source_tree;

        let others = before
            .iter_mut()
            .enumerate()
            .chain(after.iter_mut().enumerate().map(|(i, t)| (source + 1 + i, t)));
        let mut changed_contexts = Vec::new();
        for (context, tree) in others {
            let traversal = &mut self.traversals[context];
            let mut changed = false;
            for node in 0..tree.node_count() {
                if tree.height(node) != source_tree.height(node) {
                    traversal.update_node_and_children(source_tree, node);
                    changed = true;
                }
                if tree.branch_rate(node) != source_tree.branch_rate(node) {
                    traversal.update_node(node);
                    changed = true;
                }
            }
            if changed {
                tree.copy_parameters_from(source_tree);
                self.log_likelihoods[context] = None;
                changed_contexts.push(context);
            }
        }

        for &context in &changed_contexts {
            self.delegate.set_active_context(context);
            self.delegate.tree_changed();
        }
        self.delegate.set_active_context(source);
    }

    pub fn store_state(&mut self) {
        for tree in &mut self.trees {
            tree.store_state();
        }
        self.delegate.store_state();
        self.stored_log_likelihoods
            .clone_from_slice(&self.log_likelihoods);
    }

    /// Roll back to the last `store_state`.
    pub fn restore_state(&mut self) {
        for tree in &mut self.trees {
            tree.restore_state();
        }
        self.delegate.restore_state();
        self.log_likelihoods
            .clone_from_slice(&self.stored_log_likelihoods);

        if self.log_likelihoods.iter().all(Option::is_some) {
            for traversal in &mut self.traversals {
                traversal.set_all_nodes_updated();
            }
        } else {
            // The checkpoint was taken with unevaluated changes pending.
            self.make_dirty();
        }
    }

    pub fn make_dirty(&mut self) {
        self.delegate.make_dirty();
        for traversal in &mut self.traversals {
            traversal.update_all_nodes();
        }
        self.invalidate();
    }

    /// Recompute the branch above `node` in the active context.
    pub fn mark_node_dirty(&mut self, node: usize) {
        let context = self.delegate.active_context();
        self.traversals[context].update_node(node);
        self.delegate.tree_changed();
        self.log_likelihoods[context] = None;
    }

    /// Move a node of the active context's tree; the branches to its
    /// children change length too.
    pub fn set_node_height(&mut self, node: usize, height: f64) {
        let context = self.delegate.active_context();
        let tree = &mut self.trees[context];
        tree.set_node_height(node, height);
        self.traversals[context].update_node_and_children(tree, node);
        self.delegate.tree_changed();
        self.log_likelihoods[context] = None;
    }

    pub fn set_branch_rate(&mut self, node: usize, rate: f64) {
        self.trees[self.delegate.active_context()].set_branch_rate(node, rate);
        self.mark_node_dirty(node);
    }

    /// Change model parameters through the delegate.
    ///
    /// Every branch is recomputed; partitions the delegate does not flag as
    /// changed keep their cached values.
    pub fn update_models<R>(&mut self, update: impl FnOnce(&mut D) -> R) -> R {
        let result = update(&mut self.delegate);
        for traversal in &mut self.traversals {
            traversal.update_all_nodes();
        }
        self.invalidate();
        result
    }

    fn invalidate(&mut self) {
        self.log_likelihoods.iter_mut().for_each(|l| *l = None);
    }
}
