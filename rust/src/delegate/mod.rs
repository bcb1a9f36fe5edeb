//! Likelihood delegates: one evaluation cycle over a set of dirty operations.
//!
//! A delegate turns the branch and node operations produced by a
//! [`TreeTraversal`](crate::traversal::TreeTraversal) into backend calls,
//! runs the rescaling state machine and reports either a log-likelihood or
//! a retryable error. [`DataLikelihoodDelegate`] handles one partition,
//! [`MultiPartitionDelegate`] several partitions over one shared schedule.
//!
//! Per-partition bookkeeping common to both lives in [`PartitionState`],
//! one instance per partition and evaluation context.

use tracing::warn;

use crate::backend::{ComputeBackend, PartialsOperation, PartitionLayout, RootRequest};
use crate::buffer::BufferIndexHelper;
use crate::config::LikelihoodConfig;
use crate::error::{Error, Result};
use crate::model::{BranchModel, SiteRateModel};
use crate::patterns::Patterns;
use crate::process::EvolutionaryProcessDelegate;
use crate::rescaling::{RescalingState, UnderflowAction};
use crate::traversal::{BranchOperation, NodeOperation, TraversalType};
use crate::tree::Tree;

pub mod multi;
pub mod single;

pub use multi::{MultiPartitionDelegate, PartitionSpec};
pub use single::DataLikelihoodDelegate;

/// Evaluation interface driven by [`TreeDataLikelihood`](crate::likelihood::TreeDataLikelihood).
pub trait LikelihoodDelegate {
    /// Run one evaluation attempt.
    ///
    /// Returns [`Error::Underflow`] or [`Error::RescaleRequested`] when the
    /// caller should retry with every node dirty. Negative infinity means
    /// the state is rejected.
    fn calculate_likelihood(
        &mut self,
        branch_operations: &[BranchOperation],
        node_operations: &[NodeOperation],
        root: usize,
    ) -> Result<f64>;

    fn store_state(&mut self);

    fn restore_state(&mut self);

    /// Forget every cached quantity; the next evaluation recomputes all.
    fn make_dirty(&mut self);

    /// The active context's tree changed, so its partitions that would
    /// otherwise reuse their cached value must recompute.
    fn tree_changed(&mut self) {}

    fn context_count(&self) -> usize;

    fn set_active_context(&mut self, context: usize);

    fn active_context(&self) -> usize;

    fn preferred_traversal(&self) -> TraversalType;
}

/// Buffer bookkeeping and rescaling state of one partition in one context.
#[derive(Debug, Clone)]
pub(crate) struct PartitionState {
    pub partition: usize,
    pub branch_model: usize,
    pub site_model: usize,
    tip_count: usize,
    internal_node_count: usize,
    partials: BufferIndexHelper,
    scales: BufferIndexHelper,
    pub process: EvolutionaryProcessDelegate,
    scale_buffer_indices: Vec<usize>,
    stored_scale_buffer_indices: Vec<usize>,
    pub rescaling: RescalingState,
    flip: bool,
    /// Category rates, weights and root frequencies must be re-sent.
    pub update_parameters: bool,
    /// Recompute on the next cycle instead of reusing the cached value.
    pub needs_update: bool,
    pub cached_log_likelihood: f64,
    stored_cached_log_likelihood: f64,
}

impl PartitionState {
    pub fn new(
        partition: usize,
        branch_model_index: usize,
        site_model_index: usize,
        tree: &Tree,
        branch_model: &BranchModel,
        config: &LikelihoodConfig,
        context: usize,
    ) -> Result<Self> {
        let tip_count = tree.tip_count();
        let internal = tree.internal_node_count();
        let scale_count = internal + 1;
        let scales = BufferIndexHelper::with_base(scale_count, 0, context * 2 * scale_count);
        let scale_buffer_indices: Vec<usize> = (0..internal).map(|i| scales.offset_index(i)).collect();

        Ok(Self {
            partition,
            branch_model: branch_model_index,
            site_model: site_model_index,
            tip_count,
            internal_node_count: internal,
            partials: BufferIndexHelper::with_base(tree.node_count(), tip_count, context * 2 * internal),
            scales,
            process: EvolutionaryProcessDelegate::new(
                branch_model,
                tree.node_count(),
                config.convolution_pool_size,
                context,
            )?,
            stored_scale_buffer_indices: scale_buffer_indices.clone(),
            scale_buffer_indices,
            rescaling: RescalingState::new(config),
            flip: true,
            update_parameters: true,
            needs_update: true,
            cached_log_likelihood: f64::NEG_INFINITY,
            stored_cached_log_likelihood: f64::NEG_INFINITY,
        })
    }

    /// Backend storage for one partition across `context_count` contexts.
    pub fn layout(
        tree: &Tree,
        patterns: &Patterns,
        branch_model: &BranchModel,
        site_model: &SiteRateModel,
        config: &LikelihoodConfig,
    ) -> PartitionLayout {
        let contexts = config.context_count;
        let internal = tree.internal_node_count();
        PartitionLayout {
            tip_count: tree.tip_count(),
            partials_buffer_count: tree.tip_count() + contexts * 2 * internal,
            scale_buffer_count: contexts * 2 * (internal + 1),
            matrix_buffer_count: contexts
                * EvolutionaryProcessDelegate::matrix_buffer_count(
                    branch_model,
                    tree.node_count(),
                    config.convolution_pool_size,
                ),
            eigen_buffer_count: contexts * EvolutionaryProcessDelegate::eigen_buffer_count(branch_model),
            state_count: branch_model.state_count(),
            pattern_count: patterns.pattern_count(),
            category_count: site_model.category_count(),
        }
    }

    /// Whether buffer offsets advance on the next write.
    pub fn flips_buffers(&self) -> bool {
        self.flip
    }

    /// Push parameters and eigen systems that changed since the last cycle.
    pub fn update_models<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        branch_model: &BranchModel,
        site_model: &SiteRateModel,
    ) -> Result<()> {
        if self.update_parameters {
            backend.set_category_rates(self.partition, site_model.category_rates())?;
            backend.set_category_weights(self.partition, site_model.category_weights())?;
            backend.set_state_frequencies(self.partition, branch_model.root_frequencies())?;
            self.update_parameters = false;
        }
        self.process
            .update_substitution_models(backend, self.partition, branch_model, self.flip)
    }

    pub fn update_transition_matrices<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        branch_model: &BranchModel,
        branch_operations: &[BranchOperation],
    ) -> Result<()> {
        if branch_operations.is_empty() {
            return Ok(());
        }
        self.process.update_transition_matrices(
            backend,
            self.partition,
            branch_model,
            branch_operations,
            self.flip,
        )
    }

    /// Translate node operations into backend partials operations, moving
    /// each destination (and scale buffer, when recomputing) to a fresh slot.
    pub fn collect_operations(
        &mut self,
        node_operations: &[NodeOperation],
        operations: &mut Vec<PartialsOperation>,
    ) {
        let use_scale = self.rescaling.uses_scale_factors();
        let recompute = self.rescaling.recomputes_scale_factors();

        for op in node_operations {
            let node = op.node_number;
            self.partials.prepare_write(node, self.flip);
            debug_assert!(self.partials.is_safe_update(node));

            let scale_index = node - self.tip_count;
            let (write_scale, read_scale) = match (use_scale, recompute) {
                (true, true) => {
                    self.scales.prepare_write(scale_index, self.flip);
                    debug_assert!(self.scales.is_safe_update(scale_index));
                    self.scale_buffer_indices[scale_index] = self.scales.offset_index(scale_index);
                    (Some(self.scale_buffer_indices[scale_index]), None)
                }
                (true, false) => (None, Some(self.scale_buffer_indices[scale_index])),
                (false, _) => (None, None),
            };

            operations.push(PartialsOperation {
                partition: self.partition,
                destination: self.partials.offset_index(node),
                write_scale,
                read_scale,
                child1: self.partials.offset_index(op.left_child),
                matrix1: self.process.matrix_index(op.left_child),
                child2: self.partials.offset_index(op.right_child),
                matrix2: self.process.matrix_index(op.right_child),
            });
        }
    }

    /// Build the root request, refreshing the cumulative scale buffer first
    /// if this cycle recomputed scale factors.
    pub fn root_request<B: ComputeBackend>(&mut self, backend: &mut B, root: usize) -> Result<RootRequest> {
        let cumulative_scale = if self.rescaling.uses_scale_factors() {
            let cumulative = self.internal_node_count;
            if self.rescaling.recomputes_scale_factors() {
                self.scales.prepare_write(cumulative, self.flip);
                debug_assert!(self.scales.is_safe_update(cumulative));
                let index = self.scales.offset_index(cumulative);
                backend.reset_scale_factors(self.partition, index)?;
                backend.accumulate_scale_factors(self.partition, &self.scale_buffer_indices, index)?;
                Some(index)
            } else {
                Some(self.scales.offset_index(cumulative))
            }
        } else {
            None
        };

        Ok(RootRequest {
            partition: self.partition,
            buffer: self.partials.offset_index(root),
            cumulative_scale,
        })
    }

    pub fn on_success(&mut self, log_likelihood: f64) {
        self.flip = true;
        self.rescaling.on_success();
        self.cached_log_likelihood = log_likelihood;
        self.needs_update = false;
    }

    /// Feed a non-finite root value to the rescaling state machine.
    pub fn on_underflow(&mut self, log_likelihood: f64) -> UnderflowAction {
        let action = self.rescaling.on_underflow(log_likelihood);
        match action {
            UnderflowAction::Retry => {
                warn!(
                    partition = self.partition,
                    log_likelihood,
                    forced = self.rescaling.is_forced(),
                    "non-finite log-likelihood, retrying with rescaling"
                );
                self.flip = false;
            }
            UnderflowAction::Reject => {
                warn!(
                    partition = self.partition,
                    log_likelihood,
                    "non-finite log-likelihood after rescaling, rejecting"
                );
                self.flip = true;
                self.cached_log_likelihood = f64::NEG_INFINITY;
                self.needs_update = false;
            }
        }
        action
    }

    pub fn make_dirty(&mut self) {
        self.process.mark_all_models_dirty();
        self.update_parameters = true;
        self.needs_update = true;
    }

    pub fn store_state(&mut self) {
        self.partials.store_state();
        self.scales.store_state();
        self.process.store_state();
        self.stored_scale_buffer_indices
            .copy_from_slice(&self.scale_buffer_indices);
        self.stored_cached_log_likelihood = self.cached_log_likelihood;
        self.flip = true;
    }

    pub fn restore_state(&mut self) {
        self.partials.restore_state();
        self.scales.restore_state();
        self.process.restore_state();
        std::mem::swap(
            &mut self.scale_buffer_indices,
            &mut self.stored_scale_buffer_indices,
        );
        self.stored_scale_buffer_indices
            .copy_from_slice(&self.scale_buffer_indices);
        self.cached_log_likelihood = self.stored_cached_log_likelihood;
        // The restored state was fully evaluated when it was stored.
        self.needs_update = false;
        // Re-send the parameters of the models the owner restored.
        self.update_parameters = true;
        self.flip = true;
    }
}

/// Allocate backend storage for a partition and upload its tip data and
/// pattern weights.
pub(crate) fn initialize_partition<B: ComputeBackend>(
    backend: &mut B,
    partition: usize,
    layout: &PartitionLayout,
    tree: &Tree,
    patterns: &Patterns,
    use_ambiguities: bool,
) -> Result<()> {
    if patterns.state_count() != layout.state_count {
        return Err(Error::InvalidModel(format!(
            "partition {} has {}-state data but a {}-state model",
            partition,
            patterns.state_count(),
            layout.state_count
        )));
    }

    backend.allocate(partition, layout)?;
    for tip in 0..tree.tip_count() {
        let name = tree.taxon_name(tip);
        let taxon = patterns
            .taxon_index(name)
            .ok_or_else(|| Error::MissingTaxon(name.to_string()))?;
        if use_ambiguities {
            backend.set_tip_partials(partition, tip, &patterns.tip_partials(taxon))?;
        } else {
            backend.set_tip_states(partition, tip, patterns.tip_states(taxon))?;
        }
    }
    backend.set_pattern_weights(partition, patterns.weights())?;
    Ok(())
}
