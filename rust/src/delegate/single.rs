//! Single-partition likelihood delegate.

use tracing::{debug, info, warn};

use super::{initialize_partition, LikelihoodDelegate, PartitionState};
use crate::backend::ComputeBackend;
use crate::config::LikelihoodConfig;
use crate::error::{Error, Result};
use crate::model::{BranchModel, SiteRateModel, SubstitutionModel};
use crate::patterns::Patterns;
use crate::rescaling::{RescalingState, UnderflowAction};
use crate::traversal::{BranchOperation, NodeOperation, TraversalType};
use crate::tree::Tree;

const PARTITION: usize = 0;

/// Evaluates one pattern set on one tree.
pub struct DataLikelihoodDelegate<B: ComputeBackend> {
    backend: B,
    branch_model: BranchModel,
    site_model: SiteRateModel,
    stored_branch_model: BranchModel,
    stored_site_model: SiteRateModel,
    contexts: Vec<PartitionState>,
    active: usize,
    internal_node_count: usize,
    traversal_type: TraversalType,
}

impl<B: ComputeBackend> DataLikelihoodDelegate<B> {
    pub fn new(
        tree: &Tree,
        patterns: &Patterns,
        branch_model: BranchModel,
        site_model: SiteRateModel,
        mut backend: B,
        config: &LikelihoodConfig,
    ) -> Result<Self> {
        config.validate()?;

        let layout = PartitionState::layout(tree, patterns, &branch_model, &site_model, config);
        initialize_partition(&mut backend, PARTITION, &layout, tree, patterns, config.use_ambiguities)?;

        let contexts = (0..config.context_count)
            .map(|context| PartitionState::new(PARTITION, 0, 0, tree, &branch_model, config, context))
            .collect::<Result<Vec<_>>>()?;

        info!(
            backend = backend.name(),
            taxa = tree.tip_count(),
            patterns = patterns.pattern_count(),
            states = layout.state_count,
            categories = layout.category_count,
            models = branch_model.model_count(),
            partials_buffers = layout.partials_buffer_count,
            matrix_buffers = layout.matrix_buffer_count,
            contexts = config.context_count,
            traversal = %config.traversal_type,
            rescaling = %config.describe_rescaling(),
            "created data likelihood delegate"
        );

        Ok(Self {
            backend,
            stored_branch_model: branch_model.clone(),
            stored_site_model: site_model.clone(),
            branch_model,
            site_model,
            contexts,
            active: 0,
            internal_node_count: tree.internal_node_count(),
            traversal_type: config.traversal_type,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn branch_model(&self) -> &BranchModel {
        &self.branch_model
    }

    pub fn site_model(&self) -> &SiteRateModel {
        &self.site_model
    }

    /// Rescaling state of the active context.
    pub fn rescaling_state(&self) -> &RescalingState {
        &self.contexts[self.active].rescaling
    }

    /// Whether the active context writes into fresh slots on the next cycle.
    pub fn flips_buffers(&self) -> bool {
        self.contexts[self.active].flips_buffers()
    }

    /// Replace substitution model `index`; its eigen system is re-sent on
    /// the next evaluation.
    pub fn set_substitution_model(&mut self, index: usize, model: SubstitutionModel) -> Result<()> {
        self.branch_model.set_substitution_model(index, model)?;
        for state in &mut self.contexts {
            state.process.mark_model_dirty(index);
            state.update_parameters = true;
        }
        Ok(())
    }

    /// Replace the category rates. Invalid values are accepted here and
    /// reject the next evaluation.
    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.site_model.set_category_rates(rates)?;
        for state in &mut self.contexts {
            state.update_parameters = true;
        }
        Ok(())
    }
}

impl<B: ComputeBackend> LikelihoodDelegate for DataLikelihoodDelegate<B> {
    fn calculate_likelihood(
        &mut self,
        branch_operations: &[BranchOperation],
        node_operations: &[NodeOperation],
        root: usize,
    ) -> Result<f64> {
        // Rejected before planning so the rescaling counters do not advance.
        if let Err(err) = self.site_model.validate() {
            warn!(%err, "site model failed validation, rejecting");
            return Ok(f64::NEG_INFINITY);
        }

        let state = &mut self.contexts[self.active];
        state
            .rescaling
            .plan_cycle(node_operations.len() == self.internal_node_count)?;

        debug!(
            context = self.active,
            branch_operations = branch_operations.len(),
            node_operations = node_operations.len(),
            use_scale_factors = state.rescaling.uses_scale_factors(),
            recompute_scale_factors = state.rescaling.recomputes_scale_factors(),
            "evaluating"
        );

        state.update_models(&mut self.backend, &self.branch_model, &self.site_model)?;
        state.update_transition_matrices(&mut self.backend, &self.branch_model, branch_operations)?;

        let mut operations = Vec::with_capacity(node_operations.len());
        state.collect_operations(node_operations, &mut operations);
        if !operations.is_empty() {
            self.backend.update_partials(&operations)?;
        }

        let request = state.root_request(&mut self.backend, root)?;
        let log_likelihood = self.backend.calculate_root_log_likelihoods(&[request])?.total;

        if log_likelihood.is_finite() {
            state.on_success(log_likelihood);
            return Ok(log_likelihood);
        }
        match state.on_underflow(log_likelihood) {
            UnderflowAction::Retry => Err(Error::Underflow {
                partitions: vec![PARTITION],
            }),
            UnderflowAction::Reject => Ok(f64::NEG_INFINITY),
        }
    }

    fn store_state(&mut self) {
        self.stored_branch_model.clone_from(&self.branch_model);
        self.stored_site_model.clone_from(&self.site_model);
        for state in &mut self.contexts {
            state.store_state();
        }
    }

    /// Roll back buffers and models together, so the restored eigen slots
    /// and matrices describe the models in use.
    fn restore_state(&mut self) {
        self.branch_model.clone_from(&self.stored_branch_model);
        self.site_model.clone_from(&self.stored_site_model);
        for state in &mut self.contexts {
            state.restore_state();
        }
    }

    fn make_dirty(&mut self) {
        for state in &mut self.contexts {
            state.make_dirty();
        }
    }

    fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn set_active_context(&mut self, context: usize) {
        assert!(
            context < self.contexts.len(),
            "context {} out of range {}",
            context,
            self.contexts.len()
        );
        self.active = context;
    }

    fn active_context(&self) -> usize {
        self.active
    }

    fn preferred_traversal(&self) -> TraversalType {
        self.traversal_type
    }
}
