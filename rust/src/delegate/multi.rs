//! Several partitions evaluated over one shared operation schedule.
//!
//! Partitions reference branch and site models by index, so a model shared
//! by several partitions is updated once and dirties exactly its users.
//! A partition that is clean keeps its cached log-likelihood and issues no
//! backend calls; the dirty ones are batched into one partials call and one
//! combined root reduction.

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

/// Data and model choice for one partition.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub patterns: Patterns,
    pub branch_model: usize,
    pub site_model: usize,
}

pub struct MultiPartitionDelegate<B: ComputeBackend> {
    backend: B,
    branch_models: Vec<BranchModel>,
    site_models: Vec<SiteRateModel>,
    stored_branch_models: Vec<BranchModel>,
    stored_site_models: Vec<SiteRateModel>,
    /// `contexts[context][partition]`
    contexts: Vec<Vec<PartitionState>>,
    active: usize,
    internal_node_count: usize,
    traversal_type: TraversalType,
}

impl<B: ComputeBackend> MultiPartitionDelegate<B> {
    pub fn new(
        tree: &Tree,
        partitions: Vec<PartitionSpec>,
        branch_models: Vec<BranchModel>,
        site_models: Vec<SiteRateModel>,
        mut backend: B,
        config: &LikelihoodConfig,
    ) -> Result<Self> {
        config.validate()?;
        if partitions.is_empty() {
            return Err(Error::InvalidConfig("no partitions given".to_string()));
        }

        for (p, spec) in partitions.iter().enumerate() {
            let branch_model = branch_models.get(spec.branch_model).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "partition {} uses branch model {} of {}",
                    p,
                    spec.branch_model,
                    branch_models.len()
                ))
            })?;
            let site_model = site_models.get(spec.site_model).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "partition {} uses site model {} of {}",
                    p,
                    spec.site_model,
                    site_models.len()
                ))
            })?;
            let layout = PartitionState::layout(tree, &spec.patterns, branch_model, site_model, config);
            initialize_partition(&mut backend, p, &layout, tree, &spec.patterns, config.use_ambiguities)?;
        }

        let mut contexts = Vec::with_capacity(config.context_count);
        for context in 0..config.context_count {
            let states = partitions
                .iter()
                .enumerate()
                .map(|(p, spec)| {
                    PartitionState::new(
                        p,
                        spec.branch_model,
                        spec.site_model,
                        tree,
                        &branch_models[spec.branch_model],
                        config,
                        context,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            contexts.push(states);
        }

        info!(
            backend = backend.name(),
            partitions = partitions.len(),
            branch_models = branch_models.len(),
            site_models = site_models.len(),
            taxa = tree.tip_count(),
            patterns = partitions.iter().map(|s| s.patterns.pattern_count()).sum::<usize>(),
            contexts = config.context_count,
            traversal = %config.traversal_type,
            rescaling = %config.describe_rescaling(),
            "created multi-partition likelihood delegate"
        );

        Ok(Self {
            backend,
            stored_branch_models: branch_models.clone(),
            stored_site_models: site_models.clone(),
            branch_models,
            site_models,
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

    pub fn partition_count(&self) -> usize {
        self.contexts[0].len()
    }

    pub fn branch_model(&self, index: usize) -> &BranchModel {
        &self.branch_models[index]
    }

    pub fn site_model(&self, index: usize) -> &SiteRateModel {
        &self.site_models[index]
    }

    pub fn rescaling_state(&self, partition: usize) -> &RescalingState {
        &self.contexts[self.active][partition].rescaling
    }

    /// Last valid log-likelihood of a partition in the active context.
    pub fn partition_log_likelihood(&self, partition: usize) -> f64 {
        self.contexts[self.active][partition].cached_log_likelihood
    }

    /// Whether a partition will be recomputed on the next evaluation.
    pub fn is_partition_dirty(&self, partition: usize) -> bool {
        self.contexts[self.active][partition].needs_update
    }

    /// Skip the cached value of a partition on the next cycle.
    ///
    /// Only the operations in the schedule are recomputed, so call this
    /// through [`TreeDataLikelihood::update_models`] when every node of the
    /// partition is stale.
    ///
    /// [`TreeDataLikelihood::update_models`]: crate::likelihood::TreeDataLikelihood::update_models
    pub fn mark_partition_dirty(&mut self, partition: usize) {
        for states in &mut self.contexts {
            states[partition].needs_update = true;
        }
    }

    /// Replace substitution model `model` of branch model `branch_model`.
    pub fn set_substitution_model(
        &mut self,
        branch_model: usize,
        model: usize,
        substitution_model: SubstitutionModel,
    ) -> Result<()> {
        self.branch_models
            .get_mut(branch_model)
            .ok_or_else(|| Error::InvalidModel(format!("no branch model {}", branch_model)))?
            .set_substitution_model(model, substitution_model)?;

        for state in self
            .contexts
            .iter_mut()
            .flatten()
            .filter(|s| s.branch_model == branch_model)
        {
            state.process.mark_model_dirty(model);
            state.update_parameters = true;
            state.needs_update = true;
        }
        Ok(())
    }

    pub fn set_category_rates(&mut self, site_model: usize, rates: &[f64]) -> Result<()> {
        self.site_models
            .get_mut(site_model)
            .ok_or_else(|| Error::InvalidModel(format!("no site model {}", site_model)))?
            .set_category_rates(rates)?;

        for state in self
            .contexts
            .iter_mut()
            .flatten()
            .filter(|s| s.site_model == site_model)
        {
            state.update_parameters = true;
            state.needs_update = true;
        }
        Ok(())
    }
}

impl<B: ComputeBackend> LikelihoodDelegate for MultiPartitionDelegate<B> {
    fn calculate_likelihood(
        &mut self,
        branch_operations: &[BranchOperation],
        node_operations: &[NodeOperation],
        root: usize,
    ) -> Result<f64> {
        let full_traversal = node_operations.len() == self.internal_node_count;
        let states = &mut self.contexts[self.active];
        let updated: Vec<usize> = (0..states.len()).filter(|&p| states[p].needs_update).collect();

        for &p in &updated {
            if let Err(err) = self.site_models[states[p].site_model].validate() {
                warn!(partition = p, %err, "site model failed validation, rejecting");
                return Ok(f64::NEG_INFINITY);
            }
        }

        // Ask for a full traversal before touching any partition's counters.
        if !full_traversal && updated.iter().any(|&p| states[p].rescaling.requires_full_traversal()) {
            debug!("partition due for periodic rescaling, requesting full traversal");
            return Err(Error::RescaleRequested);
        }
        for &p in &updated {
            states[p].rescaling.plan_cycle(full_traversal)?;
        }

        debug!(
            context = self.active,
            partitions = ?updated,
            branch_operations = branch_operations.len(),
            node_operations = node_operations.len(),
            "evaluating"
        );

        let mut operations = Vec::with_capacity(updated.len() * node_operations.len());
        for &p in &updated {
            let state = &mut states[p];
            let branch_model = &self.branch_models[state.branch_model];
            state.update_models(&mut self.backend, branch_model, &self.site_models[state.site_model])?;
            state.update_transition_matrices(&mut self.backend, branch_model, branch_operations)?;
            state.collect_operations(node_operations, &mut operations);
        }
        if !operations.is_empty() {
            self.backend.update_partials(&operations)?;
        }

        if !updated.is_empty() {
            let mut requests = Vec::with_capacity(updated.len());
            for &p in &updated {
                requests.push(states[p].root_request(&mut self.backend, root)?);
            }
            let result = self.backend.calculate_root_log_likelihoods(&requests)?;

            let mut underflowed = Vec::new();
            let mut rejected = false;
            for (&p, &log_likelihood) in updated.iter().zip(&result.per_partition) {
                let state = &mut states[p];
                if log_likelihood.is_finite() {
                    state.on_success(log_likelihood);
                    continue;
                }
                match state.on_underflow(log_likelihood) {
                    UnderflowAction::Retry => underflowed.push(p),
                    UnderflowAction::Reject => rejected = true,
                }
            }

            if !underflowed.is_empty() {
                return Err(Error::Underflow {
                    partitions: underflowed,
                });
            }
            if rejected {
                return Ok(f64::NEG_INFINITY);
            }
        }

        Ok(states.iter().map(|s| s.cached_log_likelihood).sum())
    }

    fn store_state(&mut self) {
        self.stored_branch_models.clone_from(&self.branch_models);
        self.stored_site_models.clone_from(&self.site_models);
        for state in self.contexts.iter_mut().flatten() {
            state.store_state();
        }
    }

    fn restore_state(&mut self) {
        self.branch_models.clone_from(&self.stored_branch_models);
        self.site_models.clone_from(&self.stored_site_models);
        for state in self.contexts.iter_mut().flatten() {
            state.restore_state();
        }
    }

    fn make_dirty(&mut self) {
        for state in self.contexts.iter_mut().flatten() {
            state.make_dirty();
        }
    }

    fn tree_changed(&mut self) {
        for state in &mut self.contexts[self.active] {
            state.needs_update = true;
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
