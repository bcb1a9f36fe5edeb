//! Recording wrapper around a backend.
//!
//! Every call is forwarded unchanged, logged at trace level and kept in an
//! in-memory log, so callers can check exactly which buffers an evaluation
//! touched.

use tracing::trace;

use super::{
    BackendResult, ComputeBackend, PartialsOperation, PartitionLayout, RootLogLikelihoods,
    RootRequest,
};
use crate::model::EigenDecomposition;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Allocate { partition: usize, layout: PartitionLayout },
    SetTipStates { partition: usize, tip: usize },
    SetTipPartials { partition: usize, tip: usize },
    SetPatternWeights { partition: usize },
    SetStateFrequencies { partition: usize },
    SetCategoryRates { partition: usize, rates: Vec<f64> },
    SetCategoryWeights { partition: usize },
    SetEigenDecomposition { partition: usize, buffer: usize },
    UpdateTransitionMatrices {
        partition: usize,
        eigen_buffer: usize,
        matrices: Vec<usize>,
        branch_lengths: Vec<f64>,
    },
    ConvolveTransitionMatrices {
        partition: usize,
        first: Vec<usize>,
        second: Vec<usize>,
        results: Vec<usize>,
    },
    UpdatePartials { operations: Vec<PartialsOperation> },
    ResetScaleFactors { partition: usize, cumulative: usize },
    AccumulateScaleFactors {
        partition: usize,
        scale_buffers: Vec<usize>,
        cumulative: usize,
    },
    CalculateRootLogLikelihoods {
        requests: Vec<RootRequest>,
        per_partition: Vec<f64>,
    },
}

impl BackendCall {
    /// Partitions this call touches.
    pub fn partitions(&self) -> Vec<usize> {
        match self {
            BackendCall::UpdatePartials { operations } => {
                let mut ids: Vec<usize> = operations.iter().map(|op| op.partition).collect();
                ids.dedup();
                ids
            }
            BackendCall::CalculateRootLogLikelihoods { requests, .. } => {
                requests.iter().map(|r| r.partition).collect()
            }
            BackendCall::Allocate { partition, .. }
            | BackendCall::SetTipStates { partition, .. }
            | BackendCall::SetTipPartials { partition, .. }
            | BackendCall::SetPatternWeights { partition }
            | BackendCall::SetStateFrequencies { partition }
            | BackendCall::SetCategoryRates { partition, .. }
            | BackendCall::SetCategoryWeights { partition }
            | BackendCall::SetEigenDecomposition { partition, .. }
            | BackendCall::UpdateTransitionMatrices { partition, .. }
            | BackendCall::ConvolveTransitionMatrices { partition, .. }
            | BackendCall::ResetScaleFactors { partition, .. }
            | BackendCall::AccumulateScaleFactors { partition, .. } => vec![*partition],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationReport<B> {
    inner: B,
    calls: Vec<BackendCall>,
}

impl<B: ComputeBackend> OperationReport<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            calls: Vec::new(),
        }
    }

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    /// All partials operations recorded since the last `clear`, in order.
    pub fn partials_operations(&self) -> Vec<PartialsOperation> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::UpdatePartials { operations } => Some(operations.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Matrix buffers written by transition-matrix updates since the last `clear`.
    pub fn updated_matrices(&self) -> Vec<usize> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::UpdateTransitionMatrices { matrices, .. } => Some(matrices.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    fn record(&mut self, call: BackendCall) {
        trace!(backend = %self.inner.name(), call = ?call, "backend call");
        self.calls.push(call);
    }
}

impl<B: ComputeBackend> ComputeBackend for OperationReport<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn allocate(&mut self, partition: usize, layout: &PartitionLayout) -> BackendResult<()> {
        self.record(BackendCall::Allocate {
            partition,
            layout: *layout,
        });
        self.inner.allocate(partition, layout)
    }

    fn set_tip_states(&mut self, partition: usize, tip: usize, states: &[u32]) -> BackendResult<()> {
        self.record(BackendCall::SetTipStates { partition, tip });
        self.inner.set_tip_states(partition, tip, states)
    }

    fn set_tip_partials(&mut self, partition: usize, tip: usize, partials: &[f64]) -> BackendResult<()> {
        self.record(BackendCall::SetTipPartials { partition, tip });
        self.inner.set_tip_partials(partition, tip, partials)
    }

    fn set_pattern_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()> {
        self.record(BackendCall::SetPatternWeights { partition });
        self.inner.set_pattern_weights(partition, weights)
    }

    fn set_state_frequencies(&mut self, partition: usize, frequencies: &[f64]) -> BackendResult<()> {
        self.record(BackendCall::SetStateFrequencies { partition });
        self.inner.set_state_frequencies(partition, frequencies)
    }

    fn set_category_rates(&mut self, partition: usize, rates: &[f64]) -> BackendResult<()> {
        self.record(BackendCall::SetCategoryRates {
            partition,
            rates: rates.to_vec(),
        });
        self.inner.set_category_rates(partition, rates)
    }

    fn set_category_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()> {
        self.record(BackendCall::SetCategoryWeights { partition });
        self.inner.set_category_weights(partition, weights)
    }

    fn set_eigen_decomposition(
        &mut self,
        partition: usize,
        buffer: usize,
        eigen: &EigenDecomposition,
    ) -> BackendResult<()> {
        self.record(BackendCall::SetEigenDecomposition { partition, buffer });
        self.inner.set_eigen_decomposition(partition, buffer, eigen)
    }

    fn update_transition_matrices(
        &mut self,
        partition: usize,
        eigen_buffer: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> BackendResult<()> {
        self.record(BackendCall::UpdateTransitionMatrices {
            partition,
            eigen_buffer,
            matrices: matrices.to_vec(),
            branch_lengths: branch_lengths.to_vec(),
        });
        self.inner
            .update_transition_matrices(partition, eigen_buffer, matrices, branch_lengths)
    }

    fn convolve_transition_matrices(
        &mut self,
        partition: usize,
        first: &[usize],
        second: &[usize],
        results: &[usize],
    ) -> BackendResult<()> {
        self.record(BackendCall::ConvolveTransitionMatrices {
            partition,
            first: first.to_vec(),
            second: second.to_vec(),
            results: results.to_vec(),
        });
        self.inner
            .convolve_transition_matrices(partition, first, second, results)
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> BackendResult<()> {
        self.record(BackendCall::UpdatePartials {
            operations: operations.to_vec(),
        });
        self.inner.update_partials(operations)
    }

    fn reset_scale_factors(&mut self, partition: usize, cumulative: usize) -> BackendResult<()> {
        self.record(BackendCall::ResetScaleFactors {
            partition,
            cumulative,
        });
        self.inner.reset_scale_factors(partition, cumulative)
    }

    fn accumulate_scale_factors(
        &mut self,
        partition: usize,
        scale_buffers: &[usize],
        cumulative: usize,
    ) -> BackendResult<()> {
        self.record(BackendCall::AccumulateScaleFactors {
            partition,
            scale_buffers: scale_buffers.to_vec(),
            cumulative,
        });
        self.inner
            .accumulate_scale_factors(partition, scale_buffers, cumulative)
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        requests: &[RootRequest],
    ) -> BackendResult<RootLogLikelihoods> {
        let result = self.inner.calculate_root_log_likelihoods(requests)?;
        self.record(BackendCall::CalculateRootLogLikelihoods {
            requests: requests.to_vec(),
            per_partition: result.per_partition.clone(),
        });
        Ok(result)
    }
}
