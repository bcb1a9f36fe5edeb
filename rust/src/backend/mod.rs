//! Compute backend interface.
//!
//! The delegates drive a backend purely through buffer indices. A backend
//! owns all numeric storage; partition ids keep several independent data
//! sets apart inside one backend instance.

use crate::error::BackendError;
use crate::model::EigenDecomposition;

pub mod cpu;
pub mod report;

pub use cpu::CpuBackend;
pub use report::{BackendCall, OperationReport};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Buffer and dimension counts for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub tip_count: usize,
    pub partials_buffer_count: usize,
    pub scale_buffer_count: usize,
    pub matrix_buffer_count: usize,
    pub eigen_buffer_count: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub category_count: usize,
}

/// One partials update: `destination = (M1 · child1) ∘ (M2 · child2)`.
///
/// With `write_scale` the result is rescaled and the log factors written to
/// that scale buffer; with `read_scale` existing factors are applied instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialsOperation {
    pub partition: usize,
    pub destination: usize,
    pub write_scale: Option<usize>,
    pub read_scale: Option<usize>,
    pub child1: usize,
    pub matrix1: usize,
    pub child2: usize,
    pub matrix2: usize,
}

/// Root reduction request for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRequest {
    pub partition: usize,
    pub buffer: usize,
    pub cumulative_scale: Option<usize>,
}

/// Result of a combined root reduction, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct RootLogLikelihoods {
    pub per_partition: Vec<f64>,
    pub total: f64,
}

/// Numeric kernel driven by the likelihood delegates.
///
/// Calls are synchronous. Operations in one `update_partials` batch are
/// listed in dependency order; an implementation may run independent ones
/// concurrently.
pub trait ComputeBackend {
    fn name(&self) -> &str;

    /// Allocate (or reallocate) storage for a partition.
    fn allocate(&mut self, partition: usize, layout: &PartitionLayout) -> BackendResult<()>;

    /// Compact tip data; codes `>= state_count` are treated as unknown.
    fn set_tip_states(&mut self, partition: usize, tip: usize, states: &[u32]) -> BackendResult<()>;

    /// Tip partials, `pattern × state`, shared by every rate category.
    fn set_tip_partials(&mut self, partition: usize, tip: usize, partials: &[f64]) -> BackendResult<()>;

    fn set_pattern_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()>;

    fn set_state_frequencies(&mut self, partition: usize, frequencies: &[f64]) -> BackendResult<()>;

    fn set_category_rates(&mut self, partition: usize, rates: &[f64]) -> BackendResult<()>;

    fn set_category_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()>;

    fn set_eigen_decomposition(
        &mut self,
        partition: usize,
        buffer: usize,
        eigen: &EigenDecomposition,
    ) -> BackendResult<()>;

    /// Exponentiate one eigen system for each `(matrix, length)` pair, once
    /// per rate category.
    fn update_transition_matrices(
        &mut self,
        partition: usize,
        eigen_buffer: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> BackendResult<()>;

    /// `results[i] = first[i] · second[i]`. A result may alias an input.
    fn convolve_transition_matrices(
        &mut self,
        partition: usize,
        first: &[usize],
        second: &[usize],
        results: &[usize],
    ) -> BackendResult<()>;

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> BackendResult<()>;

    fn reset_scale_factors(&mut self, partition: usize, cumulative: usize) -> BackendResult<()>;

    fn accumulate_scale_factors(
        &mut self,
        partition: usize,
        scale_buffers: &[usize],
        cumulative: usize,
    ) -> BackendResult<()>;

    fn calculate_root_log_likelihoods(
        &mut self,
        requests: &[RootRequest],
    ) -> BackendResult<RootLogLikelihoods>;
}
