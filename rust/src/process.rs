//! Evolutionary process delegate: eigen systems and transition matrices.
//!
//! Every branch has a double-buffered matrix slot. Branches that cross an
//! epoch boundary are computed segment by segment into scratch buffers drawn
//! from a bounded pool, then multiplied together into the branch's slot.
//!
//! Matrix layout for one context:
//! `[branch slots (2 × node_count) | pool | reserve]`.

use std::collections::VecDeque;

use tracing::debug;

use crate::backend::ComputeBackend;
use crate::buffer::BufferIndexHelper;
use crate::error::{Error, Result};
use crate::model::BranchModel;
use crate::traversal::BranchOperation;

#[derive(Debug, Clone)]
pub struct EvolutionaryProcessDelegate {
    eigen_count: usize,
    eigen_helper: BufferIndexHelper,
    matrix_helper: BufferIndexHelper,
    pool_start: usize,
    pool_size: usize,
    reserve_buffer_index: usize,
    available_buffers: Vec<usize>,
    model_dirty: Vec<bool>,
    stored_model_dirty: Vec<bool>,
}

impl EvolutionaryProcessDelegate {
    /// Matrix buffers one context needs.
    pub fn matrix_buffer_count(branch_model: &BranchModel, node_count: usize, pool_size: usize) -> usize {
        2 * node_count + Self::extra_buffer_count(branch_model, pool_size) + 1
    }

    /// Eigen buffers one context needs.
    pub fn eigen_buffer_count(branch_model: &BranchModel) -> usize {
        2 * branch_model.model_count()
    }

    fn extra_buffer_count(branch_model: &BranchModel, pool_size: usize) -> usize {
        if branch_model.requires_convolution() {
            pool_size
        } else {
            0
        }
    }

    /// Delegate for evaluation context `context`; contexts get disjoint
    /// matrix and eigen regions.
    pub fn new(
        branch_model: &BranchModel,
        node_count: usize,
        pool_size: usize,
        context: usize,
    ) -> Result<Self> {
        let eigen_count = branch_model.model_count();
        if branch_model.requires_convolution() && pool_size < eigen_count {
            return Err(Error::InvalidConfig(format!(
                "convolution pool of {} buffers is smaller than the {} epoch models",
                pool_size, eigen_count
            )));
        }

        let extra = Self::extra_buffer_count(branch_model, pool_size);
        let matrix_base = context * Self::matrix_buffer_count(branch_model, node_count, pool_size);
        let eigen_base = context * Self::eigen_buffer_count(branch_model);
        let pool_start = matrix_base + 2 * node_count;

        Ok(Self {
            eigen_count,
            eigen_helper: BufferIndexHelper::with_base(eigen_count, 0, eigen_base),
            matrix_helper: BufferIndexHelper::with_base(node_count, 0, matrix_base),
            pool_start,
            pool_size: extra,
            reserve_buffer_index: pool_start + extra,
            available_buffers: (pool_start..pool_start + extra).rev().collect(),
            model_dirty: vec![true; eigen_count],
            stored_model_dirty: vec![true; eigen_count],
        })
    }

    pub fn eigen_index(&self, model: usize) -> usize {
        self.eigen_helper.offset_index(model)
    }

    pub fn matrix_index(&self, branch: usize) -> usize {
        self.matrix_helper.offset_index(branch)
    }

    pub fn reserve_buffer_index(&self) -> usize {
        self.reserve_buffer_index
    }

    pub fn available_buffer_count(&self) -> usize {
        self.available_buffers.len()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn mark_model_dirty(&mut self, model: usize) {
        self.model_dirty[model] = true;
    }

    pub fn mark_all_models_dirty(&mut self) {
        self.model_dirty.iter_mut().for_each(|d| *d = true);
    }

    pub fn has_dirty_models(&self) -> bool {
        self.model_dirty.iter().any(|&d| d)
    }

    /// Push the eigen systems of dirty models, each into a fresh slot.
    pub fn update_substitution_models<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        partition: usize,
        branch_model: &BranchModel,
        flip: bool,
    ) -> Result<()> {
        for (k, model) in branch_model.substitution_models().iter().enumerate() {
            if !self.model_dirty[k] {
                continue;
            }
            self.eigen_helper.prepare_write(k, flip);
            debug_assert!(self.eigen_helper.is_safe_update(k));
            backend.set_eigen_decomposition(
                partition,
                self.eigen_helper.offset_index(k),
                model.eigen_decomposition(),
            )?;
            self.model_dirty[k] = false;
        }
        Ok(())
    }

    /// Recompute the matrices of the given branches.
    ///
    /// Single-model branches are written directly. Multi-model branches are
    /// queued for convolution; when the pool cannot hold the next branch's
    /// segments, everything queued so far is computed and released first.
    pub fn update_transition_matrices<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        partition: usize,
        branch_model: &BranchModel,
        operations: &[BranchOperation],
        flip: bool,
    ) -> Result<()> {
        let mut probability_indices: Vec<Vec<usize>> = vec![Vec::new(); self.eigen_count];
        let mut edge_lengths: Vec<Vec<f64>> = vec![Vec::new(); self.eigen_count];
        let mut convolution_list: Vec<VecDeque<usize>> = Vec::new();

        for op in operations {
            let mapping = branch_model.mapping(op.node_height, op.parent_height);

            if let &[k] = mapping.order.as_slice() {
                self.matrix_helper.prepare_write(op.branch_number, flip);
                debug_assert!(self.matrix_helper.is_safe_update(op.branch_number));
                probability_indices[k].push(self.matrix_helper.offset_index(op.branch_number));
                edge_lengths[k].push(op.branch_length);
                continue;
            }

            let sum: f64 = mapping.weights.iter().sum();

            if self.available_buffers.len() < mapping.order.len() {
                debug!(
                    pending = convolution_list.len(),
                    available = self.available_buffers.len(),
                    "convolution pool exhausted, flushing"
                );
                self.compute_transition_matrices(backend, partition, &mut probability_indices, &mut edge_lengths)?;
                self.convolve_matrices(backend, partition, &mut convolution_list)?;
            }

            let mut buffers = VecDeque::with_capacity(mapping.order.len() + 1);
            for (&k, &weight) in mapping.order.iter().zip(&mapping.weights) {
                let buffer = self.available_buffers.pop().ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "branch {} spans {} epochs but the convolution pool holds {}",
                        op.branch_number,
                        mapping.order.len(),
                        self.pool_size
                    ))
                })?;
                let length = if sum > 0.0 {
                    weight * op.branch_length / sum
                } else {
                    0.0
                };
                probability_indices[k].push(buffer);
                edge_lengths[k].push(length);
                buffers.push_back(buffer);
            }
            self.matrix_helper.prepare_write(op.branch_number, flip);
            debug_assert!(self.matrix_helper.is_safe_update(op.branch_number));
            buffers.push_back(self.matrix_helper.offset_index(op.branch_number));
            convolution_list.push(buffers);
        }

        self.compute_transition_matrices(backend, partition, &mut probability_indices, &mut edge_lengths)?;
        self.convolve_matrices(backend, partition, &mut convolution_list)
    }

    /// Advance matrix slots without recomputing them.
    pub fn flip_transition_matrices(&mut self, branches: &[usize]) {
        for &branch in branches {
            self.matrix_helper.flip_offset(branch);
        }
    }

    pub fn store_state(&mut self) {
        self.eigen_helper.store_state();
        self.matrix_helper.store_state();
        self.stored_model_dirty.copy_from_slice(&self.model_dirty);
    }

    /// Return to the checkpointed eigen and matrix slots. A model uploaded
    /// since the store is clean again, since its restored slot holds the
    /// checkpointed decomposition.
    pub fn restore_state(&mut self) {
        self.eigen_helper.restore_state();
        self.matrix_helper.restore_state();
        self.model_dirty.copy_from_slice(&self.stored_model_dirty);
    }

    fn compute_transition_matrices<B: ComputeBackend>(
        &self,
        backend: &mut B,
        partition: usize,
        probability_indices: &mut [Vec<usize>],
        edge_lengths: &mut [Vec<f64>],
    ) -> Result<()> {
        for k in 0..self.eigen_count {
            if !probability_indices[k].is_empty() {
                backend.update_transition_matrices(
                    partition,
                    self.eigen_helper.offset_index(k),
                    &probability_indices[k],
                    &edge_lengths[k],
                )?;
            }
            probability_indices[k].clear();
            edge_lengths[k].clear();
        }
        Ok(())
    }

    /// Reduce every queued list `[segment.., destination]` to its product.
    ///
    /// Each pass multiplies the first two entries of every list. Lists with
    /// more than one product left take an intermediate buffer from the pool;
    /// if none is free, the products gathered so far in this pass are
    /// computed to release their inputs, and if nothing is gathered yet the
    /// reserve buffer takes the intermediate.
    fn convolve_matrices<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        partition: usize,
        convolution_list: &mut Vec<VecDeque<usize>>,
    ) -> Result<()> {
        while !convolution_list.is_empty() {
            let mut first = Vec::with_capacity(convolution_list.len());
            let mut second = Vec::with_capacity(convolution_list.len());
            let mut results = Vec::with_capacity(convolution_list.len());

            for convolve in convolution_list.iter_mut() {
                match convolve.len() {
                    0..=2 => {
                        return Err(Error::InvalidConfig(format!(
                            "convolution list of length {} has nothing to multiply",
                            convolve.len()
                        )))
                    }
                    3 => {
                        first.extend(convolve.pop_front());
                        second.extend(convolve.pop_front());
                        results.extend(convolve.pop_front());
                    }
                    _ => {
                        let (Some(a), Some(b)) = (convolve.pop_front(), convolve.pop_front()) else {
                            unreachable!("list has more than three entries");
                        };
                        loop {
                            if let Some(buffer) = self.available_buffers.pop() {
                                first.push(a);
                                second.push(b);
                                results.push(buffer);
                                convolve.push_front(buffer);
                                break;
                            }
                            if first.is_empty() {
                                let reserve = self.reserve_buffer_index;
                                self.convolve_and_release(backend, partition, &[a], &[b], &[reserve])?;
                                convolve.push_front(reserve);
                                break;
                            }
                            self.convolve_and_release(backend, partition, &first, &second, &results)?;
                            first.clear();
                            second.clear();
                            results.clear();
                        }
                    }
                }
            }

            self.convolve_and_release(backend, partition, &first, &second, &results)?;
            convolution_list.retain(|convolve| !convolve.is_empty());
        }
        Ok(())
    }

    fn convolve_and_release<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        partition: usize,
        first: &[usize],
        second: &[usize],
        results: &[usize],
    ) -> Result<()> {
        if first.is_empty() {
            return Ok(());
        }
        backend.convolve_transition_matrices(partition, first, second, results)?;

        for &buffer in first.iter().chain(second) {
            if self.is_pool_buffer(buffer) {
                self.available_buffers.push(buffer);
            }
        }
        Ok(())
    }

    fn is_pool_buffer(&self, buffer: usize) -> bool {
        buffer >= self.pool_start && buffer < self.reserve_buffer_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, CpuBackend, OperationReport, PartitionLayout};
    use crate::model::SubstitutionModel;
    use approx::assert_relative_eq;

    fn epoch_model(epochs: usize) -> BranchModel {
        let models = (0..epochs)
            .map(|i| SubstitutionModel::two_state(0.5 + i as f64, 1.0).unwrap())
            .collect();
        let times = (1..epochs).map(|i| i as f64).collect();
        BranchModel::epoch(models, times).unwrap()
    }

    fn backend_for(model: &BranchModel, node_count: usize, pool: usize) -> OperationReport<CpuBackend> {
        let mut backend = OperationReport::new(CpuBackend::new());
        backend
            .allocate(
                0,
                &PartitionLayout {
                    tip_count: 0,
                    partials_buffer_count: 0,
                    scale_buffer_count: 0,
                    matrix_buffer_count: EvolutionaryProcessDelegate::matrix_buffer_count(
                        model, node_count, pool,
                    ),
                    eigen_buffer_count: EvolutionaryProcessDelegate::eigen_buffer_count(model),
                    state_count: 2,
                    pattern_count: 1,
                    category_count: 1,
                },
            )
            .unwrap();
        backend
    }

    fn op(branch: usize, node_height: f64, parent_height: f64) -> BranchOperation {
        BranchOperation {
            branch_number: branch,
            branch_length: parent_height - node_height,
            node_height,
            parent_height,
        }
    }

    fn product(model: &BranchModel, segments: &[(usize, f64)]) -> ndarray::Array2<f64> {
        let models = model.substitution_models();
        segments
            .iter()
            .map(|&(k, t)| models[k].transition_matrix(t))
            .reduce(|acc, m| acc.dot(&m))
            .unwrap()
    }

    #[test]
    fn test_two_epoch_branch_is_product() {
        let model = epoch_model(2);
        let mut backend = backend_for(&model, 3, 10);
        let mut delegate = EvolutionaryProcessDelegate::new(&model, 3, 10, 0).unwrap();
        delegate
            .update_substitution_models(&mut backend, 0, &model, true)
            .unwrap();
        delegate
            .update_transition_matrices(&mut backend, 0, &model, &[op(0, 0.25, 1.75)], true)
            .unwrap();

        let slot = delegate.matrix_index(0);
        let computed = &backend.inner().transition_matrices(0, slot).unwrap()[0];
        let expected = product(&model, &[(1, 0.75), (0, 0.75)]);
        for (x, y) in computed.iter().zip(expected.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
        assert_eq!(delegate.available_buffer_count(), 10);
    }

    #[test]
    fn test_pool_exhaustion_flushes_and_matches() {
        // Four epochs, pool of four: every branch needs the whole pool.
        let model = epoch_model(4);
        let mut backend = backend_for(&model, 4, 4);
        let mut delegate = EvolutionaryProcessDelegate::new(&model, 4, 4, 0).unwrap();
        delegate
            .update_substitution_models(&mut backend, 0, &model, true)
            .unwrap();
        let ops = [op(0, 0.5, 3.5), op(1, 0.5, 3.5), op(2, 0.0, 3.0)];
        delegate
            .update_transition_matrices(&mut backend, 0, &model, &ops, true)
            .unwrap();

        let expected_long = product(&model, &[(3, 0.5), (2, 1.0), (1, 1.0), (0, 0.5)]);
        let expected_short = product(&model, &[(2, 1.0), (1, 1.0), (0, 1.0)]);
        for (branch, expected) in [(0, &expected_long), (1, &expected_long), (2, &expected_short)] {
            let slot = delegate.matrix_index(branch);
            let computed = &backend.inner().transition_matrices(0, slot).unwrap()[0];
            for (x, y) in computed.iter().zip(expected.iter()) {
                assert_relative_eq!(*x, *y, epsilon = 1e-12);
            }
        }

        assert_eq!(delegate.available_buffer_count(), 4);
        let reserve = delegate.reserve_buffer_index();
        assert!(backend.count(|c| matches!(
            c,
            BackendCall::ConvolveTransitionMatrices { results, .. } if results.contains(&reserve)
        )) > 0);
    }

    #[test]
    fn test_homogeneous_model_writes_directly() {
        let model = BranchModel::homogeneous(SubstitutionModel::two_state(1.0, 1.0).unwrap());
        let mut backend = backend_for(&model, 3, 100);
        let mut delegate = EvolutionaryProcessDelegate::new(&model, 3, 100, 0).unwrap();
        assert_eq!(delegate.pool_size(), 0);
        delegate
            .update_substitution_models(&mut backend, 0, &model, true)
            .unwrap();
        delegate
            .update_transition_matrices(&mut backend, 0, &model, &[op(0, 0.0, 0.5), op(1, 0.0, 0.5)], true)
            .unwrap();

        assert_eq!(
            backend.updated_matrices(),
            vec![delegate.matrix_index(0), delegate.matrix_index(1)]
        );
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::ConvolveTransitionMatrices { .. })),
            0
        );
    }

    #[test]
    fn test_clean_models_are_not_reuploaded() {
        let model = BranchModel::homogeneous(SubstitutionModel::jukes_cantor(2).unwrap());
        let mut backend = backend_for(&model, 3, 100);
        let mut delegate = EvolutionaryProcessDelegate::new(&model, 3, 100, 0).unwrap();
        delegate.update_substitution_models(&mut backend, 0, &model, true).unwrap();
        delegate.update_substitution_models(&mut backend, 0, &model, true).unwrap();
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::SetEigenDecomposition { .. })),
            1
        );

        delegate.mark_model_dirty(0);
        delegate.update_substitution_models(&mut backend, 0, &model, true).unwrap();
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::SetEigenDecomposition { .. })),
            2
        );
    }

    #[test]
    fn test_store_restore_matrix_slots() {
        let model = BranchModel::homogeneous(SubstitutionModel::jukes_cantor(2).unwrap());
        let mut delegate = EvolutionaryProcessDelegate::new(&model, 3, 100, 0).unwrap();
        delegate.store_state();
        let before = delegate.matrix_index(1);
        delegate.flip_transition_matrices(&[1]);
        assert_ne!(delegate.matrix_index(1), before);
        delegate.restore_state();
        assert_eq!(delegate.matrix_index(1), before);
    }

    #[test]
    fn test_restore_returns_uploaded_model_to_checkpoint_slot() {
        let model = BranchModel::homogeneous(SubstitutionModel::jukes_cantor(2).unwrap());
        let mut backend = backend_for(&model, 3, 100);
        let mut delegate = EvolutionaryProcessDelegate::new(&model, 3, 100, 0).unwrap();
        delegate.update_substitution_models(&mut backend, 0, &model, true).unwrap();
        delegate.store_state();
        let checkpoint = delegate.eigen_index(0);

        delegate.mark_model_dirty(0);
        delegate.update_substitution_models(&mut backend, 0, &model, true).unwrap();
        assert_ne!(delegate.eigen_index(0), checkpoint);
        assert!(!delegate.has_dirty_models());

        delegate.restore_state();
        assert_eq!(delegate.eigen_index(0), checkpoint);
        assert!(!delegate.has_dirty_models());

        // A change made but never uploaded is dropped as well.
        delegate.mark_model_dirty(0);
        delegate.restore_state();
        assert!(!delegate.has_dirty_models());
    }

    #[test]
    fn test_contexts_use_disjoint_regions() {
        let model = epoch_model(2);
        let a = EvolutionaryProcessDelegate::new(&model, 3, 5, 0).unwrap();
        let b = EvolutionaryProcessDelegate::new(&model, 3, 5, 1).unwrap();
        let per_context = EvolutionaryProcessDelegate::matrix_buffer_count(&model, 3, 5);
        assert_eq!(per_context, 12);
        assert_eq!(b.matrix_index(0), a.matrix_index(0) + per_context);
        assert_eq!(b.reserve_buffer_index(), a.reserve_buffer_index() + per_context);
        assert_ne!(a.eigen_index(0), b.eigen_index(0));
    }

    #[test]
    fn test_pool_smaller_than_model_count_rejected() {
        let model = epoch_model(3);
        assert!(EvolutionaryProcessDelegate::new(&model, 3, 2, 0).is_err());
    }
}
