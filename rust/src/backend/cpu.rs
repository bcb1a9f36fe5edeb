//! Reference CPU kernel.
//!
//! Partials are stored `category × pattern × state`. Scale factors are kept
//! as natural logs per pattern; rescaling divides each pattern by its largest
//! entry across categories and states. Work inside one operation is split
//! over category/pattern rows with Rayon.

use ndarray::Array2;
use rayon::prelude::*;

use super::{
    BackendResult, ComputeBackend, PartialsOperation, PartitionLayout, RootLogLikelihoods,
    RootRequest,
};
use crate::error::BackendError;
use crate::model::EigenDecomposition;

#[derive(Debug, Clone)]
struct PartitionStore {
    id: usize,
    layout: PartitionLayout,
    tip_states: Vec<Option<Vec<u32>>>,
    partials: Vec<Option<Vec<f64>>>,
    scale_factors: Vec<Vec<f64>>,
    matrices: Vec<Option<Vec<Array2<f64>>>>,
    eigen: Vec<Option<EigenDecomposition>>,
    pattern_weights: Vec<f64>,
    state_frequencies: Vec<f64>,
    category_rates: Vec<f64>,
    category_weights: Vec<f64>,
}

enum Child<'a> {
    States(&'a [u32]),
    Partials(&'a [f64]),
}

impl PartitionStore {
    fn new(id: usize, layout: PartitionLayout) -> Self {
        let categories = layout.category_count;
        Self {
            id,
            layout,
            tip_states: vec![None; layout.tip_count],
            partials: vec![None; layout.partials_buffer_count],
            scale_factors: vec![vec![0.0; layout.pattern_count]; layout.scale_buffer_count],
            matrices: vec![None; layout.matrix_buffer_count],
            eigen: vec![None; layout.eigen_buffer_count],
            pattern_weights: vec![1.0; layout.pattern_count],
            state_frequencies: vec![1.0 / layout.state_count as f64; layout.state_count],
            category_rates: vec![1.0; categories],
            category_weights: vec![1.0 / categories as f64; categories],
        }
    }

    fn check(&self, kind: &'static str, index: usize, capacity: usize) -> BackendResult<()> {
        if index >= capacity {
            return Err(BackendError::BufferOutOfRange {
                kind,
                partition: self.id,
                index,
                capacity,
            });
        }
        Ok(())
    }

    fn expect_len(what: &'static str, expected: usize, actual: usize) -> BackendResult<()> {
        if expected != actual {
            return Err(BackendError::DimensionMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn child(&self, buffer: usize) -> BackendResult<Child<'_>> {
        if buffer < self.tip_states.len() {
            if let Some(states) = &self.tip_states[buffer] {
                return Ok(Child::States(states));
            }
        }
        self.check("partials", buffer, self.partials.len())?;
        self.partials[buffer]
            .as_deref()
            .map(Child::Partials)
            .ok_or(BackendError::UninitializedBuffer {
                kind: "partials",
                partition: self.id,
                index: buffer,
            })
    }

    fn matrix(&self, index: usize) -> BackendResult<&[Array2<f64>]> {
        self.check("matrix", index, self.matrices.len())?;
        self.matrices[index]
            .as_deref()
            .ok_or(BackendError::UninitializedBuffer {
                kind: "matrix",
                partition: self.id,
                index,
            })
    }

    fn update_partials(&mut self, op: &PartialsOperation) -> BackendResult<()> {
        let states = self.layout.state_count;
        let patterns = self.layout.pattern_count;
        let categories = self.layout.category_count;
        self.check("partials", op.destination, self.partials.len())?;

        let mut destination = vec![0.0; categories * patterns * states];
        {
            let child1 = self.child(op.child1)?;
            let child2 = self.child(op.child2)?;
            let matrices1 = self.matrix(op.matrix1)?;
            let matrices2 = self.matrix(op.matrix2)?;

            destination
                .par_chunks_mut(states)
                .enumerate()
                .for_each(|(row, out)| {
                    let category = row / patterns;
                    let pattern = row % patterns;
                    let offset = row * states;
                    let m1 = &matrices1[category];
                    let m2 = &matrices2[category];
                    for (state, value) in out.iter_mut().enumerate() {
                        let left = contribution(&child1, m1, state, pattern, offset, states);
                        let right = contribution(&child2, m2, state, pattern, offset, states);
                        *value = left * right;
                    }
                });
        }

        if let Some(write) = op.write_scale {
            self.check("scale", write, self.scale_factors.len())?;
            let factors = &mut self.scale_factors[write];
            for pattern in 0..patterns {
                let max = (0..categories)
                    .flat_map(|c| {
                        let start = (c * patterns + pattern) * states;
                        destination[start..start + states].iter().copied()
                    })
                    .fold(0.0f64, f64::max);
                if max > 0.0 {
                    for c in 0..categories {
                        let start = (c * patterns + pattern) * states;
                        destination[start..start + states]
                            .iter_mut()
                            .for_each(|v| *v /= max);
                    }
                    factors[pattern] = max.ln();
                } else {
                    factors[pattern] = 0.0;
                }
            }
        } else if let Some(read) = op.read_scale {
            self.check("scale", read, self.scale_factors.len())?;
            let factors = &self.scale_factors[read];
            for c in 0..categories {
                for pattern in 0..patterns {
                    let divisor = factors[pattern].exp();
                    let start = (c * patterns + pattern) * states;
                    destination[start..start + states]
                        .iter_mut()
                        .for_each(|v| *v /= divisor);
                }
            }
        }

        self.partials[op.destination] = Some(destination);
        Ok(())
    }

    fn root_log_likelihood(&self, buffer: usize, cumulative: Option<usize>) -> BackendResult<f64> {
        let states = self.layout.state_count;
        let patterns = self.layout.pattern_count;
        let partials = match self.child(buffer)? {
            Child::Partials(partials) => partials,
            Child::States(_) => {
                return Err(BackendError::UninitializedBuffer {
                    kind: "partials",
                    partition: self.id,
                    index: buffer,
                })
            }
        };
        let scale = match cumulative {
            Some(index) => {
                self.check("scale", index, self.scale_factors.len())?;
                Some(&self.scale_factors[index])
            }
            None => None,
        };

        let mut total = 0.0;
        for pattern in 0..patterns {
            let weight = self.pattern_weights[pattern];
            if weight == 0.0 {
                continue;
            }
            let site: f64 = self
                .category_weights
                .iter()
                .enumerate()
                .map(|(c, w)| {
                    let start = (c * patterns + pattern) * states;
                    let inner: f64 = partials[start..start + states]
                        .iter()
                        .zip(&self.state_frequencies)
                        .map(|(p, f)| p * f)
                        .sum();
                    w * inner
                })
                .sum();
            let mut log_site = site.ln();
            if let Some(factors) = scale {
                log_site += factors[pattern];
            }
            total += weight * log_site;
        }
        Ok(total)
    }
}

fn contribution(
    child: &Child<'_>,
    matrix: &Array2<f64>,
    state: usize,
    pattern: usize,
    offset: usize,
    states: usize,
) -> f64 {
    match child {
        Child::States(codes) => {
            let code = codes[pattern] as usize;
            if code < states {
                matrix[[state, code]]
            } else {
                1.0
            }
        }
        Child::Partials(partials) => {
            let row = &partials[offset..offset + states];
            (0..states).map(|j| matrix[[state, j]] * row[j]).sum()
        }
    }
}

/// In-process reference backend.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    partitions: Vec<Option<PartitionStore>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, partition: usize) -> BackendResult<&PartitionStore> {
        self.partitions
            .get(partition)
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnallocatedPartition(partition))
    }

    fn store_mut(&mut self, partition: usize) -> BackendResult<&mut PartitionStore> {
        self.partitions
            .get_mut(partition)
            .and_then(Option::as_mut)
            .ok_or(BackendError::UnallocatedPartition(partition))
    }

    /// Contents of a partials buffer, for inspection in tests and tools.
    pub fn partials(&self, partition: usize, buffer: usize) -> Option<&[f64]> {
        self.store(partition)
            .ok()
            .and_then(|s| s.partials.get(buffer))
            .and_then(|p| p.as_deref())
    }

    /// Transition matrices (one per category) held in a matrix buffer.
    pub fn transition_matrices(&self, partition: usize, buffer: usize) -> Option<&[Array2<f64>]> {
        self.store(partition)
            .ok()
            .and_then(|s| s.matrices.get(buffer))
            .and_then(|m| m.as_deref())
    }

    pub fn scale_factors(&self, partition: usize, buffer: usize) -> Option<&[f64]> {
        self.store(partition)
            .ok()
            .and_then(|s| s.scale_factors.get(buffer))
            .map(Vec::as_slice)
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn allocate(&mut self, partition: usize, layout: &PartitionLayout) -> BackendResult<()> {
        for (what, value) in [
            ("state count", layout.state_count),
            ("pattern count", layout.pattern_count),
            ("category count", layout.category_count),
        ] {
            if value == 0 {
                return Err(BackendError::DimensionMismatch {
                    what,
                    expected: 1,
                    actual: 0,
                });
            }
        }
        if self.partitions.len() <= partition {
            self.partitions.resize_with(partition + 1, || None);
        }
        self.partitions[partition] = Some(PartitionStore::new(partition, *layout));
        Ok(())
    }

    fn set_tip_states(&mut self, partition: usize, tip: usize, states: &[u32]) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        store.check("tip", tip, store.tip_states.len())?;
        PartitionStore::expect_len("tip states", store.layout.pattern_count, states.len())?;
        store.tip_states[tip] = Some(states.to_vec());
        Ok(())
    }

    fn set_tip_partials(&mut self, partition: usize, tip: usize, partials: &[f64]) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        store.check("tip", tip, store.layout.tip_count)?;
        let per_category = store.layout.pattern_count * store.layout.state_count;
        PartitionStore::expect_len("tip partials", per_category, partials.len())?;
        let mut replicated = Vec::with_capacity(per_category * store.layout.category_count);
        for _ in 0..store.layout.category_count {
            replicated.extend_from_slice(partials);
        }
        store.tip_states[tip] = None;
        store.partials[tip] = Some(replicated);
        Ok(())
    }

    fn set_pattern_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        PartitionStore::expect_len("pattern weights", store.layout.pattern_count, weights.len())?;
        store.pattern_weights = weights.to_vec();
        Ok(())
    }

    fn set_state_frequencies(&mut self, partition: usize, frequencies: &[f64]) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        PartitionStore::expect_len("state frequencies", store.layout.state_count, frequencies.len())?;
        store.state_frequencies = frequencies.to_vec();
        Ok(())
    }

    fn set_category_rates(&mut self, partition: usize, rates: &[f64]) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        PartitionStore::expect_len("category rates", store.layout.category_count, rates.len())?;
        store.category_rates = rates.to_vec();
        Ok(())
    }

    fn set_category_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        PartitionStore::expect_len("category weights", store.layout.category_count, weights.len())?;
        store.category_weights = weights.to_vec();
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        partition: usize,
        buffer: usize,
        eigen: &EigenDecomposition,
    ) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        store.check("eigen", buffer, store.eigen.len())?;
        PartitionStore::expect_len("eigen system states", store.layout.state_count, eigen.state_count())?;
        store.eigen[buffer] = Some(eigen.clone());
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        partition: usize,
        eigen_buffer: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        PartitionStore::expect_len("branch lengths", matrices.len(), branch_lengths.len())?;
        store.check("eigen", eigen_buffer, store.eigen.len())?;
        for &index in matrices {
            store.check("matrix", index, store.matrices.len())?;
        }
        let eigen = store.eigen[eigen_buffer]
            .as_ref()
            .ok_or(BackendError::UninitializedBuffer {
                kind: "eigen",
                partition,
                index: eigen_buffer,
            })?;

        let rates = &store.category_rates;
        let computed: Vec<Vec<Array2<f64>>> = branch_lengths
            .par_iter()
            .map(|&length| {
                rates
                    .iter()
                    .map(|&rate| eigen.transition_matrix(rate * length))
                    .collect()
            })
            .collect();

        for (&index, matrices) in matrices.iter().zip(computed) {
            store.matrices[index] = Some(matrices);
        }
        Ok(())
    }

    fn convolve_transition_matrices(
        &mut self,
        partition: usize,
        first: &[usize],
        second: &[usize],
        results: &[usize],
    ) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        PartitionStore::expect_len("convolution inputs", first.len(), second.len())?;
        PartitionStore::expect_len("convolution results", first.len(), results.len())?;

        for ((&a, &b), &result) in first.iter().zip(second).zip(results) {
            store.check("matrix", result, store.matrices.len())?;
            let product: Vec<Array2<f64>> = store
                .matrix(a)?
                .iter()
                .zip(store.matrix(b)?)
                .map(|(x, y)| x.dot(y))
                .collect();
            store.matrices[result] = Some(product);
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> BackendResult<()> {
        for op in operations {
            self.store_mut(op.partition)?.update_partials(op)?;
        }
        Ok(())
    }

    fn reset_scale_factors(&mut self, partition: usize, cumulative: usize) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        store.check("scale", cumulative, store.scale_factors.len())?;
        store.scale_factors[cumulative].iter_mut().for_each(|f| *f = 0.0);
        Ok(())
    }

    fn accumulate_scale_factors(
        &mut self,
        partition: usize,
        scale_buffers: &[usize],
        cumulative: usize,
    ) -> BackendResult<()> {
        let store = self.store_mut(partition)?;
        store.check("scale", cumulative, store.scale_factors.len())?;
        let mut sum = std::mem::take(&mut store.scale_factors[cumulative]);
        for &index in scale_buffers {
            if let Err(err) = store.check("scale", index, store.scale_factors.len()) {
                store.scale_factors[cumulative] = sum;
                return Err(err);
            }
            if index == cumulative {
                continue;
            }
            for (total, factor) in sum.iter_mut().zip(&store.scale_factors[index]) {
                *total += factor;
            }
        }
        store.scale_factors[cumulative] = sum;
        Ok(())
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        requests: &[RootRequest],
    ) -> BackendResult<RootLogLikelihoods> {
        let per_partition = requests
            .iter()
            .map(|request| {
                self.store(request.partition)?
                    .root_log_likelihood(request.buffer, request.cumulative_scale)
            })
            .collect::<BackendResult<Vec<f64>>>()?;
        let total = per_partition.iter().sum();
        Ok(RootLogLikelihoods {
            per_partition,
            total,
        })
    }
}
