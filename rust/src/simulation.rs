//! Sequence simulation down a tree.
//!
//! Each site draws a rate category, a root state from the model's
//! stationary frequencies, and then a state for every node from the
//! transition matrix of the branch above it. Used to build test data.

use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::Result;
use crate::model::{SiteRateModel, SubstitutionModel};
use crate::patterns::Patterns;
use crate::tree::Tree;

#[derive(Debug, Clone)]
pub struct SequenceSimulator {
    tree: Tree,
    model: SubstitutionModel,
    site_model: SiteRateModel,
}

impl SequenceSimulator {
    pub fn new(tree: Tree, model: SubstitutionModel, site_model: SiteRateModel) -> Self {
        Self {
            tree,
            model,
            site_model,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Simulate `site_count` alignment columns and compress them.
    pub fn simulate(&self, site_count: usize, rng: &mut StdRng) -> Result<Patterns> {
        let matrices = self.branch_matrices()?;
        let node_count = self.tree.node_count();
        let tip_count = self.tree.tip_count();

        // Parents before children.
        let mut pre_order = self.tree.post_order();
        pre_order.reverse();

        let mut sequences = vec![Vec::with_capacity(site_count); tip_count];
        let mut states = vec![0usize; node_count];
        for _ in 0..site_count {
            let category = sample_index(ArrayView1::from(self.site_model.category_weights()), rng);
            for &node in &pre_order {
                states[node] = match self.tree.parent(node) {
                    None => sample_index(ArrayView1::from(self.model.frequencies()), rng),
                    Some(parent) => sample_index(matrices[category][node].row(states[parent]), rng),
                };
            }
            for (tip, sequence) in sequences.iter_mut().enumerate() {
                sequence.push(states[tip] as u32);
            }
        }

        Patterns::from_alignment(
            self.model.state_count(),
            self.tree.taxon_names().to_vec(),
            sequences,
        )
    }

    /// `matrices[category][node]` for the branch above `node`; the root's
    /// entry is unused.
    fn branch_matrices(&self) -> Result<Vec<Vec<Array2<f64>>>> {
        let root = self.tree.root();
        self.site_model
            .category_rates()
            .iter()
            .map(|&rate| {
                (0..self.tree.node_count())
                    .map(|node| {
                        let length = if node == root {
                            0.0
                        } else {
                            self.tree.branch_length(node)?
                        };
                        Ok(self.model.transition_matrix(rate * length))
                    })
                    .collect()
            })
            .collect()
    }
}

/// Simulate `n_replicates` independent data sets in parallel.
///
/// Replicate `i` is seeded with `seed + i`, so results do not depend on
/// thread scheduling.
pub fn simulate_replicates_parallel(
    simulator: &SequenceSimulator,
    site_count: usize,
    n_replicates: usize,
    seed: u64,
) -> Result<Vec<Patterns>> {
    (0..n_replicates)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            simulator.simulate(site_count, &mut rng)
        })
        .collect()
}

fn sample_index(weights: ArrayView1<f64>, rng: &mut StdRng) -> usize {
    let total = weights.sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        if u < w {
            return i;
        }
        u -= w;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator() -> SequenceSimulator {
        SequenceSimulator::new(
            Tree::from_newick("((A:0.1,B:0.2):0.1,(C:0.3,D:0.05):0.15);").unwrap(),
            SubstitutionModel::jukes_cantor(4).unwrap(),
            SiteRateModel::with_rates(vec![0.5, 1.5]).unwrap(),
        )
    }

    #[test]
    fn test_same_seed_same_data() {
        let sim = simulator();
        let a = sim.simulate(200, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = sim.simulate(200, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.site_count(), 200.0);
        assert_eq!(a.taxon_count(), 4);
    }

    #[test]
    fn test_parallel_replicates_match_sequential() {
        let sim = simulator();
        let replicates = simulate_replicates_parallel(&sim, 50, 4, 11).unwrap();
        assert_eq!(replicates.len(), 4);
        for (i, patterns) in replicates.iter().enumerate() {
            let mut rng = StdRng::seed_from_u64(11 + i as u64);
            assert_eq!(patterns, &sim.simulate(50, &mut rng).unwrap());
        }
        assert_ne!(replicates[0], replicates[1]);
    }

    #[test]
    fn test_zero_length_tree_gives_constant_columns() {
        let sim = SequenceSimulator::new(
            Tree::from_newick("(A:0,B:0);").unwrap(),
            SubstitutionModel::jukes_cantor(4).unwrap(),
            SiteRateModel::uniform(),
        );
        let patterns = sim.simulate(100, &mut StdRng::seed_from_u64(3)).unwrap();
        let a = patterns.taxon_index("A").unwrap();
        let b = patterns.taxon_index("B").unwrap();
        assert_eq!(patterns.tip_states(a), patterns.tip_states(b));
        assert!(patterns.pattern_count() <= 4);
    }

    #[test]
    fn test_stationary_frequencies_recovered() {
        let sim = simulator();
        let patterns = sim.simulate(4000, &mut StdRng::seed_from_u64(5)).unwrap();
        for f in patterns.empirical_frequencies() {
            assert!((f - 0.25).abs() < 0.03, "frequency {} far from 0.25", f);
        }
    }
}
