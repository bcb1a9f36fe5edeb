#![allow(dead_code)]

use ndarray::Array2;
use phylo_engine::backend::{
    BackendResult, ComputeBackend, CpuBackend, OperationReport, PartialsOperation, PartitionLayout,
    RootLogLikelihoods, RootRequest,
};
use phylo_engine::model::EigenDecomposition;
use phylo_engine::prelude::*;

/// Replacement rule for root values: `(root call index, partition)` to an
/// optional value that overrides what the kernel computed.
pub type RootScript = Box<dyn FnMut(usize, usize) -> Option<f64>>;

/// CPU backend whose root reductions can be overridden, with every call
/// recorded.
pub struct ScriptedBackend {
    inner: OperationReport<CpuBackend>,
    script: RootScript,
    root_calls: usize,
    root_requests: Vec<Vec<RootRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: impl FnMut(usize, usize) -> Option<f64> + 'static) -> Self {
        Self {
            inner: OperationReport::new(CpuBackend::new()),
            script: Box::new(script),
            root_calls: 0,
            root_requests: Vec::new(),
        }
    }

    /// Computes honestly.
    pub fn honest() -> Self {
        Self::new(|_, _| None)
    }

    /// The first `count` root calls report `value` for every partition.
    pub fn failing_first(count: usize, value: f64) -> Self {
        Self::new(move |call, _| (call < count).then_some(value))
    }

    pub fn always(value: f64) -> Self {
        Self::new(move |_, _| Some(value))
    }

    pub fn root_calls(&self) -> usize {
        self.root_calls
    }

    /// Requests of every root call, in order.
    pub fn root_requests(&self) -> &[Vec<RootRequest>] {
        &self.root_requests
    }

    pub fn report(&self) -> &OperationReport<CpuBackend> {
        &self.inner
    }

    pub fn report_mut(&mut self) -> &mut OperationReport<CpuBackend> {
        &mut self.inner
    }
}

impl ComputeBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn allocate(&mut self, partition: usize, layout: &PartitionLayout) -> BackendResult<()> {
        self.inner.allocate(partition, layout)
    }

    fn set_tip_states(&mut self, partition: usize, tip: usize, states: &[u32]) -> BackendResult<()> {
        self.inner.set_tip_states(partition, tip, states)
    }

    fn set_tip_partials(&mut self, partition: usize, tip: usize, partials: &[f64]) -> BackendResult<()> {
        self.inner.set_tip_partials(partition, tip, partials)
    }

    fn set_pattern_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()> {
        self.inner.set_pattern_weights(partition, weights)
    }

    fn set_state_frequencies(&mut self, partition: usize, frequencies: &[f64]) -> BackendResult<()> {
        self.inner.set_state_frequencies(partition, frequencies)
    }

    fn set_category_rates(&mut self, partition: usize, rates: &[f64]) -> BackendResult<()> {
        self.inner.set_category_rates(partition, rates)
    }

    fn set_category_weights(&mut self, partition: usize, weights: &[f64]) -> BackendResult<()> {
        self.inner.set_category_weights(partition, weights)
    }

    fn set_eigen_decomposition(
        &mut self,
        partition: usize,
        buffer: usize,
        eigen: &EigenDecomposition,
    ) -> BackendResult<()> {
        self.inner.set_eigen_decomposition(partition, buffer, eigen)
    }

    fn update_transition_matrices(
        &mut self,
        partition: usize,
        eigen_buffer: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> BackendResult<()> {
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
        self.inner
            .convolve_transition_matrices(partition, first, second, results)
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> BackendResult<()> {
        self.inner.update_partials(operations)
    }

    fn reset_scale_factors(&mut self, partition: usize, cumulative: usize) -> BackendResult<()> {
        self.inner.reset_scale_factors(partition, cumulative)
    }

    fn accumulate_scale_factors(
        &mut self,
        partition: usize,
        scale_buffers: &[usize],
        cumulative: usize,
    ) -> BackendResult<()> {
        self.inner
            .accumulate_scale_factors(partition, scale_buffers, cumulative)
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        requests: &[RootRequest],
    ) -> BackendResult<RootLogLikelihoods> {
        let computed = self.inner.calculate_root_log_likelihoods(requests)?;
        let call = self.root_calls;
        self.root_calls += 1;
        self.root_requests.push(requests.to_vec());

        let per_partition: Vec<f64> = requests
            .iter()
            .zip(&computed.per_partition)
            .map(|(request, &value)| (self.script)(call, request.partition).unwrap_or(value))
            .collect();
        let total = per_partition.iter().sum();
        Ok(RootLogLikelihoods {
            per_partition,
            total,
        })
    }
}

pub const THREE_TAXON: &str = "((A:0.1,B:0.1):0.1,C:0.2);";

pub fn three_taxon() -> (Tree, Patterns) {
    let tree = Tree::from_newick(THREE_TAXON).unwrap();
    let patterns = Patterns::from_nucleotides(&[
        ("A", "ACGTTAGCCA"),
        ("B", "ACGTCAGCTA"),
        ("C", "ACCTTGGCTA"),
    ])
    .unwrap();
    (tree, patterns)
}

/// Ladder-shaped tree with `tips` taxa `t0..`, every branch `length` long.
pub fn caterpillar(tips: usize, length: f64) -> Tree {
    let mut newick = format!("t0:{}", length);
    for i in 1..tips - 1 {
        newick = format!("({},t{}:{}):{}", newick, i, length, length);
    }
    newick = format!("({},t{}:{});", newick, tips - 1, length);
    Tree::from_newick(&newick).unwrap()
}

/// Alternating distinct nucleotides across `sites` columns for every tip.
pub fn ladder_patterns(tree: &Tree, sites: usize) -> Patterns {
    let bases = ['A', 'C', 'G', 'T'];
    let rows: Vec<(String, String)> = (0..tree.tip_count())
        .map(|tip| {
            let sequence = (0..sites).map(|site| bases[(tip * 7 + site * 3) % 4]).collect();
            (tree.taxon_name(tip).to_string(), sequence)
        })
        .collect();
    let borrowed: Vec<(&str, &str)> = rows.iter().map(|(n, s)| (n.as_str(), s.as_str())).collect();
    Patterns::from_nucleotides(&borrowed).unwrap()
}

pub fn jukes_cantor() -> BranchModel {
    BranchModel::homogeneous(SubstitutionModel::jukes_cantor(4).unwrap())
}

pub fn likelihood<B: ComputeBackend>(
    tree: &Tree,
    patterns: &Patterns,
    branch_model: BranchModel,
    backend: B,
    config: &LikelihoodConfig,
) -> TreeDataLikelihood<DataLikelihoodDelegate<B>> {
    let delegate = DataLikelihoodDelegate::new(
        tree,
        patterns,
        branch_model,
        SiteRateModel::uniform(),
        backend,
        config,
    )
    .unwrap();
    TreeDataLikelihood::new(tree.clone(), delegate, config).unwrap()
}

/// Direct pruning without scaling or buffering; `matrix(category, node)`
/// gives the transition matrix of the branch above `node`.
pub fn reference_with(
    tree: &Tree,
    patterns: &Patterns,
    frequencies: &[f64],
    category_weights: &[f64],
    matrix: impl Fn(usize, usize) -> Array2<f64>,
) -> f64 {
    let n = frequencies.len();
    let mut total = 0.0;
    for pattern in 0..patterns.pattern_count() {
        let mut site = 0.0;
        for (category, &weight) in category_weights.iter().enumerate() {
            let mut partials = vec![vec![0.0; n]; tree.node_count()];
            for node in tree.post_order() {
                if tree.is_external(node) {
                    let taxon = patterns.taxon_index(tree.taxon_name(node)).unwrap();
                    let state = patterns.tip_states(taxon)[pattern] as usize;
                    for (i, p) in partials[node].iter_mut().enumerate() {
                        *p = if state >= n || state == i { 1.0 } else { 0.0 };
                    }
                    continue;
                }
                let mut value = vec![1.0; n];
                for &child in tree.children(node) {
                    let m = matrix(category, child);
                    for (i, v) in value.iter_mut().enumerate() {
                        *v *= (0..n).map(|j| m[[i, j]] * partials[child][j]).sum::<f64>();
                    }
                }
                partials[node] = value;
            }
            let root = &partials[tree.root()];
            site += weight * (0..n).map(|i| frequencies[i] * root[i]).sum::<f64>();
        }
        total += patterns.weights()[pattern] * site.ln();
    }
    total
}

pub fn reference_log_likelihood(
    tree: &Tree,
    patterns: &Patterns,
    model: &SubstitutionModel,
    site_model: &SiteRateModel,
) -> f64 {
    let rates = site_model.category_rates();
    reference_with(
        tree,
        patterns,
        model.frequencies(),
        site_model.category_weights(),
        |category, node| model.transition_matrix(rates[category] * tree.branch_length(node).unwrap()),
    )
}

pub fn assert_close(actual: f64, expected: f64) {
    approx::assert_relative_eq!(actual, expected, max_relative = 1e-9);
}

/// Test logger; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
