mod common;

use common::*;
use phylo_engine::backend::BackendCall;
use phylo_engine::prelude::*;

const DATA: [[(&str, &str); 3]; 3] = [
    [("A", "ACGTTAGCCA"), ("B", "ACGTCAGCTA"), ("C", "ACCTTGGCTA")],
    [("A", "GGGTTTCCAA"), ("B", "GGGTTACCAA"), ("C", "GAGTTTCCTA")],
    [("A", "TTAACCGGTT"), ("B", "TTAACCGGTA"), ("C", "TCAACGGGTT")],
];

fn site_models() -> Vec<SiteRateModel> {
    vec![
        SiteRateModel::uniform(),
        SiteRateModel::with_rates(vec![0.5, 1.5]).unwrap(),
        SiteRateModel::with_rates(vec![0.3, 1.7]).unwrap(),
    ]
}

fn branch_models() -> Vec<BranchModel> {
    let jc = SubstitutionModel::jukes_cantor(4).unwrap();
    vec![
        BranchModel::homogeneous(jc.clone()),
        BranchModel::epoch(vec![jc.clone(), jc], vec![0.15]).unwrap(),
    ]
}

fn patterns(p: usize) -> Patterns {
    Patterns::from_nucleotides(&DATA[p]).unwrap()
}

fn multi<B: ComputeBackend>(backend: B) -> TreeDataLikelihood<MultiPartitionDelegate<B>> {
    let tree = Tree::from_newick(THREE_TAXON).unwrap();
    let specs = (0..3)
        .map(|p| PartitionSpec {
            patterns: patterns(p),
            branch_model: p / 2,
            site_model: p,
        })
        .collect();
    let config = LikelihoodConfig::default();
    let delegate =
        MultiPartitionDelegate::new(&tree, specs, branch_models(), site_models(), backend, &config).unwrap();
    TreeDataLikelihood::new(tree, delegate, &config).unwrap()
}

fn partition_reference(tree: &Tree, p: usize, site_model: &SiteRateModel) -> f64 {
    reference_log_likelihood(
        tree,
        &patterns(p),
        &SubstitutionModel::jukes_cantor(4).unwrap(),
        site_model,
    )
}

#[test]
fn test_total_matches_single_partition_delegates() {
    init_tracing();
    let mut lik = multi(CpuBackend::new());
    let total = lik.evaluate().unwrap();

    let mut sum = 0.0;
    for p in 0..3 {
        let delegate = DataLikelihoodDelegate::new(
            lik.tree(),
            &patterns(p),
            branch_models().swap_remove(p / 2),
            site_models().swap_remove(p),
            CpuBackend::new(),
            &LikelihoodConfig::default(),
        )
        .unwrap();
        let mut single = TreeDataLikelihood::new(lik.tree().clone(), delegate, &LikelihoodConfig::default()).unwrap();
        let value = single.evaluate().unwrap();
        assert_close(lik.delegate().partition_log_likelihood(p), value);
        sum += value;
    }
    assert_close(total, sum);
}

#[test]
fn test_changed_site_model_recomputes_only_its_partition() {
    let mut lik = multi(OperationReport::new(CpuBackend::new()));
    lik.evaluate().unwrap();
    let p0 = lik.delegate().partition_log_likelihood(0);
    let p1 = lik.delegate().partition_log_likelihood(1);
    lik.delegate_mut().backend_mut().clear();

    lik.update_models(|d| d.set_category_rates(2, &[0.2, 1.8])).unwrap();
    let total = lik.evaluate().unwrap();

    let touched: Vec<usize> = lik
        .delegate()
        .backend()
        .calls()
        .iter()
        .flat_map(|c| c.partitions())
        .collect();
    assert!(!touched.is_empty());
    assert!(touched.iter().all(|&p| p == 2));

    let p2 = partition_reference(
        lik.tree(),
        2,
        &SiteRateModel::with_rates(vec![0.2, 1.8]).unwrap(),
    );
    assert_close(lik.delegate().partition_log_likelihood(2), p2);
    assert_eq!(lik.delegate().partition_log_likelihood(0), p0);
    assert_eq!(lik.delegate().partition_log_likelihood(1), p1);
    assert_close(total, p0 + p1 + p2);
}

#[test]
fn test_substitution_model_change_reaches_only_its_branch_model() {
    let mut lik = multi(OperationReport::new(CpuBackend::new()));
    let before = lik.evaluate().unwrap();
    lik.delegate_mut().backend_mut().clear();

    lik.update_models(|d| d.set_substitution_model(1, 1, SubstitutionModel::jukes_cantor(4).unwrap()))
        .unwrap();
    assert!(!lik.delegate().is_partition_dirty(0));
    assert!(!lik.delegate().is_partition_dirty(1));
    assert!(lik.delegate().is_partition_dirty(2));
    assert_close(lik.evaluate().unwrap(), before);

    let report = lik.delegate().backend();
    let eigen_uploads: Vec<usize> = report
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::SetEigenDecomposition { partition, .. } => Some(*partition),
            _ => None,
        })
        .collect();
    assert_eq!(eigen_uploads, vec![2]);
}

#[test]
fn test_underflow_retries_only_failing_partition() {
    let script = |call: usize, partition: usize| (call == 0 && partition == 1).then_some(f64::NAN);
    let mut lik = multi(ScriptedBackend::new(script));
    let total = lik.evaluate().unwrap();

    let backend = lik.delegate().backend();
    assert_eq!(backend.root_calls(), 2);
    let first: Vec<usize> = backend.root_requests()[0].iter().map(|r| r.partition).collect();
    assert_eq!(first, vec![0, 1, 2]);
    let retry = &backend.root_requests()[1];
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].partition, 1);
    assert!(retry[0].cumulative_scale.is_some());

    assert!(lik.delegate().rescaling_state(1).has_underflowed());
    assert!(!lik.delegate().rescaling_state(0).has_underflowed());

    let mut honest = multi(CpuBackend::new());
    assert_close(total, honest.evaluate().unwrap());
}

#[test]
fn test_restore_returns_cached_total() {
    let mut lik = multi(OperationReport::new(CpuBackend::new()));
    let original = lik.evaluate().unwrap();

    lik.store_state();
    lik.update_models(|d| d.set_category_rates(1, &[0.9, 1.1])).unwrap();
    let proposed = lik.evaluate().unwrap();
    assert!((proposed - original).abs() > 1e-9);
    lik.restore_state();

    lik.delegate_mut().backend_mut().clear();
    assert_eq!(lik.evaluate().unwrap(), original);
    assert!(lik.delegate().backend().calls().is_empty());

    lik.update_models(|d| d.set_category_rates(1, &[0.5, 1.5])).unwrap();
    assert_close(lik.evaluate().unwrap(), original);
}

#[test]
fn test_restore_rolls_back_site_model_before_partial_update() {
    let mut lik = multi(CpuBackend::new());
    lik.evaluate().unwrap();

    lik.store_state();
    lik.update_models(|d| d.set_category_rates(1, &[0.9, 1.1])).unwrap();
    lik.evaluate().unwrap();
    lik.restore_state();
    assert_eq!(lik.delegate().site_model(1).category_rates(), &[0.5, 1.5]);

    let a = lik.tree().tip_index("A").unwrap();
    lik.set_branch_rate(a, 1.3);
    let total = lik.evaluate().unwrap();

    let sites = site_models();
    let expected: f64 = (0..3).map(|p| partition_reference(lik.tree(), p, &sites[p])).sum();
    assert_close(total, expected);
}

#[test]
fn test_marked_partition_recomputes_every_node() {
    let mut lik = multi(OperationReport::new(CpuBackend::new()));
    let total = lik.evaluate().unwrap();
    lik.delegate_mut().backend_mut().clear();

    lik.update_models(|d| d.mark_partition_dirty(1));
    assert_close(lik.evaluate().unwrap(), total);

    let operations = lik.delegate().backend().partials_operations();
    assert_eq!(operations.len(), lik.tree().internal_node_count());
    assert!(operations.iter().all(|op| op.partition == 1));
}
