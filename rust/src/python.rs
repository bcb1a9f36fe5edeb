//! Python bindings, built with the `python` feature.

use numpy::{PyArray1, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;
use rayon::prelude::*;

use crate::backend::CpuBackend;
use crate::config::LikelihoodConfig;
use crate::delegate::DataLikelihoodDelegate;
use crate::error::{Error, Result};
use crate::likelihood::TreeDataLikelihood;
use crate::model::{BranchModel, SiteRateModel, SubstitutionModel};
use crate::patterns::Patterns;
use crate::tree::Tree;

fn to_py_err(err: Error) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Log-likelihood of one presence/absence family under a gain/loss model.
fn family_log_likelihood(
    tree: &Tree,
    presence: Vec<Vec<u32>>,
    gain_rate: f64,
    loss_rate: f64,
    config: &LikelihoodConfig,
) -> Result<f64> {
    let patterns = Patterns::new(2, tree.taxon_names().to_vec(), presence, vec![1.0])?;
    let delegate = DataLikelihoodDelegate::new(
        tree,
        &patterns,
        BranchModel::homogeneous(SubstitutionModel::two_state(gain_rate, loss_rate)?),
        SiteRateModel::uniform(),
        CpuBackend::new(),
        config,
    )?;
    TreeDataLikelihood::new(tree.clone(), delegate, config)?.evaluate()
}

/// Compute log-likelihoods for all gene families in parallel.
///
/// # Arguments
/// * `parent_indices` - Parent index for each node (-1 for root); tips first
/// * `branch_lengths` - Branch length for each node
/// * `presence_matrix` - (n_tips, n_families); 1 present, 0 absent, negative unknown
/// * `gain_rates` - (n_families,) gain rates
/// * `loss_rates` - (n_families,) loss rates
/// * `n_tips` - Number of tip nodes
#[pyfunction]
fn compute_log_likelihoods_parallel<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    presence_matrix: PyReadonlyArray2<i8>,
    gain_rates: PyReadonlyArray1<f64>,
    loss_rates: PyReadonlyArray1<f64>,
    n_tips: usize,
) -> PyResult<&'py PyArray1<f64>> {
    let names = (0..n_tips).map(|i| format!("t{}", i)).collect();
    let tree = Tree::from_structure(
        parent_indices.as_slice()?,
        branch_lengths.as_slice()?,
        names,
    )
    .map_err(to_py_err)?;
    let config = LikelihoodConfig::from_env().map_err(to_py_err)?;

    let presence = presence_matrix.as_array();
    let gains = gain_rates.as_array();
    let losses = loss_rates.as_array();
    if presence.shape()[0] != n_tips {
        return Err(PyValueError::new_err(format!(
            "presence matrix has {} rows for {} tips",
            presence.shape()[0],
            n_tips
        )));
    }
    let n_families = presence.shape()[1];
    if gains.len() != n_families || losses.len() != n_families {
        return Err(PyValueError::new_err(
            "gain_rates and loss_rates need one entry per family",
        ));
    }

    let log_likelihoods: Vec<f64> = (0..n_families)
        .into_par_iter()
        .map(|family| {
            let states = (0..n_tips)
                .map(|tip| match presence[[tip, family]] {
                    value if value < 0 => vec![2],
                    0 => vec![0],
                    _ => vec![1],
                })
                .collect();
            family_log_likelihood(&tree, states, gains[family], losses[family], &config)
        })
        .collect::<Result<_>>()
        .map_err(to_py_err)?;

    Ok(PyArray1::from_vec(py, log_likelihoods))
}

#[pymodule]
fn phylo_engine(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_log_likelihoods_parallel, m)?)?;
    Ok(())
}
