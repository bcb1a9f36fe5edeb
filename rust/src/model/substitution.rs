//! Substitution models, expressed through their eigen systems.
//!
//! The engine never builds rate matrices itself; it only needs each model's
//! eigen system and stationary frequencies. Two closed-form families are
//! provided, plus a constructor for decompositions computed elsewhere.

use ndarray::{Array1, Array2};

use super::eigen::EigenDecomposition;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionModel {
    name: String,
    eigen: EigenDecomposition,
    frequencies: Vec<f64>,
}

impl SubstitutionModel {
    /// Use an existing eigen system and stationary distribution.
    pub fn from_eigen(
        name: impl Into<String>,
        eigen: EigenDecomposition,
        frequencies: Vec<f64>,
    ) -> Result<Self> {
        if frequencies.len() != eigen.state_count() {
            return Err(Error::InvalidModel(format!(
                "{} frequencies for a {}-state model",
                frequencies.len(),
                eigen.state_count()
            )));
        }
        let total: f64 = frequencies.iter().sum();
        if frequencies.iter().any(|f| !(f.is_finite() && *f >= 0.0)) || (total - 1.0).abs() > 1e-8
        {
            return Err(Error::InvalidModel(
                "frequencies must be non-negative and sum to one".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            eigen,
            frequencies,
        })
    }

    /// Equal-rates model on `state_count` states, one expected substitution
    /// per unit time.
    ///
    /// `Q = n/(n-1) · (J/n - I)` is symmetric, so an orthonormal (Helmert)
    /// basis diagonalizes it and `V⁻¹ = Vᵀ`.
    pub fn jukes_cantor(state_count: usize) -> Result<Self> {
        if state_count < 2 {
            return Err(Error::InvalidModel(
                "Jukes-Cantor needs at least two states".to_string(),
            ));
        }
        let n = state_count;
        let mut eigenvectors = Array2::<f64>::zeros((n, n));
        let first = 1.0 / (n as f64).sqrt();
        for i in 0..n {
            eigenvectors[[i, 0]] = first;
        }
        for k in 1..n {
            let norm = ((k * (k + 1)) as f64).sqrt();
            for i in 0..k {
                eigenvectors[[i, k]] = 1.0 / norm;
            }
            eigenvectors[[k, k]] = -(k as f64) / norm;
        }
        let inverse = eigenvectors.t().to_owned();

        let mut eigenvalues = Array1::from_elem(n, -(n as f64) / (n as f64 - 1.0));
        eigenvalues[0] = 0.0;

        let eigen = EigenDecomposition::new(eigenvectors, inverse, eigenvalues)?;
        Self::from_eigen(
            format!("JC{}", state_count),
            eigen,
            vec![1.0 / n as f64; n],
        )
    }

    /// Binary gain/loss model.
    ///
    /// Q = [[-λ, λ], [μ, -μ]] with eigenvalues 0 and -(λ+μ). At equilibrium
    /// π₀ · λ = π₁ · μ. Rates summing to ~0 give a model with no change.
    pub fn two_state(gain_rate: f64, loss_rate: f64) -> Result<Self> {
        if !(gain_rate.is_finite() && loss_rate.is_finite() && gain_rate >= 0.0 && loss_rate >= 0.0)
        {
            return Err(Error::InvalidModel(format!(
                "gain/loss rates must be non-negative, got {} and {}",
                gain_rate, loss_rate
            )));
        }
        let total = gain_rate + loss_rate;

        if total < 1e-10 {
            return Self::from_eigen("gain-loss", EigenDecomposition::identity(2), vec![0.5, 0.5]);
        }

        let eigenvectors = ndarray::array![[1.0, gain_rate], [1.0, -loss_rate]];
        let inverse = ndarray::array![
            [loss_rate / total, gain_rate / total],
            [1.0 / total, -1.0 / total]
        ];
        let eigenvalues = ndarray::array![0.0, -total];

        let eigen = EigenDecomposition::new(eigenvectors, inverse, eigenvalues)?;
        Self::from_eigen(
            "gain-loss",
            eigen,
            vec![loss_rate / total, gain_rate / total],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_count(&self) -> usize {
        self.eigen.state_count()
    }

    pub fn eigen_decomposition(&self) -> &EigenDecomposition {
        &self.eigen
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        self.eigen.transition_matrix(distance)
    }
}
