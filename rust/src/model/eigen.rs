//! Eigen systems of reversible rate matrices.

use ndarray::{Array1, Array2};

use crate::error::{Error, Result};

/// `Q = V · diag(λ) · V⁻¹`, stored in the form the backend exponentiates.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    eigenvectors: Array2<f64>,
    inverse_eigenvectors: Array2<f64>,
    eigenvalues: Array1<f64>,
}

impl EigenDecomposition {
    pub fn new(
        eigenvectors: Array2<f64>,
        inverse_eigenvectors: Array2<f64>,
        eigenvalues: Array1<f64>,
    ) -> Result<Self> {
        let n = eigenvalues.len();
        if n < 2 {
            return Err(Error::InvalidModel(
                "an eigen system needs at least two states".to_string(),
            ));
        }
        if eigenvectors.dim() != (n, n) || inverse_eigenvectors.dim() != (n, n) {
            return Err(Error::InvalidModel(format!(
                "eigenvector matrices must be {}x{}",
                n, n
            )));
        }
        if eigenvalues.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidModel("eigenvalues must be finite".to_string()));
        }
        Ok(Self {
            eigenvectors,
            inverse_eigenvectors,
            eigenvalues,
        })
    }

    /// Decomposition of the zero rate matrix.
    pub fn identity(state_count: usize) -> Self {
        Self {
            eigenvectors: Array2::eye(state_count),
            inverse_eigenvectors: Array2::eye(state_count),
            eigenvalues: Array1::zeros(state_count),
        }
    }

    pub fn state_count(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn eigenvectors(&self) -> &Array2<f64> {
        &self.eigenvectors
    }

    pub fn inverse_eigenvectors(&self) -> &Array2<f64> {
        &self.inverse_eigenvectors
    }

    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// `P(t) = V · diag(exp(λt)) · V⁻¹`, with round-off negatives clamped to 0.
    pub fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        let decay = self.eigenvalues.mapv(|lambda| (lambda * distance).exp());
        let scaled = &self.eigenvectors * &decay;
        scaled
            .dot(&self.inverse_eigenvectors)
            .mapv(|p| if p < 0.0 { 0.0 } else { p })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_identity_never_changes_state() {
        let eigen = EigenDecomposition::identity(3);
        let p = eigen.transition_matrix(10.0);
        assert_eq!(p, Array2::eye(3));
    }

    #[test]
    fn test_two_state_transition_rows_sum_to_one() {
        // Q = [[-1, 1], [1, -1]]
        let v = array![[1.0, 1.0], [1.0, -1.0]];
        let v_inv = array![[0.5, 0.5], [0.5, -0.5]];
        let eigen = EigenDecomposition::new(v, v_inv, array![0.0, -2.0]).unwrap();

        let p = eigen.transition_matrix(0.3);
        for row in p.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(p[[0, 0]], 0.5 + 0.5 * (-0.6f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let result = EigenDecomposition::new(Array2::eye(3), Array2::eye(2), array![0.0, -1.0]);
        assert!(result.is_err());
    }
}
