//! Among-site rate variation as discrete categories.

use crate::error::{Error, Result};

/// Category rates and their weights.
///
/// Rates can be replaced with arbitrary values between evaluations. Invalid
/// values are not rejected at that point: the delegate checks
/// [`validate`](Self::validate) on each evaluation and turns a failure into
/// a rejected proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteRateModel {
    category_rates: Vec<f64>,
    category_weights: Vec<f64>,
}

impl SiteRateModel {
    /// One category with rate 1.
    pub fn uniform() -> Self {
        Self {
            category_rates: vec![1.0],
            category_weights: vec![1.0],
        }
    }

    pub fn new(category_rates: Vec<f64>, category_weights: Vec<f64>) -> Result<Self> {
        if category_rates.is_empty() || category_rates.len() != category_weights.len() {
            return Err(Error::InvalidModel(format!(
                "{} category rates with {} weights",
                category_rates.len(),
                category_weights.len()
            )));
        }
        let model = Self {
            category_rates,
            category_weights,
        };
        model.validate()?;
        Ok(model)
    }

    /// Equal-weight categories.
    pub fn with_rates(category_rates: Vec<f64>) -> Result<Self> {
        let n = category_rates.len();
        Self::new(category_rates, vec![1.0 / n.max(1) as f64; n])
    }

    pub fn category_count(&self) -> usize {
        self.category_rates.len()
    }

    pub fn category_rates(&self) -> &[f64] {
        &self.category_rates
    }

    pub fn category_weights(&self) -> &[f64] {
        &self.category_weights
    }

    /// Replace the rates, keeping the category count.
    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        if rates.len() != self.category_rates.len() {
            return Err(Error::InvalidModel(format!(
                "expected {} category rates, got {}",
                self.category_rates.len(),
                rates.len()
            )));
        }
        self.category_rates.copy_from_slice(rates);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self
            .category_rates
            .iter()
            .find(|r| !(r.is_finite() && **r >= 0.0))
        {
            return Err(Error::InvalidModel(format!("invalid category rate {}", rate)));
        }
        let total: f64 = self.category_weights.iter().sum();
        if self
            .category_weights
            .iter()
            .any(|w| !(w.is_finite() && *w >= 0.0))
            || (total - 1.0).abs() > 1e-8
        {
            return Err(Error::InvalidModel(
                "category weights must be non-negative and sum to one".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SiteRateModel {
    fn default() -> Self {
        Self::uniform()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_is_valid() {
        let model = SiteRateModel::uniform();
        assert_eq!(model.category_count(), 1);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_equal_weights() {
        let model = SiteRateModel::with_rates(vec![0.5, 1.5]).unwrap();
        assert_eq!(model.category_weights(), &[0.5, 0.5]);
    }

    #[test]
    fn test_invalid_rates_detected_after_update() {
        let mut model = SiteRateModel::with_rates(vec![0.5, 1.5]).unwrap();
        model.set_category_rates(&[f64::NAN, 1.0]).unwrap();
        assert!(model.validate().is_err());
        assert!(model.set_category_rates(&[1.0]).is_err());
    }

    #[test]
    fn test_rejects_bad_construction() {
        assert!(SiteRateModel::new(vec![1.0, 2.0], vec![1.0]).is_err());
        assert!(SiteRateModel::new(vec![1.0], vec![0.5]).is_err());
        assert!(SiteRateModel::with_rates(vec![-1.0]).is_err());
    }
}
