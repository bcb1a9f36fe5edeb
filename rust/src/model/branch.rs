//! Assignment of substitution models to branches.

use super::substitution::SubstitutionModel;
use crate::error::{Error, Result};

/// Models acting along one branch, ordered from the parent end to the child
/// end, with the time spent under each.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchMapping {
    pub order: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Piecewise-constant models over time.
///
/// `models[0]` applies from the present up to `transition_times[0]`,
/// `models[i]` between `transition_times[i-1]` and `transition_times[i]`,
/// and the last model beyond the last transition time.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochModel {
    models: Vec<SubstitutionModel>,
    transition_times: Vec<f64>,
}

impl EpochModel {
    pub fn new(models: Vec<SubstitutionModel>, transition_times: Vec<f64>) -> Result<Self> {
        if models.len() != transition_times.len() + 1 {
            return Err(Error::InvalidModel(format!(
                "{} epoch models need {} transition times, got {}",
                models.len(),
                models.len().saturating_sub(1),
                transition_times.len()
            )));
        }
        if transition_times
            .windows(2)
            .any(|w| !(w[0] < w[1]))
            || transition_times.iter().any(|t| !(t.is_finite() && *t > 0.0))
        {
            return Err(Error::InvalidModel(
                "epoch transition times must be positive and increasing".to_string(),
            ));
        }
        Ok(Self {
            models,
            transition_times,
        })
    }

    pub fn transition_times(&self) -> &[f64] {
        &self.transition_times
    }

    fn epoch_of(&self, height: f64) -> usize {
        self.transition_times.iter().filter(|&&t| t <= height).count()
    }

    fn mapping(&self, node_height: f64, parent_height: f64) -> BranchMapping {
        let oldest = self.epoch_of(parent_height);
        let youngest = self.epoch_of(node_height);
        let mut order = Vec::new();
        let mut weights = Vec::new();

        for epoch in (youngest..=oldest).rev() {
            let lower = if epoch == 0 {
                f64::NEG_INFINITY
            } else {
                self.transition_times[epoch - 1]
            };
            let upper = self
                .transition_times
                .get(epoch)
                .copied()
                .unwrap_or(f64::INFINITY);
            let duration = parent_height.min(upper) - node_height.max(lower);
            if duration > 0.0 {
                order.push(epoch);
                weights.push(duration);
            }
        }

        if order.is_empty() {
            order.push(youngest);
            weights.push(1.0);
        }
        BranchMapping { order, weights }
    }
}

/// How substitution models are laid over the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchModel {
    /// One model everywhere.
    Homogeneous(SubstitutionModel),
    /// Models change at fixed heights; branches crossing a boundary need
    /// their segment matrices multiplied together.
    Epoch(EpochModel),
}

impl BranchModel {
    pub fn homogeneous(model: SubstitutionModel) -> Self {
        BranchModel::Homogeneous(model)
    }

    pub fn epoch(models: Vec<SubstitutionModel>, transition_times: Vec<f64>) -> Result<Self> {
        let epoch = EpochModel::new(models, transition_times)?;
        let states = epoch.models[0].state_count();
        if epoch.models.iter().any(|m| m.state_count() != states) {
            return Err(Error::InvalidModel(
                "epoch models must share a state space".to_string(),
            ));
        }
        Ok(BranchModel::Epoch(epoch))
    }

    pub fn substitution_models(&self) -> &[SubstitutionModel] {
        match self {
            BranchModel::Homogeneous(model) => std::slice::from_ref(model),
            BranchModel::Epoch(epoch) => &epoch.models,
        }
    }

    pub fn model_count(&self) -> usize {
        self.substitution_models().len()
    }

    /// Replace one model, keeping the state space.
    pub fn set_substitution_model(&mut self, index: usize, model: SubstitutionModel) -> Result<()> {
        let expected = self.state_count();
        if model.state_count() != expected {
            return Err(Error::InvalidModel(format!(
                "replacement model has {} states, expected {}",
                model.state_count(),
                expected
            )));
        }
        let slot = match self {
            BranchModel::Homogeneous(current) if index == 0 => current,
            BranchModel::Epoch(epoch) if index < epoch.models.len() => &mut epoch.models[index],
            _ => {
                return Err(Error::InvalidModel(format!(
                    "no substitution model at index {}",
                    index
                )))
            }
        };
        *slot = model;
        Ok(())
    }

    pub fn state_count(&self) -> usize {
        self.substitution_models()[0].state_count()
    }

    /// Whether any branch can span more than one model.
    pub fn requires_convolution(&self) -> bool {
        self.model_count() > 1
    }

    pub fn mapping(&self, node_height: f64, parent_height: f64) -> BranchMapping {
        match self {
            BranchModel::Homogeneous(_) => BranchMapping {
                order: vec![0],
                weights: vec![1.0],
            },
            BranchModel::Epoch(epoch) => epoch.mapping(node_height, parent_height),
        }
    }

    /// Frequencies at the root: those of the oldest model.
    pub fn root_frequencies(&self) -> &[f64] {
        let models = self.substitution_models();
        models[models.len() - 1].frequencies()
    }
}
