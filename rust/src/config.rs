//! Evaluation configuration.
//!
//! Defaults match the usual MCMC setting: dynamic rescaling every 100
//! evaluations, activated only after the first underflow, and a retry cap of
//! 100 attempts per evaluation. Every field can be overridden from the
//! environment through [`LikelihoodConfig::from_env`].

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::traversal::TraversalType;

pub const DEFAULT_RESCALING_FREQUENCY: usize = 100;
pub const DEFAULT_MAX_UNDERFLOW_RETRIES: usize = 100;
pub const DEFAULT_CONVOLUTION_POOL_SIZE: usize = 100;

/// Number of consecutive evaluations that recompute scale factors once a
/// dynamic rescaling period elapses.
pub const RESCALE_TIMES: usize = 1;

/// When partial likelihoods are rescaled to avoid floating-point underflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RescalingScheme {
    /// Never use scale factors.
    None,
    /// Recompute scale factors on every evaluation.
    Always,
    /// Use scale factors and recompute them periodically.
    #[default]
    Dynamic,
    /// Like `Always`, but only once an underflow has been seen.
    Delayed,
}

impl RescalingScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RescalingScheme::None => "none",
            RescalingScheme::Always => "always",
            RescalingScheme::Dynamic => "dynamic",
            RescalingScheme::Delayed => "delayed",
        }
    }
}

impl fmt::Display for RescalingScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RescalingScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(RescalingScheme::None),
            "always" => Ok(RescalingScheme::Always),
            "dynamic" => Ok(RescalingScheme::Dynamic),
            "delayed" => Ok(RescalingScheme::Delayed),
            other => Err(Error::InvalidConfig(format!(
                "unknown rescaling scheme '{}'",
                other
            ))),
        }
    }
}

/// Configuration shared by every delegate of one likelihood.
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodConfig {
    pub rescaling_scheme: RescalingScheme,
    /// Evaluations between scale-factor recomputations under `Dynamic`.
    pub rescaling_frequency: usize,
    /// Leave scale factors off until the first underflow (`Dynamic` only).
    pub delay_rescaling_until_underflow: bool,
    /// Attempts per `evaluate()` before an underflow becomes fatal.
    pub max_underflow_retries: usize,
    pub traversal_type: TraversalType,
    /// Scratch matrix buffers available to epoch-branch convolution.
    pub convolution_pool_size: usize,
    /// Independent evaluation contexts, for prefetching competing proposals.
    pub context_count: usize,
    /// Upload tips as partial vectors instead of compact states.
    pub use_ambiguities: bool,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            rescaling_scheme: RescalingScheme::default(),
            rescaling_frequency: DEFAULT_RESCALING_FREQUENCY,
            delay_rescaling_until_underflow: true,
            max_underflow_retries: DEFAULT_MAX_UNDERFLOW_RETRIES,
            traversal_type: TraversalType::default(),
            convolution_pool_size: DEFAULT_CONVOLUTION_POOL_SIZE,
            context_count: 1,
            use_ambiguities: false,
        }
    }
}

impl LikelihoodConfig {
    /// Defaults overridden by `PHYLO_*` environment variables.
    ///
    /// Recognised variables:
    /// * `PHYLO_RESCALING_SCHEME` - none, always, dynamic or delayed
    /// * `PHYLO_RESCALING_FREQUENCY`
    /// * `PHYLO_DELAY_SCALING` - true/false
    /// * `PHYLO_MAX_UNDERFLOW_RETRIES`
    /// * `PHYLO_TRAVERSAL` - post-order or reverse-level-order
    /// * `PHYLO_CONVOLUTION_POOL`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("PHYLO_RESCALING_SCHEME") {
            config.rescaling_scheme = value.parse()?;
        }
        if let Some(value) = lookup("PHYLO_RESCALING_FREQUENCY") {
            config.rescaling_frequency = parse_number("PHYLO_RESCALING_FREQUENCY", &value)?;
        }
        if let Some(value) = lookup("PHYLO_DELAY_SCALING") {
            config.delay_rescaling_until_underflow = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "PHYLO_DELAY_SCALING must be a boolean, got '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(value) = lookup("PHYLO_MAX_UNDERFLOW_RETRIES") {
            config.max_underflow_retries = parse_number("PHYLO_MAX_UNDERFLOW_RETRIES", &value)?;
        }
        if let Some(value) = lookup("PHYLO_TRAVERSAL") {
            config.traversal_type = value.parse()?;
        }
        if let Some(value) = lookup("PHYLO_CONVOLUTION_POOL") {
            config.convolution_pool_size = parse_number("PHYLO_CONVOLUTION_POOL", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rescaling_frequency == 0 {
            return Err(Error::InvalidConfig(
                "rescaling frequency must be at least 1".to_string(),
            ));
        }
        if self.max_underflow_retries == 0 {
            return Err(Error::InvalidConfig(
                "underflow retry cap must be at least 1".to_string(),
            ));
        }
        if self.context_count == 0 {
            return Err(Error::InvalidConfig(
                "at least one evaluation context is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Human readable summary for construction logs.
    pub fn describe_rescaling(&self) -> String {
        match self.rescaling_scheme {
            RescalingScheme::Dynamic if self.delay_rescaling_until_underflow => format!(
                "dynamic (rescaling every {} evaluations, delayed until first underflow)",
                self.rescaling_frequency
            ),
            RescalingScheme::Dynamic => format!(
                "dynamic (rescaling every {} evaluations)",
                self.rescaling_frequency
            ),
            RescalingScheme::Delayed => "delayed (rescaling after first underflow)".to_string(),
            scheme => scheme.to_string(),
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        Error::InvalidConfig(format!("{} must be a non-negative integer, got '{}'", key, value))
    })
}
