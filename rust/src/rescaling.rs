//! Per-partition rescaling state machine.
//!
//! Each evaluation cycle asks [`RescalingState::plan_cycle`] whether scale
//! factors are used and whether they are recomputed. A non-finite result is
//! reported through [`RescalingState::on_underflow`], which forces a full
//! rescale for the next attempt or gives up on the cycle.

use tracing::debug;

use crate::config::{LikelihoodConfig, RescalingScheme, RESCALE_TIMES};
use crate::error::{Error, Result};

/// What to do after a non-finite log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderflowAction {
    /// Retry with all nodes dirty and scale factors recomputed.
    Retry,
    /// Report negative infinity; the proposal is rejected.
    Reject,
}

#[derive(Debug, Clone)]
pub struct RescalingState {
    scheme: RescalingScheme,
    frequency: usize,
    delay_until_underflow: bool,
    use_scale_factors: bool,
    recompute_scale_factors: bool,
    ever_underflowed: bool,
    forced: bool,
    rescaling_count: usize,
    rescaling_count_inner: usize,
}

impl RescalingState {
    pub fn new(config: &LikelihoodConfig) -> Self {
        Self {
            scheme: config.rescaling_scheme,
            frequency: config.rescaling_frequency.max(1),
            delay_until_underflow: config.delay_rescaling_until_underflow,
            use_scale_factors: false,
            recompute_scale_factors: false,
            ever_underflowed: false,
            forced: false,
            rescaling_count: 0,
            rescaling_count_inner: 0,
        }
    }

    pub fn scheme(&self) -> RescalingScheme {
        self.scheme
    }

    pub fn uses_scale_factors(&self) -> bool {
        self.use_scale_factors
    }

    pub fn recomputes_scale_factors(&self) -> bool {
        self.recompute_scale_factors
    }

    pub fn has_underflowed(&self) -> bool {
        self.ever_underflowed
    }

    /// Whether the current attempt is a forced rescue after an underflow.
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    fn active(&self) -> bool {
        match self.scheme {
            RescalingScheme::None => false,
            RescalingScheme::Always => true,
            RescalingScheme::Delayed => self.ever_underflowed,
            RescalingScheme::Dynamic => !self.delay_until_underflow || self.ever_underflowed,
        }
    }

    /// Whether the next cycle wants to recompute scale factors periodically,
    /// which needs every node in the operation list.
    pub fn requires_full_traversal(&self) -> bool {
        self.scheme == RescalingScheme::Dynamic
            && self.active()
            && !self.forced
            && (self.rescaling_count >= self.frequency
                || self.rescaling_count_inner < RESCALE_TIMES)
    }

    /// Decide this cycle's flags.
    ///
    /// Returns [`Error::RescaleRequested`], without changing any state, when
    /// a periodic recomputation is due but the traversal is partial.
    pub fn plan_cycle(&mut self, full_traversal: bool) -> Result<()> {
        if self.forced {
            self.use_scale_factors = true;
            self.recompute_scale_factors = true;
            return Ok(());
        }

        if !full_traversal && self.requires_full_traversal() {
            debug!(count = self.rescaling_count, "periodic rescale needs a full traversal");
            return Err(Error::RescaleRequested);
        }

        self.recompute_scale_factors = false;
        if !self.active() {
            self.use_scale_factors = false;
            return Ok(());
        }

        self.use_scale_factors = true;
        match self.scheme {
            RescalingScheme::Always | RescalingScheme::Delayed => {
                self.recompute_scale_factors = true;
            }
            RescalingScheme::Dynamic => {
                if self.rescaling_count >= self.frequency {
                    self.rescaling_count = 0;
                    self.rescaling_count_inner = 0;
                }
                if self.rescaling_count_inner < RESCALE_TIMES {
                    self.recompute_scale_factors = true;
                    self.rescaling_count_inner += 1;
                }
                self.rescaling_count += 1;
            }
            RescalingScheme::None => {}
        }
        Ok(())
    }

    /// Record a non-finite log-likelihood and pick the follow-up.
    ///
    /// The first failure of a cycle forces scale-factor use and recomputation.
    /// A forced attempt that still gives negative infinity is a genuine zero
    /// likelihood and is rejected; NaN or positive infinity keeps retrying
    /// until the caller's cap.
    pub fn on_underflow(&mut self, log_likelihood: f64) -> UnderflowAction {
        self.ever_underflowed = true;

        if self.scheme == RescalingScheme::None {
            return UnderflowAction::Reject;
        }
        if !self.forced {
            self.forced = true;
            self.use_scale_factors = true;
            self.recompute_scale_factors = true;
            return UnderflowAction::Retry;
        }
        if log_likelihood == f64::NEG_INFINITY {
            self.forced = false;
            return UnderflowAction::Reject;
        }
        UnderflowAction::Retry
    }

    /// Close a successful cycle.
    pub fn on_success(&mut self) {
        if self.forced {
            self.forced = false;
            if self.scheme == RescalingScheme::Dynamic {
                // The rescue already refreshed every scale factor.
                self.rescaling_count = 1;
                self.rescaling_count_inner = RESCALE_TIMES;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(scheme: RescalingScheme, delay: bool, frequency: usize) -> RescalingState {
        RescalingState::new(&LikelihoodConfig {
            rescaling_scheme: scheme,
            delay_rescaling_until_underflow: delay,
            rescaling_frequency: frequency,
            ..LikelihoodConfig::default()
        })
    }

    #[test]
    fn test_none_never_scales() {
        let mut s = state(RescalingScheme::None, false, 10);
        s.plan_cycle(false).unwrap();
        assert!(!s.uses_scale_factors());
        assert_eq!(s.on_underflow(f64::NAN), UnderflowAction::Reject);
    }

    #[test]
    fn test_always_recomputes_every_cycle() {
        let mut s = state(RescalingScheme::Always, false, 10);
        for _ in 0..3 {
            s.plan_cycle(false).unwrap();
            assert!(s.uses_scale_factors() && s.recomputes_scale_factors());
        }
    }

    #[test]
    fn test_dynamic_period() {
        let mut s = state(RescalingScheme::Dynamic, false, 3);
        let mut recomputed = Vec::new();
        for _ in 0..7 {
            s.plan_cycle(true).unwrap();
            recomputed.push(s.recomputes_scale_factors());
            s.on_success();
        }
        assert_eq!(recomputed, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_dynamic_requests_full_traversal() {
        let mut s = state(RescalingScheme::Dynamic, false, 2);
        s.plan_cycle(true).unwrap();
        s.plan_cycle(false).unwrap();
        assert!(matches!(s.plan_cycle(false), Err(Error::RescaleRequested)));
        // Asking again is harmless until the full traversal arrives.
        assert!(matches!(s.plan_cycle(false), Err(Error::RescaleRequested)));
        s.plan_cycle(true).unwrap();
        assert!(s.recomputes_scale_factors());
    }

    #[test]
    fn test_delayed_dynamic_waits_for_underflow() {
        let mut s = state(RescalingScheme::Dynamic, true, 100);
        s.plan_cycle(false).unwrap();
        assert!(!s.uses_scale_factors());

        assert_eq!(s.on_underflow(f64::NAN), UnderflowAction::Retry);
        s.plan_cycle(true).unwrap();
        assert!(s.uses_scale_factors() && s.recomputes_scale_factors());
        s.on_success();

        // The rescue counts as this period's recomputation.
        s.plan_cycle(false).unwrap();
        assert!(s.uses_scale_factors());
        assert!(!s.recomputes_scale_factors());
    }

    #[test]
    fn test_delayed_scheme_activates_after_underflow() {
        let mut s = state(RescalingScheme::Delayed, false, 100);
        s.plan_cycle(false).unwrap();
        assert!(!s.uses_scale_factors());
        s.on_underflow(f64::INFINITY);
        s.plan_cycle(true).unwrap();
        s.on_success();
        s.plan_cycle(false).unwrap();
        assert!(s.uses_scale_factors() && s.recomputes_scale_factors());
    }

    #[test]
    fn test_forced_attempt_rejects_negative_infinity() {
        let mut s = state(RescalingScheme::Dynamic, true, 100);
        assert_eq!(s.on_underflow(f64::NEG_INFINITY), UnderflowAction::Retry);
        assert!(s.is_forced());
        assert_eq!(s.on_underflow(f64::NAN), UnderflowAction::Retry);
        assert_eq!(s.on_underflow(f64::NEG_INFINITY), UnderflowAction::Reject);
        assert!(!s.is_forced());
        assert!(s.has_underflowed());
    }
}
