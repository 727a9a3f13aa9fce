//! The scalar coherence budget: a value in `[0, 1]` that degrades on gate
//! failures and warnings and recovers on passes, with a floor below which
//! the episode executor refuses to proceed.
//!
//! Degradation is asymmetric by design — a default `degrade_step` of 0.05
//! for outright failures and a lighter, separately-specified amount (0.02
//! in the reference caller) for warnings — so that a string of marginal
//! warnings erodes the budget more slowly than a single hard failure.

use serde::{Deserialize, Serialize};

/// A snapshot of budget state and its derived predicates, returned by
/// `CoherenceBudget::check`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoherenceStatus {
    pub current: f64,
    pub floor: f64,
    pub healthy: bool,
    pub degraded: bool,
    pub critical: bool,
    pub can_proceed: bool,
}

/// `{current, floor, degrade_step, recover_step}` per the data model: a
/// record, not a trait object — there is exactly one kind of budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceBudget {
    current: f64,
    initial: f64,
    floor: f64,
    degrade_step: f64,
    recover_step: f64,
}

const HEALTHY_THRESHOLD: f64 = 0.8;
const DEGRADED_THRESHOLD: f64 = 0.3;
const DEFAULT_DEGRADE_STEP: f64 = 0.05;
const DEFAULT_RECOVER_STEP: f64 = 0.02;
const DEFAULT_FLOOR: f64 = 0.1;

impl CoherenceBudget {
    pub fn new(current: f64) -> Self {
        Self::with_params(current, DEFAULT_FLOOR, DEFAULT_DEGRADE_STEP, DEFAULT_RECOVER_STEP)
    }

    pub fn with_params(current: f64, floor: f64, degrade_step: f64, recover_step: f64) -> Self {
        let current = current.clamp(0.0, 1.0);
        Self {
            current,
            initial: current,
            floor,
            degrade_step,
            recover_step,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// Degrade the budget. `amount` overrides `degrade_step` for this call
    /// only (the warn-path caller passes a smaller amount than the
    /// fail-path default); `reason` is logged, not stored.
    pub fn degrade(&mut self, amount: Option<f64>, reason: &str) {
        let step = amount.unwrap_or(self.degrade_step);
        self.current = (self.current - step).clamp(0.0, 1.0);
        tracing::debug!(reason, step, current = self.current, "coherence budget degraded");
    }

    pub fn recover(&mut self, reason: &str) {
        if self.current < 1.0 {
            self.current = (self.current + self.recover_step).clamp(0.0, 1.0);
            tracing::debug!(reason, current = self.current, "coherence budget recovered");
        }
    }

    pub fn healthy(&self) -> bool {
        self.current >= HEALTHY_THRESHOLD
    }

    pub fn degraded(&self) -> bool {
        self.current >= DEGRADED_THRESHOLD && self.current < HEALTHY_THRESHOLD
    }

    pub fn critical(&self) -> bool {
        self.current < self.floor
    }

    pub fn can_proceed(&self) -> bool {
        !self.critical()
    }

    pub fn check(&self) -> CoherenceStatus {
        CoherenceStatus {
            current: self.current,
            floor: self.floor,
            healthy: self.healthy(),
            degraded: self.degraded(),
            critical: self.critical(),
            can_proceed: self.can_proceed(),
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_degrade_step_is_point_zero_five() {
        let mut b = CoherenceBudget::new(0.9);
        b.degrade(None, "gate_failure_test");
        assert!((b.current() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn warn_degrade_uses_smaller_amount() {
        let mut b = CoherenceBudget::new(0.9);
        b.degrade(Some(0.02), "gate_warning_test");
        assert!((b.current() - 0.88).abs() < 1e-9);
    }

    #[test]
    fn recover_is_clamped_at_one() {
        let mut b = CoherenceBudget::new(0.99);
        b.recover("gate_passed");
        assert!(b.current() <= 1.0);
    }

    #[test]
    fn predicates_match_thresholds() {
        let healthy = CoherenceBudget::new(0.85);
        assert!(healthy.healthy() && !healthy.degraded() && !healthy.critical());

        let degraded = CoherenceBudget::new(0.5);
        assert!(!degraded.healthy() && degraded.degraded() && !degraded.critical());

        let critical = CoherenceBudget::with_params(0.05, 0.1, 0.05, 0.02);
        assert!(critical.critical() && !critical.can_proceed());
    }

    #[test]
    fn reset_restores_initial_value() {
        let mut b = CoherenceBudget::new(0.9);
        b.degrade(None, "x");
        b.degrade(None, "x");
        b.reset();
        assert_eq!(b.current(), 0.9);
    }

    #[test]
    fn degrade_and_recover_never_leave_unit_interval() {
        let mut b = CoherenceBudget::new(0.02);
        b.degrade(None, "x");
        assert!(b.current() >= 0.0);

        let mut b = CoherenceBudget::new(0.99);
        for _ in 0..10 {
            b.recover("x");
        }
        assert!(b.current() <= 1.0);
    }

    proptest! {
        #[test]
        fn budget_always_stays_in_unit_interval(
            start in 0.0f64..=1.0,
            ops in prop::collection::vec(prop::bool::ANY, 0..50),
        ) {
            let mut b = CoherenceBudget::new(start);
            for degrade in ops {
                if degrade {
                    b.degrade(None, "op");
                } else {
                    b.recover("op");
                }
            }
            prop_assert!(b.current() >= 0.0 && b.current() <= 1.0);
        }
    }
}
