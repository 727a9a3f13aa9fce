//! The gate kit: a closed set of validity checks run at every phase
//! transition, each producing a `{Pass, Fail, Warn, Skip}` decision with
//! rationale. Gates are a sum type, not a trait-object inheritance ladder —
//! `GateManager` matches exhaustively over `Gate` rather than dispatching
//! through dynamic calls, the one exception being the `External` arm, whose
//! evaluation is necessarily supplied by the embedder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coh_clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateKind {
    EvidenceSufficiency,
    CoherenceCheck,
    ReconstructionBound,
    Contradiction,
    Scope,
    Temporal,
    External,
}

/// The closed set of built-in gates, plus a single escape hatch for
/// capabilities the embedder supplies at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Gate {
    EvidenceSufficiency { threshold: f64, min_count: usize, strict: bool },
    CoherenceCheck { threshold: f64, strict: bool },
    ReconstructionBound,
    Contradiction,
    Scope,
    Temporal,
    External { capability: String },
}

impl Gate {
    pub fn kind(&self) -> GateKind {
        match self {
            Gate::EvidenceSufficiency { .. } => GateKind::EvidenceSufficiency,
            Gate::CoherenceCheck { .. } => GateKind::CoherenceCheck,
            Gate::ReconstructionBound => GateKind::ReconstructionBound,
            Gate::Contradiction => GateKind::Contradiction,
            Gate::Scope => GateKind::Scope,
            Gate::Temporal => GateKind::Temporal,
            Gate::External { .. } => GateKind::External,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub decision: GateDecision,
    pub kind: GateKind,
    pub details: Value,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Must,
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub value: String,
}

/// Everything a gate needs to evaluate. One struct rather than the source's
/// separate `context`/`state` dictionaries — the distinction there was
/// between per-episode and per-step data, which this crate doesn't need to
/// keep apart.
#[derive(Debug, Clone, Default)]
pub struct GateContext {
    pub evidence: Vec<String>,
    pub evidence_scores: Vec<f64>,
    pub required_claims: Vec<String>,
    pub conclusions: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub coherence_budget: f64,
    pub steps_completed: u32,
    pub max_reconstruction_steps: u32,
    pub scope_violations: Vec<String>,
    pub temporal_violations: Vec<String>,
}

/// Hook for the `External` gate arm; the embedder decides what a named
/// capability means.
pub trait ExternalGateEvaluator: Send + Sync {
    fn evaluate(&self, capability: &str, ctx: &GateContext) -> GateResult;
}

fn find_contradictions(conclusions: &[String], constraints: &[Constraint]) -> Vec<String> {
    constraints
        .iter()
        .filter_map(|c| match c.kind {
            ConstraintKind::MustNot if conclusions.contains(&c.value) => {
                Some(format!("violated must_not: {}", c.value))
            }
            _ => None,
        })
        .collect()
}

impl Gate {
    pub fn evaluate(
        &self,
        ctx: &GateContext,
        clock: &dyn Clock,
        external: Option<&dyn ExternalGateEvaluator>,
    ) -> GateResult {
        let now = clock.now();
        match self {
            Gate::EvidenceSufficiency { threshold, min_count, strict } => {
                evaluate_evidence_sufficiency(ctx, *threshold, *min_count, *strict, now)
            }
            Gate::CoherenceCheck { threshold, strict } => {
                evaluate_coherence_check(ctx, *threshold, *strict, now)
            }
            Gate::ReconstructionBound => {
                let within_bound = ctx.steps_completed <= ctx.max_reconstruction_steps;
                GateResult {
                    decision: if within_bound { GateDecision::Pass } else { GateDecision::Fail },
                    kind: GateKind::ReconstructionBound,
                    details: json!({
                        "steps_completed": ctx.steps_completed,
                        "max_reconstruction_steps": ctx.max_reconstruction_steps,
                    }),
                    message: if within_bound {
                        "reconstruction within bound".to_string()
                    } else {
                        format!(
                            "reconstruction exceeded bound: {} > {}",
                            ctx.steps_completed, ctx.max_reconstruction_steps
                        )
                    },
                    timestamp: now,
                }
            }
            Gate::Contradiction => {
                let contradictions = find_contradictions(&ctx.conclusions, &ctx.constraints);
                let decision = if contradictions.is_empty() { GateDecision::Pass } else { GateDecision::Fail };
                GateResult {
                    decision,
                    kind: GateKind::Contradiction,
                    details: json!({ "contradictions": contradictions.clone() }),
                    message: if contradictions.is_empty() {
                        "no contradictions found".to_string()
                    } else {
                        format!("{} contradiction(s) found", contradictions.len())
                    },
                    timestamp: now,
                }
            }
            Gate::Scope => {
                let decision = if ctx.scope_violations.is_empty() { GateDecision::Pass } else { GateDecision::Fail };
                GateResult {
                    decision,
                    kind: GateKind::Scope,
                    details: json!({ "violations": ctx.scope_violations.clone() }),
                    message: if ctx.scope_violations.is_empty() {
                        "scope respected".to_string()
                    } else {
                        format!("{} scope violation(s)", ctx.scope_violations.len())
                    },
                    timestamp: now,
                }
            }
            Gate::Temporal => {
                let decision = if ctx.temporal_violations.is_empty() { GateDecision::Pass } else { GateDecision::Fail };
                GateResult {
                    decision,
                    kind: GateKind::Temporal,
                    details: json!({ "violations": ctx.temporal_violations.clone() }),
                    message: if ctx.temporal_violations.is_empty() {
                        "temporal ordering respected".to_string()
                    } else {
                        format!("{} temporal violation(s)", ctx.temporal_violations.len())
                    },
                    timestamp: now,
                }
            }
            Gate::External { capability } => match external {
                Some(resolver) => resolver.evaluate(capability, ctx),
                None => GateResult {
                    decision: GateDecision::Skip,
                    kind: GateKind::External,
                    details: json!({ "capability": capability }),
                    message: format!("no evaluator registered for capability '{capability}'"),
                    timestamp: now,
                },
            },
        }
    }
}

fn evaluate_evidence_sufficiency(
    ctx: &GateContext,
    threshold: f64,
    min_count: usize,
    strict: bool,
    now: DateTime<Utc>,
) -> GateResult {
    if ctx.evidence.len() < min_count {
        return GateResult {
            decision: if strict { GateDecision::Fail } else { GateDecision::Warn },
            kind: GateKind::EvidenceSufficiency,
            details: json!({ "evidence_count": ctx.evidence.len(), "min_required": min_count }),
            message: format!("insufficient evidence: {} < {}", ctx.evidence.len(), min_count),
            timestamp: now,
        };
    }

    let avg_score = if ctx.evidence_scores.is_empty() {
        0.5
    } else {
        ctx.evidence_scores.iter().sum::<f64>() / ctx.evidence_scores.len() as f64
    };

    let coverage_score = if ctx.required_claims.is_empty() {
        1.0
    } else {
        let covered = ctx
            .required_claims
            .iter()
            .filter(|claim| ctx.evidence.contains(claim))
            .count();
        covered as f64 / ctx.required_claims.len() as f64
    };

    let combined_score = avg_score * 0.6 + coverage_score * 0.4;
    let details = json!({
        "avg_score": avg_score,
        "coverage_score": coverage_score,
        "combined_score": combined_score,
        "evidence_count": ctx.evidence.len(),
    });

    if combined_score >= threshold {
        GateResult {
            decision: GateDecision::Pass,
            kind: GateKind::EvidenceSufficiency,
            details,
            message: format!("evidence sufficient: score={combined_score:.2}"),
            timestamp: now,
        }
    } else if combined_score >= threshold * 0.7 {
        GateResult {
            decision: GateDecision::Warn,
            kind: GateKind::EvidenceSufficiency,
            details,
            message: format!("evidence marginal: score={combined_score:.2} < {threshold}"),
            timestamp: now,
        }
    } else {
        GateResult {
            decision: if strict { GateDecision::Fail } else { GateDecision::Warn },
            kind: GateKind::EvidenceSufficiency,
            details,
            message: format!("evidence insufficient: score={combined_score:.2} < {threshold}"),
            timestamp: now,
        }
    }
}

fn evaluate_coherence_check(
    ctx: &GateContext,
    threshold: f64,
    strict: bool,
    now: DateTime<Utc>,
) -> GateResult {
    let contradictions = find_contradictions(&ctx.conclusions, &ctx.constraints);
    let consistency_score = if contradictions.is_empty() {
        1.0
    } else {
        (1.0 - contradictions.len() as f64 * 0.2).max(0.0)
    };

    let budget_sufficient = ctx.coherence_budget >= threshold;
    let coherence_score = if budget_sufficient { consistency_score } else { consistency_score * 0.5 };

    let details = json!({
        "consistency_score": consistency_score,
        "coherence_budget": ctx.coherence_budget,
        "contradictions_found": contradictions.len(),
        "budget_sufficient": budget_sufficient,
    });

    if coherence_score >= threshold {
        GateResult {
            decision: GateDecision::Pass,
            kind: GateKind::CoherenceCheck,
            details,
            message: format!("coherence check passed: score={coherence_score:.2}"),
            timestamp: now,
        }
    } else if coherence_score >= threshold * 0.7 {
        GateResult {
            decision: GateDecision::Warn,
            kind: GateKind::CoherenceCheck,
            details,
            message: format!("coherence marginal: score={coherence_score:.2}"),
            timestamp: now,
        }
    } else {
        GateResult {
            decision: if strict { GateDecision::Fail } else { GateDecision::Warn },
            kind: GateKind::CoherenceCheck,
            details,
            message: format!("coherence check failed: score={coherence_score:.2}"),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Strict,
    Permissive,
}

/// Coordinates evaluation of an ordered gate list: short-circuits on the
/// first `Fail` (configurable), and under `Enforcement::Strict` a `Warn`
/// also marks the batch as not-all-passed.
pub struct GateManager {
    gates: Vec<Gate>,
    enforcement: Enforcement,
    short_circuit: bool,
    external: Option<Arc<dyn ExternalGateEvaluator>>,
}

impl GateManager {
    pub fn new(gates: Vec<Gate>, enforcement: Enforcement, short_circuit: bool) -> Self {
        Self { gates, enforcement, short_circuit, external: None }
    }

    pub fn with_external_evaluator(mut self, evaluator: Arc<dyn ExternalGateEvaluator>) -> Self {
        self.external = Some(evaluator);
        self
    }

    pub fn default_suite(threshold: f64) -> Self {
        Self::new(
            vec![
                Gate::EvidenceSufficiency { threshold, min_count: 1, strict: true },
                Gate::CoherenceCheck { threshold, strict: true },
            ],
            Enforcement::Strict,
            true,
        )
    }

    pub fn evaluate_all(&self, ctx: &GateContext, clock: &dyn Clock) -> (Vec<GateResult>, bool) {
        let mut results = Vec::with_capacity(self.gates.len());
        let mut all_passed = true;

        for gate in &self.gates {
            let result = gate.evaluate(ctx, clock, self.external.as_deref());
            match result.decision {
                GateDecision::Fail => {
                    all_passed = false;
                    tracing::warn!(kind = ?result.kind, message = %result.message, "gate failed");
                    results.push(result);
                    if self.short_circuit {
                        break;
                    }
                    continue;
                }
                GateDecision::Warn => {
                    if self.enforcement == Enforcement::Strict {
                        all_passed = false;
                    }
                }
                GateDecision::Pass | GateDecision::Skip => {}
            }
            results.push(result);
        }

        (results, all_passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_clock::FixedClock;

    fn clock() -> FixedClock {
        FixedClock::at(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc))
    }

    fn ctx() -> GateContext {
        GateContext {
            evidence: vec!["e1".to_string()],
            evidence_scores: vec![0.9],
            coherence_budget: 1.0,
            max_reconstruction_steps: 10,
            ..Default::default()
        }
    }

    #[test]
    fn evidence_sufficiency_passes_with_high_scores() {
        let gate = Gate::EvidenceSufficiency { threshold: 0.8, min_count: 1, strict: true };
        let result = gate.evaluate(&ctx(), &clock(), None);
        assert_eq!(result.decision, GateDecision::Pass);
    }

    #[test]
    fn evidence_sufficiency_fails_below_min_count() {
        let gate = Gate::EvidenceSufficiency { threshold: 0.8, min_count: 5, strict: true };
        let result = gate.evaluate(&ctx(), &clock(), None);
        assert_eq!(result.decision, GateDecision::Fail);
    }

    #[test]
    fn evidence_sufficiency_non_strict_warns_instead_of_failing() {
        let gate = Gate::EvidenceSufficiency { threshold: 0.8, min_count: 5, strict: false };
        let result = gate.evaluate(&ctx(), &clock(), None);
        assert_eq!(result.decision, GateDecision::Warn);
    }

    #[test]
    fn coherence_check_contradiction_under_tight_budget_fails() {
        let mut c = ctx();
        c.conclusions = vec!["c1".to_string()];
        c.constraints = vec![Constraint { kind: ConstraintKind::MustNot, value: "c1".to_string() }];
        c.coherence_budget = 0.35;
        let gate = Gate::CoherenceCheck { threshold: 0.8, strict: true };
        let result = gate.evaluate(&c, &clock(), None);
        assert_eq!(result.decision, GateDecision::Fail);
    }

    #[test]
    fn coherence_check_passes_with_no_contradictions_and_full_budget() {
        let gate = Gate::CoherenceCheck { threshold: 0.8, strict: true };
        let result = gate.evaluate(&ctx(), &clock(), None);
        assert_eq!(result.decision, GateDecision::Pass);
    }

    #[test]
    fn external_gate_without_resolver_skips() {
        let gate = Gate::External { capability: "custom-check".to_string() };
        let result = gate.evaluate(&ctx(), &clock(), None);
        assert_eq!(result.decision, GateDecision::Skip);
    }

    #[test]
    fn manager_short_circuits_on_first_failure() {
        let manager = GateManager::new(
            vec![
                Gate::EvidenceSufficiency { threshold: 0.8, min_count: 5, strict: true },
                Gate::CoherenceCheck { threshold: 0.8, strict: true },
            ],
            Enforcement::Strict,
            true,
        );
        let (results, all_passed) = manager.evaluate_all(&ctx(), &clock());
        assert_eq!(results.len(), 1);
        assert!(!all_passed);
    }

    #[test]
    fn manager_in_strict_mode_treats_warn_as_not_all_passed() {
        let manager = GateManager::new(
            vec![Gate::EvidenceSufficiency { threshold: 0.95, min_count: 1, strict: false }],
            Enforcement::Strict,
            false,
        );
        let (results, all_passed) = manager.evaluate_all(&ctx(), &clock());
        assert_eq!(results[0].decision, GateDecision::Warn);
        assert!(!all_passed);
    }
}
