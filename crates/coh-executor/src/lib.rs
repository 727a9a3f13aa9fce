//! The episode executor: runs one reasoning episode end to end by driving
//! the phase machine through its DAG, evaluating the gate suite at every
//! transition, updating the coherence budget from each gate's decision, and
//! emitting a receipt for every step along the way.
//!
//! This crate is the "impure shell" around the pure cores in `coh-gates`,
//! `coh-budget`, and `coh-phases`: the only state it owns across a call is
//! the phase machine and the context accumulated for this one episode. The
//! coherence budget and receipt store are owned by the caller (typically
//! `coh-kernel`) and passed in by mutable reference, since both are meant
//! to persist across many episodes in a session, not reset per episode.

use std::sync::Arc;

use coh_budget::{CoherenceBudget, CoherenceStatus};
use coh_clock::Clock;
use coh_gates::{Constraint, GateContext, GateDecision, GateManager};
use coh_hash::Hash;
use coh_phases::{Phase, PhaseError, PhaseMachine};
use coh_receipts::{Decision, ReceiptDraft, ReceiptError, ReceiptStore, StepKind};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Receipt(#[from] ReceiptError),
}

/// Everything an episode needs to start. `evidence_scores`, when absent,
/// defaults to a flat 0.9 per item, matching the reference kernel's
/// assumption that unscored evidence is presumptively reliable.
#[derive(Debug, Clone)]
pub struct EpisodeRequest {
    pub goal: String,
    pub evidence: Vec<String>,
    pub evidence_scores: Option<Vec<f64>>,
    pub required_claims: Vec<String>,
    pub conclusions: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub max_reconstruction_steps: u32,
}

impl Default for EpisodeRequest {
    fn default() -> Self {
        Self {
            goal: String::new(),
            evidence: Vec::new(),
            evidence_scores: None,
            required_claims: Vec::new(),
            conclusions: Vec::new(),
            constraints: Vec::new(),
            max_reconstruction_steps: 10,
        }
    }
}

/// The abstraction layer (hierarchical summaries built out of completed
/// episodes) is out of scope here; `abstractions_created` is kept as a
/// named field for shape-compatibility with callers that may populate it
/// once that layer exists, but this executor never writes to it.
#[derive(Debug, Clone)]
pub struct EpisodeResult {
    pub episode_id: String,
    pub success: bool,
    pub final_phase: Phase,
    pub abstractions_created: Vec<String>,
    pub receipts_generated: usize,
    pub coherence_status: CoherenceStatus,
    pub duration_ms: i64,
    pub goal: String,
    pub steps_completed: u32,
}

/// Runs episodes against a fixed gate suite. One executor can run many
/// episodes; each gets its own fresh `PhaseMachine` (phase machines can't be
/// restarted) but shares the gate suite and clock across all of them.
pub struct EpisodeExecutor {
    gate_manager: GateManager,
    clock: Arc<dyn Clock>,
    warn_degrade_step: f64,
    strict_mode: bool,
}

const DEFAULT_WARN_DEGRADE_STEP: f64 = 0.02;

impl EpisodeExecutor {
    pub fn new(gate_manager: GateManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            gate_manager,
            clock,
            warn_degrade_step: DEFAULT_WARN_DEGRADE_STEP,
            strict_mode: false,
        }
    }

    pub fn with_warn_degrade_step(mut self, step: f64) -> Self {
        self.warn_degrade_step = step;
        self
    }

    /// Under strict mode, a phase only advances when every gate passed —
    /// the soft `all_passed OR budget.healthy()` progress rule never
    /// overrides an explicit `Warn`. Off by default, since a healthy budget
    /// carrying one marginal warning forward is usually the desired
    /// behavior; callers that need a harder guarantee flip this on.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Runs one episode, mutating `budget` and appending to `receipts` as it
    /// goes. The episode's chain in `receipts` is independently verifiable
    /// afterward via `receipts.verify_episode_chain(&result.episode_id)`.
    pub fn run(
        &self,
        receipts: &mut ReceiptStore,
        budget: &mut CoherenceBudget,
        request: EpisodeRequest,
    ) -> Result<EpisodeResult, ExecutorError> {
        let episode_id = format!("ep-{}", uuid::Uuid::new_v4());
        let start = self.clock.now();

        receipts.emit(
            &episode_id,
            StepKind::EpisodeStart,
            "kernel",
            ReceiptDraft {
                decision: Some(Decision::Pass),
                details: json!({
                    "goal": request.goal,
                    "max_steps": request.max_reconstruction_steps,
                }),
                ..Default::default()
            },
        )?;

        let mut phase_machine = PhaseMachine::new(self.clock.clone());
        phase_machine.start("episode_start")?;

        let evidence_scores = request
            .evidence_scores
            .clone()
            .unwrap_or_else(|| vec![0.9; request.evidence.len()]);

        let mut ctx = GateContext {
            evidence: request.evidence.clone(),
            evidence_scores,
            required_claims: request.required_claims.clone(),
            conclusions: request.conclusions.clone(),
            constraints: request.constraints.clone(),
            coherence_budget: budget.current(),
            max_reconstruction_steps: request.max_reconstruction_steps,
            ..Default::default()
        };

        let mut steps_completed = 0u32;

        let mut success = self.execute_phase(
            Phase::Construction,
            &mut ctx,
            &mut phase_machine,
            budget,
            receipts,
            &episode_id,
            &mut steps_completed,
        )?;

        if success {
            success = self.execute_phase(
                Phase::Reasoning,
                &mut ctx,
                &mut phase_machine,
                budget,
                receipts,
                &episode_id,
                &mut steps_completed,
            )?;
        }

        if success {
            success = self.execute_phase(
                Phase::Validation,
                &mut ctx,
                &mut phase_machine,
                budget,
                receipts,
                &episode_id,
                &mut steps_completed,
            )?;
            if !success {
                // One recovery attempt; its own pass/fail doesn't resurrect
                // `success` for this episode, matching the reference
                // kernel's single-shot fallback.
                self.execute_phase(
                    Phase::Recovery,
                    &mut ctx,
                    &mut phase_machine,
                    budget,
                    receipts,
                    &episode_id,
                    &mut steps_completed,
                )?;
            }
        }

        let duration_ms = (self.clock.now() - start).num_milliseconds();
        let coherence_status = budget.check();

        receipts.emit(
            &episode_id,
            StepKind::EpisodeEnd,
            "kernel",
            ReceiptDraft {
                decision: Some(if success { Decision::Pass } else { Decision::Fail }),
                details: json!({
                    "success": success,
                    "duration_ms": duration_ms,
                    "abstractions_created": 0,
                }),
                ..Default::default()
            },
        )?;

        tracing::info!(episode_id, success, duration_ms, "episode finished");

        Ok(EpisodeResult {
            episode_id: episode_id.clone(),
            success,
            final_phase: phase_machine.current().unwrap_or(Phase::Terminated),
            abstractions_created: Vec::new(),
            receipts_generated: receipts.episode_receipts(&episode_id).len(),
            coherence_status,
            duration_ms,
            goal: request.goal,
            steps_completed,
        })
    }

    /// Transitions into `to`, evaluates the gate suite, emits one
    /// `gate_validation` receipt per gate and one `phase_transition` receipt
    /// for the transition itself, and updates `budget` from each gate
    /// decision (fail degrades by the default step, warn degrades by
    /// `warn_degrade_step`, pass recovers). Returns whether the episode may
    /// keep going: `all_passed OR budget.healthy()`, the soft-progress rule
    /// that lets a healthy budget carry a marginal warning forward.
    fn execute_phase(
        &self,
        to: Phase,
        ctx: &mut GateContext,
        phase_machine: &mut PhaseMachine,
        budget: &mut CoherenceBudget,
        receipts: &mut ReceiptStore,
        episode_id: &str,
        steps_completed: &mut u32,
    ) -> Result<bool, ExecutorError> {
        let from = phase_machine.current();
        phase_machine.transition_to(to, "phase_transition", *steps_completed)?;

        let (results, all_passed) = self.gate_manager.evaluate_all(ctx, self.clock.as_ref());

        let mut gate_receipt_ids: Vec<Hash> = Vec::with_capacity(results.len());
        for result in &results {
            let decision = match result.decision {
                GateDecision::Pass => Decision::Pass,
                GateDecision::Fail => Decision::Fail,
                GateDecision::Warn => Decision::Warn,
                GateDecision::Skip => Decision::Skip,
            };

            let receipt = receipts.emit(
                episode_id,
                StepKind::GateValidation,
                "kernel",
                ReceiptDraft {
                    decision: Some(decision),
                    details: json!({
                        "kind": format!("{:?}", result.kind),
                        "message": result.message,
                        "details": result.details,
                    }),
                    ..Default::default()
                },
            )?;
            gate_receipt_ids.push(receipt.receipt_id);

            match result.decision {
                GateDecision::Fail => budget.degrade(None, &result.message),
                GateDecision::Warn => budget.degrade(Some(self.warn_degrade_step), &result.message),
                GateDecision::Pass => budget.recover(&result.message),
                GateDecision::Skip => {}
            }
        }

        *steps_completed += 1;
        ctx.steps_completed = *steps_completed;
        ctx.coherence_budget = budget.current();

        if !budget.can_proceed() {
            return Ok(false);
        }

        receipts.emit(
            episode_id,
            StepKind::PhaseTransition,
            "kernel",
            ReceiptDraft {
                decision: Some(Decision::Pass),
                details: json!({
                    "from_phase": format!("{:?}", from),
                    "to_phase": format!("{:?}", to),
                    "steps_completed": *steps_completed,
                }),
                parent_receipts: gate_receipt_ids,
                ..Default::default()
            },
        )?;

        Ok(all_passed || (!self.strict_mode && budget.healthy()))
    }
}
