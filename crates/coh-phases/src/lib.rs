//! The reasoning-phase state machine: a fixed DAG
//! `Acquisition -> Construction -> Reasoning -> Validation -> {Recovery, Terminated}`,
//! `Recovery -> Reasoning | Terminated`, with an ordered transition history.
//! The DAG is compiled in, not configurable — adding a phase is an API
//! change, matching the closed-enum treatment the rest of this workspace
//! gives to gates and hash kinds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coh_clock::Clock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Acquisition,
    Construction,
    Reasoning,
    Validation,
    Recovery,
    Terminated,
}

impl Phase {
    pub fn allowed_successors(&self) -> &'static [Phase] {
        match self {
            Phase::Acquisition => &[Phase::Construction],
            Phase::Construction => &[Phase::Reasoning],
            Phase::Reasoning => &[Phase::Validation],
            Phase::Validation => &[Phase::Recovery, Phase::Terminated],
            Phase::Recovery => &[Phase::Reasoning, Phase::Terminated],
            Phase::Terminated => &[],
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("phase machine already started")]
    AlreadyStarted,
    #[error("phase machine has not been started")]
    NotStarted,
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition { from: Phase, to: Phase },
}

/// One entry in the phase history: `(phase, entered_at, exited_at, reason,
/// steps_completed)` per the data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub steps_completed: u32,
}

pub struct PhaseMachine {
    current: Option<Phase>,
    history: Vec<PhaseRecord>,
    clock: Arc<dyn Clock>,
}

impl PhaseMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            current: None,
            history: Vec::new(),
            clock,
        }
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    pub fn history(&self) -> &[PhaseRecord] {
        &self.history
    }

    /// Enter `Acquisition`, the only legal starting phase.
    pub fn start(&mut self, reason: &str) -> Result<(), PhaseError> {
        if self.current.is_some() {
            return Err(PhaseError::AlreadyStarted);
        }
        let now = self.clock.now();
        self.current = Some(Phase::Acquisition);
        self.history.push(PhaseRecord {
            phase: Phase::Acquisition,
            entered_at: now,
            exited_at: None,
            reason: reason.to_string(),
            steps_completed: 0,
        });
        tracing::info!(phase = ?Phase::Acquisition, "phase machine started");
        Ok(())
    }

    pub fn transition_to(
        &mut self,
        next: Phase,
        reason: &str,
        steps_completed: u32,
    ) -> Result<(), PhaseError> {
        let current = self.current.ok_or(PhaseError::NotStarted)?;
        if !current.allowed_successors().contains(&next) {
            return Err(PhaseError::IllegalTransition { from: current, to: next });
        }

        let now = self.clock.now();
        if let Some(last) = self.history.last_mut() {
            last.exited_at = Some(now);
            last.steps_completed = steps_completed;
        }
        self.current = Some(next);
        self.history.push(PhaseRecord {
            phase: next,
            entered_at: now,
            exited_at: None,
            reason: reason.to_string(),
            steps_completed: 0,
        });
        tracing::info!(from = ?current, to = ?next, reason, "phase transition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_clock::FixedClock;

    fn machine() -> PhaseMachine {
        let clock = Arc::new(FixedClock::ticking_from(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
            chrono::Duration::milliseconds(1),
        ));
        PhaseMachine::new(clock)
    }

    #[test]
    fn happy_path_walks_the_whole_dag() {
        let mut m = machine();
        m.start("begin").unwrap();
        m.transition_to(Phase::Construction, "ok", 1).unwrap();
        m.transition_to(Phase::Reasoning, "ok", 1).unwrap();
        m.transition_to(Phase::Validation, "ok", 1).unwrap();
        m.transition_to(Phase::Terminated, "done", 1).unwrap();
        assert_eq!(m.current(), Some(Phase::Terminated));
        assert_eq!(m.history().len(), 5);
    }

    #[test]
    fn recovery_can_return_to_reasoning() {
        let mut m = machine();
        m.start("begin").unwrap();
        m.transition_to(Phase::Construction, "ok", 1).unwrap();
        m.transition_to(Phase::Reasoning, "ok", 1).unwrap();
        m.transition_to(Phase::Validation, "ok", 1).unwrap();
        m.transition_to(Phase::Recovery, "validation failed", 1).unwrap();
        m.transition_to(Phase::Reasoning, "retry", 1).unwrap();
        assert_eq!(m.current(), Some(Phase::Reasoning));
    }

    #[test]
    fn illegal_skip_is_rejected() {
        let mut m = machine();
        m.start("begin").unwrap();
        let err = m.transition_to(Phase::Reasoning, "skip ahead", 1).unwrap_err();
        assert_eq!(
            err,
            PhaseError::IllegalTransition { from: Phase::Acquisition, to: Phase::Reasoning }
        );
    }

    #[test]
    fn terminated_has_no_successors() {
        assert!(Phase::Terminated.allowed_successors().is_empty());
    }

    #[test]
    fn cannot_transition_before_start() {
        let mut m = machine();
        assert_eq!(
            m.transition_to(Phase::Construction, "x", 0).unwrap_err(),
            PhaseError::NotStarted
        );
    }

    #[test]
    fn history_tracks_entry_and_exit() {
        let mut m = machine();
        m.start("begin").unwrap();
        m.transition_to(Phase::Construction, "ok", 3).unwrap();
        let first = &m.history()[0];
        assert_eq!(first.phase, Phase::Acquisition);
        assert!(first.exited_at.is_some());
        assert_eq!(first.steps_completed, 3);
    }
}
