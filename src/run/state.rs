//! Run phase state machine
//!
//! Init → GuardCheck → Discovery → CapacityCheck → KeyResolve
//!      → [Staging] → Publishing → FinalCapacityCheck → Done
//!
//! Any non-terminal phase may move to Failed or Canceled.

use chrono::{DateTime, Utc};

use super::result::{FailureKind, RunResult};

/// Phases of one archive run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    GuardCheck,
    Discovery,
    CapacityCheck,
    KeyResolve,
    Staging,
    Publishing,
    FinalCapacityCheck,
    Done,
    Failed(FailureKind),
    Canceled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed(_) | RunPhase::Canceled)
    }

    /// Check if transition from this phase to `target` is valid
    pub fn can_transition_to(&self, target: RunPhase) -> bool {
        use RunPhase::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(target, Failed(_) | Canceled) {
            return true;
        }

        matches!(
            (self, target),
            (Init, GuardCheck)
                | (GuardCheck, Discovery)
                | (Discovery, CapacityCheck)
                | (CapacityCheck, KeyResolve)
                | (KeyResolve, Staging)
                | (KeyResolve, Publishing)
                | (Staging, Publishing)
                | (Publishing, FinalCapacityCheck)
                | (FinalCapacityCheck, Done)
        )
    }

    /// Terminal phase for a run result
    pub fn terminal_for(result: &RunResult) -> RunPhase {
        match result {
            RunResult::Succeeded | RunResult::SucceededWithWarnings(_) => RunPhase::Done,
            RunResult::Failed { kind, .. } => RunPhase::Failed(*kind),
            RunResult::Canceled => RunPhase::Canceled,
        }
    }
}

/// Errors for phase transitions
#[derive(Debug, thiserror::Error)]
pub enum RunStateError {
    #[error("invalid phase transition from {from:?} to {to:?}")]
    InvalidTransition { from: RunPhase, to: RunPhase },
}

/// Tracks the current phase and when each phase was entered
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    phase: RunPhase,
    history: Vec<(RunPhase, DateTime<Utc>)>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            history: vec![(RunPhase::Init, Utc::now())],
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn history(&self) -> impl Iterator<Item = RunPhase> + '_ {
        self.history.iter().map(|(phase, _)| *phase)
    }

    /// Move to `target`
    pub fn transition(&mut self, target: RunPhase) -> Result<(), RunStateError> {
        if !self.phase.can_transition_to(target) {
            return Err(RunStateError::InvalidTransition {
                from: self.phase,
                to: target,
            });
        }
        self.phase = target;
        self.history.push((target, Utc::now()));
        Ok(())
    }

    /// Enter the terminal phase matching `result`; no-op if already terminal.
    pub fn finish(&mut self, result: &RunResult) {
        let terminal = RunPhase::terminal_for(result);
        if self.phase == terminal {
            return;
        }
        if self.phase.can_transition_to(terminal) {
            self.phase = terminal;
            self.history.push((terminal, Utc::now()));
        }
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
