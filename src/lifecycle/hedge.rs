//! Hedge phase machine.
//!
//! The happy path mirrors the intent flow:
//! `Idle → EnteringPerp → EnteringSpot → Active → ExitingSpot → ExitingPerp
//! → Closed → Idle`. Two recovery edges exist: an entry aborted before the
//! perp filled returns to `Idle`, and a naked perp (spot leg failed) unwinds
//! through `ExitingPerp`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Amount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HedgeState {
    Idle,
    EnteringPerp { intent_id: String },
    EnteringSpot { perp_filled_base: Amount },
    Active { notional_quote: Amount, spot_qty_base: Amount, perp_qty_base: Amount },
    ExitingSpot,
    ExitingPerp,
    Closed { pnl_quote: Amount },
}

impl HedgeState {
    pub fn name(&self) -> &'static str {
        match self {
            HedgeState::Idle => "IDLE",
            HedgeState::EnteringPerp { .. } => "ENTERING_PERP",
            HedgeState::EnteringSpot { .. } => "ENTERING_SPOT",
            HedgeState::Active { .. } => "ACTIVE",
            HedgeState::ExitingSpot => "EXITING_SPOT",
            HedgeState::ExitingPerp => "EXITING_PERP",
            HedgeState::Closed { .. } => "CLOSED",
        }
    }

    /// Whether a hedge is currently on (any non-idle, non-closed phase).
    pub fn is_engaged(&self) -> bool {
        !matches!(self, HedgeState::Idle | HedgeState::Closed { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("hedge transition {from} -> {to} not allowed")]
pub struct HedgeTransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

fn allowed(from: &HedgeState, to: &HedgeState) -> bool {
    use HedgeState::*;
    matches!(
        (from, to),
        (Idle, EnteringPerp { .. })
            | (EnteringPerp { .. }, EnteringSpot { .. })
            | (EnteringPerp { .. }, Idle)
            | (EnteringPerp { .. }, ExitingPerp)
            | (EnteringSpot { .. }, Active { .. })
            | (EnteringSpot { .. }, ExitingPerp)
            | (Active { .. }, ExitingSpot)
            | (ExitingSpot, ExitingPerp)
            | (ExitingPerp, Closed { .. })
            | (Closed { .. }, Idle)
            | (Closed { .. }, EnteringPerp { .. })
    )
}

/// Owns the current hedge phase; transitions only through `transition_to`.
#[derive(Debug)]
pub struct HedgeMachine {
    state: HedgeState,
}

impl Default for HedgeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HedgeMachine {
    pub fn new() -> Self {
        Self { state: HedgeState::Idle }
    }

    pub fn state(&self) -> &HedgeState {
        &self.state
    }

    /// Validate and perform a transition, returning `(from, to)` names for
    /// the audit log.
    pub fn transition_to(
        &mut self,
        next: HedgeState,
    ) -> Result<(&'static str, &'static str), HedgeTransitionError> {
        if !allowed(&self.state, &next) {
            return Err(HedgeTransitionError { from: self.state.name(), to: next.name() });
        }
        let from = self.state.name();
        let to = next.name();
        self.state = next;
        Ok((from, to))
    }
}
