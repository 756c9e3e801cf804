//! The analyzer state machine shared by every control loop.
//!
//! Each transition belongs to exactly one domain and only the component
//! owning that domain may perform it. Transitions are compare-and-swap
//! against the previous state; losing the race is a soft failure that the
//! owning loop re-evaluates on its next tick.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerState {
    Disabled,
    Error,
    Sensing,
    Planned,
    Executing,
    Executed,
    Validating,
}

impl AnalyzerState {
    pub const RUNNING: [AnalyzerState; 4] = [
        AnalyzerState::Planned,
        AnalyzerState::Executing,
        AnalyzerState::Executed,
        AnalyzerState::Validating,
    ];

    pub const PASSIVE: [AnalyzerState; 3] = [
        AnalyzerState::Sensing,
        AnalyzerState::Disabled,
        AnalyzerState::Error,
    ];

    pub fn is_running(&self) -> bool {
        Self::RUNNING.contains(self)
    }

    pub fn is_passive(&self) -> bool {
        Self::PASSIVE.contains(self)
    }
}

impl Display for AnalyzerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let repr = match self {
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Sensing => "sensing",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Validating => "validating",
        };
        write!(f, "{repr}")
    }
}

/// The component allowed to perform a given transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerDomain {
    Admin,
    Sensor,
    Supervisor,
    Validator,
}

impl Display for OwnerDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let repr = match self {
            Self::Admin => "admin",
            Self::Sensor => "sensor",
            Self::Supervisor => "supervisor",
            Self::Validator => "validator",
        };
        write!(f, "{repr}")
    }
}

/// Soft request stored on the analyzer record by admin and honoured by
/// whichever domain owns the analyzer's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wish {
    Cancel,
    Disable,
}

use AnalyzerState::*;
use OwnerDomain::*;

pub const ALLOWED_TRANSITIONS: &[(AnalyzerState, AnalyzerState, OwnerDomain)] = &[
    (Error, Disabled, Admin),
    (Disabled, Error, Admin),
    (Disabled, Sensing, Admin),
    (Disabled, Planned, Admin),
    (Sensing, Error, Sensor),
    (Sensing, Disabled, Sensor),
    (Sensing, Planned, Sensor),
    (Planned, Error, Supervisor),
    (Planned, Executing, Supervisor),
    (Executing, Error, Supervisor),
    (Executing, Executed, Supervisor),
    (Executed, Error, Validator),
    (Executed, Validating, Validator),
    (Validating, Error, Validator),
    (Validating, Sensing, Validator),
];

/// The domain owning a `from -> to` transition, or `None` if the transition
/// is not part of the state machine.
pub fn transition_owner(from: AnalyzerState, to: AnalyzerState) -> Option<OwnerDomain> {
    ALLOWED_TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, domain)| *domain)
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("transition {from} -> {to} is not part of the state machine")]
    NotSupported {
        from: AnalyzerState,
        to: AnalyzerState,
    },
}

pub fn check_transition(from: AnalyzerState, to: AnalyzerState) -> Result<(), TransitionError> {
    match transition_owner(from, to) {
        Some(_) => Ok(()),
        None => Err(TransitionError::NotSupported { from, to }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owners_match_the_domain_table() {
        assert_eq!(transition_owner(Sensing, Planned), Some(Sensor));
        assert_eq!(transition_owner(Planned, Executing), Some(Supervisor));
        assert_eq!(transition_owner(Executing, Executed), Some(Supervisor));
        assert_eq!(transition_owner(Executed, Validating), Some(Validator));
        assert_eq!(transition_owner(Validating, Sensing), Some(Validator));
        assert_eq!(transition_owner(Disabled, Sensing), Some(Admin));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert_eq!(transition_owner(Sensing, Executing), None);
        assert_eq!(transition_owner(Executed, Sensing), None);
        assert_eq!(transition_owner(Error, Sensing), None);
        assert_eq!(transition_owner(Validating, Planned), None);
        assert!(check_transition(Sensing, Executed).is_err());
    }

    #[test]
    fn every_state_is_either_running_or_passive() {
        let all = [
            Disabled, Error, Sensing, Planned, Executing, Executed, Validating,
        ];
        for state in all {
            assert!(state.is_running() ^ state.is_passive());
        }
    }

    #[test]
    fn error_transitions_exist_from_every_state_but_error() {
        for from in [Disabled, Sensing, Planned, Executing, Executed, Validating] {
            assert!(transition_owner(from, Error).is_some(), "{from}");
        }
        assert_eq!(transition_owner(Error, Error), None);
    }
}
