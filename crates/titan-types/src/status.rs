//! Kernel session status machine.
//!
//! ```text
//! Provisioning ─▶ Starting ─▶ Idle ◀─▶ Busy
//!                              │  ▲     │
//!                              ▼  │     │
//!                           Restarting ◀┘
//!
//! any (but Dead) ─▶ ShuttingDown ─▶ Dead
//! any (but Dead, Error) ─▶ Error
//! ```
//!
//! `Dead` is terminal. Only `Idle` accepts new executions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a kernel session.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KernelStatus {
    /// Host resources are being reserved.
    Provisioning,
    /// The environment process is coming up.
    Starting,
    /// Ready for an execution.
    Idle,
    /// Running exactly one execution.
    Busy,
    /// Tearing down and re-launching the environment.
    Restarting,
    /// Termination requested.
    ShuttingDown,
    /// Gone. No further transitions.
    Dead,
    /// Unrecoverable fault; only shutdown remains.
    Error,
}

impl KernelStatus {
    /// Whether the edge `self → next` exists in the state machine.
    pub fn can_transition_to(self, next: KernelStatus) -> bool {
        use KernelStatus::*;
        match (self, next) {
            (Dead, _) => false,
            (_, ShuttingDown) => self != ShuttingDown,
            (_, Error) => self != Error,
            (Provisioning, Starting) => true,
            (Starting, Idle) => true,
            (Idle, Busy) | (Busy, Idle) => true,
            (Idle | Busy, Restarting) => true,
            (Restarting, Idle) => true,
            (ShuttingDown, Dead) => true,
            _ => false,
        }
    }

    /// Checked transition.
    pub fn transition(self, next: KernelStatus) -> Result<KernelStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }

    /// Only idle sessions accept new executions.
    pub fn accepts_execution(self) -> bool {
        self == KernelStatus::Idle
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == KernelStatus::Dead
    }
}

/// An edge that is not in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: KernelStatus,
    pub to: KernelStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use KernelStatus::*;

    #[test]
    fn test_happy_path() {
        let s = Provisioning.transition(Starting).unwrap();
        let s = s.transition(Idle).unwrap();
        let s = s.transition(Busy).unwrap();
        let s = s.transition(Idle).unwrap();
        let s = s.transition(ShuttingDown).unwrap();
        assert_eq!(s.transition(Dead).unwrap(), Dead);
    }

    #[test]
    fn test_busy_to_busy_is_illegal() {
        let err = Busy.transition(Busy).unwrap_err();
        assert_eq!(err, TransitionError { from: Busy, to: Busy });
        assert_eq!(err.to_string(), "illegal status transition busy -> busy");
    }

    #[test]
    fn test_no_skipping_to_busy() {
        assert!(!Provisioning.can_transition_to(Busy));
        assert!(!Starting.can_transition_to(Busy));
        assert!(!Restarting.can_transition_to(Busy));
    }

    #[test]
    fn test_restart_edges() {
        assert!(Idle.can_transition_to(Restarting));
        assert!(Busy.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Idle));
        assert!(!Starting.can_transition_to(Restarting));
    }

    #[test]
    fn test_dead_is_terminal() {
        for next in KernelStatus::iter() {
            assert!(!Dead.can_transition_to(next), "dead -> {next}");
        }
        assert!(Dead.is_terminal());
    }

    #[test]
    fn test_shutdown_and_error_reachable_from_live_states() {
        for s in KernelStatus::iter().filter(|s| *s != Dead) {
            assert_eq!(s.can_transition_to(ShuttingDown), s != ShuttingDown);
            assert_eq!(s.can_transition_to(Error), s != Error);
        }
    }

    #[test]
    fn test_only_idle_accepts() {
        let accepting: Vec<_> = KernelStatus::iter().filter(|s| s.accepts_execution()).collect();
        assert_eq!(accepting, vec![Idle]);
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(ShuttingDown.to_string(), "shutting_down");
        assert_eq!(
            serde_json::to_string(&ShuttingDown).unwrap(),
            "\"shutting_down\""
        );
        assert_eq!("busy".parse::<KernelStatus>().unwrap(), Busy);
    }
}
