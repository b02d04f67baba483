//! Kernel error types.
//!
//! These are orchestration failures signalled to the immediate caller.
//! Faults raised by dispatched code never appear here: they come back as a
//! terminal [`ExecutionResult`](titan_types::ExecutionResult).

use thiserror::Error;
use titan_types::{KernelStatus, SessionId, TransitionError};

/// Kernel error type.
#[derive(Debug, Error)]
pub enum KernelError {
    /// No spec registered under this name.
    #[error("kernel spec not found: {0}")]
    SpecNotFound(String),

    /// No live session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A spec with this name is already registered.
    #[error("kernel spec already registered: {0}")]
    DuplicateName(String),

    /// Execution requested against a session that is not idle.
    #[error("session {session_id} is {status}, not idle")]
    SessionBusy {
        session_id: SessionId,
        status: KernelStatus,
    },

    /// The host cannot satisfy the spec's resource envelope.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The session could not be brought up.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// A status change outside the state machine.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The session's spec does not support interrupts.
    #[error("kernel spec {0} does not support interrupt")]
    InterruptNotSupported(String),

    /// Interrupt requested but nothing is running.
    #[error("no execution in flight for session {0}")]
    NothingToInterrupt(SessionId),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

impl KernelError {
    /// Create a ResourceExhausted error.
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a ProvisioningFailed error.
    pub fn provisioning_failed(msg: impl Into<String>) -> Self {
        Self::ProvisioningFailed(msg.into())
    }

    /// Either flavour of not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SpecNotFound(_) | Self::SessionNotFound(_))
    }
}

/// Kernel result type.
pub type KernelResult<T> = Result<T, KernelError>;
