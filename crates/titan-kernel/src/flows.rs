//! Kernel event bus.
//!
//! Observers (UIs, the CLI, the telemetry sink) learn about status changes,
//! output events, and finished executions by subscribing here rather than
//! polling. Subjects are dot-separated and subscribers filter with
//! NATS-style patterns:
//!
//! - `*` matches exactly one token: `kernel.*` matches `kernel.status`
//! - `>` matches one or more trailing tokens: `kernel.>` matches everything
//!   under `kernel`
//!
//! Publishing never blocks. A subscriber that falls more than `capacity`
//! messages behind loses the oldest ones and logs a warning.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use titan_types::{ExecutionId, ExecutionStatus, KernelStatus, OutputMessage, SessionId};

pub const SUBJECT_STATUS: &str = "kernel.status";
pub const SUBJECT_OUTPUT: &str = "kernel.output";
pub const SUBJECT_EXECUTION: &str = "kernel.execution";

/// NATS-style subject match.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.').peekable();
    let mut subject = subject.split('.');

    while let Some(token) = pattern.next() {
        match (token, subject.next()) {
            // Tail wildcard: only valid last, needs at least one token.
            (">", Some(_)) => return pattern.peek().is_none(),
            (_, None) => return false,
            ("*", Some(_)) => {}
            (literal, Some(actual)) if literal == actual => {}
            _ => return false,
        }
    }
    subject.next().is_none()
}

/// Payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

/// A message on the bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    pub subject: String,
    pub payload: T,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T) -> Self {
        Self {
            subject: payload.subject().to_string(),
            payload,
        }
    }
}

/// Everything the kernel announces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelFlow {
    /// A session moved along the status machine.
    StatusChanged {
        session_id: SessionId,
        from: KernelStatus,
        to: KernelStatus,
    },
    /// One stamped output event, in emission order.
    Output {
        session_id: SessionId,
        execution_id: ExecutionId,
        message: OutputMessage,
    },
    /// An execution reached its terminal status.
    ExecutionFinished {
        session_id: SessionId,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: u64,
    },
}

impl KernelFlow {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::StatusChanged { session_id, .. }
            | Self::Output { session_id, .. }
            | Self::ExecutionFinished { session_id, .. } => *session_id,
        }
    }
}

impl HasSubject for KernelFlow {
    fn subject(&self) -> &str {
        match self {
            Self::StatusChanged { .. } => SUBJECT_STATUS,
            Self::Output { .. } => SUBJECT_OUTPUT,
            Self::ExecutionFinished { .. } => SUBJECT_EXECUTION,
        }
    }
}

/// Broadcast bus for one payload type.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload)).unwrap_or(0)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

/// Kernel flow bus.
pub type KernelFlowBus = FlowBus<KernelFlow>;

/// Pattern-filtered receiver.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if matches_pattern(&self.pattern, &msg.subject) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(pattern = %self.pattern, skipped, "Kernel flow subscriber lagged");
                }
            }
        }
    }

    /// Next matching message if one is already queued.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if matches_pattern(&self.pattern, &msg.subject) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(pattern = %self.pattern, skipped, "Kernel flow subscriber lagged");
                }
            }
        }
    }

    /// Drain everything currently queued that matches.
    pub fn drain(&mut self) -> Vec<FlowMessage<T>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}
