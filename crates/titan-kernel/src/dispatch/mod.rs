//! Compute dispatch boundary.
//!
//! A [`ComputeDispatcher`] is whatever actually runs code: a child process, a
//! container, a remote runtime, or the in-process [`SimulatedDispatcher`].
//! The execution engine hands it a [`DispatchRequest`] and an
//! [`OutputSink`], and awaits a [`DispatchOutcome`]. Dispatchers are looked
//! up per environment type through a [`DispatcherRegistry`].
//!
//! ```text
//! ExecutionEngine ──request──▶ ComputeDispatcher
//!        ▲                          │
//!        └──── OutputSink ◀─────────┘  (stamped, ordered events)
//! ```

mod simulated;
mod sink;

pub use simulated::SimulatedDispatcher;
pub use sink::{OutputDraft, OutputSink};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use titan_types::{EnvironmentType, ErrorDetails, ExecutionId, ExecutionMetrics, SessionId};

/// One code submission, as seen by the compute host.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    pub environment: EnvironmentType,
    pub spec_name: String,
    /// Opaque to the kernel.
    pub code: String,
    /// Rich MIME types the session's spec allows.
    pub mime_types: Vec<String>,
    /// Fires when the engine wants the dispatch to stop (interrupt, timeout,
    /// restart, shutdown). Dispatchers should return promptly, ideally with
    /// [`DispatchOutcome::Aborted`].
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    pub fn allows_mime(&self, mime: &str) -> bool {
        self.mime_types.iter().any(|m| m == mime)
    }
}

/// Values reported by a dispatch that ran to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub return_value: Option<Value>,
    pub metrics: Option<ExecutionMetrics>,
}

/// How a dispatch ended, from the host's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The code ran to the end.
    Completed(Completion),
    /// The code raised an uncaught fault.
    Faulted(ErrorDetails),
    /// The dispatch stopped because `cancel` fired.
    Aborted,
}

/// The compute host itself failed (as opposed to the code it ran).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The host could not be reached or died.
    #[error("compute host unavailable: {0}")]
    HostUnavailable(String),

    /// The host sent something the kernel cannot interpret.
    #[error("dispatch protocol error: {0}")]
    Protocol(String),
}

/// Trait for compute hosts.
#[async_trait]
pub trait ComputeDispatcher: Send + Sync {
    /// Dispatcher name, for logs.
    fn name(&self) -> &str;

    /// Run `request.code`, streaming events through `sink`.
    async fn dispatch(
        &self,
        request: DispatchRequest,
        sink: OutputSink,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Dispatchers keyed by environment type, with an optional fallback.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: RwLock<HashMap<EnvironmentType, Arc<dyn ComputeDispatcher>>>,
    fallback: RwLock<Option<Arc<dyn ComputeDispatcher>>>,
}

impl std::fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("environments", &self.environments())
            .field(
                "fallback",
                &self.fallback.read().as_ref().map(|d| d.name().to_string()),
            )
            .finish()
    }
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry where every environment falls back to `dispatcher`.
    pub fn with_fallback(dispatcher: Arc<dyn ComputeDispatcher>) -> Self {
        let registry = Self::new();
        registry.set_fallback(dispatcher);
        registry
    }

    /// Route one environment type to a dispatcher, replacing any previous one.
    pub fn register(&self, environment: EnvironmentType, dispatcher: Arc<dyn ComputeDispatcher>) {
        self.dispatchers.write().insert(environment, dispatcher);
    }

    /// Remove a specific route. Returns whether one existed.
    pub fn remove(&self, environment: EnvironmentType) -> bool {
        self.dispatchers.write().remove(&environment).is_some()
    }

    /// Dispatcher used for environments without a specific route.
    pub fn set_fallback(&self, dispatcher: Arc<dyn ComputeDispatcher>) {
        *self.fallback.write() = Some(dispatcher);
    }

    /// Specific route first, then fallback.
    pub fn resolve(&self, environment: EnvironmentType) -> Option<Arc<dyn ComputeDispatcher>> {
        self.dispatchers
            .read()
            .get(&environment)
            .cloned()
            .or_else(|| self.fallback.read().clone())
    }

    pub fn supports(&self, environment: EnvironmentType) -> bool {
        self.resolve(environment).is_some()
    }

    /// Environments with a specific route.
    pub fn environments(&self) -> Vec<EnvironmentType> {
        let mut envs: Vec<_> = self.dispatchers.read().keys().copied().collect();
        envs.sort_by_key(|e| e.to_string());
        envs
    }
}
