//! Kernel session lifecycle.
//!
//! The manager owns every live session. Each one sits behind a
//! [`SessionHandle`]: the mutable [`KernelSession`] under a lock, a run token
//! that restart and terminate cancel, and a bounded history of finished
//! executions. Callers only ever get cloned snapshots.
//!
//! All status changes go through [`KernelSessionManager::apply_transition`],
//! which checks the edge and publishes it on the flow bus while the session
//! lock is still held, so subscribers see a session's transitions in the
//! order they happened.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use titan_types::{
    ExecutionResult, KernelSession, KernelSpec, KernelStatus, ResourceEnvelope, ResourceUsage,
    SessionId, TransitionError,
};
use tokio_util::sync::CancellationToken;

use crate::config::HostCapacity;
use crate::dispatch::DispatcherRegistry;
use crate::error::{KernelError, KernelResult};
use crate::flows::{KernelFlow, KernelFlowBus};
use crate::sources::Sources;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

// ============================================================================
// Session handle
// ============================================================================

/// Shared state for one live session.
pub struct SessionHandle {
    state: RwLock<KernelSession>,
    run_token: Mutex<CancellationToken>,
    history: Mutex<VecDeque<ExecutionResult>>,
}

impl SessionHandle {
    pub fn new(session: KernelSession) -> Self {
        Self {
            state: RwLock::new(session),
            run_token: Mutex::new(CancellationToken::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.state.read().id
    }

    /// Consistent copy of the session.
    pub fn snapshot(&self) -> KernelSession {
        self.state.read().clone()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&KernelSession) -> R) -> R {
        f(&self.state.read())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut KernelSession) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Token that fires when the session is restarted or terminated.
    pub(crate) fn run_token(&self) -> CancellationToken {
        self.run_token.lock().clone()
    }

    /// Cancel whatever is running and install a fresh token.
    fn rotate_run_token(&self) {
        let mut token = self.run_token.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    pub(crate) fn record_result(&self, result: ExecutionResult, limit: usize) {
        if limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= limit {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Up to `limit` newest results, oldest first.
    pub fn history(&self, limit: usize) -> Vec<ExecutionResult> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SessionHandle")
            .field("id", &state.id)
            .field("status", &state.status)
            .field("history", &self.history.lock().len())
            .finish()
    }
}

// ============================================================================
// Session store
// ============================================================================

/// Where live sessions are kept.
pub trait SessionStore: Send + Sync {
    fn insert(&self, handle: Arc<SessionHandle>);
    fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>>;
    fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>>;
    fn all(&self) -> Vec<Arc<SessionHandle>>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, handle: Arc<SessionHandle>) {
        self.sessions.insert(handle.id(), handle);
    }

    fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    fn all(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns session lifecycle: start, lookup, list, restart, terminate.
pub struct KernelSessionManager {
    store: Arc<dyn SessionStore>,
    dispatchers: Arc<DispatcherRegistry>,
    flows: KernelFlowBus,
    telemetry: Arc<TelemetrySink>,
    sources: Sources,
    capacity: HostCapacity,
    /// Serializes the capacity check with the insert.
    admission: Mutex<()>,
}

impl KernelSessionManager {
    /// In-memory store, unlimited capacity, default bus and telemetry sizes.
    pub fn new(sources: Sources, dispatchers: Arc<DispatcherRegistry>) -> Self {
        let telemetry = Arc::new(TelemetrySink::new(50, Arc::clone(&sources.clock)));
        Self {
            store: Arc::new(InMemorySessionStore::new()),
            dispatchers,
            flows: KernelFlowBus::new(1024),
            telemetry,
            sources,
            capacity: HostCapacity::default(),
            admission: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_capacity(mut self, capacity: HostCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_flows(mut self, flows: KernelFlowBus) -> Self {
        self.flows = flows;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn flows(&self) -> &KernelFlowBus {
        &self.flows
    }

    pub fn telemetry(&self) -> &Arc<TelemetrySink> {
        &self.telemetry
    }

    pub fn dispatchers(&self) -> &Arc<DispatcherRegistry> {
        &self.dispatchers
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn capacity(&self) -> HostCapacity {
        self.capacity
    }

    /// Checked status change, published before the session lock is released.
    /// Returns the previous status.
    pub(crate) fn apply_transition(
        &self,
        session: &mut KernelSession,
        next: KernelStatus,
    ) -> Result<KernelStatus, TransitionError> {
        let from = session.transition(next)?;
        tracing::debug!(session = %session.id, %from, to = %next, "Kernel status changed");
        self.flows.publish(KernelFlow::StatusChanged {
            session_id: session.id,
            from,
            to: next,
        });
        Ok(from)
    }

    pub(crate) fn handle(&self, id: SessionId) -> KernelResult<Arc<SessionHandle>> {
        self.store.get(id).ok_or(KernelError::SessionNotFound(id))
    }

    /// Sum of the envelopes of every live session.
    fn reserved(&self) -> ResourceEnvelope {
        self.store
            .all()
            .iter()
            .fold(ResourceEnvelope::default(), |mut acc, handle| {
                handle.read(|s| {
                    let r = &s.kernel_spec.resources;
                    acc.cpu_cores += r.cpu_cores;
                    acc.memory_gb += r.memory_gb;
                    if let Some(gpus) = r.gpu_count {
                        acc.gpu_count = Some(acc.gpu_count.unwrap_or(0) + gpus);
                    }
                    if let Some(tpus) = r.tpu_count {
                        acc.tpu_count = Some(acc.tpu_count.unwrap_or(0) + tpus);
                    }
                });
                acc
            })
    }

    /// Start a session of `spec` for a notebook and its owner.
    ///
    /// The session walks `provisioning → starting → idle` before it is
    /// registered; a failure at any step leaves nothing behind.
    pub fn start_kernel(
        &self,
        notebook_id: impl Into<String>,
        user_id: impl Into<String>,
        spec: &KernelSpec,
    ) -> KernelResult<KernelSession> {
        if !spec.resources.is_valid() {
            return Err(KernelError::provisioning_failed(format!(
                "spec {} declares an invalid resource envelope",
                spec.name
            )));
        }
        if !self.dispatchers.supports(spec.environment_type) {
            return Err(KernelError::provisioning_failed(format!(
                "no compute dispatcher for {} environments",
                spec.environment_type
            )));
        }

        let _admission = self.admission.lock();
        if let Some(shortfall) = self.capacity.shortfall(&self.reserved(), &spec.resources) {
            tracing::warn!(spec = %spec.name, %shortfall, "Kernel start rejected");
            return Err(KernelError::resource_exhausted(shortfall));
        }

        let now = self.sources.now();
        let mut session = KernelSession::provisioning(
            self.sources.session_id(),
            notebook_id,
            user_id,
            spec.clone(),
            now,
        );
        self.apply_transition(&mut session, KernelStatus::Starting)?;
        self.apply_transition(&mut session, KernelStatus::Idle)?;

        let snapshot = session.clone();
        self.store.insert(Arc::new(SessionHandle::new(session)));

        tracing::info!(
            session = %snapshot.id,
            spec = %spec.name,
            notebook = %snapshot.notebook_id,
            user = %snapshot.user_id,
            "Kernel session started"
        );
        self.telemetry.emit(
            TelemetryEvent::new("session.started")
                .with_session(snapshot.id)
                .with_property("spec", spec.name.as_str())
                .with_property("notebook_id", snapshot.notebook_id.as_str()),
        );
        Ok(snapshot)
    }

    pub fn get_session(&self, id: SessionId) -> KernelResult<KernelSession> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Every live session, ordered by start time then id.
    pub fn list_sessions(&self) -> Vec<KernelSession> {
        let mut sessions: Vec<_> = self.store.all().iter().map(|h| h.snapshot()).collect();
        sessions.sort_by_key(|s| (s.start_time, s.id));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    /// Shut a session down and forget it. An in-flight execution is
    /// cancelled. A second call for the same id reports `SessionNotFound`.
    pub fn terminate(&self, id: SessionId) -> KernelResult<KernelSession> {
        let handle = self.handle(id)?;

        handle.write(|s| {
            if matches!(s.status, KernelStatus::ShuttingDown | KernelStatus::Dead) {
                return Err(KernelError::SessionNotFound(id));
            }
            self.apply_transition(s, KernelStatus::ShuttingDown)?;
            handle.rotate_run_token();
            Ok::<_, KernelError>(())
        })?;

        let now = self.sources.now();
        let snapshot = handle.write(|s| {
            self.apply_transition(s, KernelStatus::Dead)?;
            s.current_execution = None;
            s.touch(now);
            Ok::<_, KernelError>(s.clone())
        })?;
        self.store.remove(id);

        tracing::info!(session = %id, "Kernel session terminated");
        self.telemetry.emit(
            TelemetryEvent::new("session.terminated")
                .with_session(id)
                .with_property("executions", snapshot.resource_usage.execution_count),
        );
        Ok(snapshot)
    }

    /// Relaunch the environment: `idle|busy → restarting → idle`. Usage
    /// resets to baseline.
    ///
    /// An in-flight execution is cancelled and keeps the session in
    /// `restarting` until it ends; the engine then finishes the restart, or
    /// fails the session if the host does not wind down. The returned
    /// snapshot shows `restarting` in that case.
    pub fn restart(&self, id: SessionId) -> KernelResult<KernelSession> {
        let handle = self.handle(id)?;
        let now = self.sources.now();

        let snapshot = handle.write(|s| {
            let from = self.apply_transition(s, KernelStatus::Restarting)?;
            handle.rotate_run_token();
            s.touch(now);
            match s.current_execution {
                Some(execution) => tracing::info!(
                    session = %id,
                    %execution,
                    %from,
                    "Restart waits for in-flight execution to stop"
                ),
                None => self.complete_restart(s)?,
            }
            Ok::<_, KernelError>(s.clone())
        })?;
        Ok(snapshot)
    }

    /// `restarting → idle` with fresh usage.
    pub(crate) fn complete_restart(&self, session: &mut KernelSession) -> Result<(), TransitionError> {
        session.resource_usage = ResourceUsage::baseline();
        self.apply_transition(session, KernelStatus::Idle)?;
        tracing::info!(session = %session.id, "Kernel session restarted");
        self.telemetry
            .emit(TelemetryEvent::new("session.restarted").with_session(session.id));
        Ok(())
    }

    /// Attach a client. `Ok(false)` if it was already attached.
    pub fn attach_client(&self, id: SessionId, client: impl Into<String>) -> KernelResult<bool> {
        let now = self.sources.now();
        let added = self.handle(id)?.write(|s| {
            s.touch(now);
            s.attach_client(client)
        });
        Ok(added)
    }

    /// Detach a client. `Ok(false)` if it was not attached.
    pub fn detach_client(&self, id: SessionId, client: &str) -> KernelResult<bool> {
        let now = self.sources.now();
        let removed = self.handle(id)?.write(|s| {
            s.touch(now);
            s.detach_client(client)
        });
        Ok(removed)
    }

    /// Mark a session `error` from whatever state it is in.
    pub(crate) fn fail(&self, session: &mut KernelSession, reason: &str) {
        match self.apply_transition(session, KernelStatus::Error) {
            Ok(_) => {
                tracing::error!(session = %session.id, %reason, "Kernel session failed");
                self.telemetry.emit(
                    TelemetryEvent::new("session.failed")
                        .with_session(session.id)
                        .with_property("reason", json!(reason)),
                );
            }
            Err(e) => tracing::debug!(session = %session.id, error = %e, "Session already failed"),
        }
    }
}

impl std::fmt::Debug for KernelSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSessionManager")
            .field("sessions", &self.store.len())
            .field("capacity", &self.capacity)
            .field("dispatchers", &self.dispatchers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SimulatedDispatcher;
    use crate::flows::SUBJECT_STATUS;
    use crate::sources::{FixedEntropy, ManualClock};
    use std::time::Duration;
    use titan_types::{EnvironmentType, ExecutionId};

    fn manager_with(clock: Arc<ManualClock>) -> KernelSessionManager {
        let sources = Sources::deterministic(clock, 0.5);
        let dispatchers = Arc::new(DispatcherRegistry::with_fallback(Arc::new(
            SimulatedDispatcher::new(Default::default(), Arc::new(FixedEntropy(0.5))),
        )));
        KernelSessionManager::new(sources, dispatchers)
    }

    fn manager() -> KernelSessionManager {
        manager_with(Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn test_start_kernel_reaches_idle() {
        let mgr = manager();
        let mut statuses = mgr.flows().subscribe(SUBJECT_STATUS);

        let session = mgr.start_kernel("nb-1", "ada", &KernelSpec::python3()).unwrap();
        assert_eq!(session.status, KernelStatus::Idle);
        assert_eq!(session.connected_clients, vec!["ada"]);
        assert_eq!(session.environment_type, EnvironmentType::Python3);
        assert_eq!(session.start_time, 1_000);
        assert_eq!(session.last_activity, 1_000);
        assert_eq!(session.resource_usage, ResourceUsage::baseline());

        let seen: Vec<KernelStatus> = statuses
            .drain()
            .into_iter()
            .map(|m| match m.payload {
                KernelFlow::StatusChanged { to, .. } => to,
                other => panic!("unexpected flow {other:?}"),
            })
            .collect();
        assert_eq!(seen, vec![KernelStatus::Starting, KernelStatus::Idle]);
        assert_eq!(mgr.get_session(session.id).unwrap(), session);
    }

    #[test]
    fn test_empty_manager_lists_nothing() {
        assert!(manager().list_sessions().is_empty());
    }

    #[test]
    fn test_list_is_ordered_by_start_time() {
        let clock = Arc::new(ManualClock::new(0));
        let mgr = manager_with(Arc::clone(&clock));
        clock.set(500);
        let late = mgr.start_kernel("nb", "u", &KernelSpec::sql()).unwrap();
        clock.set(100);
        let early = mgr.start_kernel("nb", "u", &KernelSpec::sql()).unwrap();

        let ids: Vec<SessionId> = mgr.list_sessions().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[test]
    fn test_unknown_session() {
        let err = manager().get_session(SessionId::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_no_dispatcher_fails_provisioning() {
        let sources = Sources::deterministic(Arc::new(ManualClock::new(0)), 0.0);
        let mgr = KernelSessionManager::new(sources, Arc::new(DispatcherRegistry::new()));
        let err = mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap_err();
        assert!(matches!(err, KernelError::ProvisioningFailed(_)));
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_invalid_envelope_fails_provisioning() {
        let spec = KernelSpec::python3().with_resources(ResourceEnvelope::new(-1.0, 1.0));
        let err = manager().start_kernel("nb", "u", &spec).unwrap_err();
        assert!(matches!(err, KernelError::ProvisioningFailed(_)));
    }

    #[test]
    fn test_capacity_exhaustion_registers_nothing() {
        let mgr = manager().with_capacity(HostCapacity {
            cpu_cores: Some(3.0),
            ..Default::default()
        });
        mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap();
        mgr.start_kernel("nb", "u", &KernelSpec::sql()).unwrap();

        let err = mgr.start_kernel("nb", "u", &KernelSpec::sql()).unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted(_)));
        assert_eq!(mgr.session_count(), 2);
    }

    #[test]
    fn test_terminate_then_not_found() {
        let mgr = manager();
        let session = mgr.start_kernel("nb", "u", &KernelSpec::sql()).unwrap();

        let last = mgr.terminate(session.id).unwrap();
        assert_eq!(last.status, KernelStatus::Dead);
        assert!(mgr.get_session(session.id).unwrap_err().is_not_found());
        assert!(mgr.terminate(session.id).unwrap_err().is_not_found());
        assert!(mgr.list_sessions().is_empty());
    }

    #[test]
    fn test_terminate_frees_capacity() {
        let mgr = manager().with_capacity(HostCapacity {
            memory_gb: Some(4.0),
            ..Default::default()
        });
        let first = mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap();
        assert!(mgr.start_kernel("nb", "u", &KernelSpec::python3()).is_err());
        mgr.terminate(first.id).unwrap();
        assert!(mgr.start_kernel("nb", "u", &KernelSpec::python3()).is_ok());
    }

    #[test]
    fn test_terminate_cancels_run_token() {
        let mgr = manager();
        let session = mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap();
        let token = mgr.handle(session.id).unwrap().run_token();
        mgr.terminate(session.id).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_restart_resets_usage_and_rotates_token() {
        let clock = Arc::new(ManualClock::new(0));
        let mgr = manager_with(Arc::clone(&clock));
        let session = mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap();
        let handle = mgr.handle(session.id).unwrap();
        handle.write(|s| s.resource_usage.execution_count = 7);
        let old = handle.run_token();

        clock.advance(Duration::from_millis(10));
        let restarted = mgr.restart(session.id).unwrap();
        assert_eq!(restarted.status, KernelStatus::Idle);
        assert_eq!(restarted.resource_usage.execution_count, 0);
        assert_eq!(restarted.last_activity, 10);
        assert!(old.is_cancelled());
        assert!(!handle.run_token().is_cancelled());
    }

    #[test]
    fn test_restart_of_busy_session_waits_for_execution() {
        let mgr = manager();
        let session = mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap();
        let handle = mgr.handle(session.id).unwrap();
        let execution = ExecutionId::new();
        handle.write(|s| {
            mgr.apply_transition(s, KernelStatus::Busy).unwrap();
            s.current_execution = Some(execution);
        });
        let token = handle.run_token();

        let pending = mgr.restart(session.id).unwrap();
        assert_eq!(pending.status, KernelStatus::Restarting);
        assert_eq!(pending.current_execution, Some(execution));
        assert!(token.is_cancelled());
        assert!(!pending.status.accepts_execution());
        let restarted = |mgr: &KernelSessionManager| {
            mgr.telemetry()
                .recent_events(10)
                .iter()
                .any(|e| e.name == "session.restarted")
        };
        assert!(!restarted(&mgr));

        handle.write(|s| {
            s.current_execution = None;
            mgr.complete_restart(s).unwrap();
        });
        assert_eq!(mgr.get_session(session.id).unwrap().status, KernelStatus::Idle);
        assert!(restarted(&mgr));
    }

    #[test]
    fn test_restart_from_error_is_rejected() {
        let mgr = manager();
        let session = mgr.start_kernel("nb", "u", &KernelSpec::python3()).unwrap();
        mgr.handle(session.id)
            .unwrap()
            .write(|s| mgr.fail(s, "test"));
        let err = mgr.restart(session.id).unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition(_)));
    }

    #[test]
    fn test_attach_detach_are_idempotent() {
        let mgr = manager();
        let session = mgr.start_kernel("nb", "ada", &KernelSpec::sql()).unwrap();
        assert!(mgr.attach_client(session.id, "bob").unwrap());
        assert!(!mgr.attach_client(session.id, "bob").unwrap());
        assert!(mgr.detach_client(session.id, "ada").unwrap());
        assert!(!mgr.detach_client(session.id, "ada").unwrap());
        assert_eq!(mgr.get_session(session.id).unwrap().connected_clients, vec!["bob"]);
    }

    #[test]
    fn test_history_bounded() {
        let handle = SessionHandle::new(KernelSession::provisioning(
            SessionId::new(),
            "nb",
            "u",
            KernelSpec::sql(),
            0,
        ));
        for i in 0..5u64 {
            handle.record_result(
                ExecutionResult {
                    execution_id: titan_types::ExecutionId::new(),
                    session_id: handle.id(),
                    status: titan_types::ExecutionStatus::Success,
                    outputs: Vec::new(),
                    duration_ms: i,
                    stdout: None,
                    stderr: None,
                    return_value: None,
                    error_details: None,
                    metrics: None,
                },
                3,
            );
        }
        let durations: Vec<u64> = handle.history(10).iter().map(|r| r.duration_ms).collect();
        assert_eq!(durations, vec![2, 3, 4]);
        assert_eq!(handle.history(1)[0].duration_ms, 4);
    }

    #[test]
    fn test_lifecycle_telemetry() {
        let mgr = manager();
        let session = mgr.start_kernel("nb", "u", &KernelSpec::sql()).unwrap();
        mgr.terminate(session.id).unwrap();
        let names: Vec<String> = mgr
            .telemetry()
            .recent_events(10)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["session.started", "session.terminated"]);
    }
}
