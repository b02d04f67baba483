//! Execution engine.
//!
//! Runs code against a live session. At most one execution is in flight per
//! session: admission flips the session `idle → busy` before the first
//! suspension point, so a second submission racing the first sees
//! `SessionBusy` rather than queueing.
//!
//! While the dispatcher runs, the engine drains its output sink, recording
//! and publishing each event as it arrives, and watches four things:
//!
//! | signal                   | terminal status |
//! |--------------------------|-----------------|
//! | dispatcher returns       | from outcome    |
//! | [`ExecutionEngine::interrupt`] | `interrupted` |
//! | restart / terminate      | `cancelled`     |
//! | timeout                  | `timeout`       |
//!
//! For the last three the dispatch is cancelled and given `interrupt_grace`
//! to wind down. A host that ignores cancellation leaves the session in
//! `error`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use titan_types::{
    ErrorDetails, ExecutionId, ExecutionMetrics, ExecutionResult, ExecutionStatus, KernelSpec,
    KernelStatus, OutputId, OutputMessage, OutputType, ResourceUsage, SessionId, error_content,
};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionConfig;
use crate::dispatch::{
    Completion, ComputeDispatcher, DispatchOutcome, DispatchRequest, OutputDraft, OutputSink,
};
use crate::error::{KernelError, KernelResult};
use crate::flows::{KernelFlow, KernelFlowBus};
use crate::session_manager::{KernelSessionManager, SessionHandle};
use crate::telemetry::TelemetryEvent;

/// Name used in [`ErrorDetails`] when the compute host itself fails.
pub const HOST_FAULT: &str = "HostFault";

/// Per-submission options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    /// Overrides `execution.default_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Stamped on every output event.
    pub cell_id: Option<String>,
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cell_id(mut self, cell_id: impl Into<String>) -> Self {
        self.cell_id = Some(cell_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    TimedOut,
    Cancelled,
}

impl StopReason {
    fn status(self) -> ExecutionStatus {
        match self {
            Self::Interrupted => ExecutionStatus::Interrupted,
            Self::TimedOut => ExecutionStatus::Timeout,
            Self::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

/// What happens to the session once the execution is over.
enum Disposition {
    Release,
    Fail(String),
}

struct InFlight {
    execution_id: ExecutionId,
    interrupt: CancellationToken,
}

/// Everything fixed at admission.
struct Admission {
    handle: Arc<SessionHandle>,
    dispatcher: Arc<dyn ComputeDispatcher>,
    spec: KernelSpec,
    execution_id: ExecutionId,
    started_at: u64,
    interrupt: CancellationToken,
    run_token: CancellationToken,
}

/// Records output events in arrival order and republishes them.
struct Recorder<'a> {
    session_id: SessionId,
    execution_id: ExecutionId,
    flows: &'a KernelFlowBus,
    outputs: Vec<OutputMessage>,
    seen: HashSet<OutputId>,
}

impl<'a> Recorder<'a> {
    fn new(session_id: SessionId, execution_id: ExecutionId, flows: &'a KernelFlowBus) -> Self {
        Self {
            session_id,
            execution_id,
            flows,
            outputs: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn record(&mut self, mut message: OutputMessage) {
        if let Some(parent) = message.parent_id
            && !self.seen.contains(&parent)
        {
            tracing::warn!(
                execution = %self.execution_id,
                %parent,
                "Output names a parent this execution never emitted, dropping the link"
            );
            message.parent_id = None;
        }
        if let Some(id) = message.output_id {
            self.seen.insert(id);
        }
        self.flows.publish(KernelFlow::Output {
            session_id: self.session_id,
            execution_id: self.execution_id,
            message: message.clone(),
        });
        self.outputs.push(message);
    }
}

fn absorb_metrics(usage: &mut ResourceUsage, metrics: &ExecutionMetrics, duration_ms: u64) {
    usage.cpu_time_ms = usage.cpu_time_ms.saturating_add(metrics.cpu_time_ms);
    usage.memory_bytes = usage
        .memory_bytes
        .max(metrics.memory_peak_mb.saturating_mul(1024 * 1024));
    usage.cpu_percent =
        (metrics.cpu_time_ms as f64 * 100.0 / duration_ms.max(1) as f64).min(100.0);
}

/// Accepts code against sessions owned by a [`KernelSessionManager`].
pub struct ExecutionEngine {
    manager: Arc<KernelSessionManager>,
    config: ExecutionConfig,
    in_flight: DashMap<SessionId, InFlight>,
}

impl ExecutionEngine {
    pub fn new(manager: Arc<KernelSessionManager>, config: ExecutionConfig) -> Self {
        Self {
            manager,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<KernelSessionManager> {
        &self.manager
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run `code` in a session and wait for its terminal result.
    ///
    /// Fails only when the submission is refused: unknown session
    /// (`SessionNotFound`) or a session that is not idle (`SessionBusy`).
    /// Faults, interrupts, and timeouts come back as results.
    pub async fn execute(
        &self,
        session_id: SessionId,
        code: impl Into<String>,
        options: ExecuteOptions,
    ) -> KernelResult<ExecutionResult> {
        let admission = self.admit(session_id)?;
        Ok(self.run(admission, code.into(), options).await)
    }

    fn admit(&self, session_id: SessionId) -> KernelResult<Admission> {
        let handle = self.manager.handle(session_id)?;
        let environment = handle.read(|s| s.environment_type);
        let dispatcher = self
            .manager
            .dispatchers()
            .resolve(environment)
            .ok_or_else(|| {
                KernelError::provisioning_failed(format!(
                    "no compute dispatcher for {environment} environments"
                ))
            })?;

        let sources = self.manager.sources();
        let (spec, execution_id, started_at, run_token) = handle.write(|s| {
            if !s.status.accepts_execution() {
                return Err(KernelError::SessionBusy {
                    session_id,
                    status: s.status,
                });
            }
            self.manager.apply_transition(s, KernelStatus::Busy)?;
            let execution_id = sources.execution_id();
            let now = sources.now();
            s.current_execution = Some(execution_id);
            s.touch(now);
            Ok::<_, KernelError>((s.kernel_spec.clone(), execution_id, now, handle.run_token()))
        })?;

        let interrupt = CancellationToken::new();
        self.in_flight.insert(
            session_id,
            InFlight {
                execution_id,
                interrupt: interrupt.clone(),
            },
        );

        tracing::info!(
            session = %session_id,
            execution = %execution_id,
            dispatcher = dispatcher.name(),
            "Execution accepted"
        );
        Ok(Admission {
            handle,
            dispatcher,
            spec,
            execution_id,
            started_at,
            interrupt,
            run_token,
        })
    }

    async fn run(&self, admission: Admission, code: String, options: ExecuteOptions) -> ExecutionResult {
        let Admission {
            handle,
            dispatcher,
            spec,
            execution_id,
            started_at,
            interrupt,
            run_token,
        } = admission;
        let session_id = handle.id();
        let sources = self.manager.sources().clone();

        let dispatch_cancel = CancellationToken::new();
        let request = DispatchRequest {
            execution_id,
            session_id,
            environment: spec.environment_type,
            spec_name: spec.name.clone(),
            code,
            mime_types: spec.rich_output_mime_types.clone(),
            cancel: dispatch_cancel.clone(),
        };
        let (sink, mut rx) = OutputSink::channel(sources.clone(), options.cell_id, started_at);
        let mut recorder = Recorder::new(session_id, execution_id, self.manager.flows());

        let timeout = options.timeout.or_else(|| self.config.default_timeout());
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut dispatch = dispatcher.dispatch(request, sink.clone());
        let mut outcome = None;
        let mut stop = None;

        loop {
            tokio::select! {
                biased;
                Some(message) = rx.recv() => recorder.record(message),
                result = &mut dispatch => {
                    outcome = Some(result);
                    break;
                }
                _ = interrupt.cancelled() => {
                    stop = Some(StopReason::Interrupted);
                    break;
                }
                _ = run_token.cancelled() => {
                    stop = Some(StopReason::Cancelled);
                    break;
                }
                _ = &mut deadline => {
                    stop = Some(StopReason::TimedOut);
                    break;
                }
            }
        }

        if let Some(reason) = stop {
            tracing::info!(session = %session_id, execution = %execution_id, ?reason, "Stopping execution");
            dispatch_cancel.cancel();
            let grace = tokio::time::sleep(self.config.interrupt_grace());
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    biased;
                    Some(message) = rx.recv() => recorder.record(message),
                    result = &mut dispatch => {
                        outcome = Some(result);
                        break;
                    }
                    _ = &mut grace => break,
                }
            }
        }
        drop(dispatch);

        let mut status = ExecutionStatus::Success;
        let mut completion = Completion::default();
        let mut error_details = None;
        let mut disposition = Disposition::Release;

        match (stop, outcome) {
            (Some(reason), Some(Ok(_))) => status = reason.status(),
            (Some(reason), Some(Err(e))) => {
                status = reason.status();
                disposition = Disposition::Fail(format!("compute host failed while stopping: {e}"));
            }
            (Some(reason), None) => {
                status = reason.status();
                disposition = Disposition::Fail(format!(
                    "compute host did not wind down within {:?} after {reason:?}",
                    self.config.interrupt_grace()
                ));
            }
            (None, Some(Ok(DispatchOutcome::Completed(done)))) => completion = done,
            (None, Some(Ok(DispatchOutcome::Faulted(details)))) => {
                status = ExecutionStatus::Error;
                sink.emit(error_output(&details));
                error_details = Some(details);
            }
            (None, Some(Ok(DispatchOutcome::Aborted))) => {
                tracing::warn!(execution = %execution_id, "Dispatcher aborted without being asked");
                status = ExecutionStatus::Cancelled;
            }
            (None, Some(Err(e))) => {
                let details = ErrorDetails::new(HOST_FAULT, e.to_string());
                status = ExecutionStatus::Error;
                sink.emit(error_output(&details));
                error_details = Some(details);
                disposition = Disposition::Fail(e.to_string());
            }
            (None, None) => {
                let details = ErrorDetails::new(HOST_FAULT, "dispatch ended without an outcome");
                status = ExecutionStatus::Error;
                disposition = Disposition::Fail(details.message.clone());
                error_details = Some(details);
            }
        }
        drop(sink);
        while let Ok(message) = rx.try_recv() {
            recorder.record(message);
        }

        let finished_at = sources.now();
        let duration_ms = finished_at.saturating_sub(started_at);
        self.release(&handle, execution_id, &disposition, completion.metrics.as_ref(), finished_at, duration_ms);
        self.in_flight
            .remove_if(&session_id, |_, f| f.execution_id == execution_id);

        let result = ExecutionResult {
            execution_id,
            session_id,
            status,
            outputs: recorder.outputs,
            duration_ms,
            stdout: completion.stdout,
            stderr: completion.stderr,
            return_value: completion.return_value,
            error_details,
            metrics: completion.metrics,
        };
        self.finish(&handle, &spec, &result);
        result
    }

    /// Hand the session back, if this execution still holds it. A restart
    /// that was waiting on this execution completes here.
    fn release(
        &self,
        handle: &SessionHandle,
        execution_id: ExecutionId,
        disposition: &Disposition,
        metrics: Option<&ExecutionMetrics>,
        now: u64,
        duration_ms: u64,
    ) {
        handle.write(|s| {
            // Terminate takes the session away mid-flight.
            if s.current_execution != Some(execution_id)
                || !matches!(s.status, KernelStatus::Busy | KernelStatus::Restarting)
            {
                return;
            }
            s.current_execution = None;
            s.touch(now);

            if s.status == KernelStatus::Restarting {
                match disposition {
                    Disposition::Release => {
                        if let Err(e) = self.manager.complete_restart(s) {
                            tracing::warn!(session = %s.id, error = %e, "Could not finish restart");
                        }
                    }
                    Disposition::Fail(reason) => self.manager.fail(s, reason),
                }
                return;
            }

            if let Some(metrics) = metrics {
                absorb_metrics(&mut s.resource_usage, metrics, duration_ms);
            }
            s.resource_usage.execution_count += 1;
            match disposition {
                Disposition::Release => {
                    if let Err(e) = self.manager.apply_transition(s, KernelStatus::Idle) {
                        tracing::warn!(session = %s.id, error = %e, "Could not release session");
                    }
                }
                Disposition::Fail(reason) => self.manager.fail(s, reason),
            }
        });
    }

    fn finish(&self, handle: &SessionHandle, spec: &KernelSpec, result: &ExecutionResult) {
        handle.record_result(result.clone(), self.config.history_limit);
        self.manager.flows().publish(KernelFlow::ExecutionFinished {
            session_id: result.session_id,
            execution_id: result.execution_id,
            status: result.status,
            duration_ms: result.duration_ms,
        });
        self.manager.telemetry().emit(
            TelemetryEvent::new("execution.finished")
                .with_session(result.session_id)
                .with_property("execution_id", result.execution_id.to_string())
                .with_property("spec", spec.name.as_str())
                .with_property("status", result.status.to_string())
                .with_property("duration_ms", result.duration_ms)
                .with_property("outputs", result.outputs.len()),
        );
        tracing::info!(
            session = %result.session_id,
            execution = %result.execution_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            outputs = result.outputs.len(),
            "Execution finished"
        );
    }

    /// Ask the in-flight execution to stop. Returns its id; the execution
    /// itself ends `interrupted`.
    pub fn interrupt(&self, session_id: SessionId) -> KernelResult<ExecutionId> {
        let handle = self.manager.handle(session_id)?;
        let (supported, spec_name) = handle.read(|s| {
            (s.kernel_spec.supports_interrupt, s.kernel_spec.name.clone())
        });
        if !supported {
            return Err(KernelError::InterruptNotSupported(spec_name));
        }
        let entry = self
            .in_flight
            .get(&session_id)
            .ok_or(KernelError::NothingToInterrupt(session_id))?;
        entry.interrupt.cancel();
        tracing::info!(session = %session_id, execution = %entry.execution_id, "Interrupt requested");
        Ok(entry.execution_id)
    }

    /// The execution currently holding a session busy.
    pub fn in_flight(&self, session_id: SessionId) -> Option<ExecutionId> {
        self.in_flight.get(&session_id).map(|f| f.execution_id)
    }

    /// Up to `limit` most recent results for a session, oldest first.
    pub fn history(&self, session_id: SessionId, limit: usize) -> KernelResult<Vec<ExecutionResult>> {
        Ok(self.manager.handle(session_id)?.history(limit))
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

fn error_output(details: &ErrorDetails) -> OutputDraft {
    OutputDraft::new(
        OutputType::Error,
        error_content(&details.name, &details.message, &details.stacktrace),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchError, DispatcherRegistry, SimulatedDispatcher};
    use crate::sources::{FixedEntropy, ManualClock, Sources};
    use async_trait::async_trait;
    use titan_types::BASELINE_MEMORY_BYTES;

    fn engine_with(dispatcher: Arc<dyn ComputeDispatcher>) -> ExecutionEngine {
        let sources = Sources::deterministic(Arc::new(ManualClock::new(10_000)), 0.5);
        let manager = KernelSessionManager::new(
            sources,
            Arc::new(DispatcherRegistry::with_fallback(dispatcher)),
        );
        ExecutionEngine::new(Arc::new(manager), ExecutionConfig::default())
    }

    fn instant_engine() -> ExecutionEngine {
        engine_with(Arc::new(SimulatedDispatcher::new(
            crate::config::SimulatorConfig {
                latency_base_ms: 0,
                latency_jitter_ms: 0,
            },
            Arc::new(FixedEntropy(0.5)),
        )))
    }

    /// Emits one event pointing at a parent nobody emitted.
    struct DanglingParent;

    #[async_trait]
    impl ComputeDispatcher for DanglingParent {
        fn name(&self) -> &str {
            "dangling"
        }

        async fn dispatch(
            &self,
            _request: DispatchRequest,
            sink: OutputSink,
        ) -> Result<crate::dispatch::DispatchOutcome, DispatchError> {
            let root = sink.stdout("root");
            sink.emit(OutputDraft::new(OutputType::Log, serde_json::json!({})).with_parent(root));
            sink.emit(
                OutputDraft::new(OutputType::Log, serde_json::json!({})).with_parent(OutputId::new()),
            );
            Ok(DispatchOutcome::Completed(Completion::default()))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ComputeDispatcher for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn dispatch(
            &self,
            _request: DispatchRequest,
            _sink: OutputSink,
        ) -> Result<DispatchOutcome, DispatchError> {
            Err(DispatchError::HostUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_success_updates_usage() {
        let engine = instant_engine();
        let session = engine
            .manager()
            .start_kernel("nb", "u", &KernelSpec::python3())
            .unwrap();

        let result = engine
            .execute(session.id, "1+1", ExecuteOptions::default().with_cell_id("c1"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.outputs.iter().all(|o| o.cell_id.as_deref() == Some("c1")));

        let after = engine.manager().get_session(session.id).unwrap();
        assert_eq!(after.status, KernelStatus::Idle);
        assert_eq!(after.current_execution, None);
        assert_eq!(after.resource_usage.execution_count, 1);
        assert_eq!(after.resource_usage.cpu_time_ms, 150);
        assert_eq!(after.resource_usage.memory_bytes, BASELINE_MEMORY_BYTES);
        assert!(engine.in_flight(session.id).is_none());
    }

    #[tokio::test]
    async fn test_dangling_parent_is_stripped() {
        let engine = engine_with(Arc::new(DanglingParent));
        let session = engine
            .manager()
            .start_kernel("nb", "u", &KernelSpec::sql())
            .unwrap();
        let result = engine
            .execute(session.id, "select 1", ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.outputs.len(), 3);
        assert_eq!(result.outputs[1].parent_id, result.outputs[0].output_id);
        assert_eq!(result.outputs[2].parent_id, None);
    }

    #[tokio::test]
    async fn test_host_fault_fails_session() {
        let engine = engine_with(Arc::new(Unreachable));
        let session = engine
            .manager()
            .start_kernel("nb", "u", &KernelSpec::sql())
            .unwrap();
        let result = engine
            .execute(session.id, "select 1", ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_details.as_ref().unwrap().name, HOST_FAULT);
        assert_eq!(result.outputs.last().unwrap().output_type, OutputType::Error);
        assert_eq!(
            engine.manager().get_session(session.id).unwrap().status,
            KernelStatus::Error
        );

        let err = engine
            .execute(session.id, "select 2", ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::SessionBusy {
                status: KernelStatus::Error,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_interrupt_when_idle() {
        let engine = instant_engine();
        let session = engine
            .manager()
            .start_kernel("nb", "u", &KernelSpec::python3())
            .unwrap();
        let err = engine.interrupt(session.id).unwrap_err();
        assert!(matches!(err, KernelError::NothingToInterrupt(_)));
    }

    #[tokio::test]
    async fn test_interrupt_unsupported() {
        let engine = instant_engine();
        let spec = KernelSpec::python3().with_interrupt(false);
        let session = engine.manager().start_kernel("nb", "u", &spec).unwrap();
        let err = engine.interrupt(session.id).unwrap_err();
        assert!(matches!(err, KernelError::InterruptNotSupported(ref n) if n == "python3"));
    }

    #[test]
    fn test_absorb_metrics() {
        let mut usage = ResourceUsage::baseline();
        absorb_metrics(
            &mut usage,
            &ExecutionMetrics {
                cpu_time_ms: 50,
                memory_peak_mb: 512,
            },
            100,
        );
        assert_eq!(usage.cpu_time_ms, 50);
        assert_eq!(usage.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(usage.cpu_percent, 50.0);
    }

    #[test]
    fn test_absorb_metrics_saturates() {
        let mut usage = ResourceUsage::baseline();
        usage.cpu_time_ms = u64::MAX - 1;
        absorb_metrics(
            &mut usage,
            &ExecutionMetrics {
                cpu_time_ms: 10,
                memory_peak_mb: u64::MAX,
            },
            1,
        );
        assert_eq!(usage.cpu_time_ms, u64::MAX);
        assert_eq!(usage.memory_bytes, u64::MAX);
        assert_eq!(usage.cpu_percent, 100.0);
    }
}
