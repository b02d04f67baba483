//! Shared setup for titan-kernel integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use titan_kernel::{
    ComputeDispatcher, DispatchError, DispatchOutcome, DispatchRequest, DispatcherRegistry,
    KernelConfig, KernelFlow, KernelHost, KernelSpecRegistry, ManualClock, OutputSink,
    SimulatorConfig, Sources, Subscription,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn deterministic_sources() -> Sources {
    Sources::deterministic(Arc::new(ManualClock::new(1_700_000_000_000)), 0.5)
}

/// Simulated host with no latency.
pub fn instant_config() -> KernelConfig {
    KernelConfig {
        simulator: SimulatorConfig {
            latency_base_ms: 0,
            latency_jitter_ms: 0,
        },
        ..Default::default()
    }
}

pub fn simulated_host(config: KernelConfig) -> Arc<KernelHost> {
    init_tracing();
    Arc::new(KernelHost::new(config, deterministic_sources()))
}

/// Built-in specs, every environment served by `dispatcher`.
pub fn host_with(config: KernelConfig, dispatcher: Arc<dyn ComputeDispatcher>) -> Arc<KernelHost> {
    init_tracing();
    Arc::new(
        KernelHost::builder(config, deterministic_sources())
            .registry(KernelSpecRegistry::with_builtin_specs())
            .dispatchers(DispatcherRegistry::with_fallback(dispatcher))
            .build(),
    )
}

/// Wait until the next output event shows up on the bus.
pub async fn next_output(sub: &mut Subscription<KernelFlow>) {
    let msg = sub.recv().await.expect("flow bus closed");
    assert!(matches!(msg.payload, KernelFlow::Output { .. }));
}

// ============================================================================
// Test dispatchers
// ============================================================================

/// Emits a line, then runs until cancelled and winds down cooperatively.
pub struct Gated;

#[async_trait]
impl ComputeDispatcher for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        sink: OutputSink,
    ) -> Result<DispatchOutcome, DispatchError> {
        sink.stdout("started\n");
        request.cancel.cancelled().await;
        sink.stderr("stopping\n");
        Ok(DispatchOutcome::Aborted)
    }
}

/// Emits a line, then never returns, cancelled or not.
pub struct Unresponsive;

#[async_trait]
impl ComputeDispatcher for Unresponsive {
    fn name(&self) -> &str {
        "unresponsive"
    }

    async fn dispatch(
        &self,
        _request: DispatchRequest,
        sink: OutputSink,
    ) -> Result<DispatchOutcome, DispatchError> {
        sink.stdout("started\n");
        std::future::pending().await
    }
}
