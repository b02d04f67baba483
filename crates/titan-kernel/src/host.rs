//! The kernel host: one process's worth of kernel machinery.
//!
//! A host owns:
//! - A spec registry (which environments exist)
//! - Compute dispatchers (who runs code for each environment)
//! - A session manager (which sessions are live)
//! - An execution engine (what is running right now)
//! - The flow bus and telemetry sink everything reports to

use std::sync::Arc;

use titan_types::{ExecutionId, ExecutionResult, KernelSession, KernelSpec, SessionId};

use crate::config::KernelConfig;
use crate::dispatch::{DispatcherRegistry, SimulatedDispatcher};
use crate::engine::{ExecuteOptions, ExecutionEngine};
use crate::error::KernelResult;
use crate::flows::KernelFlowBus;
use crate::registry::KernelSpecRegistry;
use crate::session_manager::{KernelSessionManager, SessionStore};
use crate::sources::Sources;
use crate::telemetry::TelemetrySink;

/// Wiring for registry, sessions, execution, flows, and telemetry.
pub struct KernelHost {
    config: KernelConfig,
    registry: Arc<KernelSpecRegistry>,
    manager: Arc<KernelSessionManager>,
    engine: ExecutionEngine,
}

impl std::fmt::Debug for KernelHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHost")
            .field("registry", &self.registry)
            .field("manager", &self.manager)
            .field("engine", &self.engine)
            .finish()
    }
}

impl KernelHost {
    /// Built-in specs, every environment served by the simulated host.
    pub fn new(config: KernelConfig, sources: Sources) -> Self {
        let simulated = SimulatedDispatcher::new(config.simulator, Arc::clone(&sources.entropy));
        let dispatchers = DispatcherRegistry::with_fallback(Arc::new(simulated));
        Self::builder(config, sources)
            .registry(KernelSpecRegistry::with_builtin_specs())
            .dispatchers(dispatchers)
            .build()
    }

    /// Start from an empty registry and no dispatchers.
    pub fn builder(config: KernelConfig, sources: Sources) -> KernelHostBuilder {
        KernelHostBuilder {
            config,
            sources,
            registry: KernelSpecRegistry::new(),
            dispatchers: DispatcherRegistry::new(),
            store: None,
        }
    }

    // ========================================================================
    // Components
    // ========================================================================

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<KernelSpecRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<KernelSessionManager> {
        &self.manager
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn flows(&self) -> &KernelFlowBus {
        self.manager.flows()
    }

    pub fn telemetry(&self) -> &Arc<TelemetrySink> {
        self.manager.telemetry()
    }

    pub fn dispatchers(&self) -> &Arc<DispatcherRegistry> {
        self.manager.dispatchers()
    }

    // ========================================================================
    // Specs
    // ========================================================================

    pub fn list_specs(&self) -> Vec<Arc<KernelSpec>> {
        self.registry.list()
    }

    pub fn register_spec(&self, spec: KernelSpec) -> KernelResult<Arc<KernelSpec>> {
        self.registry.register(spec)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Start a session from a registered spec name.
    pub fn start_kernel(
        &self,
        notebook_id: impl Into<String>,
        user_id: impl Into<String>,
        spec_name: &str,
    ) -> KernelResult<KernelSession> {
        let spec = self.registry.get(spec_name)?;
        self.manager.start_kernel(notebook_id, user_id, &spec)
    }

    pub fn get_session(&self, id: SessionId) -> KernelResult<KernelSession> {
        self.manager.get_session(id)
    }

    pub fn list_sessions(&self) -> Vec<KernelSession> {
        self.manager.list_sessions()
    }

    pub fn terminate(&self, id: SessionId) -> KernelResult<KernelSession> {
        self.manager.terminate(id)
    }

    pub fn restart(&self, id: SessionId) -> KernelResult<KernelSession> {
        self.manager.restart(id)
    }

    /// Terminate every live session. Returns how many were stopped.
    pub fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for session in self.manager.list_sessions() {
            match self.manager.terminate(session.id) {
                Ok(_) => stopped += 1,
                // Lost a race with another terminate.
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(session = %session.id, error = %e, "Shutdown skipped session"),
            }
        }
        tracing::info!(stopped, "Kernel host shut down");
        stopped
    }

    // ========================================================================
    // Execution
    // ========================================================================

    pub async fn execute(
        &self,
        session_id: SessionId,
        code: impl Into<String>,
        options: ExecuteOptions,
    ) -> KernelResult<ExecutionResult> {
        self.engine.execute(session_id, code, options).await
    }

    pub fn interrupt(&self, session_id: SessionId) -> KernelResult<ExecutionId> {
        self.engine.interrupt(session_id)
    }

    pub fn history(&self, session_id: SessionId, limit: usize) -> KernelResult<Vec<ExecutionResult>> {
        self.engine.history(session_id, limit)
    }
}

/// Builder for hosts with custom specs, dispatchers, or storage.
pub struct KernelHostBuilder {
    config: KernelConfig,
    sources: Sources,
    registry: KernelSpecRegistry,
    dispatchers: DispatcherRegistry,
    store: Option<Arc<dyn SessionStore>>,
}

impl KernelHostBuilder {
    pub fn registry(mut self, registry: KernelSpecRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dispatchers(mut self, dispatchers: DispatcherRegistry) -> Self {
        self.dispatchers = dispatchers;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> KernelHost {
        let config = self.config;
        let telemetry = Arc::new(TelemetrySink::new(
            config.telemetry.retention,
            Arc::clone(&self.sources.clock),
        ));
        let mut manager = KernelSessionManager::new(self.sources, Arc::new(self.dispatchers))
            .with_capacity(config.host)
            .with_flows(KernelFlowBus::new(config.flows.capacity))
            .with_telemetry(telemetry);
        if let Some(store) = self.store {
            manager = manager.with_store(store);
        }
        let manager = Arc::new(manager);
        let engine = ExecutionEngine::new(Arc::clone(&manager), config.execution);

        tracing::debug!(
            specs = self.registry.len(),
            retention = config.telemetry.retention,
            "Kernel host ready"
        );
        KernelHost {
            config,
            registry: Arc::new(self.registry),
            manager,
            engine,
        }
    }
}
