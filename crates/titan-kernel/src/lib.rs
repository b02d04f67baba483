//! # titan-kernel
//!
//! Kernel session core for titan.
//!
//! A kernel session is a long-lived, interruptible compute environment bound
//! to a notebook. This crate:
//! - Catalogs environments ([`KernelSpecRegistry`])
//! - Starts, lists, restarts, and terminates sessions ([`KernelSessionManager`])
//! - Runs code with one execution in flight per session ([`ExecutionEngine`])
//! - Hands the actual work to a [`ComputeDispatcher`] per environment
//! - Publishes status, output, and completion events on a [`KernelFlowBus`]
//! - Keeps a bounded [`TelemetrySink`]
//!
//! [`KernelHost`] wires all of it from a [`KernelConfig`] and a set of
//! injected [`Sources`] (clock, ids, entropy).

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flows;
pub mod host;
pub mod registry;
pub mod session_manager;
pub mod sources;
pub mod telemetry;

pub use config::{
    ExecutionConfig, FlowConfig, HostCapacity, KernelConfig, SimulatorConfig, TelemetryConfig,
};
pub use dispatch::{
    Completion, ComputeDispatcher, DispatchError, DispatchOutcome, DispatchRequest,
    DispatcherRegistry, OutputDraft, OutputSink, SimulatedDispatcher,
};
pub use engine::{ExecuteOptions, ExecutionEngine, HOST_FAULT};
pub use error::{KernelError, KernelResult};
pub use flows::{
    FlowBus, FlowMessage, HasSubject, KernelFlow, KernelFlowBus, SUBJECT_EXECUTION,
    SUBJECT_OUTPUT, SUBJECT_STATUS, Subscription, matches_pattern,
};
pub use host::{KernelHost, KernelHostBuilder};
pub use registry::KernelSpecRegistry;
pub use session_manager::{InMemorySessionStore, KernelSessionManager, SessionHandle, SessionStore};
pub use sources::{
    Clock, Entropy, FixedEntropy, IdSource, ManualClock, SequentialIds, Sources, SystemClock,
    ThreadEntropy, TimeOrderedIds,
};
pub use telemetry::{TelemetryEvent, TelemetrySink};
