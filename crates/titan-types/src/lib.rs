//! Shared types for Titan kernel sessions.
//!
//! This crate is the data model: typed IDs, kernel specs, sessions and their
//! status machine, output events, and execution results. It has **no
//! internal titan dependencies** and no async runtime, so it can be shared by
//! the kernel, the CLI, and any transport that wants to carry these values.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! KernelSpec (name) ← immutable environment descriptor
//!     └── referenced by many KernelSessions
//!
//! KernelSession (SessionId) ← a running instance of a spec
//!     └── bound to one notebook and one owning user
//!     └── walks the KernelStatus machine
//!     └── owns zero-or-one in-flight Execution (ExecutionId)
//!
//! Execution (ExecutionId) ← one code submission
//!     └── emits OutputMessages (OutputId, parent_id correlation)
//!     └── ends in exactly one ExecutionResult
//! ```
//!
//! # Key Types
//!
//! |---------------------|-------------------------------------------------|
//! | Type                | Purpose                                         |
//! |---------------------|-------------------------------------------------|
//! | [`KernelSpec`]      | Environment descriptor (resources, mime types)  |
//! | [`KernelSession`]   | Live session snapshot (status, usage, activity) |
//! | [`KernelStatus`]    | Session state machine                           |
//! | [`OutputMessage`]   | One event in an execution's output stream       |
//! | [`ExecutionResult`] | Terminal record of one execution                |
//! | [`SessionId`]       | Which session                                   |
//! | [`ExecutionId`]     | Which execution                                 |
//! | [`OutputId`]        | Which output event                              |
//! |---------------------|-------------------------------------------------|

pub mod execution;
pub mod ids;
pub mod output;
pub mod session;
pub mod spec;
pub mod status;

// Re-export primary types at crate root for convenience.
pub use execution::{ErrorDetails, ExecutionMetrics, ExecutionResult, ExecutionStatus};
pub use ids::{ExecutionId, OutputId, SessionId};
pub use output::{OutputMessage, OutputType, error_content, mime_bundle, stream_content};
pub use session::{BASELINE_MEMORY_BYTES, KernelSession, ResourceUsage};
pub use spec::{EnvironmentType, KernelSpec, ResourceEnvelope};
pub use status::{KernelStatus, TransitionError};
