//! Execution results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ExecutionId, SessionId};
use crate::output::{OutputMessage, OutputType};

/// Status of an execution.
///
/// `Pending` and `Running` are transient; a returned [`ExecutionResult`]
/// always carries one of the terminal variants.
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
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Interrupted,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Details of an uncaught fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stacktrace: Vec<String>,
}

impl ErrorDetails {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stacktrace: Vec::new(),
        }
    }

    pub fn with_stacktrace<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stacktrace = frames.into_iter().map(Into::into).collect();
        self
    }
}

/// Resource accounting for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub cpu_time_ms: u64,
    pub memory_peak_mb: u64,
}

/// Terminal record of one code submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    pub status: ExecutionStatus,
    /// In emission order.
    pub outputs: Vec<OutputMessage>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    /// Present iff `status` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Outputs of one type, in order.
    pub fn outputs_of(&self, output_type: OutputType) -> impl Iterator<Item = &OutputMessage> {
        self.outputs.iter().filter(move |o| o.output_type == output_type)
    }

    /// Sequence of output types, for comparing runs.
    pub fn output_types(&self) -> Vec<OutputType> {
        self.outputs.iter().map(|o| o.output_type).collect()
    }
}
