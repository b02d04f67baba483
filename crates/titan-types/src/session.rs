//! Kernel session snapshot types.
//!
//! A `KernelSession` is what observers see: who owns the session, which spec
//! it runs, where it is in the status machine, and how much it has consumed.
//! The live copy belongs to the session manager; everything handed out is a
//! clone taken under the session's lock.

use serde::{Deserialize, Serialize};

use crate::ids::{ExecutionId, SessionId};
use crate::spec::{EnvironmentType, KernelSpec};
use crate::status::{KernelStatus, TransitionError};

/// Memory a freshly started session is assumed to hold (256 MiB).
pub const BASELINE_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Live resource accounting for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilisation of the most recent execution, 0..=100.
    pub cpu_percent: f64,
    /// Resident memory high-water mark.
    pub memory_bytes: u64,
    /// CPU time accumulated over all executions.
    #[serde(default)]
    pub cpu_time_ms: u64,
    /// Executions completed in this session.
    #[serde(default)]
    pub execution_count: u64,
}

impl ResourceUsage {
    /// Usage of a session that has not executed anything yet.
    pub fn baseline() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_bytes: BASELINE_MEMORY_BYTES,
            cpu_time_ms: 0,
            execution_count: 0,
        }
    }
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self::baseline()
    }
}

/// A running instance of a kernel spec, bound to a notebook and a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSession {
    pub id: SessionId,
    pub notebook_id: String,
    pub user_id: String,
    /// Copied from the spec at start.
    pub environment_type: EnvironmentType,
    pub status: KernelStatus,
    /// Client identities attached to this session; starts with the owner.
    pub connected_clients: Vec<String>,
    /// Unix millis.
    pub start_time: u64,
    /// Unix millis; never moves backwards.
    pub last_activity: u64,
    pub kernel_spec: KernelSpec,
    pub resource_usage: ResourceUsage,
    /// The execution holding this session busy, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_execution: Option<ExecutionId>,
}

impl KernelSession {
    /// A session in `Provisioning`, not yet registered anywhere.
    pub fn provisioning(
        id: SessionId,
        notebook_id: impl Into<String>,
        user_id: impl Into<String>,
        spec: KernelSpec,
        now: u64,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            id,
            notebook_id: notebook_id.into(),
            environment_type: spec.environment_type,
            status: KernelStatus::Provisioning,
            connected_clients: vec![user_id.clone()],
            user_id,
            start_time: now,
            last_activity: now,
            kernel_spec: spec,
            resource_usage: ResourceUsage::baseline(),
            current_execution: None,
        }
    }

    /// Move along the status machine, returning the previous status.
    pub fn transition(&mut self, next: KernelStatus) -> Result<KernelStatus, TransitionError> {
        let prev = self.status;
        self.status = prev.transition(next)?;
        Ok(prev)
    }

    /// Record activity at `now`, keeping `last_activity` monotonic.
    pub fn touch(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Attach a client. Returns false if it was already attached.
    pub fn attach_client(&mut self, client: impl Into<String>) -> bool {
        let client = client.into();
        if self.connected_clients.contains(&client) {
            return false;
        }
        self.connected_clients.push(client);
        true
    }

    /// Detach a client. Returns false if it was not attached.
    pub fn detach_client(&mut self, client: &str) -> bool {
        let before = self.connected_clients.len();
        self.connected_clients.retain(|c| c != client);
        self.connected_clients.len() != before
    }

    /// Display string: short hex ID plus the spec name.
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.kernel_spec.name, self.id.short())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> KernelSession {
        KernelSession::provisioning(SessionId::new(), "n1", "u1", KernelSpec::python3(), 1_000)
    }

    #[test]
    fn test_construction() {
        let s = session();
        assert_eq!(s.status, KernelStatus::Provisioning);
        assert_eq!(s.environment_type, EnvironmentType::Python3);
        assert_eq!(s.connected_clients, vec!["u1".to_string()]);
        assert_eq!(s.start_time, 1_000);
        assert_eq!(s.last_activity, 1_000);
        assert_eq!(s.resource_usage.memory_bytes, BASELINE_MEMORY_BYTES);
        assert!(s.current_execution.is_none());
    }

    #[test]
    fn test_transition_returns_previous() {
        let mut s = session();
        assert_eq!(s.transition(KernelStatus::Starting).unwrap(), KernelStatus::Provisioning);
        assert!(s.transition(KernelStatus::Busy).is_err());
        assert_eq!(s.status, KernelStatus::Starting);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut s = session();
        s.touch(5_000);
        s.touch(2_000);
        assert_eq!(s.last_activity, 5_000);
    }

    #[test]
    fn test_clients_have_set_semantics() {
        let mut s = session();
        assert!(!s.attach_client("u1"));
        assert!(s.attach_client("u2"));
        assert!(s.detach_client("u1"));
        assert!(!s.detach_client("u1"));
        assert_eq!(s.connected_clients, vec!["u2".to_string()]);
    }

    #[test]
    fn test_display_name() {
        let s = session();
        assert!(s.display_name().starts_with("python3:"));
    }

    #[test]
    fn test_json_roundtrip() {
        let s = session();
        let json = serde_json::to_string(&s).unwrap();
        let parsed: KernelSession = serde_json::from_str(&json).unwrap();
        assert_eq!(s, parsed);
    }
}
