//! Bounded in-memory telemetry log.
//!
//! The engine emits one event per finished execution and the manager one per
//! lifecycle change. Only the newest `retention` events are kept.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use titan_types::SessionId;

use crate::sources::Clock;

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event name, e.g. `execution.finished`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Unix millis, set by the sink on emit.
    #[serde(default)]
    pub timestamp: u64,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_id: None,
            properties: BTreeMap::new(),
            timestamp: 0,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Append-only ring of recent events.
pub struct TelemetrySink {
    events: Mutex<VecDeque<TelemetryEvent>>,
    retention: usize,
    clock: Arc<dyn Clock>,
}

impl TelemetrySink {
    /// `retention` is clamped to at least one event.
    pub fn new(retention: usize, clock: Arc<dyn Clock>) -> Self {
        let retention = retention.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(retention)),
            retention,
            clock,
        }
    }

    /// Stamp and append, evicting the oldest event when full.
    pub fn emit(&self, mut event: TelemetryEvent) {
        event.timestamp = self.clock.now_millis();
        tracing::trace!(event = %event.name, "telemetry");
        let mut events = self.events.lock();
        if events.len() == self.retention {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Up to `limit` newest events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<TelemetryEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl std::fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySink")
            .field("retention", &self.retention)
            .field("len", &self.len())
            .finish()
    }
}
