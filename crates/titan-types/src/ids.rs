//! Typed identifiers for sessions, executions, and output events.
//!
//! All ID types wrap a UUID. Production sources mint UUIDv7 (time-ordered);
//! deterministic sources used in tests mint counter-derived UUIDs through
//! `From<Uuid>`. IDs display as standard UUID text for logging. The `short()`
//! form (first 8 hex chars) is for human-facing output only, never a lookup
//! key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A kernel session identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

/// An execution identifier (one per code submission).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(uuid::Uuid);

/// An output event identifier, used for `parent_id` correlation.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new time-ordered ID (UUIDv7).
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// First 8 hex characters, for human display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Full 32-character hex string (no hyphens).
            pub fn to_hex(&self) -> String {
                self.0.as_simple().to_string()
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> uuid::Uuid {
                self.0
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl std::str::FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(SessionId, "SessionId");
impl_typed_id!(ExecutionId, "ExecutionId");
impl_typed_id!(OutputId, "OutputId");

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_short_is_8_chars() {
        assert_eq!(ExecutionId::new().short().len(), 8);
    }

    #[test]
    fn test_parse_both_formats() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_hex()).unwrap(), id);
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(SessionId::parse("does-not-exist").is_err());
    }

    #[test]
    fn test_from_counter_uuid_is_ordered() {
        let a = OutputId::from(uuid::Uuid::from_u128(1));
        let b = OutputId::from(uuid::Uuid::from_u128(2));
        assert!(a < b);
    }

    #[test]
    fn test_debug_uses_short_form() {
        let id = ExecutionId::from(uuid::Uuid::from_u128(0xabcdef));
        assert_eq!(format!("{id:?}"), format!("ExecutionId({})", id.short()));
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_postcard_roundtrip() {
        let id = ExecutionId::new();
        let bytes = postcard::to_stdvec(&id).unwrap();
        let parsed: ExecutionId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(id, parsed);
    }
}
