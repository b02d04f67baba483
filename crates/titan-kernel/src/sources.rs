//! Injectable time, identity, and entropy sources.
//!
//! Everything nondeterministic the kernel touches goes through one of these
//! traits, bundled in [`Sources`]. Production wiring uses the wall clock,
//! UUIDv7, and `rand`; tests pin all three.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use titan_types::{ExecutionId, OutputId, SessionId};
use uuid::Uuid;

// ============================================================================
// Clock
// ============================================================================

/// Source of Unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Source of fresh UUIDs for sessions, executions, and outputs.
pub trait IdSource: Send + Sync {
    fn next_uuid(&self) -> Uuid;
}

/// UUIDv7 (time-ordered, globally unique).
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeOrderedIds;

impl IdSource for TimeOrderedIds {
    fn next_uuid(&self) -> Uuid {
        Uuid::now_v7()
    }
}

/// Counter-derived UUIDs: 1, 2, 3, ...
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for SequentialIds {
    fn next_uuid(&self) -> Uuid {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Uuid::from_u128(n as u128)
    }
}

// ============================================================================
// Entropy
// ============================================================================

/// Source of uniform samples in `[0, 1)`.
pub trait Entropy: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadEntropy;

impl Entropy for ThreadEntropy {
    fn next_unit(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Always the same sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedEntropy(pub f64);

impl Entropy for FixedEntropy {
    fn next_unit(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// The injected sources shared by every kernel component.
#[derive(Clone)]
pub struct Sources {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
    pub entropy: Arc<dyn Entropy>,
}

impl Sources {
    /// Wall clock, UUIDv7, thread RNG.
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            ids: Arc::new(TimeOrderedIds),
            entropy: Arc::new(ThreadEntropy),
        }
    }

    /// Fully pinned: manual clock, sequential ids, fixed entropy.
    pub fn deterministic(clock: Arc<ManualClock>, entropy: f64) -> Self {
        Self {
            clock,
            ids: Arc::new(SequentialIds::new()),
            entropy: Arc::new(FixedEntropy(entropy)),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::from(self.ids.next_uuid())
    }

    pub fn execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.ids.next_uuid())
    }

    pub fn output_id(&self) -> OutputId {
        OutputId::from(self.ids.next_uuid())
    }
}

impl Default for Sources {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Sources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sources")
            .field("now", &self.clock.now_millis())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(Duration::from_millis(50));
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01 in Unix millis
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::new();
        assert_eq!(ids.next_uuid(), Uuid::from_u128(1));
        assert_eq!(ids.next_uuid(), Uuid::from_u128(2));
    }

    #[test]
    fn test_entropy_ranges() {
        for _ in 0..100 {
            let x = ThreadEntropy.next_unit();
            assert!((0.0..1.0).contains(&x));
        }
        assert_eq!(FixedEntropy(0.25).next_unit(), 0.25);
        assert_eq!(FixedEntropy(7.0).next_unit(), 1.0);
    }

    #[test]
    fn test_deterministic_sources_share_one_counter() {
        let sources = Sources::deterministic(Arc::new(ManualClock::new(0)), 0.0);
        let s = sources.session_id();
        let e = sources.execution_id();
        assert_eq!(s.as_uuid(), Uuid::from_u128(1));
        assert_eq!(e.as_uuid(), Uuid::from_u128(2));
    }
}
