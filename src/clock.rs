/*!
 * Monotonic Clock
 * Injected time source so TTL/expiry logic is deterministic under test.
 *
 * Wall clock only ever appears in emitted signal payloads (see `signals.rs`);
 * every comparison inside the pipeline's state machines goes through here.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Source of monotonically non-decreasing milliseconds.
pub trait MonotonicClock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Real clock, anchored to process start the same way `monitoring::events::Event::now_ns`
/// anchors its timestamps — a lazily-initialized static `Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_millis() as u64
    }
}

/// Test double: an explicit, manually-advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicU64::new(0),
        }
    }

    pub fn set(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
