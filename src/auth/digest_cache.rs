//! Bounded cache of retired Digest security contexts.
//!
//! # Responsibilities
//! - Keep retired Digest contexts alive across requests (the protocol requires
//!   server-side nonce state beyond one request, possibly across connections)
//! - Bound memory: power-of-two ring, age-based eviction amortized into `save`
//! - Guarantee a minimum survival time even under ring pressure, via a
//!   two-generation overflow ledger rotated every minimum-lifetime interval
//!
//! All bookkeeping happens under one lock; the native releases for evicted
//! contexts run outside it (collect-then-close).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::auth::context::SecurityContext;

/// Default ring capacity. Must be a power of two.
pub const DEFAULT_CAPACITY: usize = 1024;
/// Default lifetime after which a cached context is evicted.
pub const DEFAULT_LIFETIME_SECS: u64 = 300;
/// Default survival floor for every saved context.
pub const DEFAULT_MINIMUM_LIFETIME_SECS: u64 = 10;

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

struct Slot {
    context: Option<SecurityContext>,
    timestamp_ms: u64,
}

struct CacheInner {
    slots: Vec<Slot>,
    newest: usize,
    oldest: usize,
    /// Generation currently accepting displaced-but-young contexts.
    ledger_current: Vec<SecurityContext>,
    /// Previous generation, drained on the next rotation.
    ledger_baking: Vec<SecurityContext>,
    ledger_rotated_ms: u64,
}

/// Counts of live entries, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub ring: usize,
    pub ledger: usize,
}

/// Fixed-capacity ring plus overflow ledger for retired Digest contexts.
pub struct DigestContextCache {
    inner: Mutex<CacheInner>,
    mask: usize,
    lifetime_ms: u64,
    minimum_lifetime_ms: u64,
    /// While false (listener stopped/closed), saves close immediately.
    active: AtomicBool,
}

impl DigestContextCache {
    /// Create a cache. `capacity` must be a non-zero power of two.
    pub fn new(capacity: usize, lifetime_secs: u64, minimum_lifetime_secs: u64) -> Self {
        assert!(
            capacity != 0 && capacity.is_power_of_two(),
            "digest cache capacity must be a non-zero power of two"
        );
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                context: None,
                timestamp_ms: 0,
            });
        }
        DigestContextCache {
            inner: Mutex::new(CacheInner {
                slots,
                newest: 0,
                oldest: 0,
                ledger_current: Vec::new(),
                ledger_baking: Vec::new(),
                ledger_rotated_ms: 0,
            }),
            mask: capacity - 1,
            lifetime_ms: lifetime_secs * 1000,
            minimum_lifetime_ms: minimum_lifetime_secs * 1000,
            active: AtomicBool::new(true),
        }
    }

    /// Gate saves on listener state. When inactive, saved contexts are closed
    /// immediately instead of cached.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Retire a Digest context into the cache.
    pub fn save(&self, context: SecurityContext) {
        self.save_at(context, monotonic_ms());
    }

    /// Retire a Digest context with an explicit timestamp. The aging logic is
    /// driven entirely by the timestamps passed here, which keeps it testable
    /// without real waits.
    pub fn save_at(&self, context: SecurityContext, now_ms: u64) {
        let mut to_close: Vec<SecurityContext> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("digest cache mutex poisoned");

            if !self.active.load(Ordering::Acquire) {
                drop(inner);
                tracing::debug!("listener inactive, closing digest context instead of caching");
                context.close();
                return;
            }

            inner.newest = (inner.newest + 1) & self.mask;
            let newest = inner.newest;
            let displaced_ts = inner.slots[newest].timestamp_ms;
            let displaced = inner.slots[newest].context.take();
            inner.slots[newest].context = Some(context);
            inner.slots[newest].timestamp_ms = now_ms;

            if inner.oldest == newest {
                inner.oldest = (newest + 1) & self.mask;
            }

            // Sweep entries past their lifetime, oldest first.
            loop {
                let oldest = inner.oldest;
                if inner.slots[oldest].context.is_none() {
                    break;
                }
                if now_ms.wrapping_sub(inner.slots[oldest].timestamp_ms) < self.lifetime_ms {
                    break;
                }
                to_close.push(inner.slots[oldest].context.take().expect("checked above"));
                inner.oldest = (oldest + 1) & self.mask;
            }

            // A displaced context younger than the floor moves to the ledger so
            // it still gets its guaranteed minimum lifetime.
            if let Some(old) = displaced {
                if now_ms.wrapping_sub(displaced_ts) <= self.minimum_lifetime_ms {
                    if now_ms.wrapping_sub(inner.ledger_rotated_ms) > self.minimum_lifetime_ms {
                        let mut drained = std::mem::take(&mut inner.ledger_baking);
                        to_close.append(&mut drained);
                        inner.ledger_baking = std::mem::take(&mut inner.ledger_current);
                        inner.ledger_rotated_ms = now_ms;
                    }
                    inner.ledger_current.push(old);
                } else {
                    to_close.push(old);
                }
            }
        }

        for ctx in to_close {
            ctx.close();
        }
    }

    /// Close every cached context. Used on listener stop/abort; safe to call
    /// concurrently with `save`.
    pub fn clear(&self) {
        let mut to_close: Vec<SecurityContext> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("digest cache mutex poisoned");
            to_close.append(&mut inner.ledger_baking);
            to_close.append(&mut inner.ledger_current);
            inner.ledger_rotated_ms = 0;
            inner.newest = 0;
            inner.oldest = 0;
            for slot in inner.slots.iter_mut() {
                if let Some(ctx) = slot.context.take() {
                    to_close.push(ctx);
                }
                slot.timestamp_ms = 0;
            }
        }

        let evicted = to_close.len();
        for ctx in to_close {
            ctx.close();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "digest cache cleared");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("digest cache mutex poisoned");
        CacheStats {
            ring: inner.slots.iter().filter(|s| s.context.is_some()).count(),
            ledger: inner.ledger_current.len() + inner.ledger_baking.len(),
        }
    }
}

impl Default for DigestContextCache {
    fn default() -> Self {
        DigestContextCache::new(
            DEFAULT_CAPACITY,
            DEFAULT_LIFETIME_SECS,
            DEFAULT_MINIMUM_LIFETIME_SECS,
        )
    }
}
