//! Disconnect tracking and race-free per-connection cleanup.
//!
//! # Responsibilities
//! - Map connection ids to pending disconnect registrations
//! - Arbitrate between foreground request handling and the kernel's
//!   asynchronous disconnect callback via a per-record ownership state machine
//! - Run cleanup exactly once, whichever of "handler done" and "connection
//!   gone" happens last
//!
//! The kernel delivers disconnect notifications on an arbitrary thread while
//! request processing for the same connection may be running on another; the
//! atomic tri-state handoff below is what makes naive check-then-act races
//! impossible.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::auth::context::SecurityContext;
use crate::auth::digest_cache::DigestContextCache;
use crate::auth::provider::Principal;
use crate::auth::AuthScheme;
use crate::queue::RequestQueueTransport;

/// No one is using the record; a disconnect may clean up immediately.
const IDLE: u8 = 0;
/// A handler is reading or mutating the record; cleanup must defer.
const IN_USE: u8 = 1;
/// The kernel signaled disconnect while the record was in use.
const DISCONNECTED: u8 = 2;
/// Cleanup has run. Terminal; used to assert against double-cleanup.
const CLEANED_UP: u8 = 3;

/// Per-connection state guarded by the ownership state machine.
pub struct DisconnectRecord {
    connection_id: u64,
    state: AtomicU8,
    /// Security context attached to the connection, awaiting the next request.
    session: Mutex<Option<SecurityContext>>,
    /// Principal cached for unsafe connection-based NTLM reuse.
    principal: Mutex<Option<Arc<Principal>>>,
}

impl DisconnectRecord {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Cached principal for unsafe NTLM reuse, if any.
    pub fn principal(&self) -> Option<Arc<Principal>> {
        self.principal
            .lock()
            .expect("disconnect record mutex poisoned")
            .clone()
    }

    /// Drop the cached principal. The previous value may still be in use by
    /// the application; only our reference is released.
    pub fn clear_principal(&self) {
        self.principal
            .lock()
            .expect("disconnect record mutex poisoned")
            .take();
    }

    pub fn set_principal(&self, principal: Arc<Principal>) {
        *self
            .principal
            .lock()
            .expect("disconnect record mutex poisoned") = Some(principal);
    }

    fn take_session_inner(&self) -> Option<SecurityContext> {
        self.session
            .lock()
            .expect("disconnect record mutex poisoned")
            .take()
    }

    fn set_session_inner(&self, context: SecurityContext) {
        *self
            .session
            .lock()
            .expect("disconnect record mutex poisoned") = Some(context);
    }
}

/// Exclusive ownership of a [`DisconnectRecord`] for the duration of one
/// request. Releases ownership on drop; if the connection disconnected while
/// owned, cleanup runs inline at that point.
pub struct OwnedDisconnect {
    inner: Arc<TrackerInner>,
    record: Arc<DisconnectRecord>,
}

impl OwnedDisconnect {
    pub fn record(&self) -> &DisconnectRecord {
        &self.record
    }

    /// Detach the connection's live session, if any. The caller becomes its
    /// sole owner.
    pub fn take_session(&self) -> Option<SecurityContext> {
        self.record.take_session_inner()
    }

    /// Attach a live session to the connection.
    pub fn set_session(&self, context: SecurityContext) {
        self.record.set_session_inner(context);
    }
}

impl Drop for OwnedDisconnect {
    fn drop(&mut self) {
        self.inner.finish_owning(&self.record);
    }
}

/// Registry of pending disconnect registrations, keyed by connection id.
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct DisconnectTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    table: DashMap<u64, Arc<DisconnectRecord>>,
    digest_cache: Arc<DigestContextCache>,
}

impl DisconnectTracker {
    pub fn new(digest_cache: Arc<DigestContextCache>) -> Self {
        DisconnectTracker {
            inner: Arc::new(TrackerInner {
                table: DashMap::new(),
                digest_cache,
            }),
        }
    }

    /// Look up the record for a connection without taking ownership.
    pub fn lookup(&self, connection_id: u64) -> Option<Arc<DisconnectRecord>> {
        self.inner
            .table
            .get(&connection_id)
            .map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    /// Issue a disconnect wait with the transport and publish the record.
    ///
    /// The record starts owned by the caller: the registering request is
    /// already touching it, and the kernel callback may fire before this call
    /// returns. Returns `None` if registration fails; the caller must treat
    /// disconnect safety as unavailable.
    pub fn register(
        &self,
        transport: &dyn RequestQueueTransport,
        connection_id: u64,
    ) -> Option<OwnedDisconnect> {
        let record = Arc::new(DisconnectRecord {
            connection_id,
            state: AtomicU8::new(IN_USE),
            session: Mutex::new(None),
            principal: Mutex::new(None),
        });

        let notify = {
            let inner = Arc::clone(&self.inner);
            let record = Arc::clone(&record);
            Box::new(move || inner.connection_disconnected(&record))
        };

        match transport.wait_for_disconnect(connection_id, notify) {
            Ok(()) => {
                self.inner.table.insert(connection_id, Arc::clone(&record));
                tracing::debug!(connection_id, "disconnect wait registered");
                Some(OwnedDisconnect {
                    inner: Arc::clone(&self.inner),
                    record,
                })
            }
            Err(error) => {
                tracing::warn!(connection_id, %error, "disconnect wait registration failed");
                None
            }
        }
    }

    /// Atomically take ownership of an existing record.
    ///
    /// Returns `None` if the record was already cleaned up (the caller must
    /// treat it as gone and re-register). Spins briefly if a disconnect
    /// cleanup is mid-flight on another thread.
    pub fn start_owning(&self, record: &Arc<DisconnectRecord>) -> Option<OwnedDisconnect> {
        loop {
            match record
                .state
                .compare_exchange(IDLE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(OwnedDisconnect {
                        inner: Arc::clone(&self.inner),
                        record: Arc::clone(record),
                    })
                }
                Err(DISCONNECTED) => {
                    // Cleanup is running right now; wait for it to finish.
                    std::hint::spin_loop();
                }
                Err(CLEANED_UP) => return None,
                Err(current) => {
                    debug_assert!(
                        current != IN_USE,
                        "start_owning called on a record that is already owned"
                    );
                    return None;
                }
            }
        }
    }

    /// Tear down all registrations whose connections have not yet
    /// disconnected, closing live sessions unconditionally. Used on listener
    /// stop/abort.
    pub fn shutdown(&self) {
        let records: Vec<Arc<DisconnectRecord>> = self
            .inner
            .table
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for record in records {
            if let Some(owned) = self.acquire_for_teardown(&record) {
                self.inner.table.remove(&record.connection_id);
                if let Some(session) = owned.take_session() {
                    session.close();
                }
                record.clear_principal();
            }
        }
    }

    /// Ownership acquisition for teardown. Unlike [`Self::start_owning`], an
    /// `InUse` record here is legitimate: a request is still in flight on
    /// another thread, so wait for its owner to release instead of treating
    /// the state as a double-acquire.
    fn acquire_for_teardown(&self, record: &Arc<DisconnectRecord>) -> Option<OwnedDisconnect> {
        loop {
            match record
                .state
                .compare_exchange(IDLE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(OwnedDisconnect {
                        inner: Arc::clone(&self.inner),
                        record: Arc::clone(record),
                    })
                }
                Err(CLEANED_UP) => return None,
                // InUse or Disconnected: the owner or a disconnect cleanup is
                // about to advance the state.
                Err(_) => std::hint::spin_loop(),
            }
        }
    }
}

impl TrackerInner {
    /// Release ownership. If the kernel signaled a disconnect while the record
    /// was owned, cleanup runs here, exactly once.
    fn finish_owning(&self, record: &Arc<DisconnectRecord>) {
        match record
            .state
            .compare_exchange(IN_USE, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(DISCONNECTED) => self.cleanup(record),
            // IDLE: never acquired; nothing to release. CLEANED_UP: gone.
            Err(_) => {}
        }
    }

    /// Kernel disconnect callback. Runs cleanup immediately when nobody owns
    /// the record, otherwise flags it for the current owner to clean up.
    fn connection_disconnected(&self, record: &Arc<DisconnectRecord>) {
        let previous = record.state.swap(DISCONNECTED, Ordering::AcqRel);
        match previous {
            IDLE => self.cleanup(record),
            IN_USE => {
                tracing::debug!(
                    connection_id = record.connection_id,
                    "disconnect signaled while record in use, cleanup deferred"
                );
            }
            _ => {
                // The transport contract says the signal fires at most once.
                debug_assert!(false, "disconnect signaled twice for one registration");
                record.state.store(previous, Ordering::Release);
            }
        }
    }

    /// Remove the record and release everything it still references. Runs in
    /// the `Disconnected` state only.
    fn cleanup(&self, record: &Arc<DisconnectRecord>) {
        self.table.remove(&record.connection_id);

        if let Some(session) = record.take_session_inner() {
            if session.scheme() == AuthScheme::Digest {
                // Digest wants the server to remember the context for as long
                // as a client might reuse the nonce, even past the connection.
                self.digest_cache.save(session);
            } else {
                session.close();
            }
        }

        // Last tracker reference to a principal cached for unsafe NTLM reuse.
        record.clear_principal();

        let previous = record.state.swap(CLEANED_UP, Ordering::AcqRel);
        debug_assert_eq!(previous, DISCONNECTED, "cleanup ran outside Disconnected");
        tracing::debug!(connection_id = record.connection_id, "connection record cleaned up");
    }
}
