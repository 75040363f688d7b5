//! EntryHandle - a caller's claim on an [`Entry`].
//!
//! A claim starts out pending in the waiter registry and, once admitted, sits
//! in the entries table until it is released with [`EntryHandle::done`] and its
//! linger period runs out.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::entry::{Entry, Priority};
use crate::instance::Shared;

/// Process-unique claim identity. Two claims on the same entry never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Shared claim data, referenced from the registries and the entries table.
#[derive(Debug)]
pub(crate) struct Claim {
    pub(crate) id: HandleId,
    pub(crate) entry: Entry,
    pub(crate) reason: String,
    pub(crate) priority: Priority,
    pub(crate) created: Instant,
    /// Set exactly once, by the first release. The inner `None` marks a linger
    /// past the clock's range: the slot is never freed.
    pub(crate) expires: OnceLock<Option<Instant>>,
}

impl Claim {
    pub(crate) fn new(entry: Entry, reason: String, priority: Priority) -> Self {
        Self {
            id: HandleId::next(),
            entry,
            reason,
            priority,
            created: Instant::now(),
            expires: OnceLock::new(),
        }
    }
}

/// A granted claim on an entry's slot.
///
/// Call [`done`](Self::done) when the tracked flow ends. Dropping an unreleased
/// handle releases it the same way.
pub struct EntryHandle {
    claim: Arc<Claim>,
    shared: Arc<Shared>,
}

impl EntryHandle {
    pub(crate) fn new(claim: Arc<Claim>, shared: Arc<Shared>) -> Self {
        Self { claim, shared }
    }

    pub fn entry(&self) -> &Entry {
        &self.claim.entry
    }

    pub fn reason(&self) -> &str {
        &self.claim.reason
    }

    pub fn priority(&self) -> Priority {
        self.claim.priority
    }

    pub fn created(&self) -> Instant {
        self.claim.created
    }

    /// When the slot is freed. `None` while held, and for a release whose
    /// linger never runs out.
    pub fn expires(&self) -> Option<Instant> {
        self.claim.expires.get().copied().flatten()
    }

    pub fn is_done(&self) -> bool {
        self.claim.expires.get().is_some()
    }

    /// Release the claim.
    ///
    /// The slot lingers for the instance's timeout for this entry before it is
    /// removed from the table. Only the first call has any effect.
    pub fn done(&self) {
        if self.is_done() {
            tracing::trace!(entry = %self.claim.entry, handle = %self.claim.id, "Handle already released");
            return;
        }
        let timeout = self.shared.timeout_for(&self.claim.entry);
        self.release(timeout);
    }

    fn release(&self, timeout: Duration) {
        let expires = Instant::now().checked_add(timeout);
        if self.claim.expires.set(expires).is_err() {
            tracing::trace!(entry = %self.claim.entry, handle = %self.claim.id, "Handle already released");
            return;
        }

        tracing::debug!(
            entry = %self.claim.entry,
            handle = %self.claim.id,
            reason = %self.claim.reason,
            linger = ?timeout,
            "Handle released"
        );
        match expires {
            Some(_) => self.schedule_expiry(timeout),
            None => tracing::warn!(
                entry = %self.claim.entry,
                handle = %self.claim.id,
                linger = ?timeout,
                "Linger out of clock range - slot stays occupied"
            ),
        }
    }

    /// Runs on the tokio runtime current at release, or on a dedicated thread
    /// when there is none.
    fn schedule_expiry(&self, timeout: Duration) {
        let shared = Arc::clone(&self.shared);
        let claim = Arc::clone(&self.claim);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                shared.expire(&claim);
            });
            return;
        }

        let spawned = std::thread::Builder::new()
            .name("conntrack-expiry".to_string())
            .spawn(move || {
                std::thread::sleep(timeout);
                shared.expire(&claim);
            });
        if let Err(e) = spawned {
            tracing::error!(
                entry = %self.claim.entry,
                handle = %self.claim.id,
                error = %e,
                "Failed to start expiry thread - freeing slot now"
            );
            self.shared.expire(&self.claim);
        }
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("id", &self.claim.id)
            .field("entry", &self.claim.entry)
            .field("reason", &self.claim.reason)
            .field("priority", &self.claim.priority)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if self.is_done() {
            return;
        }
        tracing::debug!(
            entry = %self.claim.entry,
            handle = %self.claim.id,
            "EntryHandle dropped without done() - releasing"
        );

        // A second panic while unwinding aborts, so the policy is skipped then.
        let timeout = if std::thread::panicking() {
            self.shared.default_timeout()
        } else {
            let entry = &self.claim.entry;
            match panic::catch_unwind(AssertUnwindSafe(|| self.shared.timeout_for(entry))) {
                Ok(timeout) => timeout,
                Err(_) => {
                    tracing::error!(
                        entry = %self.claim.entry,
                        handle = %self.claim.id,
                        "Timeout policy panicked - using default linger"
                    );
                    self.shared.default_timeout()
                }
            }
        };
        self.release(timeout);
    }
}
