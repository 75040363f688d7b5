//! Instance - the admission controller.
//!
//! Slots are consumed per distinct [`Entry`]. A caller asking for an entry that
//! is already held shares it for free; a caller asking for a new entry needs
//! free capacity *and* must belong to the highest priority class among all
//! pending callers. Lower classes wait even when there is room, so they cannot
//! cut in front of pending higher-priority callers.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{Capacity, ConntrackConfig};
use crate::entry::{Entry, Priority};
use crate::handle::{Claim, EntryHandle, HandleId};
use crate::registry::WaiterRegistry;
use crate::status::StatusSnapshot;
use crate::store::{Step, Store};

pub(crate) type TimeoutFn = Arc<dyn Fn(&Entry) -> Duration + Send + Sync>;

/// Everything guarded by the store.
pub(crate) struct State {
    pub(crate) capacity: Capacity,
    pub(crate) timeout: TimeoutFn,
    /// Occupied slots: entry -> claims sharing it. Buckets are never empty.
    pub(crate) entries: BTreeMap<Entry, HashMap<HandleId, Arc<Claim>>>,
    pub(crate) waiters: WaiterRegistry,
}

impl State {
    fn admit(&mut self, claim: &Arc<Claim>) {
        self.entries
            .entry(claim.entry.clone())
            .or_default()
            .insert(claim.id, Arc::clone(claim));
        self.waiters.remove(claim);
    }
}

pub(crate) struct Shared {
    store: Store<State>,
    /// Linger from the config, used when the timeout policy cannot be consulted.
    default_timeout: Duration,
}

impl Shared {
    /// Runs the caller's policy outside the store lock, so a panicking policy
    /// cannot poison the table.
    pub(crate) fn timeout_for(&self, entry: &Entry) -> Duration {
        let timeout = self.store.read(|s| Arc::clone(&s.timeout));
        (*timeout)(entry)
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Drop an expired claim from its entry, freeing the slot if it was the last holder.
    pub(crate) fn expire(&self, claim: &Claim) {
        let freed = self.store.atomically(|s| {
            let Some(holders) = s.entries.get_mut(&claim.entry) else {
                return false;
            };
            holders.remove(&claim.id);
            if holders.is_empty() {
                s.entries.remove(&claim.entry);
                true
            } else {
                false
            }
        });
        tracing::debug!(entry = %claim.entry, handle = %claim.id, freed, "Handle expired");
    }
}

/// Deregisters a pending claim if the wait is abandoned part-way, e.g. when
/// the `wait` future is dropped by a timeout.
struct WaiterGuard<'a> {
    shared: &'a Shared,
    claim: &'a Claim,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let claim = self.claim;
            self.shared.store.atomically(|s| s.waiters.remove(claim));
            tracing::debug!(entry = %claim.entry, handle = %claim.id, "Abandoned wait deregistered");
        }
    }
}

/// Connection-tracking admission controller.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct Instance {
    shared: Arc<Shared>,
}

impl Instance {
    pub fn new() -> Self {
        Self::with_config(ConntrackConfig::default())
    }

    pub fn with_config(config: ConntrackConfig) -> Self {
        let default_timeout = config.default_timeout;
        let state = State {
            capacity: config.capacity,
            timeout: Arc::new(move |_: &Entry| default_timeout),
            entries: BTreeMap::new(),
            waiters: WaiterRegistry::default(),
        };
        Self {
            shared: Arc::new(Shared {
                store: Store::new(state),
                default_timeout,
            }),
        }
    }

    /// Limit the number of distinct entries. Existing holders are never evicted.
    pub fn set_max_entries(&self, max: usize) {
        self.set_capacity(Capacity::Limited(max));
    }

    pub fn set_no_max_entries(&self) {
        self.set_capacity(Capacity::Unlimited);
    }

    pub fn set_capacity(&self, capacity: Capacity) {
        self.shared.store.atomically(|s| s.capacity = capacity);
        tracing::debug!(?capacity, "Capacity changed");
    }

    pub fn capacity(&self) -> Capacity {
        self.shared.store.read(|s| s.capacity)
    }

    /// Override how long a released entry keeps its slot.
    ///
    /// Applies to handles released after the call.
    pub fn set_timeout(&self, timeout: impl Fn(&Entry) -> Duration + Send + Sync + 'static) {
        let timeout: TimeoutFn = Arc::new(timeout);
        self.shared.store.atomically(|s| s.timeout = timeout);
    }

    pub async fn wait_default(
        &self,
        cancel: &CancellationToken,
        entry: Entry,
    ) -> Option<EntryHandle> {
        self.wait(cancel, entry, "", Priority::default()).await
    }

    /// Block until `entry` may be tracked.
    ///
    /// Returns `None` only if `cancel` fired before a slot became available.
    /// The pending claim is deregistered before this returns, whatever the
    /// outcome, and also if the returned future is dropped.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        entry: Entry,
        reason: impl Into<String>,
        priority: Priority,
    ) -> Option<EntryHandle> {
        let claim = Arc::new(Claim::new(entry, reason.into(), priority));
        self.shared.store.atomically(|s| s.waiters.add(&claim));
        let mut guard = WaiterGuard {
            shared: &self.shared,
            claim: &claim,
            armed: true,
        };

        let admitted = self
            .shared
            .store
            .atomically_or_retry(cancel, |s, cancelled| {
                // Sharing an occupied entry costs nothing.
                if s.entries.contains_key(&claim.entry) {
                    s.admit(&claim);
                    return Step::Commit(true);
                }

                let have_room = s.capacity.has_room(s.entries.len());
                let Some(top) = s.waiters.top_priority() else {
                    tracing::error!(
                        entry = %claim.entry,
                        handle = %claim.id,
                        "Waiter registry empty while a claim is pending"
                    );
                    panic!("no waiters registered while {} is pending", claim.id);
                };

                if have_room && claim.priority == top {
                    s.admit(&claim);
                    return Step::Commit(true);
                }

                if cancelled {
                    s.waiters.remove(&claim);
                    return Step::Commit(false);
                }

                Step::Retry
            })
            .await;
        guard.disarm();
        drop(guard);

        debug_assert!(
            self.shared
                .store
                .read(|s| !s.waiters.contains(claim.id) && s.waiters.is_consistent()),
            "claim still registered after wait"
        );

        let waited = claim.created.elapsed();
        if admitted {
            tracing::debug!(
                entry = %claim.entry,
                handle = %claim.id,
                reason = %claim.reason,
                priority = %claim.priority,
                ?waited,
                "Entry admitted"
            );
            Some(EntryHandle::new(claim, Arc::clone(&self.shared)))
        } else {
            tracing::debug!(
                entry = %claim.entry,
                reason = %claim.reason,
                priority = %claim.priority,
                ?waited,
                "Wait cancelled before admission"
            );
            None
        }
    }

    /// Number of pending claims for `entry`.
    pub fn waiters_for(&self, entry: &Entry) -> usize {
        self.shared.store.read(|s| s.waiters.waiting_on(entry))
    }

    pub fn status(&self) -> StatusSnapshot {
        let now = Instant::now();
        self.shared.store.read(|s| StatusSnapshot::capture(s, now))
    }

    /// Write a human-readable dump of the table and the waiters.
    pub fn write_status(&self, w: &mut impl io::Write) -> io::Result<()> {
        write!(w, "{}", self.status())
    }

    #[cfg(test)]
    pub(crate) async fn wait_for_state(&self, pred: impl FnMut(&State) -> bool) {
        self.shared.store.wait_until(pred).await;
    }

    #[cfg(test)]
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        self.shared.store.read(f)
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.shared.store.read(|s| {
            f.debug_struct("Instance")
                .field("capacity", &s.capacity)
                .field("entries", &s.entries.len())
                .field("waiters", &s.waiters.len())
                .finish()
        })
    }
}
