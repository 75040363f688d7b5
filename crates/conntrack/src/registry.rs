//! Waiter registry - the pending claims, indexed four ways.
//!
//! The four views (by priority, by reason, by entry, flat) only change through
//! [`WaiterRegistry::add`] and [`WaiterRegistry::remove`], which always touch
//! all of them. Since the registry lives inside the store state, each call is
//! part of a single transaction.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use crate::entry::{Entry, Priority};
use crate::handle::{Claim, HandleId};

type Buckets<K> = BTreeMap<K, HashSet<HandleId>>;

#[derive(Debug, Default)]
pub(crate) struct WaiterRegistry {
    /// Highest priority first.
    by_priority: Buckets<Reverse<Priority>>,
    by_reason: Buckets<String>,
    by_entry: Buckets<Entry>,
    waiters: HashSet<HandleId>,
}

impl WaiterRegistry {
    pub(crate) fn add(&mut self, claim: &Claim) {
        if !self.waiters.insert(claim.id) {
            return;
        }
        insert_into(&mut self.by_priority, Reverse(claim.priority), claim.id);
        insert_into(&mut self.by_reason, claim.reason.clone(), claim.id);
        insert_into(&mut self.by_entry, claim.entry.clone(), claim.id);
    }

    /// Returns false if the claim was not registered.
    pub(crate) fn remove(&mut self, claim: &Claim) -> bool {
        if !self.waiters.remove(&claim.id) {
            return false;
        }
        remove_from(&mut self.by_priority, &Reverse(claim.priority), claim.id);
        remove_from(&mut self.by_reason, &claim.reason, claim.id);
        remove_from(&mut self.by_entry, &claim.entry, claim.id);
        true
    }

    /// Highest priority among pending claims.
    pub(crate) fn top_priority(&self) -> Option<Priority> {
        self.by_priority.keys().next().map(|Reverse(p)| *p)
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn contains(&self, id: HandleId) -> bool {
        self.waiters.contains(&id)
    }

    /// Pending counts per reason, in reason order.
    pub(crate) fn by_reason(&self) -> impl Iterator<Item = (&str, usize)> {
        self.by_reason.iter().map(|(r, ids)| (r.as_str(), ids.len()))
    }

    pub(crate) fn waiting_on(&self, entry: &Entry) -> usize {
        self.by_entry.get(entry).map_or(0, HashSet::len)
    }

    /// Every flat-set member appears in exactly one bucket of each index, and
    /// no index holds anything else.
    pub(crate) fn is_consistent(&self) -> bool {
        fn covers<K>(buckets: &Buckets<K>, waiters: &HashSet<HandleId>) -> bool {
            let mut seen = HashSet::with_capacity(waiters.len());
            buckets
                .values()
                .all(|ids| !ids.is_empty() && ids.iter().all(|id| seen.insert(*id)))
                && seen == *waiters
        }
        covers(&self.by_priority, &self.waiters)
            && covers(&self.by_reason, &self.waiters)
            && covers(&self.by_entry, &self.waiters)
    }
}

fn insert_into<K: Ord>(buckets: &mut Buckets<K>, key: K, id: HandleId) {
    buckets.entry(key).or_default().insert(id);
}

fn remove_from<K: Ord>(buckets: &mut Buckets<K>, key: &K, id: HandleId) {
    if let Some(ids) = buckets.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            buckets.remove(key);
        }
    }
}
