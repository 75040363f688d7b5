//! Transactional store for controller state.
//!
//! All shared state sits behind a single mutex. Every committing transaction
//! broadcasts a change notification after the lock is released, and a
//! transaction that cannot make progress returns [`Step::Retry`] and sleeps
//! until the next commit (or cancellation) before being re-run against fresh
//! state.
//!
//! Transactions are closures over the whole state, so a transaction either
//! runs to completion or not at all. A closure that returns `Step::Retry` must
//! leave the state untouched.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Outcome of one evaluation of a retryable transaction.
#[derive(Debug)]
pub(crate) enum Step<T> {
    Commit(T),
    Retry,
}

pub(crate) struct Store<S> {
    state: Mutex<S>,
    changed: Notify,
}

impl<S> Store<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // The only panic inside a transaction fires before any write.
                tracing::error!("Store mutex poisoned - recovering state");
                poisoned.into_inner()
            }
        }
    }

    /// Run a read-only view of the state. Does not wake retrying transactions.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.lock();
        f(&guard)
    }

    /// Run a mutating transaction and wake every retrying transaction.
    pub(crate) fn atomically<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = {
            let mut guard = self.lock();
            f(&mut guard)
        };
        self.changed.notify_waiters();
        result
    }

    /// Run `tx` until it commits.
    ///
    /// `tx` receives the state and whether `cancel` has fired. On
    /// `Step::Retry` the caller is suspended until another transaction commits
    /// or `cancel` fires, then `tx` is evaluated again. The change subscription
    /// is armed before the state is read, so a commit that lands between the
    /// evaluation and the suspension still wakes us.
    pub(crate) async fn atomically_or_retry<R, F>(&self, cancel: &CancellationToken, mut tx: F) -> R
    where
        F: FnMut(&mut S, bool) -> Step<R>,
    {
        let mut retries: u64 = 0;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let step = {
                let mut guard = self.lock();
                tx(&mut guard, cancel.is_cancelled())
            };

            match step {
                Step::Commit(result) => {
                    self.changed.notify_waiters();
                    return result;
                }
                Step::Retry => {
                    retries += 1;
                    tracing::trace!(retries, "Transaction blocked, waiting for state change");
                }
            }

            tokio::select! {
                () = &mut changed => {}
                () = cancel.cancelled() => {}
            }
        }
    }

    /// Suspend until `pred` holds for the committed state.
    pub(crate) async fn wait_until(&self, mut pred: impl FnMut(&S) -> bool) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let satisfied = {
                let guard = self.lock();
                pred(&guard)
            };
            if satisfied {
                return;
            }
            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn atomically_mutates_and_returns() {
        let store = Store::new(1u32);
        let previous = store.atomically(|n| {
            let old = *n;
            *n += 41;
            old
        });
        assert_eq!(previous, 1);
        assert_eq!(store.read(|n| *n), 42);
    }

    #[tokio::test]
    async fn retry_wakes_on_commit() {
        let store = Arc::new(Store::new(0u32));
        let cancel = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store
                    .atomically_or_retry(&cancel, |n, _| {
                        if *n >= 3 {
                            *n = 100;
                            Step::Commit(true)
                        } else {
                            Step::Retry
                        }
                    })
                    .await
            })
        };

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            store.atomically(|n| *n += 1);
        }

        let committed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("retrying transaction should wake")
            .unwrap();
        assert!(committed);
        assert_eq!(store.read(|n| *n), 100);
    }

    #[tokio::test]
    async fn retry_observes_cancellation() {
        let store = Store::new(());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            store.atomically_or_retry(&cancel, |_, cancelled| {
                if cancelled {
                    Step::Commit("cancelled")
                } else {
                    Step::Retry
                }
            }),
        )
        .await
        .expect("cancellation should wake the transaction");
        assert_eq!(outcome, "cancelled");
    }

    #[tokio::test]
    async fn wait_until_returns_once_predicate_holds() {
        let store = Arc::new(Store::new(Vec::<u8>::new()));
        let pusher = Arc::clone(&store);
        tokio::spawn(async move {
            for i in 0..4 {
                tokio::time::sleep(Duration::from_millis(2)).await;
                pusher.atomically(|v| v.push(i));
            }
        });

        tokio::time::timeout(Duration::from_secs(5), store.wait_until(|v| v.len() == 4))
            .await
            .expect("predicate should become true");
        assert_eq!(store.read(|v| v.clone()), vec![0, 1, 2, 3]);
    }
}
