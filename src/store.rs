// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-key storage: a value cell and the readers-writer lock that serializes
//! transactions touching the key.
//!
//! The lock here is deliberately _not_ an RAII rwlock. Locks are acquired
//! inside the Prepare handler and released inside the Commit or Abort
//! handler -- different RPCs, different tasks, arbitrarily far apart in time
//! -- so lock ownership has to be plain data (a reader count and a writer
//! flag), with acquire and release as separate operations. Acquisition is
//! bounded: a waiter that cannot get the lock within the conflict-detection
//! timeout gives up, which is what turns a lock conflict into a No vote
//! rather than a deadlock.

use async_std::{
    future,
    sync::{Arc, Condvar, Mutex},
};
use std::time::Duration;

/// Which side of a readers-writer lock an operation needs: Gets share, Sets
/// exclude.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub(crate) enum LockMode {
    Read,
    Write,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// A readers-writer lock with explicit, cross-task acquire and release.
/// Any number of read holders, or exactly one write holder.
pub(crate) struct KeyLock {
    state: Mutex<LockState>,
    cvar: Condvar,
}

impl KeyLock {
    pub(crate) fn new() -> Self {
        KeyLock {
            state: Mutex::new(LockState::default()),
            cvar: Condvar::new(),
        }
    }

    /// Attempt to acquire the lock in `mode`, waiting at most `within` for
    /// current holders to clear. Returns whether the lock was acquired; on
    /// timeout the lock state is untouched.
    pub(crate) async fn acquire(&self, mode: LockMode, within: Duration) -> bool {
        let attempt = async {
            let guard = self.state.lock().await;
            match mode {
                LockMode::Read => {
                    let mut g = self.cvar.wait_until(guard, |s| !s.writer).await;
                    g.readers += 1;
                }
                LockMode::Write => {
                    let mut g = self
                        .cvar
                        .wait_until(guard, |s| !s.writer && s.readers == 0)
                        .await;
                    g.writer = true;
                }
            }
        };
        future::timeout(within, attempt).await.is_ok()
    }

    /// Release a previously-acquired lock. Must be called exactly once per
    /// successful [KeyLock::acquire], in the matching mode.
    pub(crate) async fn release(&self, mode: LockMode) {
        let mut g = self.state.lock().await;
        match mode {
            LockMode::Read => {
                debug_assert!(g.readers > 0);
                g.readers = g.readers.saturating_sub(1);
            }
            LockMode::Write => {
                debug_assert!(g.writer);
                g.writer = false;
            }
        }
        self.cvar.notify_all();
    }
}

/// One key's slot at its owning participant: the current value (None until
/// the first committed Set) and the lock gating access to it.
pub(crate) struct StoreItem<V> {
    pub(crate) value: Option<V>,
    pub(crate) lock: Arc<KeyLock>,
}

impl<V> StoreItem<V> {
    pub(crate) fn new() -> Self {
        StoreItem {
            value: None,
            lock: Arc::new(KeyLock::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn readers_share_writers_exclude() {
        task::block_on(async {
            let kl = KeyLock::new();
            assert!(kl.acquire(LockMode::Read, SHORT).await);
            assert!(kl.acquire(LockMode::Read, SHORT).await);
            // A writer cannot join two readers.
            assert!(!kl.acquire(LockMode::Write, SHORT).await);
            kl.release(LockMode::Read).await;
            kl.release(LockMode::Read).await;
            assert!(kl.acquire(LockMode::Write, SHORT).await);
            // Neither a second writer nor a reader can join a writer.
            assert!(!kl.acquire(LockMode::Write, SHORT).await);
            assert!(!kl.acquire(LockMode::Read, SHORT).await);
            kl.release(LockMode::Write).await;
        });
    }

    #[test]
    fn waiter_gets_lock_when_released_in_time() {
        task::block_on(async {
            let kl = Arc::new(KeyLock::new());
            assert!(kl.acquire(LockMode::Write, SHORT).await);
            let holder = kl.clone();
            task::spawn(async move {
                task::sleep(Duration::from_millis(10)).await;
                holder.release(LockMode::Write).await;
            });
            // The release arrives while we are still willing to wait, so
            // this acquire blocks briefly and then succeeds.
            assert!(kl.acquire(LockMode::Write, Duration::from_millis(200)).await);
            kl.release(LockMode::Write).await;
        });
    }

    #[test]
    fn timed_out_waiter_leaves_lock_intact() {
        task::block_on(async {
            let kl = KeyLock::new();
            assert!(kl.acquire(LockMode::Write, SHORT).await);
            assert!(!kl.acquire(LockMode::Read, SHORT).await);
            kl.release(LockMode::Write).await;
            // The failed waiter must not have perturbed the state.
            assert!(kl.acquire(LockMode::Write, SHORT).await);
            kl.release(LockMode::Write).await;
        });
    }
}
