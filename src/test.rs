// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! End-to-end protocol scenarios, driven through [Cluster]: the happy path,
//! disconnections in every phase, coordinator crashes at chosen and at
//! random moments, and contention between concurrent transactions.

use triptych::{harness::Cluster, Tid};

use async_std::task;
use std::time::Duration;

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

// The layout every scenario uses: three participants, one key each.
fn xyz_cluster() -> Cluster<u64> {
    setup_tracing_subscriber();
    Cluster::new(vec![vec!["x"], vec!["y"], vec!["z"]], false)
}

// Two transactions without failures: both commit, and the second reads what
// the first wrote.
pub fn basic_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 2).await;
        cfg.set(Tid(0), "z", 3).await;
        cfg.finish_transaction(Tid(0));
        cfg.assert_transaction(Tid(0), true, None).await;

        cfg.get(Tid(1), "x").await;
        cfg.get(Tid(1), "y").await;
        cfg.get(Tid(1), "z").await;
        cfg.finish_transaction(Tid(1));
        cfg.assert_transaction(Tid(1), true, Some(&[("x", 1), ("y", 2), ("z", 3)]))
            .await;
        cfg.shutdown();
    });
}

// A disconnected server makes the transaction abort, and the store is
// unchanged once the server returns.
pub fn basic_abort() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 1).await;
        cfg.set(Tid(0), "z", 1).await;
        cfg.finish_transaction(Tid(0));
        cfg.assert_transaction(Tid(0), true, Some(&[])).await;

        cfg.disconnect(0);
        cfg.set(Tid(1), "x", 2).await;
        cfg.set(Tid(1), "y", 2).await;
        cfg.set(Tid(1), "z", 2).await;
        cfg.finish_transaction(Tid(1));
        cfg.assert_transaction(Tid(1), false, None).await;

        // Give the straggling abort a moment to land once the server is
        // back, then read everything.
        task::sleep(Duration::from_millis(50)).await;
        cfg.connect(0);

        cfg.get(Tid(2), "x").await;
        cfg.get(Tid(2), "y").await;
        cfg.get(Tid(2), "z").await;
        cfg.finish_transaction(Tid(2));
        cfg.assert_transaction(Tid(2), true, Some(&[("x", 1), ("y", 1), ("z", 1)]))
            .await;
        cfg.shutdown();
    });
}

// A coordinator restarted between transactions recovers and keeps serving.
pub fn easy_recovery() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 2).await;
        cfg.set(Tid(0), "z", 3).await;
        cfg.finish_transaction(Tid(0));
        cfg.assert_transaction(Tid(0), true, None).await;

        cfg.start_coordinator();
        cfg.connect_all();

        cfg.get(Tid(1), "x").await;
        cfg.get(Tid(1), "y").await;
        cfg.get(Tid(1), "z").await;
        cfg.finish_transaction(Tid(1));
        cfg.assert_transaction(Tid(1), true, Some(&[("x", 1), ("y", 2), ("z", 3)]))
            .await;
        cfg.shutdown();
    });
}

// A server with no operations for the transaction reports itself irrelevant
// in Prepare; losing it afterwards doesn't stop the commit.
pub fn relevance() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 1).await;
        let c = cfg.clone();
        cfg.on_next_pre_commit(move || {
            c.disconnect(2);
            true
        });
        cfg.finish_transaction(Tid(0));
        cfg.assert_transaction(Tid(0), true, None).await;
        cfg.shutdown();
    });
}

// Concurrent transactions on disjoint keys all succeed.
pub fn concurrent_different_keys() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        let n = 10;
        for i in 0..n {
            let tid1 = Tid(i * 3);
            let tid2 = Tid(i * 3 + 1);
            let tid3 = Tid(i * 3 + 2);
            cfg.set(tid1, "x", i).await;
            cfg.set(tid2, "y", i).await;
            cfg.set(tid3, "z", i).await;
            cfg.finish_transaction(tid3);
            cfg.finish_transaction(tid2);
            cfg.finish_transaction(tid1);
            cfg.assert_transaction(tid3, true, None).await;
            cfg.assert_transaction(tid2, true, None).await;
            cfg.assert_transaction(tid1, true, None).await;
        }
        cfg.shutdown();
    });
}

// Concurrent readers of one key share its lock and all succeed.
pub fn concurrent_read_same_keys() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        let keys = ["x", "y", "z"];
        let n = 10;
        for i in 0..n {
            let tid1 = Tid(i * 3);
            let tid2 = Tid(i * 3 + 1);
            let tid3 = Tid(i * 3 + 2);
            let key = keys[(i % 3) as usize];
            cfg.get(tid1, key).await;
            cfg.get(tid2, key).await;
            cfg.get(tid3, key).await;
            cfg.finish_transaction(tid3);
            cfg.finish_transaction(tid2);
            cfg.finish_transaction(tid1);
            cfg.assert_transaction(tid3, true, None).await;
            cfg.assert_transaction(tid2, true, None).await;
            cfg.assert_transaction(tid1, true, None).await;
        }
        cfg.shutdown();
    });
}

// Concurrent writers to one key contend on its write lock; at least one of
// each batch must get through.
pub fn concurrent_write_same_keys() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        let keys = ["x", "y", "z"];
        let n = 10;
        for i in 0..n {
            let tid1 = Tid(i * 3);
            let tid2 = Tid(i * 3 + 1);
            let tid3 = Tid(i * 3 + 2);
            let key = keys[(i % 3) as usize];
            cfg.set(tid1, key, i).await;
            cfg.set(tid2, key, i).await;
            cfg.set(tid3, key, i).await;
            cfg.finish_transaction(tid3);
            cfg.finish_transaction(tid2);
            cfg.finish_transaction(tid1);
            let r1 = cfg.wait_transaction(tid3).await;
            let r2 = cfg.wait_transaction(tid2).await;
            let r3 = cfg.wait_transaction(tid1).await;
            let successes = [&r1, &r2, &r3].iter().filter(|r| r.committed).count();
            assert!(successes >= 1, "batch {} had no commits", i);
        }
        cfg.shutdown();
    });
}

// Concurrent writers of whole rows serialize: a follow-up read observes one
// writer's values on every key, never a mixture.
pub fn serializability() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 0).await;
        cfg.set(Tid(0), "y", 0).await;
        cfg.set(Tid(0), "z", 0).await;
        cfg.finish_transaction(Tid(0));
        cfg.wait_transaction(Tid(0)).await;

        let n = 10;
        let m = 3u64;
        let mut old_val = 0u64;
        for i in 0..n {
            let tid_base = i * (m + 1) + 1;
            for j in 0..m {
                let tid = Tid(tid_base + j);
                cfg.set(tid, "x", tid.0).await;
                cfg.set(tid, "y", tid.0).await;
                cfg.set(tid, "z", tid.0).await;
            }
            for j in 0..m {
                cfg.finish_transaction(Tid(tid_base + j));
            }
            for j in 0..m {
                cfg.wait_transaction(Tid(tid_base + j)).await;
            }

            let tid = Tid(tid_base + m);
            cfg.get(tid, "x").await;
            cfg.get(tid, "y").await;
            cfg.get(tid, "z").await;
            cfg.finish_transaction(tid);
            let resp = cfg.assert_transaction(tid, true, None).await;
            let x = resp.read_values["x"];
            let y = resp.read_values["y"];
            let z = resp.read_values["z"];
            assert!(x == y && x == z, "read values don't match: {} {} {}", x, y, z);
            assert!(
                x == old_val || (x >= tid_base && x < tid_base + m),
                "read value {} outside the possible range",
                x
            );
            old_val = x;
        }
        cfg.shutdown();
    });
}

// A server lost after Prepare but before its PreCommit lands: abort.
pub fn disconnect_pre_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 1).await;
        cfg.set(Tid(0), "z", 1).await;
        let c = cfg.clone();
        cfg.on_next_pre_commit(move || {
            c.disconnect(0);
            true
        });
        cfg.finish_transaction(Tid(0));
        cfg.assert_transaction(Tid(0), false, None).await;
        cfg.shutdown();
    });
}

// A server lost after PreCommit but before its Commit lands: the decision is
// already Commit, so the transaction blocks until the server returns, then
// commits.
pub fn disconnect_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 1).await;
        cfg.set(Tid(0), "z", 1).await;
        let c = cfg.clone();
        cfg.on_next_commit(move || {
            c.disconnect(0);
            true
        });
        cfg.finish_transaction(Tid(0));

        // While the server is away there must be no outcome at all.
        task::sleep(Duration::from_millis(50)).await;
        assert!(!cfg.has_response(Tid(0)));

        cfg.connect(0);
        cfg.assert_transaction(Tid(0), true, None).await;
        cfg.shutdown();
    });
}

// Coordinator dies as PreCommit begins; its successor recovers the
// transaction from the participants and commits it.
pub fn restart_pre_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        cfg.set(Tid(0), "x", 1).await;
        cfg.set(Tid(0), "y", 1).await;
        cfg.set(Tid(0), "z", 1).await;
        let c = cfg.clone();
        cfg.on_next_pre_commit(move || {
            c.restart_coordinator();
            true
        });
        cfg.finish_transaction(Tid(0));
        cfg.assert_transaction(Tid(0), true, None).await;
        cfg.shutdown();
    });
}

// Coordinator dies as Commit begins, repeatedly; every transaction still
// commits.
pub fn restart_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        let n = 10;
        for i in 0..n {
            let tid = Tid(i);
            cfg.set(tid, "x", 1).await;
            cfg.set(tid, "y", 1).await;
            cfg.set(tid, "z", 1).await;
            let c = cfg.clone();
            cfg.on_next_commit(move || {
                c.restart_coordinator();
                true
            });
            cfg.finish_transaction(tid);
            cfg.assert_transaction(tid, true, None).await;
        }
        cfg.shutdown();
    });
}

// Coordinator dies at a random moment in the PreCommit phase (possibly
// several times, possibly not at all); every transaction still commits.
pub fn restart_mid_pre_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        let n = 10;
        for i in 0..n {
            let tid = Tid(i);
            cfg.set(tid, "x", 1).await;
            cfg.set(tid, "y", 1).await;
            cfg.set(tid, "z", 1).await;
            let c = cfg.clone();
            cfg.on_next_pre_commit(move || {
                if rand::random::<bool>() {
                    c.restart_coordinator();
                    true
                } else {
                    false
                }
            });
            cfg.finish_transaction(tid);
            cfg.assert_transaction(tid, true, None).await;
        }
        cfg.shutdown();
    });
}

// Same again in the Commit phase.
pub fn restart_mid_commit() {
    let cfg = xyz_cluster();
    task::block_on(async move {
        let n = 10;
        for i in 0..n {
            let tid = Tid(i);
            cfg.set(tid, "x", 1).await;
            cfg.set(tid, "y", 1).await;
            cfg.set(tid, "z", 1).await;
            let c = cfg.clone();
            cfg.on_next_commit(move || {
                if rand::random::<bool>() {
                    c.restart_coordinator();
                    true
                } else {
                    false
                }
            });
            cfg.finish_transaction(tid);
            cfg.assert_transaction(tid, true, None).await;
        }
        cfg.shutdown();
    });
}
