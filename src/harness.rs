// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A test fixture wrapping a whole system: participants built from a key
//! layout, the simulated network, a client-side key map for routing Get/Set
//! calls, and the lifecycle of coordinator instances (including crashing one
//! mid-protocol and starting its successor, which is most of the point).
//!
//! Responses are copied off each coordinator's channel by an applier task
//! into one shared list the tests poll; a crashed coordinator's applier is
//! retired with it so a dead instance can't speak. Seeing the same tid
//! resolved twice is recorded and turned into a panic at the next wait.

use crate::{Coordinator, Network, Participant, ResponseMsg, ServerId, Tid, Val};
use async_std::task;
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

/// A fault-injection hook, run just as a matching RPC is about to be
/// delivered. Returning true consumes the hook; returning false leaves it
/// armed for the next delivery (which is how "at a random moment during the
/// phase" gets simulated).
pub type FaultHook = Box<dyn FnMut() -> bool + Send>;

struct ClusterState<V: Val> {
    key_map: BTreeMap<String, usize>,
    servers: Vec<Participant<V>>,
    coordinator: Option<Coordinator<V>>,
    // The live coordinator's endpoint-set flag and applier flag; flipping
    // them fences off a crashed instance entirely.
    ends_alive: Arc<AtomicBool>,
    applier_live: Arc<AtomicBool>,
    on_pre_commit: Option<FaultHook>,
    on_commit: Option<FaultHook>,
}

struct Responses<V: Val> {
    seen: Vec<ResponseMsg<V>>,
    duplicate: Option<Tid>,
}

/// One simulated deployment. Cheap to clone; clones share state.
pub struct Cluster<V: Val> {
    net: Network<V>,
    state: Arc<Mutex<ClusterState<V>>>,
    responses: Arc<Mutex<Responses<V>>>,
}

impl<V: Val> Clone for Cluster<V> {
    fn clone(&self) -> Self {
        Cluster {
            net: self.net.clone(),
            state: self.state.clone(),
            responses: self.responses.clone(),
        }
    }
}

impl<V: Val> Cluster<V> {
    /// Build a cluster from a key layout: `keys[i]` is the key set owned by
    /// participant `i`. Starts a coordinator and connects everyone.
    pub fn new(keys: Vec<Vec<&str>>, unreliable: bool) -> Self {
        let net = Network::new(unreliable);
        let mut key_map = BTreeMap::new();
        let mut servers = Vec::new();
        for (i, key_list) in keys.iter().enumerate() {
            for key in key_list.iter() {
                key_map.insert(key.to_string(), i);
            }
            let sv = Participant::new(
                ServerId(i),
                key_list.iter().map(|k| k.to_string()).collect(),
            );
            net.add_server(sv.clone());
            servers.push(sv);
        }
        let cluster = Cluster {
            net: net.clone(),
            state: Arc::new(Mutex::new(ClusterState {
                key_map,
                servers,
                coordinator: None,
                ends_alive: Arc::new(AtomicBool::new(false)),
                applier_live: Arc::new(AtomicBool::new(false)),
                on_pre_commit: None,
                on_commit: None,
            })),
            responses: Arc::new(Mutex::new(Responses {
                seen: Vec::new(),
                duplicate: None,
            })),
        };
        let hooks = cluster.clone();
        let hook: crate::network::DeliveryHook =
            Box::new(move |method| hooks.dispatch_hook(method));
        net.set_hook(Some(hook));
        cluster.start_coordinator();
        cluster.connect_all();
        cluster
    }

    fn dispatch_hook(&self, method: &'static str) {
        // The armed hook comes out of the state before it runs: hooks call
        // straight back into the cluster (disconnect, restart_coordinator).
        let hook = {
            let mut g = self.state.lock().unwrap();
            match method {
                "PreCommit" => g.on_pre_commit.take(),
                "Commit" => g.on_commit.take(),
                _ => None,
            }
        };
        if let Some(mut f) = hook {
            let consumed = f();
            if !consumed {
                let mut g = self.state.lock().unwrap();
                let slot = if method == "PreCommit" {
                    &mut g.on_pre_commit
                } else {
                    &mut g.on_commit
                };
                if slot.is_none() {
                    *slot = Some(f);
                }
            }
        }
    }

    /// Arm `f` to run on the next PreCommit delivery attempt.
    pub fn on_next_pre_commit(&self, f: impl FnMut() -> bool + Send + 'static) {
        self.state.lock().unwrap().on_pre_commit = Some(Box::new(f));
    }

    /// Arm `f` to run on the next Commit delivery attempt.
    pub fn on_next_commit(&self, f: impl FnMut() -> bool + Send + 'static) {
        self.state.lock().unwrap().on_commit = Some(Box::new(f));
    }

    /// Start a fresh coordinator (crashing any live one first). Its
    /// endpoints are minted dead-on-arrival for any previous instance and
    /// live for this one; its responses flow through a fresh applier.
    pub fn start_coordinator(&self) {
        let mut g = self.state.lock().unwrap();
        self.crash_coordinator_locked(&mut g);
        debug!("starting coordinator");
        let alive = Arc::new(AtomicBool::new(true));
        let ends = self.net.make_endpoints(&alive);
        let (tx, mut rx) = mpsc::unbounded::<ResponseMsg<V>>();
        let live = Arc::new(AtomicBool::new(true));
        {
            let responses = self.responses.clone();
            let live = live.clone();
            task::spawn(async move {
                while let Some(m) = rx.next().await {
                    if !live.load(Ordering::SeqCst) {
                        continue;
                    }
                    let mut r = responses.lock().unwrap();
                    if r.seen.iter().any(|prev: &ResponseMsg<V>| prev.tid == m.tid) {
                        warn!("repeated response for {:?}", m.tid);
                        r.duplicate = Some(m.tid);
                    } else {
                        r.seen.push(m);
                    }
                }
            });
        }
        g.coordinator = Some(Coordinator::new(ends, tx));
        g.ends_alive = alive;
        g.applier_live = live;
    }

    fn crash_coordinator_locked(&self, g: &mut ClusterState<V>) {
        if let Some(co) = g.coordinator.take() {
            debug!("crashing coordinator");
            g.applier_live.store(false, Ordering::SeqCst);
            g.ends_alive.store(false, Ordering::SeqCst);
            co.kill();
        }
    }

    /// Crash the live coordinator: fence its endpoints, retire its applier,
    /// stop its tasks. Participant state is untouched.
    pub fn crash_coordinator(&self) {
        let mut g = self.state.lock().unwrap();
        self.crash_coordinator_locked(&mut g);
    }

    /// Crash and replace the coordinator, reconnecting every server, as the
    /// surrounding system would after a coordinator host reboot.
    pub fn restart_coordinator(&self) {
        self.start_coordinator();
        self.connect_all();
    }

    /// Detach server `i` from the network; its in-memory state survives.
    pub fn disconnect(&self, i: usize) {
        debug!("disconnecting server {:?}", i);
        self.net.connect(ServerId(i), false);
    }

    /// Reattach server `i`.
    pub fn connect(&self, i: usize) {
        debug!("connecting server {:?}", i);
        self.net.connect(ServerId(i), true);
    }

    pub fn connect_all(&self) {
        let n = self.state.lock().unwrap().servers.len();
        for i in 0..n {
            self.connect(i);
        }
    }

    fn owner(&self, key: &str) -> Participant<V> {
        let g = self.state.lock().unwrap();
        let i = *g.key_map.get(key).expect("key not in the cluster layout");
        g.servers[i].clone()
    }

    /// Log a Get at the owning participant, as the client library would.
    pub async fn get(&self, tid: Tid, key: &str) {
        self.owner(key).get(tid, key).await;
    }

    /// Log a Set at the owning participant.
    pub async fn set(&self, tid: Tid, key: &str, value: V) {
        self.owner(key).set(tid, key, value).await;
    }

    /// Ask the live coordinator to drive `tid` to an outcome.
    pub fn finish_transaction(&self, tid: Tid) {
        let co = {
            let g = self.state.lock().unwrap();
            g.coordinator.clone().expect("no live coordinator")
        };
        co.finish_transaction(tid);
    }

    pub fn has_response(&self, tid: Tid) -> bool {
        self.responses
            .lock()
            .unwrap()
            .seen
            .iter()
            .any(|m| m.tid == tid)
    }

    /// Block (poll) until `tid` has an outcome, and return it.
    pub async fn wait_transaction(&self, tid: Tid) -> ResponseMsg<V> {
        loop {
            {
                let r = self.responses.lock().unwrap();
                if let Some(d) = r.duplicate {
                    panic!("repeated response for {:?}", d);
                }
                if let Some(m) = r.seen.iter().find(|m| m.tid == tid) {
                    return m.clone();
                }
            }
            task::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for `tid` and check its outcome, and -- when `read_values` is
    /// given -- exactly the values its Gets returned.
    pub async fn assert_transaction(
        &self,
        tid: Tid,
        committed: bool,
        read_values: Option<&[(&str, V)]>,
    ) -> ResponseMsg<V> {
        let resp = self.wait_transaction(tid).await;
        assert_eq!(resp.committed, committed, "outcome of {:?}", tid);
        if let Some(expected) = read_values {
            assert_eq!(
                resp.read_values.len(),
                expected.len(),
                "read count of {:?}",
                tid
            );
            for (k, v) in expected {
                assert_eq!(resp.read_values.get(*k), Some(v), "read of {:?} by {:?}", k, tid);
            }
        }
        resp
    }

    /// Kill the live coordinator and leave the cluster to the collector.
    pub fn shutdown(&self) {
        self.crash_coordinator();
    }
}
