#![forbid(unsafe_code)]
//! Deterministic multi-MDS simulator for SwarmFS.
//!
//! [`SimCluster`] owns one [`MdCache`] per MDS plus everything the caches
//! treat as external: per-node FIFO inboxes standing in for the
//! messenger, canned dir contents standing in for the metadata store, a
//! journal that acks on every pump, and synthetic clients that ack sync
//! fan-outs. `pump()` drains all of it to quiescence, so tests read as
//! straight-line scenarios.
//!
//! End-user operations travel as opaque server-port envelopes
//! (`"stat:/a/b"`), exactly how the cache sees them in production: it can
//! forward or park them without understanding the payload, and this crate
//! plays the server layer that re-drives them.

use anyhow::{anyhow, Result};
use serde::Serialize;
use sfs_cache::{CacheConfig, MdCache, OnFail, Traversal};
use sfs_msg::{Addr, CacheMessage, Envelope, Payload, Port};
use sfs_types::{ClientId, InodeCore, InodeKind, InodeNumber, MdsId, MdsMap};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Once;
use tracing::debug;

static INIT: Once = Once::new();

/// Install a tracing subscriber honoring `RUST_LOG` once per process.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Completed end-user operation, for assertions and transcripts.
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    pub node: u32,
    pub op: String,
    pub path: String,
    /// Resolved trace on success, errno on failure.
    pub result: std::result::Result<Vec<u64>, i32>,
}

pub struct SimCluster {
    pub nodes: Vec<MdCache>,
    inboxes: Vec<VecDeque<Envelope>>,
    /// Per-node canned dir contents served on fetch.
    pub store: Vec<BTreeMap<InodeNumber, Vec<(String, InodeCore)>>>,
    /// Envelopes that reached clients (sync fan-out traffic).
    pub client_msgs: Vec<Envelope>,
    /// Whether synthetic clients immediately ack sync starts.
    pub auto_client_ack: bool,
    /// Dir fetches withheld while `hold_fetches` is set.
    pub held_fetches: Vec<(usize, InodeNumber)>,
    pub hold_fetches: bool,
    pub completed: Vec<OpOutcome>,
}

impl SimCluster {
    pub fn new(n: u32) -> Self {
        Self::with_config(n, &CacheConfig::default())
    }

    pub fn with_config(n: u32, config: &CacheConfig) -> Self {
        init_tracing();
        let map = MdsMap::new(n);
        let nodes = (0..n).map(|i| MdCache::new(MdsId(i), map, config)).collect();
        let mut sim = Self {
            nodes,
            inboxes: (0..n).map(|_| VecDeque::new()).collect(),
            store: (0..n).map(|_| BTreeMap::new()).collect(),
            client_msgs: Vec::new(),
            auto_client_ack: true,
            held_fetches: Vec::new(),
            hold_fetches: false,
            completed: Vec::new(),
        };
        for i in 0..n as usize {
            sim.nodes[i].open_root(None);
        }
        sim.pump();
        sim
    }

    pub fn node(&mut self, i: u32) -> &mut MdCache {
        &mut self.nodes[i as usize]
    }

    // ── namespace helpers (authority side) ─────────────────────────────

    pub fn mkdir(&mut self, node: u32, parent: InodeNumber, name: &str) -> InodeNumber {
        let cache = self.node(node);
        let ino = cache.create_inode();
        let in_ = cache.get_inode_mut(ino).expect("fresh inode");
        in_.core.kind = InodeKind::Dir;
        in_.core.mode = 0o755;
        cache
            .link_inode(parent, name.to_owned(), ino)
            .expect("mkdir parent is a dir");
        cache.mark_dir_complete(ino);
        ino
    }

    pub fn mkfile(&mut self, node: u32, parent: InodeNumber, name: &str) -> InodeNumber {
        let cache = self.node(node);
        let ino = cache.create_inode();
        let in_ = cache.get_inode_mut(ino).expect("fresh inode");
        in_.core.mode = 0o644;
        cache
            .link_inode(parent, name.to_owned(), ino)
            .expect("mkfile parent is a dir");
        ino
    }

    // ── end-user operations ────────────────────────────────────────────

    /// Submit an operation (`"stat"`, `"readsoft"`, `"writesoft"`,
    /// `"writehard"`) against a path at a node.
    pub fn submit(&mut self, node: u32, op: &str, path: &str) {
        let env = Envelope {
            source: Addr::Client(ClientId(99)),
            dest: Addr::Mds(MdsId(node)),
            source_port: Port::Server,
            dest_port: Port::Server,
            payload: Payload::Opaque(format!("{op}:{path}").into_bytes()),
        };
        self.inboxes[node as usize].push_back(env);
    }

    /// Find a completed outcome for an op/path pair.
    pub fn outcome(&self, op: &str, path: &str) -> Option<&OpOutcome> {
        self.completed
            .iter()
            .find(|o| o.op == op && o.path == path)
    }

    pub fn transcript_json(&self) -> String {
        serde_json::to_string_pretty(&self.completed).expect("serializable transcript")
    }

    fn server_handle(&mut self, node: usize, env: Envelope) -> Result<()> {
        let Payload::Opaque(bytes) = &env.payload else {
            return Err(anyhow!("server port got a non-opaque payload"));
        };
        let text = std::str::from_utf8(bytes)?.to_owned();
        let (op, path) = text
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed op {text}"))?;
        let (op, path) = (op.to_owned(), path.to_owned());
        debug!(target: "sfs::harness", event = "server_op", node, %op, %path);

        // `statd` resolves by replication instead of forwarding, the way
        // internal cache operations do.
        let mode = if op == "statd" {
            OnFail::Discover
        } else {
            OnFail::Forward
        };
        let cache = &mut self.nodes[node];
        let trace = match cache.traverse(&path, Some(&env), mode) {
            Traversal::Done(trace) => trace,
            Traversal::Deferred => return Ok(()),
            Traversal::NotAuth => return Err(anyhow!("driven traversal cannot yield NotAuth")),
            Traversal::Error(e) => {
                self.completed.push(OpOutcome {
                    node: node as u32,
                    op,
                    path,
                    result: Err(e.to_errno()),
                });
                return Ok(());
            }
        };

        let target = *trace.last().expect("trace includes root");
        let proceed = match op.as_str() {
            "stat" | "statd" => true,
            "readsoft" => {
                let ok = cache.read_soft_start(target, Some(&env));
                if ok {
                    cache.read_soft_finish(target);
                }
                ok
            }
            "writesoft" => {
                let ok = cache.write_soft_start(target, Some(&env));
                if ok {
                    cache.write_soft_finish(target);
                }
                ok
            }
            "writehard" => {
                let ok = cache.write_hard_start(target, Some(&env));
                if ok {
                    cache.write_hard_finish(target);
                }
                ok
            }
            other => return Err(anyhow!("unknown op {other}")),
        };
        if proceed {
            self.completed.push(OpOutcome {
                node: node as u32,
                op,
                path,
                result: Ok(trace.iter().map(|i| i.0).collect()),
            });
        }
        Ok(())
    }

    // ── the pump ───────────────────────────────────────────────────────

    /// Deliver messages, serve fetches, flush journals, and re-drive
    /// parked operations until the whole cluster is quiescent.
    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;

            for i in 0..self.nodes.len() {
                for env in self.nodes[i].take_outbox() {
                    progressed = true;
                    self.route(env);
                }
                for env in self.nodes[i].take_upper() {
                    progressed = true;
                    self.server_handle(i, env).expect("well-formed retried op");
                }
                for ino in self.nodes[i].take_fetch_requests() {
                    progressed = true;
                    if self.hold_fetches {
                        self.held_fetches.push((i, ino));
                    } else {
                        self.complete_fetch(i, ino);
                    }
                }
                if !self.nodes[i].log.flush().is_empty() {
                    progressed = true;
                }
            }

            for i in 0..self.inboxes.len() {
                while let Some(env) = self.inboxes[i].pop_front() {
                    progressed = true;
                    self.deliver(i, env);
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Process one node's queued inbound envelopes without routing any
    /// outbound traffic; lets tests interleave protocol steps.
    pub fn step_node(&mut self, node: u32) {
        while let Some(env) = self.inboxes[node as usize].pop_front() {
            self.deliver(node as usize, env);
        }
    }

    /// Drain one node's outbox only; lets tests interleave deliveries.
    pub fn pump_node_outbox(&mut self, node: u32) {
        for env in self.nodes[node as usize].take_outbox() {
            self.route(env);
        }
        for i in 0..self.inboxes.len() {
            while let Some(env) = self.inboxes[i].pop_front() {
                self.deliver(i, env);
            }
        }
    }

    /// Serve every withheld dir fetch and resume pumping.
    pub fn release_fetches(&mut self) {
        self.hold_fetches = false;
        let held = std::mem::take(&mut self.held_fetches);
        for (i, ino) in held {
            self.complete_fetch(i, ino);
        }
        self.pump();
    }

    fn complete_fetch(&mut self, node: usize, ino: InodeNumber) {
        let entries = self.store[node].get(&ino).cloned().unwrap_or_default();
        debug!(target: "sfs::harness", event = "fetch_served", node, %ino, n = entries.len());
        self.nodes[node].dir_fetched(ino, entries);
    }

    fn route(&mut self, env: Envelope) {
        match env.dest {
            Addr::Mds(MdsId(d)) => self.inboxes[d as usize].push_back(env),
            Addr::Client(client) => {
                // Synthetic clients hold no state; they hand soft data
                // straight back.
                if self.auto_client_ack {
                    if let Payload::Cache(CacheMessage::InodeSyncStart { ino, .. }) = &env.payload {
                        let reply = Envelope {
                            source: Addr::Client(client),
                            dest: env.source,
                            source_port: Port::Cache,
                            dest_port: Port::Cache,
                            payload: Payload::Cache(CacheMessage::InodeSyncAck {
                                ino: *ino,
                                did_have: true,
                                wantback: false,
                            }),
                        };
                        if let Addr::Mds(MdsId(d)) = env.source {
                            self.inboxes[d as usize].push_back(reply);
                        }
                    }
                }
                self.client_msgs.push(env);
            }
        }
    }

    fn deliver(&mut self, node: usize, env: Envelope) {
        match env.dest_port {
            Port::Cache => self.nodes[node].handle(env),
            Port::Server => self
                .server_handle(node, env)
                .expect("well-formed server op"),
            Port::Main => debug!(target: "sfs::harness", event = "main_port_drop"),
        }
    }

    // ── cluster-wide checks ────────────────────────────────────────────

    /// Subtree bookkeeping invariants on every node.
    pub fn check_invariants(&self) {
        for cache in &self.nodes {
            cache.check_subtree_invariants();
        }
    }

    /// Run the full shutdown drain across the cluster.
    pub fn shutdown_all(&mut self) {
        for cache in &mut self.nodes {
            cache.shutdown_start();
        }
        self.pump();
        // Non-zero nodes drain first, then zero reaps root.
        for _ in 0..64 {
            let mut all_done = true;
            for i in (0..self.nodes.len()).rev() {
                let done = self.nodes[i].shutdown_pass();
                if done && i != 0 {
                    for peer in &mut self.nodes {
                        peer.note_peer_shut_down(MdsId(i as u32));
                    }
                }
                all_done &= done;
                self.pump();
            }
            if all_done {
                return;
            }
        }
        panic!("shutdown did not converge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::ROOT_INO;

    #[test]
    fn two_node_bootstrap_replicates_root() {
        let mut sim = SimCluster::new(2);
        assert_eq!(sim.node(0).root_ino(), Some(ROOT_INO));
        assert_eq!(sim.node(1).root_ino(), Some(ROOT_INO));
        let root0 = sim.nodes[0].get_inode(ROOT_INO).unwrap();
        assert!(root0.auth);
        assert!(root0.cached_by.contains(&MdsId(1)));
        let root1 = sim.nodes[1].get_inode(ROOT_INO).unwrap();
        assert!(!root1.auth);
    }

    #[test]
    fn stat_resolves_locally() {
        let mut sim = SimCluster::new(1);
        let a = sim.mkdir(0, ROOT_INO, "a");
        sim.node(0).mark_dir_complete(ROOT_INO);
        sim.submit(0, "stat", "/a");
        sim.pump();
        let out = sim.outcome("stat", "/a").expect("completed");
        assert_eq!(out.result.as_ref().unwrap().last(), Some(&a.0));
    }

    #[test]
    fn stat_missing_is_enoent() {
        let mut sim = SimCluster::new(1);
        sim.node(0).mark_dir_complete(ROOT_INO);
        sim.submit(0, "stat", "/nope");
        sim.pump();
        let out = sim.outcome("stat", "/nope").expect("completed");
        assert_eq!(out.result, Err(libc_enoent()));
    }

    fn libc_enoent() -> i32 {
        sfs_error::SfsError::NotFound.to_errno()
    }
}
