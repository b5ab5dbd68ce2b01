#![forbid(unsafe_code)]
//! Protocol laws and boundary behaviors: idempotent replica install,
//! export round-trips, expire draining, hop limits, and refusal cases.

use sfs_harness::SimCluster;
use sfs_msg::{Addr, CacheMessage, Discover, Envelope};
use sfs_types::{DirAuth, InodeNumber, MdsId, ROOT_INO};

#[test]
fn discover_install_is_idempotent() {
    let mut sim = SimCluster::new(2);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    // Drive the request by hand so we can capture the reply and replay it.
    let req = Envelope::cache(
        MdsId(1),
        MdsId(0),
        CacheMessage::Discover(Discover::new(MdsId(1), "/".to_owned(), vec!["f".into()])),
    );
    sim.node(0).handle(req);
    let replies = sim.node(0).take_outbox();
    let reply = replies
        .iter()
        .find(|env| env.dest == Addr::Mds(MdsId(1)))
        .expect("discover reply")
        .clone();

    sim.node(1).handle(reply.clone());
    let size_once = sim.node(1).cache_size();
    let cached_once = sim.nodes[1].get_inode(f).unwrap().cached_by.clone();

    sim.node(1).handle(reply);
    assert_eq!(sim.node(1).cache_size(), size_once);
    assert_eq!(sim.nodes[1].get_inode(f).unwrap().cached_by, cached_once);
}

#[test]
fn export_round_trip_restores_the_subtree() {
    let mut sim = SimCluster::new(2);
    let x = sim.mkdir(0, ROOT_INO, "x");
    let f = sim.mkfile(0, x, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);
    sim.node(0).get_inode_mut(f).unwrap().core.size = 512;
    let core_before = sim.nodes[0].get_inode(f).unwrap().core;
    let pop_before = sim.nodes[0].get_inode(x).unwrap().popularity;

    sim.node(0).export_dir(x, MdsId(1));
    sim.pump();
    assert!(sim.nodes[1].imports().contains(&x));
    sim.check_invariants();

    sim.node(1).export_dir(x, MdsId(0));
    sim.pump();
    sim.check_invariants();

    assert!(sim.nodes[0].exports().is_empty());
    assert!(sim.nodes[1].imports().is_empty());
    let x0 = sim.nodes[0].get_inode(x).unwrap();
    assert_eq!(x0.dir_auth, DirAuth::Parent);
    assert!((x0.popularity - pop_before).abs() < 1e-9);
    let f0 = sim.nodes[0].get_inode(f).unwrap();
    assert_eq!(f0.core, core_before);
    assert!(f0.auth);
    // The exchanged pair is the only allowed difference.
    assert!(f0.cached_by.iter().all(|w| *w == MdsId(1)));
}

#[test]
fn every_discovered_replica_eventually_drains_cached_by() {
    let mut sim = SimCluster::new(3);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.submit(1, "statd", "/f");
    sim.submit(2, "statd", "/f");
    sim.pump();
    let holders = sim.nodes[0].get_inode(f).unwrap().cached_by.clone();
    assert_eq!(holders.len(), 2);
    assert!(!sim.nodes[0].get_inode(f).unwrap().is_expireable());

    sim.node(1).trim(Some(1));
    sim.node(2).trim(Some(1));
    sim.pump();

    let f0 = sim.nodes[0].get_inode(f).unwrap();
    assert!(f0.cached_by.is_empty());
    assert!(f0.is_expireable());
}

#[test]
fn expire_forwarding_is_hop_limited() {
    let mut sim = SimCluster::new(3);
    // An expire for an inode nobody has circles the ring and is dropped.
    let env = Envelope::cache(
        MdsId(2),
        MdsId(1),
        CacheMessage::InodeExpire {
            ino: InodeNumber(0xdead),
            from: MdsId(2),
            soft: false,
            hops: 0,
        },
    );
    sim.node(1).handle(env);
    sim.pump();
    let forwarded: u64 = sim.nodes.iter().map(|n| n.counters.iupfw).sum();
    assert!(forwarded >= u64::from(sim.nodes[0].cluster().num_mds()));
    assert!(forwarded <= 2 * u64::from(sim.nodes[0].cluster().num_mds()) + 2);
}

#[test]
fn root_and_self_exports_are_refused() {
    let mut sim = SimCluster::new(2);
    let x = sim.mkdir(0, ROOT_INO, "x");

    sim.node(0).export_dir(ROOT_INO, MdsId(1));
    assert!(sim.node(0).take_outbox().is_empty());

    sim.node(0).export_dir(x, MdsId(0));
    assert!(sim.node(0).take_outbox().is_empty());
    assert!(sim.nodes[0].exports().is_empty());
}

#[test]
fn a_freezing_import_stays_put_under_trim() {
    let mut sim = SimCluster::new(2);
    let x = sim.mkdir(0, ROOT_INO, "x");
    sim.node(0).mark_dir_complete(ROOT_INO);
    sim.node(0).export_dir(x, MdsId(1));
    sim.pump();
    assert!(sim.nodes[1].imports().contains(&x));

    // Start exporting the import back, but hold all messages so the
    // subtree sits in the freezing state.
    sim.node(1).export_dir(x, MdsId(0));
    sim.node(1).trim(Some(0));

    assert!(sim.nodes[1].get_inode(x).is_some());
    assert!(sim.nodes[1].imports().contains(&x));

    sim.pump();
    assert!(!sim.nodes[1].imports().contains(&x));
    sim.check_invariants();
}

#[test]
fn dir_rep_updates_reach_replicas() {
    let mut sim = SimCluster::new(2);
    let d = sim.mkdir(0, ROOT_INO, "d");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.submit(1, "statd", "/d");
    sim.pump();

    {
        let cache = sim.node(0);
        let dir = cache.get_inode_mut(d).unwrap().dir.as_mut().unwrap();
        dir.dir_rep = sfs_types::DirRep::All;
    }
    sim.node(0).send_dir_updates(d, None);
    sim.pump();

    let d1 = sim.nodes[1].get_inode(d).unwrap();
    assert_eq!(d1.dir.as_ref().unwrap().dir_rep, sfs_types::DirRep::All);
}

#[test]
fn hash_and_unhash_round_trip() {
    let mut sim = SimCluster::new(3);
    let h = sim.mkdir(0, ROOT_INO, "h");
    sim.node(0).mark_dir_complete(ROOT_INO);
    let names = ["ant", "bee", "cat", "dog", "elk", "fox"];
    let mut files = Vec::new();
    for name in names {
        files.push((name, sim.mkfile(0, h, name)));
    }
    sim.node(0).mark_dir_complete(h);

    sim.node(0).hash_dir(h);
    sim.pump();

    // Hashed everywhere, entries owned by their shard.
    for node in &sim.nodes {
        let hin = node.get_inode(h).expect("dir replicated");
        assert!(hin.core.kind.is_hashed());
        assert!(hin.dir.as_ref().unwrap().is_hashed());
    }
    let map = sim.nodes[0].cluster();
    for (name, ino) in &files {
        let owner = map.hash_dentry(h, name);
        let holder = &sim.nodes[owner.0 as usize];
        let in_ = holder.get_inode(*ino).expect("entry at its shard");
        assert!(in_.auth, "{name} should be owned by {owner}");
    }

    sim.node(0).unhash_dir(h);
    sim.pump();

    let h0 = sim.nodes[0].get_inode(h).unwrap();
    assert!(!h0.core.kind.is_hashed());
    let dir = h0.dir.as_ref().unwrap();
    assert!(dir.is_complete());
    assert!(dir.is_dirty());
    assert_eq!(dir.size(), names.len());
    for (_, ino) in &files {
        assert!(sim.nodes[0].get_inode(*ino).unwrap().auth);
    }
    sim.check_invariants();
}
