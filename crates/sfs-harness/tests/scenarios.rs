#![forbid(unsafe_code)]
//! End-to-end cluster scenarios: cross-MDS traversal, coherence under
//! both regimes, migration racing live operations, and trim-driven
//! re-export.

use sfs_cache::inode::InodeDist;
use sfs_cache::CacheConfig;
use sfs_error::SfsError;
use sfs_harness::SimCluster;
use sfs_types::{ClientId, MdsId, ROOT_INO};

#[test]
fn cross_mds_stat_forwards_to_the_dentry_authority() {
    let mut sim = SimCluster::new(2);
    let a = sim.mkdir(0, ROOT_INO, "a");
    let b = sim.mkdir(0, a, "b");
    sim.node(0).mark_dir_complete(ROOT_INO);

    // Nest /a/b on mds1.
    sim.node(0).export_dir(b, MdsId(1));
    sim.pump();
    assert!(sim.nodes[1].imports().contains(&b));
    assert!(sim.nodes[0].exports().contains(&b));
    sim.check_invariants();

    // A lookup entering at mds0 must resolve ENOENT at mds1, because the
    // missing dentry lives in a dir mds1 now owns.
    sim.submit(0, "stat", "/a/b/c");
    sim.pump();
    let out = sim.outcome("stat", "/a/b/c").expect("stat completed");
    assert_eq!(out.node, 1);
    assert_eq!(out.result, Err(SfsError::NotFound.to_errno()));
    assert!(sim.nodes[0].counters.cfw >= 1);

    // Nothing transient is left pinned on either side.
    assert!(sim.nodes[0].get_inode(b).unwrap().sync_waiting_for_ack.is_empty());
    assert_eq!(sim.nodes[1].get_inode(b).unwrap().auth_pins, 0);
    sim.check_invariants();
}

#[test]
fn softasync_write_is_local_and_read_syncs_once() {
    let mut sim = SimCluster::new(2);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);
    {
        let in_ = sim.node(0).get_inode_mut(f).unwrap();
        in_.dist |= InodeDist::SOFTASYNC;
        in_.core.size = 100;
    }

    // mds1 picks up a replica (softasync bit travels with it).
    sim.submit(1, "statd", "/f");
    sim.pump();
    assert!(sim.nodes[1].get_inode(f).unwrap().is_softasync());
    assert!(sim.nodes[0].get_inode(f).unwrap().cached_by.contains(&MdsId(1)));

    // The replica writes without any round trip.
    sim.submit(1, "writesoft", "/f");
    sim.pump();
    let out = sim.outcome("writesoft", "/f").expect("write completed");
    assert_eq!(out.node, 1);
    assert!(!sim.nodes[0].get_inode(f).unwrap().is_presync());
    sim.node(1).get_inode_mut(f).unwrap().core.size = 200;

    // An authority read collects the sync, completes, and lets go.
    sim.submit(0, "readsoft", "/f");
    sim.pump();
    let out = sim.outcome("readsoft", "/f").expect("read completed");
    assert_eq!(out.node, 0);
    assert!(!sim.nodes[0].get_inode(f).unwrap().is_syncbyme());
    assert!(!sim.nodes[1].get_inode(f).unwrap().is_syncbyauth());
}

#[test]
fn sync_fans_out_to_write_open_clients() {
    let mut sim = SimCluster::new(2);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);
    sim.node(0).get_inode_mut(f).unwrap().dist |= InodeDist::SOFTASYNC;

    sim.submit(1, "statd", "/f");
    sim.pump();
    sim.node(1)
        .get_inode_mut(f)
        .unwrap()
        .open_write_add(ClientId(7));

    sim.submit(0, "readsoft", "/f");
    sim.pump();
    assert!(sim.outcome("readsoft", "/f").is_some());

    // The replica synced its client, and released it afterwards (the
    // wantback ack makes the authority drop the sync immediately).
    use sfs_msg::Payload;
    let to_client: Vec<&str> = sim
        .client_msgs
        .iter()
        .filter_map(|env| match &env.payload {
            Payload::Cache(m) => Some(m.kind()),
            Payload::Opaque(_) => None,
        })
        .collect();
    assert!(to_client.contains(&"inode_sync_start"));
    assert!(to_client.contains(&"inode_sync_release"));
    assert!(!sim.nodes[0].get_inode(f).unwrap().is_syncbyme());
}

#[test]
fn presync_under_freezing_subtree_releases_immediately() {
    let mut sim = SimCluster::new(2);
    let a = sim.mkdir(0, ROOT_INO, "a");
    let x = sim.mkfile(0, a, "x");
    sim.node(0).mark_dir_complete(ROOT_INO);
    sim.node(0).get_inode_mut(x).unwrap().dist |= InodeDist::SOFTASYNC;

    sim.submit(1, "statd", "/a/x");
    sim.pump();
    assert!(sim.nodes[0].get_inode(x).unwrap().cached_by.contains(&MdsId(1)));

    // The read acquires its sync first (acks still in flight), then the
    // export begins freezing around it.
    sim.submit(0, "readsoft", "/a/x");
    sim.step_node(0);
    assert!(sim.nodes[0].get_inode(x).unwrap().is_presync());
    sim.node(0).export_dir(a, MdsId(1));
    sim.pump();

    // The sync was dropped the moment it was acquired (the subtree was
    // freezing), the freeze drained, the export went through, and the
    // parked read chased the subtree to its new home.
    let out = sim.outcome("readsoft", "/a/x").expect("read completed");
    assert_eq!(out.node, 1);
    assert!(!sim.nodes[0].get_inode(x).unwrap().is_syncbyme());
    assert!(sim.nodes[1].imports().contains(&a));
    assert!(!sim.nodes[0].get_inode(x).unwrap().auth);
    sim.check_invariants();
}

#[test]
fn operation_parked_across_an_export_completes_at_the_new_authority() {
    let mut sim = SimCluster::new(2);
    let a = sim.mkdir(0, ROOT_INO, "a");
    let x = sim.mkfile(0, a, "x");
    sim.node(0).mark_dir_complete(ROOT_INO);
    sim.node(0).get_inode_mut(x).unwrap().dist |= InodeDist::SOFTASYNC;

    sim.submit(1, "statd", "/a/x");
    sim.pump();

    // Freeze is pending when the read arrives: it cannot auth-pin and
    // parks. The thaw after the export re-drives it, and the chase ends
    // on the importer.
    sim.node(0).export_dir(a, MdsId(1));
    sim.submit(0, "readsoft", "/a/x");
    sim.pump();

    let out = sim.outcome("readsoft", "/a/x").expect("read completed");
    assert_eq!(out.node, 1);
    assert!(sim.nodes[1].imports().contains(&a));
    assert!(sim.nodes[1].get_inode(x).unwrap().auth);
    sim.check_invariants();
}

#[test]
fn trimming_an_emptied_import_reexports_it() {
    let mut sim = SimCluster::new(2);
    let x = sim.mkdir(0, ROOT_INO, "x");
    let f = sim.mkfile(0, x, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.node(0).export_dir(x, MdsId(1));
    sim.pump();
    assert!(sim.nodes[1].imports().contains(&x));

    // The exporter lets its leftover replica of the child expire, so the
    // importer's copy loses its last replica pin.
    sim.node(0).trim(Some(2));
    sim.pump();
    assert!(sim.nodes[0].get_inode(f).is_none());
    assert!(sim.nodes[1]
        .get_inode(f)
        .unwrap()
        .cached_by
        .is_empty());

    // Pressure on the importer evicts the child; the now-empty import
    // goes home on its own.
    sim.node(1).trim(Some(0));
    sim.pump();

    assert!(sim.nodes[1].imports().is_empty());
    assert!(sim.nodes[1].exports().is_empty());
    assert!(sim.nodes[0].exports().is_empty());
    assert_eq!(
        sim.nodes[0].get_inode(x).unwrap().dir_auth,
        sfs_types::DirAuth::Parent
    );
    sim.check_invariants();
}

#[test]
fn stale_update_is_answered_with_a_soft_expire() {
    let mut sim = SimCluster::new(3);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.submit(2, "statd", "/f");
    sim.pump();
    assert!(sim.nodes[0].get_inode(f).unwrap().cached_by.contains(&MdsId(2)));

    // mds2 evicts, but its expire is still in flight when the authority
    // broadcasts an update.
    sim.node(2).trim(Some(1));
    sim.node(0).send_inode_updates(f);
    sim.pump_node_outbox(0);
    sim.pump();

    let f0 = sim.nodes[0].get_inode(f).unwrap();
    assert!(!f0.cached_by.contains(&MdsId(2)));
    assert!(f0.is_expireable());
}

#[test]
fn sticky_sync_is_recalled_by_a_blocked_replica() {
    let mut cfg = CacheConfig::default();
    cfg.sticky_sync_normal = true;
    let mut sim = SimCluster::with_config(2, &cfg);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.submit(1, "statd", "/f");
    sim.pump();

    // A normal-regime write on the authority acquires the sync and, being
    // sticky, keeps it.
    sim.submit(0, "writesoft", "/f");
    sim.pump();
    assert!(sim.outcome("writesoft", "/f").is_some());
    assert!(sim.nodes[0].get_inode(f).unwrap().is_syncbyme());
    assert!(sim.nodes[1].get_inode(f).unwrap().is_syncbyauth());

    // The replica's read is blocked until its recall pries the sync loose.
    sim.submit(1, "readsoft", "/f");
    sim.pump();
    let out = sim.outcome("readsoft", "/f").expect("read completed");
    assert_eq!(out.node, 1);
    assert!(!sim.nodes[0].get_inode(f).unwrap().is_syncbyme());
}

#[test]
fn hard_writes_lock_two_phase_and_replicas_forward() {
    let mut sim = SimCluster::new(2);
    let f = sim.mkfile(0, ROOT_INO, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.submit(1, "statd", "/f");
    sim.pump();

    // Authority-side chmod: full two-phase lock, then release.
    sim.submit(0, "writehard", "/f");
    sim.pump();
    let out = sim.outcome("writehard", "/f").expect("chmod completed");
    assert_eq!(out.node, 0);
    assert!(!sim.nodes[0].get_inode(f).unwrap().is_lockbyme());
    assert!(!sim.nodes[1].get_inode(f).unwrap().is_lockbyauth());
    assert_eq!(sim.nodes[0].get_inode(f).unwrap().lock_active_count, 0);

    // Replica-side chmod forwards and completes on the authority.
    sim.completed.clear();
    sim.submit(1, "writehard", "/f");
    sim.pump();
    let out = sim.outcome("writehard", "/f").expect("chmod completed");
    assert_eq!(out.node, 0);
}

#[test]
fn shutdown_drains_the_whole_cluster() {
    let mut sim = SimCluster::new(2);
    let x = sim.mkdir(0, ROOT_INO, "x");
    let _f = sim.mkfile(0, x, "f");
    sim.node(0).mark_dir_complete(ROOT_INO);

    sim.node(0).export_dir(x, MdsId(1));
    sim.pump();
    sim.submit(1, "statd", "/x/f");
    sim.pump();

    sim.shutdown_all();
    for cache in &sim.nodes {
        assert_eq!(cache.cache_size(), 0);
        assert!(cache.imports().is_empty());
        assert!(cache.exports().is_empty());
    }
}
