//! Cross-crate invariant checks.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_core::{
    DeleteOp, DeleteRangeOp, Epoch, Offset, PutOp, ShardId, WriteBatchPayload, WriteOp,
    DEFAULT_NAMESPACE,
};
use strata_kv::{compare_keys, Database, KvFactory, KvFactoryOptions};
use strata_wal::{Entry, TokioStorage, Wal, WalConfig};

/// Upper bound above every key these tests generate, at any depth.
const SCAN_MAX: &str = "\u{10FFFF}/\u{10FFFF}/\u{10FFFF}/\u{10FFFF}/\u{10FFFF}";

async fn open_database(root: &std::path::Path, shard: i64) -> Database {
    let factory = KvFactory::new(KvFactoryOptions::new(root));
    let store = factory
        .new_kv(DEFAULT_NAMESPACE, ShardId::new(shard))
        .await
        .unwrap();
    Database::new(store)
}

fn random_key(rng: &mut StdRng) -> String {
    let depth = rng.gen_range(1..4);
    let mut key = String::new();
    for _ in 0..depth {
        key.push('/');
        let segment_len = rng.gen_range(1..3);
        for _ in 0..segment_len {
            key.push(char::from(b'a' + rng.gen_range(0..4u8)));
        }
    }
    key
}

fn random_payload(rng: &mut StdRng) -> WriteBatchPayload {
    let op_count = rng.gen_range(1..5);
    let mut ops = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        let op = match rng.gen_range(0..10u8) {
            0 => WriteOp::Delete(DeleteOp {
                key: random_key(rng),
                expected_version_id: None,
            }),
            1 => {
                let min = random_key(rng);
                let max = format!("{min}0");
                WriteOp::DeleteRange(DeleteRangeOp {
                    min_key_inclusive: min,
                    max_key_exclusive: max,
                })
            }
            _ => WriteOp::Put(PutOp {
                key: random_key(rng),
                value: Bytes::from(format!("v{}", rng.gen_range(0..1000u32))),
                expected_version_id: None,
                session_id: None,
                client_identity: None,
            }),
        };
        ops.push(op);
    }
    WriteBatchPayload::new(1_700_000_000_000, ops)
}

/// Replaying the WAL from offset 0 onto an empty engine produces a state
/// identical (under full iteration) to the engine that applied each entry
/// as it committed.
#[tokio::test]
async fn test_wal_replay_matches_live_engine() {
    let wal_dir = tempfile::tempdir().unwrap();
    let live_dir = tempfile::tempdir().unwrap();
    let replay_dir = tempfile::tempdir().unwrap();

    let mut wal = Wal::open(
        Arc::new(TokioStorage::new()),
        ShardId::new(1),
        WalConfig::new(wal_dir.path()),
    )
    .await
    .unwrap();
    let live = open_database(live_dir.path(), 1).await;

    let mut rng = StdRng::seed_from_u64(7);
    for i in 0..100i64 {
        let offset = Offset::new(i);
        let payload = random_payload(&mut rng);
        wal.append(Entry::new(Epoch::new(1), offset, payload.encode()).unwrap())
            .await
            .unwrap();
        live.apply(&payload, offset).unwrap();
    }

    let replay = open_database(replay_dir.path(), 2).await;
    for entry in wal.read_from(Offset::new(0)).unwrap() {
        let payload = WriteBatchPayload::decode(entry.payload().clone()).unwrap();
        replay.apply(&payload, entry.offset()).unwrap();
    }

    let live_scan: Vec<(String, Bytes)> = live
        .store()
        .range_scan("", SCAN_MAX)
        .unwrap()
        .collect();
    let replay_scan: Vec<(String, Bytes)> = replay
        .store()
        .range_scan("", SCAN_MAX)
        .unwrap()
        .collect();
    assert!(!live_scan.is_empty());
    assert_eq!(live_scan, replay_scan);
    assert_eq!(
        live.applied_offset().unwrap(),
        replay.applied_offset().unwrap()
    );
}

/// The slash-aware comparator is a total order, and keys terminating at a
/// level group ahead of the keys continuing deeper there.
#[test]
fn test_comparator_total_order_randomized() {
    let mut rng = StdRng::seed_from_u64(42);
    let keys: Vec<String> = (0..60).map(|_| random_key(&mut rng)).collect();

    for x in &keys {
        assert_eq!(compare_keys(x, x), Ordering::Equal);
        for y in &keys {
            assert_eq!(compare_keys(x, y), compare_keys(y, x).reverse());
            for z in &keys {
                if compare_keys(x, y) != Ordering::Greater
                    && compare_keys(y, z) != Ordering::Greater
                {
                    assert_ne!(
                        compare_keys(x, z),
                        Ordering::Greater,
                        "transitivity violated: {x} {y} {z}"
                    );
                }
            }
        }
    }

    // A key precedes its own subtree, and any key terminating at a level
    // precedes every key that continues deeper there.
    for _ in 0..100 {
        let a = random_key(&mut rng);
        let mut sibling = a.clone();
        sibling.push('z');
        let child = format!("{a}/x");
        assert_eq!(compare_keys(&a, &child), Ordering::Less);
        assert_eq!(compare_keys(&sibling, &child), Ordering::Less);
    }
}

/// Version ids on a key strictly increase across successful writes.
#[tokio::test]
async fn test_version_ids_strictly_increase_per_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_database(dir.path(), 1).await;

    let mut last_version = -1i64;
    for i in 0..20i64 {
        let payload = WriteBatchPayload::new(
            1_000,
            vec![WriteOp::Put(PutOp {
                key: "/counter".to_string(),
                value: Bytes::from(format!("{i}")),
                expected_version_id: Some(last_version),
                session_id: None,
                client_identity: None,
            })],
        );
        db.apply(&payload, Offset::new(i)).unwrap();
        let version = db.get("/counter").unwrap().version.version_id;
        assert!(version > last_version);
        last_version = version;
    }
}

/// Scenario: a snapshot of 10 000 keys fully replaces the target engine,
/// including keys the target had before the load.
#[tokio::test]
async fn test_snapshot_replaces_target_state_at_scale() {
    let dir = tempfile::tempdir().unwrap();
    let factory = KvFactory::new(KvFactoryOptions::new(dir.path()));

    let source = factory
        .new_kv(DEFAULT_NAMESPACE, ShardId::new(1))
        .await
        .unwrap();
    let mut wb = source.new_write_batch();
    for i in 0..10_000 {
        wb.put(&format!("/k/{i:05}"), Bytes::from(format!("{i:0128}")));
    }
    wb.commit().unwrap();
    let snapshot = source.snapshot().await.unwrap();
    let chunks = snapshot.chunks().await.unwrap();
    assert!(chunks.len() > 1, "a 10k-key image should span chunks");

    let target = factory
        .new_kv(DEFAULT_NAMESPACE, ShardId::new(2))
        .await
        .unwrap();
    let mut wb = target.new_write_batch();
    wb.put("my-key-2", Bytes::from_static(b"old"));
    wb.commit().unwrap();
    target.close().await.unwrap();

    let mut loader = factory
        .snapshot_loader(DEFAULT_NAMESPACE, ShardId::new(2))
        .await
        .unwrap();
    for chunk in &chunks {
        loader.add_chunk(chunk).await.unwrap();
    }
    loader.complete().await.unwrap();
    snapshot.close();

    let restored = factory
        .new_kv(DEFAULT_NAMESPACE, ShardId::new(2))
        .await
        .unwrap();
    assert_eq!(&*restored.get("/k/00000").unwrap(), format!("{:0128}", 0).as_bytes());
    assert_eq!(
        &*restored.get("/k/09999").unwrap(),
        format!("{:0128}", 9999).as_bytes()
    );
    assert!(restored.get("my-key-2").unwrap_err().is_key_not_found());

    let keys: Vec<String> = restored.key_range_scan("/k/", "/k//").unwrap().collect();
    assert_eq!(keys.len(), 10_000);
}

/// No interleaving of role flips leaves a shard holding both roles.
#[tokio::test]
async fn test_director_single_role_under_concurrency() {
    let cluster = crate::cluster::TestCluster::new(&["a"]);
    let director = cluster.director("a");
    let shard = ShardId::new(5);

    let mut handles = Vec::new();
    for i in 0..8 {
        let director = Arc::clone(&director);
        handles.push(tokio::spawn(async move {
            for round in 0..10 {
                if (i + round) % 2 == 0 {
                    let _ = director.get_or_create_leader(DEFAULT_NAMESPACE, shard).await;
                } else {
                    let _ = director
                        .get_or_create_follower(DEFAULT_NAMESPACE, shard)
                        .await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let leader_held = director.get_leader(shard).await.is_ok();
    let follower_held = director.get_follower(shard).await.is_ok();
    assert!(
        leader_held ^ follower_held,
        "shard must hold exactly one role (leader: {leader_held}, follower: {follower_held})"
    );
}
