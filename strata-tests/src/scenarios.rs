//! End-to-end scenarios over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::{
    DeleteOp, Epoch, GetOp, NotificationKind, Offset, OpResult, OpStatus, PutOp, ShardId, WriteOp,
    DEFAULT_NAMESPACE,
};
use strata_client::{BatcherConfig, BatcherManager, PutCall, ShardWriteSink, WriteCall};
use strata_kv::{Database, KvFactory, KvFactoryOptions};
use strata_server::{
    ControllerConfig, LeaderController, LeaderStatus, NewTermRequest, ReadRequest, ServerError,
    ServerResult, ShardsDirector, WriteRequest, WriteResponse,
};
use strata_wal::SegmentConfig;
use tokio::sync::{mpsc, oneshot};

use crate::cluster::{eventually, TestCluster};

const SHARD: ShardId = ShardId::new(0);

fn put(key: &str, value: &str) -> WriteOp {
    WriteOp::Put(PutOp {
        key: key.to_string(),
        value: Bytes::from(value.to_string()),
        expected_version_id: None,
        session_id: None,
        client_identity: None,
    })
}

fn delete(key: &str) -> WriteOp {
    WriteOp::Delete(DeleteOp {
        key: key.to_string(),
        expected_version_id: None,
    })
}

async fn write(leader: &LeaderController, ops: Vec<WriteOp>) -> ServerResult<WriteResponse> {
    leader
        .write(WriteRequest {
            ops,
            deadline: None,
        })
        .await
}

async fn read_value(leader: &LeaderController, key: &str) -> ServerResult<Bytes> {
    leader
        .read(ReadRequest {
            key: key.to_string(),
        })
        .await
        .map(|response| response.value)
}

fn is_key_not_found(result: &ServerResult<Bytes>) -> bool {
    matches!(result, Err(ServerError::Kv(e)) if e.is_key_not_found())
}

#[tokio::test]
async fn test_single_node_put_get() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    let response = write(&leader, vec![put("a", "0"), put("b", "1"), put("c", "2")])
        .await
        .unwrap();
    assert_eq!(response.results.len(), 3);
    assert!(response.results.iter().all(|r| r.status() == OpStatus::Ok));

    assert_eq!(read_value(&leader, "a").await.unwrap(), Bytes::from("0"));
    assert_eq!(read_value(&leader, "b").await.unwrap(), Bytes::from("1"));
    assert_eq!(read_value(&leader, "c").await.unwrap(), Bytes::from("2"));
    assert!(is_key_not_found(&read_value(&leader, "non-existing").await));
}

#[tokio::test]
async fn test_batch_overwrite_and_delete() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    write(&leader, vec![put("a", "0"), put("b", "1"), put("c", "2")])
        .await
        .unwrap();

    // One batch: two overwrites, one new key, one delete.
    let response = write(
        &leader,
        vec![put("a", "00"), put("b", "11"), put("d", "22"), delete("c")],
    )
    .await
    .unwrap();
    assert!(response.results.iter().all(|r| r.status() == OpStatus::Ok));

    assert_eq!(read_value(&leader, "a").await.unwrap(), Bytes::from("00"));
    assert_eq!(read_value(&leader, "b").await.unwrap(), Bytes::from("11"));
    assert!(is_key_not_found(&read_value(&leader, "c").await));
    assert_eq!(read_value(&leader, "d").await.unwrap(), Bytes::from("22"));
}

#[tokio::test]
async fn test_version_id_equals_commit_offset() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    let first = write(&leader, vec![put("k", "v0")]).await.unwrap();
    let OpResult::Put {
        version: Some(v0), ..
    } = &first.results[0]
    else {
        panic!("expected put result");
    };
    assert_eq!(v0.version_id, 0);

    let second = write(&leader, vec![put("k", "v1")]).await.unwrap();
    let OpResult::Put {
        version: Some(v1), ..
    } = &second.results[0]
    else {
        panic!("expected put result");
    };
    assert_eq!(v1.version_id, 1);
    assert!(v1.version_id > v0.version_id);
    assert_eq!(v1.created_version_id, 0);

    let info = leader.info().await.unwrap();
    assert_eq!(info.head_offset, Offset::new(1));
    assert_eq!(info.commit_offset, Offset::new(1));
}

#[tokio::test]
async fn test_get_rides_write_batch() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    let response = write(
        &leader,
        vec![
            put("k", "in-batch"),
            WriteOp::Get(GetOp {
                key: "k".to_string(),
            }),
        ],
    )
    .await
    .unwrap();

    let OpResult::Get {
        status,
        value: Some(value),
        ..
    } = &response.results[1]
    else {
        panic!("expected get result");
    };
    assert_eq!(*status, OpStatus::Ok);
    assert_eq!(&value[..], b"in-batch");
}

#[tokio::test]
async fn test_notifications_follow_commit_order() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    let mut notifications = leader.subscribe_notifications().await.unwrap();

    write(&leader, vec![put("/x", "1")]).await.unwrap();
    write(&leader, vec![put("/x", "2"), delete("/x")]).await.unwrap();

    let batch0 = notifications.recv().await.unwrap();
    assert_eq!(batch0.offset, Offset::new(0));
    assert_eq!(batch0.notifications.len(), 1);
    assert_eq!(batch0.notifications[0].kind, NotificationKind::Created);
    assert_eq!(batch0.notifications[0].key, "/x");
    assert_eq!(batch0.notifications[0].version_id, 0);

    let batch1 = notifications.recv().await.unwrap();
    assert_eq!(batch1.offset, Offset::new(1));
    assert_eq!(batch1.notifications.len(), 2);
    assert_eq!(batch1.notifications[0].kind, NotificationKind::Modified);
    assert_eq!(batch1.notifications[1].kind, NotificationKind::Deleted);
}

#[tokio::test]
async fn test_expired_deadline_times_out() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    let result = leader
        .write(WriteRequest {
            ops: vec![put("k", "v")],
            deadline: Some(tokio::time::Instant::now() - Duration::from_millis(1)),
        })
        .await;
    assert!(matches!(result, Err(ServerError::Timeout)));
}

#[tokio::test]
async fn test_leader_restart_preserves_data() {
    let cluster = TestCluster::new(&["a"]);
    {
        let leader = cluster
            .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
            .await
            .unwrap();
        write(&leader, vec![put("durable", "yes")]).await.unwrap();
    }

    cluster.kill_node("a").await.unwrap();
    cluster.start_node("a");

    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(1), "a", &["a"])
        .await
        .unwrap();
    assert_eq!(
        read_value(&leader, "durable").await.unwrap(),
        Bytes::from("yes")
    );
}

#[tokio::test]
async fn test_three_member_replication() {
    crate::init_logging();
    let cluster = TestCluster::new(&["a", "b", "c"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a", "b", "c"])
        .await
        .unwrap();

    for i in 0..10 {
        write(&leader, vec![put(&format!("/k/{i}"), &format!("v{i}"))])
            .await
            .unwrap();
    }

    // Followers converge to the leader's head.
    for node in ["b", "c"] {
        let follower = cluster
            .director(node)
            .get_follower(SHARD)
            .await
            .unwrap();
        assert!(
            eventually(Duration::from_secs(5), || {
                let follower = Arc::clone(&follower);
                async move { follower.applied_offset().await == Offset::new(9) }
            })
            .await,
            "follower {node} did not converge"
        );
    }
}

#[tokio::test]
async fn test_quorum_liveness_with_dead_follower() {
    let cluster = TestCluster::new(&["a", "b", "c"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a", "b", "c"])
        .await
        .unwrap();

    write(&leader, vec![put("/before", "1")]).await.unwrap();

    // One follower dies; the majority (leader + remaining follower) keeps
    // committing.
    cluster.kill_node("c").await.unwrap();
    for i in 0..5 {
        write(&leader, vec![put(&format!("/during/{i}"), "x")])
            .await
            .unwrap();
    }
    let head = leader.info().await.unwrap().head_offset;
    assert_eq!(head, Offset::new(5));

    // The follower restarts and catches up by tail shipping.
    cluster.start_node("c");
    let follower = cluster.director("c").get_or_create_follower(DEFAULT_NAMESPACE, SHARD).await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            let follower = Arc::clone(&follower);
            async move { follower.head_offset().await == Offset::new(5) }
        })
        .await,
        "restarted follower did not catch up"
    );
}

#[tokio::test]
async fn test_epoch_safety_after_fence() {
    let cluster = TestCluster::new(&["a", "b"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a", "b"])
        .await
        .unwrap();

    write(&leader, vec![put("k", "v")]).await.unwrap();

    // The coordinator fences epoch 1 everywhere.
    let follower = cluster.director("b").get_follower(SHARD).await.unwrap();
    follower
        .new_term(NewTermRequest {
            shard: SHARD,
            epoch: Epoch::new(1),
        })
        .await
        .unwrap();
    leader
        .new_term(NewTermRequest {
            shard: SHARD,
            epoch: Epoch::new(1),
        })
        .await
        .unwrap();

    // A replicate stream from the old epoch is rejected.
    let (_request_tx, request_rx) = mpsc::channel(4);
    let (ack_tx, _ack_rx) = mpsc::channel(4);
    let result = follower
        .accept_replicate_stream(Epoch::new(0), request_rx, ack_tx)
        .await;
    assert!(matches!(result, Err(ServerError::InvalidEpoch { .. })));

    // The former leader no longer accepts writes.
    let result = write(&leader, vec![put("k", "stale")]).await;
    assert!(matches!(result, Err(ServerError::NotLeader { .. })));
    assert_eq!(leader.info().await.unwrap().status, LeaderStatus::Fenced);
}

#[tokio::test]
async fn test_fence_cancels_inflight_writes() {
    let cluster = TestCluster::new(&["a", "b", "c"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a", "b", "c"])
        .await
        .unwrap();

    // Kill both followers so writes can never reach quorum.
    cluster.kill_node("b").await.unwrap();
    cluster.kill_node("c").await.unwrap();

    let pending = {
        let leader = Arc::clone(&leader);
        tokio::spawn(async move { write(&leader, vec![put("k", "v")]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    leader
        .new_term(NewTermRequest {
            shard: SHARD,
            epoch: Epoch::new(1),
        })
        .await
        .unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ServerError::NotLeader { .. })));
}

#[tokio::test]
async fn test_snapshot_reseeds_lagging_follower() {
    crate::init_logging();
    // Tiny segments and an aggressive trim threshold so the log tail is
    // gone by the time the third member joins.
    let config = ControllerConfig::default()
        .with_segment_config(SegmentConfig::new().with_max_entries(4))
        .with_wal_trim_threshold(8);
    let cluster = TestCluster::with_config(&["a", "b", "c"], config);

    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a", "b"])
        .await
        .unwrap();

    for i in 0..40 {
        write(&leader, vec![put(&format!("/key/{i:03}"), &format!("{i}"))])
            .await
            .unwrap();
    }

    // Wait for the trimmer to discard the old tail.
    assert!(
        eventually(Duration::from_secs(5), || {
            let leader = Arc::clone(&leader);
            async move {
                leader
                    .info()
                    .await
                    .is_ok_and(|info| info.low_water_mark > Offset::new(0))
            }
        })
        .await,
        "wal was never trimmed"
    );

    // A fresh member joins; its history starts below the low-water mark,
    // so it must be re-seeded by snapshot.
    let follower = cluster
        .director("c")
        .get_or_create_follower(DEFAULT_NAMESPACE, SHARD)
        .await
        .unwrap();
    follower
        .new_term(NewTermRequest {
            shard: SHARD,
            epoch: Epoch::new(0),
        })
        .await
        .unwrap();
    leader
        .add_follower(strata_core::NodeId::new("c"), Epoch::new(0))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), || {
            let follower = Arc::clone(&follower);
            async move { follower.applied_offset().await == Offset::new(39) }
        })
        .await,
        "snapshot-seeded follower did not converge"
    );

    // The follower's materialized state carries the snapshot content.
    cluster.kill_node("c").await.unwrap();
    let factory = KvFactory::new(KvFactoryOptions::new(cluster.data_dir("c")));
    let store = factory.new_kv(DEFAULT_NAMESPACE, SHARD).await.unwrap();
    let db = Database::new(store);
    let result = db.get("/key/000").unwrap();
    assert_eq!(&result.value[..], b"0");
    assert_eq!(result.version.version_id, 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_shard_wipes_node_state() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();
    write(&leader, vec![put("gone", "soon")]).await.unwrap();

    let director = cluster.director("a");
    director
        .delete_shard(&strata_server::DeleteShardRequest {
            namespace: DEFAULT_NAMESPACE.to_string(),
            shard: SHARD,
        })
        .await
        .unwrap();

    // Recreated from scratch: empty log, empty database.
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(1), "a", &["a"])
        .await
        .unwrap();
    assert_eq!(leader.info().await.unwrap().head_offset, Offset::INVALID);
    assert!(is_key_not_found(&read_value(&leader, "gone").await));
}

/// Sink submitting batches through a node's director.
struct DirectorSink {
    director: Arc<ShardsDirector>,
}

#[async_trait]
impl ShardWriteSink for DirectorSink {
    async fn write(&self, shard: ShardId, request: WriteRequest) -> ServerResult<WriteResponse> {
        self.director.get_leader(shard).await?.write(request).await
    }
}

#[tokio::test]
async fn test_client_batcher_end_to_end() {
    let cluster = TestCluster::new(&["a"]);
    let leader = cluster
        .elect(DEFAULT_NAMESPACE, SHARD, Epoch::new(0), "a", &["a"])
        .await
        .unwrap();

    let manager = BatcherManager::new(
        Arc::new(DirectorSink {
            director: cluster.director("a"),
        }),
        BatcherConfig::default(),
    );

    let batcher = manager.get(SHARD).unwrap();
    let mut receivers = Vec::new();
    for i in 0..20 {
        let (tx, rx) = oneshot::channel();
        batcher
            .add(WriteCall::Put(PutCall {
                key: format!("/batched/{i:02}"),
                value: Bytes::from(format!("{i}")),
                expected_version_id: None,
                session_id: None,
                client_identity: Some("it-client".to_string()),
                callback: tx,
            }))
            .await
            .unwrap();
        receivers.push(rx);
    }

    // Every call resolves exactly once with a version id. Calls coalesced
    // into one batch share its commit offset, so version ids never regress
    // in submission order.
    let mut last_version = -1;
    for rx in receivers {
        let result = rx.await.unwrap().unwrap();
        let OpResult::Put {
            status,
            version: Some(version),
        } = result
        else {
            panic!("expected put result");
        };
        assert_eq!(status, OpStatus::Ok);
        assert!(version.version_id >= last_version);
        last_version = version.version_id;
    }

    assert_eq!(
        read_value(&leader, "/batched/07").await.unwrap(),
        Bytes::from("7")
    );

    manager.close().await.unwrap();
}
