use std::path::Path;

use serde_json::json;
use tempfile::tempdir;

use localsync::{
    BucketChecksum, BucketPriority, Checkpoint, Checksum, OpType, OplogOperation, Schema,
    SyncDataBatch, SyncDatabase, SyncDatabaseConfig, SyncLocalResult, Table,
};

async fn open_db(dir: &Path) -> SyncDatabase {
    let config = SyncDatabaseConfig::new(
        dir.join("sync.db"),
        Schema::new(vec![Table::new("lists"), Table::new("todos")]),
    );
    SyncDatabase::open(config).await.unwrap()
}

fn put_op(op_id: i64, row_id: &str, checksum: u32) -> OplogOperation {
    OplogOperation {
        op_id,
        op: OpType::Put,
        row_type: Some("lists".into()),
        row_id: Some(row_id.into()),
        subkey: None,
        data: Some(json!({"name": format!("list {row_id}")})),
        checksum: Checksum::new(checksum),
    }
}

fn batch(bucket: &str, ops: Vec<OplogOperation>) -> SyncDataBatch {
    SyncDataBatch::new(vec![localsync::BucketData {
        bucket: bucket.into(),
        data: ops,
        has_more: false,
    }])
}

fn checkpoint(last_op_id: i64, declared: Vec<(&str, u32, i64)>) -> Checkpoint {
    Checkpoint {
        last_op_id,
        write_checkpoint: None,
        buckets: declared
            .into_iter()
            .map(|(bucket, checksum, count)| BucketChecksum {
                bucket: bucket.into(),
                checksum: Checksum::new(checksum),
                count: Some(count),
                priority: Some(BucketPriority::DEFAULT),
            })
            .collect(),
    }
}

async fn list_ids(db: &SyncDatabase) -> Vec<String> {
    db.read_transaction(|conn| {
        let mut stmt = conn.prepare("SELECT id FROM data_lists ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn example_scenario_single_put_checkpoint() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;
    assert!(!db.has_synced());

    db.save_sync_data(&batch("a", vec![put_op(1, "1", 10)]))
        .await
        .unwrap();
    assert!(db.status().downloading);

    let result = db
        .sync_local_database(&checkpoint(1, vec![("a", 10, 1)]), None)
        .await
        .unwrap();
    assert_eq!(result, SyncLocalResult::Applied);
    assert_eq!(list_ids(&db).await, vec!["1".to_string()]);

    let status = db.status();
    assert!(status.has_synced);
    assert!(!status.downloading);
    assert!(status.last_synced_at.is_some());
}

#[tokio::test]
async fn redelivered_batch_converges_to_same_state() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;

    let data = batch("a", vec![put_op(1, "1", 10), put_op(2, "2", 20)]);
    db.save_sync_data(&data).await.unwrap();
    // Simulate at-least-once delivery from the server.
    db.save_sync_data(&data).await.unwrap();

    let result = db
        .sync_local_database(&checkpoint(2, vec![("a", 30, 2)]), None)
        .await
        .unwrap();
    assert!(result.is_applied());
    assert_eq!(list_ids(&db).await.len(), 2);
}

#[tokio::test]
async fn checksum_failure_recovers_after_redownload() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;

    db.save_sync_data(&batch("a", vec![put_op(1, "1", 10)]))
        .await
        .unwrap();

    // Server declares a different checksum: the bucket is discarded.
    let result = db
        .sync_local_database(&checkpoint(1, vec![("a", 11, 1)]), None)
        .await
        .unwrap();
    let SyncLocalResult::CheckpointInvalid(failures) = result else {
        panic!("expected invalid checkpoint, got {result:?}");
    };
    assert_eq!(failures[0].bucket, "a");

    // The connector restarts the bucket's stream from scratch.
    let states = db.bucket_states().await.unwrap();
    assert!(states.is_empty() || states.iter().all(|s| s.after == 0));

    db.save_sync_data(&batch("a", vec![put_op(1, "1", 10)]))
        .await
        .unwrap();
    let result = db
        .sync_local_database(&checkpoint(1, vec![("a", 10, 1)]), None)
        .await
        .unwrap();
    assert!(result.is_applied());
    assert_eq!(list_ids(&db).await, vec!["1".to_string()]);
}

#[tokio::test]
async fn local_write_blocks_full_sync_until_acknowledged() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;

    db.put("lists", "local-1", json!({"name": "written offline"}))
        .await
        .unwrap();
    db.save_sync_data(&batch("a", vec![put_op(1, "1", 10)]))
        .await
        .unwrap();

    // Queue is non-empty: the downloaded row must not publish yet.
    let result = db
        .sync_local_database(&checkpoint(1, vec![("a", 10, 1)]), None)
        .await
        .unwrap();
    assert_eq!(result, SyncLocalResult::NotReady);

    // Upload completes with a write checkpoint token.
    let tx = db.get_next_crud_transaction().await.unwrap().unwrap();
    db.complete_crud(tx.last_op_id(), Some(5)).await.unwrap();

    // A checkpoint without the acknowledgement still does not publish.
    let result = db
        .sync_local_database(&checkpoint(1, vec![("a", 10, 1)]), None)
        .await
        .unwrap();
    assert_eq!(result, SyncLocalResult::NotReady);

    // Once the server's checkpoint carries the write checkpoint, the
    // local write has round-tripped and the download may land.
    let mut acknowledged = checkpoint(1, vec![("a", 10, 1)]);
    acknowledged.write_checkpoint = Some(5);
    let result = db
        .sync_local_database(&acknowledged, None)
        .await
        .unwrap();
    assert_eq!(result, SyncLocalResult::Applied);
    assert!(list_ids(&db).await.contains(&"1".to_string()));
}

#[tokio::test]
async fn priority_zero_band_publishes_ahead_of_full_sync() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;

    db.put("lists", "local-1", json!({"name": "pending upload"}))
        .await
        .unwrap();
    db.save_sync_data(&batch("prio0", vec![put_op(1, "1", 10)]))
        .await
        .unwrap();

    let checkpoint = Checkpoint {
        last_op_id: 1,
        write_checkpoint: None,
        buckets: vec![BucketChecksum {
            bucket: "prio0".into(),
            checksum: Checksum::new(10),
            count: Some(1),
            priority: Some(BucketPriority::HIGHEST),
        }],
    };
    let result = db
        .sync_local_database(&checkpoint, Some(BucketPriority::HIGHEST))
        .await
        .unwrap();
    assert!(result.is_applied());

    let status = db.status();
    assert!(!status.has_synced);
    assert!(status.has_synced_for(BucketPriority::HIGHEST));
    assert!(!status.has_synced_for(BucketPriority::DEFAULT));
}

#[tokio::test]
async fn client_id_and_sync_state_survive_reopen() {
    let dir = tempdir().unwrap();
    let first_id;
    {
        let db = open_db(dir.path()).await;
        first_id = db.client_id().await.unwrap();
        db.save_sync_data(&batch("a", vec![put_op(1, "1", 10)]))
            .await
            .unwrap();
        let result = db
            .sync_local_database(&checkpoint(1, vec![("a", 10, 1)]), None)
            .await
            .unwrap();
        assert!(result.is_applied());
        db.close();
    }

    let db = open_db(dir.path()).await;
    assert_eq!(db.client_id().await.unwrap(), first_id);
    // "Has synced" is recomputed from persisted sync-state rows.
    assert!(db.has_synced());
    db.wait_for_first_sync(None).await.unwrap();

    let states = db.bucket_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].name, "a");
    assert_eq!(states[0].after, 1);
}

#[tokio::test]
async fn closed_database_rejects_operations() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;
    db.close();
    let err = db.bucket_states().await.unwrap_err();
    assert!(matches!(err, localsync::SyncError::Closed));
}

#[tokio::test]
async fn update_local_target_requires_empty_queue() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path()).await;

    // Nothing pending: there is no sentinel target to replace.
    let moved = db.update_local_target(|| async { Ok(7) }).await.unwrap();
    assert!(!moved);

    db.put("lists", "x", json!({"name": "x"})).await.unwrap();
    // Queue non-empty: the target must stay at the sentinel.
    let moved = db.update_local_target(|| async { Ok(7) }).await.unwrap();
    assert!(!moved);

    let tx = db.get_next_crud_transaction().await.unwrap().unwrap();
    db.complete_crud(tx.last_op_id(), None).await.unwrap();

    // Queue drained and the sentinel is set: the mint goes through.
    let moved = db.update_local_target(|| async { Ok(7) }).await.unwrap();
    assert!(moved);
    // A second advance has nothing pending anymore.
    let moved = db.update_local_target(|| async { Ok(8) }).await.unwrap();
    assert!(!moved);
}
