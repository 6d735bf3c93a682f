// ABOUTME: Sync application engine - applies downloaded batches and commits checkpoints
// ABOUTME: Checksum validation, the local-write gate, and row materialization live here

use rusqlite::{params, Connection, OptionalExtension};

use crate::checksum::Checksum;
use crate::error::{Result, SyncError};
use crate::storage::buckets::{self, LOCAL_BUCKET};
use crate::storage::crud;
use crate::storage::schema::physical_table_name;
use crate::sync::models::{BucketPriority, Checkpoint, OpType, SyncDataBatch};

/// Materialized effect of the newest retained operation for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOpKind {
    Put,
    Remove,
}

/// One row-level change handed to downstream operation handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOperation {
    pub kind: RowOpKind,
    pub row_type: String,
    pub row_id: String,
    /// JSON document for a put; `None` for a remove.
    pub data: Option<String>,
}

/// Downstream consumer of committed row operations, invoked in
/// registration order once a checkpoint is ready to publish.
pub trait OperationHandler: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, conn: &Connection, ops: &[RowOperation]) -> anyhow::Result<()>;
}

/// Writes committed rows into their `data_<table>` materialization
/// tables. Row types with no declared table are skipped.
#[derive(Debug, Default)]
pub struct MaterializeHandler;

impl MaterializeHandler {
    fn table_exists(conn: &Connection, physical: &str) -> rusqlite::Result<bool> {
        let found: Option<i64> = conn
            .prepare_cached("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
            .query_row([physical], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }
}

impl OperationHandler for MaterializeHandler {
    fn name(&self) -> &str {
        "materialize"
    }

    fn apply(&self, conn: &Connection, ops: &[RowOperation]) -> anyhow::Result<()> {
        for op in ops {
            let physical = physical_table_name(&op.row_type);
            if !Self::table_exists(conn, &physical)? {
                tracing::warn!(
                    "skipping row {} for undeclared table {}",
                    op.row_id,
                    op.row_type
                );
                continue;
            }
            match op.kind {
                RowOpKind::Put => {
                    conn.prepare_cached(&format!(
                        "INSERT OR REPLACE INTO \"{physical}\" (id, data) VALUES (?1, ?2)"
                    ))?
                    .execute(params![op.row_id, op.data])?;
                }
                RowOpKind::Remove => {
                    conn.prepare_cached(&format!("DELETE FROM \"{physical}\" WHERE id = ?1"))?
                        .execute([&op.row_id])?;
                }
            }
        }
        Ok(())
    }
}

/// A checksum that did not match the server's declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub bucket: String,
    pub expected: Checksum,
    pub actual: Checksum,
}

/// Outcome of a commit attempt. Only `Applied` exposes new data to
/// readers; the other outcomes are ordinary retried conditions, not
/// failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncLocalResult {
    /// Checkpoint validated and materialized.
    Applied,
    /// Checksums validated but queued local writes (or an unreached
    /// write checkpoint) block publication for this priority.
    NotReady,
    /// Validation failed; the named buckets were discarded for a clean
    /// redownload.
    CheckpointInvalid(Vec<ChecksumMismatch>),
}

impl SyncLocalResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, SyncLocalResult::Applied)
    }
}

/// Apply a batch of downloaded bucket data to the oplog store.
///
/// Must run inside a write transaction: a bucket's counters update
/// atomically with its oplog rows. Operations at or below the bucket's
/// `last_op` watermark are redelivered duplicates and are skipped, which
/// keeps re-application of a whole batch a no-op.
pub fn save_sync_data(conn: &Connection, batch: &SyncDataBatch) -> Result<()> {
    for bucket_data in &batch.buckets {
        let mut bucket = buckets::find_or_create_bucket(conn, &bucket_data.bucket)?;
        let watermark = bucket.last_op;
        let mut is_empty = bucket.last_applied_op == 0;

        let mut add_delta = Checksum::default();
        let mut op_delta = Checksum::default();
        let mut last_op = None;
        let mut count = 0i64;

        for op in &bucket_data.data {
            if op.op_id <= watermark {
                tracing::debug!(
                    "skipping redelivered op {} in bucket {}",
                    op.op_id,
                    bucket.name
                );
                continue;
            }
            count += 1;
            last_op = Some(op.op_id);

            match op.op {
                OpType::Put => {
                    if let Some(superseded) =
                        buckets::take_superseded(conn, &bucket.name, &op.key())?
                    {
                        add_delta += superseded.checksum;
                        op_delta -= superseded.checksum;
                    }
                    buckets::insert_oplog_entry(
                        conn,
                        &bucket.name,
                        op.op_id,
                        &op.key(),
                        op.row_type.as_deref(),
                        op.row_id.as_deref(),
                        op.data_json().as_deref(),
                        op.checksum,
                    )?;
                    op_delta += op.checksum;
                }
                OpType::Remove => {
                    let superseded = buckets::take_superseded(conn, &bucket.name, &op.key())?;
                    if let Some(ref superseded) = superseded {
                        add_delta += superseded.checksum;
                        op_delta -= superseded.checksum;
                    }
                    add_delta += op.checksum;
                    // A supersession in a materialized bucket means the
                    // row never reached the active view; anything else
                    // must be revisited downstream.
                    if !(superseded.is_some() && !is_empty) {
                        if let (Some(row_type), Some(row_id)) = (&op.row_type, &op.row_id) {
                            buckets::mark_updated_row(conn, row_type, row_id)?;
                        }
                    }
                }
                OpType::Move => {
                    add_delta += op.checksum;
                }
                OpType::Clear => {
                    let dropped = buckets::clear_bucket_oplog(conn, &bucket.name)?;
                    tracing::info!(
                        "CLEAR reset bucket {} ({dropped} retained entries dropped)",
                        bucket.name
                    );
                    bucket.last_applied_op = 0;
                    bucket.add_checksum = op.checksum;
                    bucket.op_checksum = Checksum::default();
                    add_delta = Checksum::default();
                    op_delta = Checksum::default();
                    is_empty = true;
                }
            }
        }

        if count > 0 {
            bucket.last_op = last_op.expect("counted at least one op");
            bucket.add_checksum += add_delta;
            bucket.op_checksum += op_delta;
            bucket.count_since_last += count;
            buckets::save_bucket(conn, &bucket)?;
            tracing::debug!(
                "bucket {} applied {count} ops through {}",
                bucket.name,
                bucket.last_op
            );
        }
    }
    Ok(())
}

/// Buckets of the checkpoint in scope for the requested priority.
fn scoped_buckets<'a>(
    checkpoint: &'a Checkpoint,
    priority: Option<BucketPriority>,
) -> Vec<&'a crate::sync::models::BucketChecksum> {
    checkpoint
        .buckets
        .iter()
        .filter(|b| match priority {
            None => true,
            Some(threshold) => threshold.covers(b.priority()),
        })
        .collect()
}

/// Compare local running checksums against the checkpoint's declaration
/// for every in-scope bucket. A locally-unknown bucket counts as zero.
pub fn validate_checksums(
    conn: &Connection,
    checkpoint: &Checkpoint,
    priority: Option<BucketPriority>,
) -> Result<Vec<ChecksumMismatch>> {
    let mut failures = Vec::new();
    for declared in scoped_buckets(checkpoint, priority) {
        let actual = match buckets::find_bucket(conn, &declared.bucket)? {
            Some(state) => state.add_checksum + state.op_checksum,
            None => Checksum::default(),
        };
        if actual != declared.checksum {
            failures.push(ChecksumMismatch {
                bucket: declared.bucket.clone(),
                expected: declared.checksum,
                actual,
            });
        }
    }
    Ok(failures)
}

fn scope_names_json(scope: &[&crate::sync::models::BucketChecksum]) -> String {
    let names: Vec<&str> = scope.iter().map(|b| b.bucket.as_str()).collect();
    serde_json::to_string(&names).expect("bucket names serialize")
}

/// Whether downloaded data may be published for this priority.
/// Priority-0 data is foundational and always publishable.
fn can_apply(conn: &Connection, priority: Option<BucketPriority>) -> Result<bool> {
    if priority == Some(BucketPriority::HIGHEST) {
        return Ok(true);
    }
    if let Some(local) = buckets::find_bucket(conn, LOCAL_BUCKET)? {
        if local.target_op > local.last_op {
            return Ok(false);
        }
    }
    crud::queue_is_empty(conn)
}

/// Rows touched since the in-scope buckets' `last_applied_op`, unioned
/// with pending updated-row markers, resolved to the newest retained
/// operation per row.
fn collect_row_operations(conn: &Connection, scope_json: Option<&str>) -> Result<Vec<RowOperation>> {
    let mut stmt = conn.prepare_cached(
        "WITH involved (name) AS (
             SELECT name FROM sync_buckets
             WHERE ?1 IS NULL OR name IN (SELECT value FROM json_each(?1))
         ),
         touched (row_type, row_id) AS (
             SELECT DISTINCT o.row_type, o.row_id
             FROM sync_oplog o
             JOIN sync_buckets b ON b.name = o.bucket
             WHERE o.bucket IN (SELECT name FROM involved)
               AND o.op_id > b.last_applied_op
               AND o.row_type IS NOT NULL AND o.row_id IS NOT NULL
             UNION
             SELECT row_type, row_id FROM sync_updated_rows
         )
         SELECT t.row_type, t.row_id,
                (SELECT r.data FROM sync_oplog r
                 WHERE r.row_type = t.row_type AND r.row_id = t.row_id
                   AND r.bucket IN (SELECT name FROM involved)
                 ORDER BY r.op_id DESC LIMIT 1) AS data
         FROM touched t
         ORDER BY t.row_type, t.row_id",
    )?;
    let ops = stmt
        .query_map([scope_json], |row| {
            let data: Option<String> = row.get(2)?;
            Ok(RowOperation {
                kind: if data.is_some() {
                    RowOpKind::Put
                } else {
                    RowOpKind::Remove
                },
                row_type: row.get(0)?,
                row_id: row.get(1)?,
                data,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Commit step exposing downloaded data to readers: validate, scope to
/// the requested priority, gate on pending local writes, materialize,
/// then advance the applied watermarks. Must run inside a write
/// transaction.
pub fn sync_local_database(
    conn: &Connection,
    checkpoint: &Checkpoint,
    priority: Option<BucketPriority>,
    handlers: &[Box<dyn OperationHandler>],
) -> Result<SyncLocalResult> {
    buckets::delete_pending_buckets(conn)?;

    let failures = validate_checksums(conn, checkpoint, priority)?;
    if !failures.is_empty() {
        let names: Vec<String> = failures.iter().map(|f| f.bucket.clone()).collect();
        for failure in &failures {
            tracing::warn!(
                "checksum mismatch in bucket {}: expected {}, got {}",
                failure.bucket,
                failure.expected,
                failure.actual
            );
        }
        buckets::remove_buckets(conn, &names)?;
        return Ok(SyncLocalResult::CheckpointInvalid(failures));
    }

    let scope = scoped_buckets(checkpoint, priority);
    let scope_json = priority.map(|_| scope_names_json(&scope));

    {
        let mut advance = conn.prepare_cached(
            "UPDATE sync_buckets SET last_op = ?2 WHERE name = ?1 AND pending_delete = 0",
        )?;
        for declared in &scope {
            advance.execute(params![declared.bucket, checkpoint.last_op_id])?;
        }
    }
    if priority.is_none() {
        if let Some(write_checkpoint) = checkpoint.write_checkpoint {
            conn.execute(
                "UPDATE sync_buckets SET last_op = ?2 WHERE name = ?1",
                params![LOCAL_BUCKET, write_checkpoint],
            )?;
        }
    }

    if !can_apply(conn, priority)? {
        tracing::debug!("checkpoint valid but local writes pending; not publishing yet");
        return Ok(SyncLocalResult::NotReady);
    }

    let ops = collect_row_operations(conn, scope_json.as_deref())?;
    for handler in handlers {
        handler
            .apply(conn, &ops)
            .map_err(|err| SyncError::Handler {
                name: handler.name().to_string(),
                source: err.into(),
            })?;
    }

    conn.execute(
        "UPDATE sync_buckets SET last_applied_op = last_op
         WHERE last_applied_op != last_op
           AND (?1 IS NULL OR name IN (SELECT value FROM json_each(?1)))",
        [&scope_json],
    )?;

    if priority.is_none() {
        let mut counts = conn.prepare_cached(
            "UPDATE sync_buckets SET count_at_last = ?2, count_since_last = 0 WHERE name = ?1",
        )?;
        for declared in &checkpoint.buckets {
            counts.execute(params![declared.bucket, declared.count.unwrap_or(0)])?;
        }
        buckets::clear_updated_rows(conn)?;
    }

    record_synced(conn, priority)?;
    tracing::info!(
        "published checkpoint {} ({} row operations, priority {:?})",
        checkpoint.last_op_id,
        ops.len(),
        priority
    );
    Ok(SyncLocalResult::Applied)
}

/// Persist the completed-sync watermark consumed by "has synced" status.
fn record_synced(conn: &Connection, priority: Option<BucketPriority>) -> Result<()> {
    let key = match priority {
        None => BucketPriority::FULL_SYNC_SENTINEL,
        Some(p) => p.0,
    };
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_state (priority, last_synced_at) VALUES (?1, ?2)
         ON CONFLICT (priority) DO UPDATE SET last_synced_at = excluded.last_synced_at",
        params![key, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{apply_schema, init_schema, Schema, Table};
    use crate::sync::models::{BucketChecksum, OplogOperation};
    use serde_json::json;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        apply_schema(&conn, &Schema::new(vec![Table::new("lists")])).unwrap();
        conn
    }

    fn handlers() -> Vec<Box<dyn OperationHandler>> {
        vec![Box::new(MaterializeHandler)]
    }

    fn put_op(op_id: i64, row_id: &str, checksum: u32) -> OplogOperation {
        OplogOperation {
            op_id,
            op: OpType::Put,
            row_type: Some("lists".into()),
            row_id: Some(row_id.into()),
            subkey: None,
            data: Some(json!({"name": format!("row {row_id}")})),
            checksum: Checksum::new(checksum),
        }
    }

    fn remove_op(op_id: i64, row_id: &str, checksum: u32) -> OplogOperation {
        OplogOperation {
            op_id,
            op: OpType::Remove,
            row_type: Some("lists".into()),
            row_id: Some(row_id.into()),
            subkey: None,
            data: None,
            checksum: Checksum::new(checksum),
        }
    }

    fn batch(bucket: &str, ops: Vec<OplogOperation>) -> SyncDataBatch {
        SyncDataBatch::new(vec![crate::sync::models::BucketData {
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

    fn materialized_rows(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT id FROM data_lists ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn example_scenario_publishes_single_put() {
        let conn = open();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10)])).unwrap();

        let result =
            sync_local_database(&conn, &checkpoint(1, vec![("a", 10, 1)]), None, &handlers())
                .unwrap();
        assert_eq!(result, SyncLocalResult::Applied);
        assert_eq!(materialized_rows(&conn), vec!["1".to_string()]);

        let bucket = buckets::find_bucket(&conn, "a").unwrap().unwrap();
        assert_eq!(bucket.last_applied_op, 1);
        assert_eq!(bucket.count_at_last, 1);
        assert_eq!(bucket.count_since_last, 0);
    }

    #[test]
    fn supersession_keeps_newest_and_accumulates_add_checksum() {
        let conn = open();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10), put_op(2, "1", 20)])).unwrap();

        let retained: Vec<i64> = conn
            .prepare("SELECT op_id FROM sync_oplog WHERE bucket = 'a'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(retained, vec![2]);

        let bucket = buckets::find_bucket(&conn, "a").unwrap().unwrap();
        assert_eq!(bucket.add_checksum, Checksum::new(10));
        assert_eq!(bucket.op_checksum, Checksum::new(20));
        // The invariant total matches the server's running sum 10 + 20.
        assert_eq!(bucket.add_checksum + bucket.op_checksum, Checksum::new(30));
    }

    #[test]
    fn redelivered_batch_is_a_no_op() {
        let conn = open();
        let data = batch("a", vec![put_op(1, "1", 10), remove_op(2, "2", 5)]);
        save_sync_data(&conn, &data).unwrap();
        let first = buckets::find_bucket(&conn, "a").unwrap().unwrap();

        save_sync_data(&conn, &data).unwrap();
        let second = buckets::find_bucket(&conn, "a").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn clear_resets_bucket_and_validates_against_own_checksum() {
        let conn = open();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10), put_op(2, "2", 20)])).unwrap();
        let result =
            sync_local_database(&conn, &checkpoint(2, vec![("a", 30, 2)]), None, &handlers())
                .unwrap();
        assert!(result.is_applied());
        assert_eq!(materialized_rows(&conn).len(), 2);

        let clear = OplogOperation {
            op_id: 3,
            op: OpType::Clear,
            row_type: None,
            row_id: None,
            subkey: None,
            data: None,
            checksum: Checksum::new(7),
        };
        save_sync_data(&conn, &batch("a", vec![clear])).unwrap();

        let bucket = buckets::find_bucket(&conn, "a").unwrap().unwrap();
        assert_eq!(bucket.last_applied_op, 0);
        assert_eq!(bucket.op_checksum, Checksum::new(0));
        assert_eq!(bucket.add_checksum, Checksum::new(7));

        let result =
            sync_local_database(&conn, &checkpoint(3, vec![("a", 7, 0)]), None, &handlers())
                .unwrap();
        assert!(result.is_applied());
        // Every previously-retained row became an implicit remove.
        assert!(materialized_rows(&conn).is_empty());
    }

    #[test]
    fn checksum_mismatch_removes_bucket_for_redownload() {
        let conn = open();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10)])).unwrap();
        let result =
            sync_local_database(&conn, &checkpoint(1, vec![("a", 999, 1)]), None, &handlers())
                .unwrap();
        let SyncLocalResult::CheckpointInvalid(failures) = result else {
            panic!("expected invalid checkpoint");
        };
        assert_eq!(failures[0].bucket, "a");
        assert_eq!(failures[0].actual, Checksum::new(10));

        // The bucket is flagged and its oplog dropped; the next commit
        // attempt purges the row entirely.
        assert!(buckets::find_bucket(&conn, "a").unwrap().unwrap().pending_delete);
        let retained: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_oplog", [], |row| row.get(0))
            .unwrap();
        assert_eq!(retained, 0);
    }

    #[test]
    fn gate_blocks_full_sync_with_pending_local_writes() {
        let conn = open();
        crud::enqueue(&conn, crud::CrudOp::Put, "lists", "9", None, None, None, None).unwrap();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10)])).unwrap();

        let result =
            sync_local_database(&conn, &checkpoint(1, vec![("a", 10, 1)]), None, &handlers())
                .unwrap();
        assert_eq!(result, SyncLocalResult::NotReady);
        assert!(materialized_rows(&conn).is_empty());
    }

    #[test]
    fn priority_zero_publishes_despite_pending_local_writes() {
        let conn = open();
        crud::enqueue(&conn, crud::CrudOp::Put, "lists", "9", None, None, None, None).unwrap();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10)])).unwrap();

        let mut checkpoint = checkpoint(1, vec![("a", 10, 1)]);
        checkpoint.buckets[0].priority = Some(BucketPriority::HIGHEST);
        let result = sync_local_database(
            &conn,
            &checkpoint,
            Some(BucketPriority::HIGHEST),
            &handlers(),
        )
        .unwrap();
        assert!(result.is_applied());
        assert_eq!(materialized_rows(&conn), vec!["1".to_string()]);
    }

    #[test]
    fn partial_sync_scopes_to_covered_buckets() {
        let conn = open();
        save_sync_data(
            &conn,
            &SyncDataBatch::new(vec![
                crate::sync::models::BucketData {
                    bucket: "high".into(),
                    data: vec![put_op(1, "1", 10)],
                    has_more: false,
                },
                crate::sync::models::BucketData {
                    bucket: "low".into(),
                    data: vec![put_op(2, "2", 20)],
                    has_more: false,
                },
            ]),
        )
        .unwrap();

        let checkpoint = Checkpoint {
            last_op_id: 2,
            write_checkpoint: None,
            buckets: vec![
                BucketChecksum {
                    bucket: "high".into(),
                    checksum: Checksum::new(10),
                    count: Some(1),
                    priority: Some(BucketPriority(1)),
                },
                BucketChecksum {
                    bucket: "low".into(),
                    checksum: Checksum::new(20),
                    count: Some(1),
                    priority: Some(BucketPriority(3)),
                },
            ],
        };
        let result =
            sync_local_database(&conn, &checkpoint, Some(BucketPriority(1)), &handlers()).unwrap();
        assert!(result.is_applied());
        // Only the covered bucket's row is published.
        assert_eq!(materialized_rows(&conn), vec!["1".to_string()]);
        let low = buckets::find_bucket(&conn, "low").unwrap().unwrap();
        assert_eq!(low.last_applied_op, 0);

        let result = sync_local_database(&conn, &checkpoint, None, &handlers()).unwrap();
        assert!(result.is_applied());
        assert_eq!(materialized_rows(&conn).len(), 2);
    }

    #[test]
    fn remove_in_unmaterialized_bucket_marks_row_for_revisit() {
        let conn = open();
        // PUT then REMOVE of the same key before the bucket is ever
        // materialized: the supersession must not skip the marker.
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10), remove_op(2, "1", 4)])).unwrap();

        let marked: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_updated_rows", [], |row| row.get(0))
            .unwrap();
        assert_eq!(marked, 1);

        let bucket = buckets::find_bucket(&conn, "a").unwrap().unwrap();
        assert_eq!(bucket.add_checksum + bucket.op_checksum, Checksum::new(14));

        let result =
            sync_local_database(&conn, &checkpoint(2, vec![("a", 14, 0)]), None, &handlers())
                .unwrap();
        assert!(result.is_applied());
        assert!(materialized_rows(&conn).is_empty());
    }

    #[test]
    fn remove_superseding_in_materialized_bucket_needs_no_marker() {
        let conn = open();
        save_sync_data(&conn, &batch("a", vec![put_op(1, "1", 10)])).unwrap();
        sync_local_database(&conn, &checkpoint(1, vec![("a", 10, 1)]), None, &handlers()).unwrap();

        save_sync_data(&conn, &batch("a", vec![remove_op(2, "1", 4)])).unwrap();
        let marked: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_updated_rows", [], |row| row.get(0))
            .unwrap();
        assert_eq!(marked, 0);
        let bucket = buckets::find_bucket(&conn, "a").unwrap().unwrap();
        assert_eq!(bucket.add_checksum + bucket.op_checksum, Checksum::new(14));
    }

    #[test]
    fn disjoint_key_checksums_commute() {
        // Same operations on disjoint keys, opposite arrival orders.
        let forward = open();
        save_sync_data(
            &forward,
            &batch("a", vec![put_op(1, "1", 10), remove_op(2, "2", 5), put_op(3, "3", 99)]),
        )
        .unwrap();
        let backward = open();
        save_sync_data(
            &backward,
            &batch("a", vec![put_op(1, "3", 99), remove_op(2, "2", 5), put_op(3, "1", 10)]),
        )
        .unwrap();

        let total = |conn: &Connection| {
            let bucket = buckets::find_bucket(conn, "a").unwrap().unwrap();
            bucket.add_checksum + bucket.op_checksum
        };
        assert_eq!(total(&forward), total(&backward));
    }
}
