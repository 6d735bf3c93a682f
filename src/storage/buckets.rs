// ABOUTME: Bucket state and oplog persistence - the local replication source of truth
// ABOUTME: All bucket/oplog mutation funnels through this API under the write lock

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::error::Result;

/// Reserved bucket tracking the local-write checkpoint (`target_op`).
pub const LOCAL_BUCKET: &str = "$local";

/// Sentinel op id meaning "no specific target yet" / "furthest possible".
pub const MAX_OP_ID: i64 = i64::MAX;

/// Replication progress for one bucket.
///
/// Invariant: at a validated checkpoint, `add_checksum + op_checksum`
/// (wrapping) equals the server-declared checksum for the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    pub name: String,
    pub last_op: i64,
    pub last_applied_op: i64,
    pub target_op: i64,
    pub add_checksum: Checksum,
    pub op_checksum: Checksum,
    pub pending_delete: bool,
    pub count_at_last: i64,
    pub count_since_last: i64,
}

/// Stream-resume request derived from a bucket's download progress.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BucketRequest {
    pub name: String,
    pub after: i64,
}

/// One retained operation in a bucket's local oplog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OplogEntryRow {
    pub op_id: i64,
    pub row_type: Option<String>,
    pub row_id: Option<String>,
    pub checksum: Checksum,
}

fn row_to_bucket(row: &rusqlite::Row<'_>) -> rusqlite::Result<BucketState> {
    Ok(BucketState {
        name: row.get(0)?,
        last_op: row.get(1)?,
        last_applied_op: row.get(2)?,
        target_op: row.get(3)?,
        add_checksum: Checksum::from_i64(row.get(4)?),
        op_checksum: Checksum::from_i64(row.get(5)?),
        pending_delete: row.get::<_, i64>(6)? != 0,
        count_at_last: row.get(7)?,
        count_since_last: row.get(8)?,
    })
}

const BUCKET_COLUMNS: &str = "name, last_op, last_applied_op, target_op, \
     add_checksum, op_checksum, pending_delete, count_at_last, count_since_last";

pub fn find_bucket(conn: &Connection, name: &str) -> Result<Option<BucketState>> {
    let state = conn
        .prepare_cached(&format!(
            "SELECT {BUCKET_COLUMNS} FROM sync_buckets WHERE name = ?1"
        ))?
        .query_row([name], row_to_bucket)
        .optional()?;
    Ok(state)
}

/// Return the existing bucket state or create one with zeroed counters.
///
/// A bucket flagged for deletion resurrects here: its counters were
/// already zeroed on removal, so clearing the flag restarts it cleanly
/// before the pending purge would have dropped the fresh redownload.
pub fn find_or_create_bucket(conn: &Connection, name: &str) -> Result<BucketState> {
    if let Some(mut state) = find_bucket(conn, name)? {
        if state.pending_delete {
            conn.execute(
                "UPDATE sync_buckets SET pending_delete = 0 WHERE name = ?1",
                [name],
            )?;
            state.pending_delete = false;
        }
        return Ok(state);
    }
    conn.execute("INSERT INTO sync_buckets (name) VALUES (?1)", [name])?;
    tracing::debug!("created bucket {name}");
    Ok(find_bucket(conn, name)?.expect("bucket row just inserted"))
}

/// Persist counter changes for a bucket after applying a batch.
pub fn save_bucket(conn: &Connection, state: &BucketState) -> Result<()> {
    conn.execute(
        "UPDATE sync_buckets SET last_op = ?2, last_applied_op = ?3, target_op = ?4,
             add_checksum = ?5, op_checksum = ?6, count_at_last = ?7, count_since_last = ?8
         WHERE name = ?1",
        params![
            state.name,
            state.last_op,
            state.last_applied_op,
            state.target_op,
            state.add_checksum.value() as i64,
            state.op_checksum.value() as i64,
            state.count_at_last,
            state.count_since_last,
        ],
    )?;
    Ok(())
}

/// Discard the named buckets so the server can resend them from scratch.
///
/// Rows whose backing data only existed in a removed bucket are recorded
/// as updated-row markers first, so the next full materialization treats
/// them as now-absent. The bucket row itself is only flagged here;
/// [`delete_pending_buckets`] purges flagged rows.
pub fn remove_buckets(conn: &Connection, names: &[String]) -> Result<()> {
    for name in names {
        let orphaned = conn.execute(
            "INSERT OR IGNORE INTO sync_updated_rows (row_type, row_id)
             SELECT o.row_type, o.row_id FROM sync_oplog o
             WHERE o.bucket = ?1 AND o.row_type IS NOT NULL AND o.row_id IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM sync_oplog other
                   WHERE other.row_type = o.row_type AND other.row_id = o.row_id
                     AND other.bucket != ?1)",
            [name],
        )?;
        let dropped = conn.execute("DELETE FROM sync_oplog WHERE bucket = ?1", [name])?;
        conn.execute(
            "UPDATE sync_buckets SET pending_delete = 1, last_op = 0, last_applied_op = 0,
                 add_checksum = 0, op_checksum = 0, count_at_last = 0, count_since_last = 0
             WHERE name = ?1",
            [name],
        )?;
        tracing::info!(
            "removed bucket {name} ({dropped} oplog entries, {orphaned} rows marked for revisit)"
        );
    }
    Ok(())
}

/// Purge bucket rows flagged by [`remove_buckets`].
pub fn delete_pending_buckets(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM sync_buckets WHERE pending_delete = 1", [])?;
    Ok(deleted)
}

/// Snapshot of download progress for stream resume after reconnect.
///
/// The reserved `$local` bucket and buckets awaiting deletion are not
/// part of the server-facing stream.
pub fn bucket_states(conn: &Connection) -> Result<Vec<BucketRequest>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, last_op FROM sync_buckets
         WHERE pending_delete = 0 AND name != ?1 ORDER BY name",
    )?;
    let states = stmt
        .query_map([LOCAL_BUCKET], |row| {
            Ok(BucketRequest {
                name: row.get(0)?,
                after: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(states)
}

/// Stable per-install identifier. Survives data clears (the meta table is
/// kept), not database deletion.
pub fn client_id(conn: &Connection) -> Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_local_meta WHERE key = 'client_id'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sync_local_meta (key, value) VALUES ('client_id', ?1)",
        [&id],
    )?;
    tracing::info!("minted client id {id}");
    Ok(id)
}

/// Remove and return the oplog entry sharing `key` in `bucket`, if any.
pub fn take_superseded(
    conn: &Connection,
    bucket: &str,
    key: &str,
) -> Result<Option<OplogEntryRow>> {
    let existing = conn
        .prepare_cached(
            "SELECT op_id, row_type, row_id, checksum FROM sync_oplog
             WHERE bucket = ?1 AND key = ?2",
        )?
        .query_row(params![bucket, key], |row| {
            Ok(OplogEntryRow {
                op_id: row.get(0)?,
                row_type: row.get(1)?,
                row_id: row.get(2)?,
                checksum: Checksum::from_i64(row.get(3)?),
            })
        })
        .optional()?;
    if let Some(ref entry) = existing {
        conn.prepare_cached("DELETE FROM sync_oplog WHERE bucket = ?1 AND op_id = ?2")?
            .execute(params![bucket, entry.op_id])?;
    }
    Ok(existing)
}

#[allow(clippy::too_many_arguments)]
pub fn insert_oplog_entry(
    conn: &Connection,
    bucket: &str,
    op_id: i64,
    key: &str,
    row_type: Option<&str>,
    row_id: Option<&str>,
    data: Option<&str>,
    checksum: Checksum,
) -> Result<()> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO sync_oplog (bucket, op_id, key, row_type, row_id, data, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        bucket,
        op_id,
        key,
        row_type,
        row_id,
        data,
        checksum.value() as i64
    ])?;
    Ok(())
}

/// Drop every retained entry in a bucket, marking each row for revisit.
/// Used by CLEAR, which turns all retained operations into implicit
/// removes.
pub fn clear_bucket_oplog(conn: &Connection, bucket: &str) -> Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_updated_rows (row_type, row_id)
         SELECT row_type, row_id FROM sync_oplog
         WHERE bucket = ?1 AND row_type IS NOT NULL AND row_id IS NOT NULL",
        [bucket],
    )?;
    let dropped = conn.execute("DELETE FROM sync_oplog WHERE bucket = ?1", [bucket])?;
    Ok(dropped)
}

pub fn mark_updated_row(conn: &Connection, row_type: &str, row_id: &str) -> Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO sync_updated_rows (row_type, row_id) VALUES (?1, ?2)",
    )?
    .execute(params![row_type, row_id])?;
    Ok(())
}

pub fn clear_updated_rows(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM sync_updated_rows", [])?;
    Ok(())
}
