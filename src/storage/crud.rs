// ABOUTME: Durable queue of locally-originated writes pending upload
// ABOUTME: Batch/transaction retrieval plus the completion contract on $local.target_op

use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;
use crate::storage::buckets::{LOCAL_BUCKET, MAX_OP_ID};

/// Kind of a locally-queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrudOp {
    Put,
    Patch,
    Delete,
}

impl CrudOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrudOp::Put => "PUT",
            CrudOp::Patch => "PATCH",
            CrudOp::Delete => "DELETE",
        }
    }

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "PUT" => Ok(CrudOp::Put),
            "PATCH" => Ok(CrudOp::Patch),
            "DELETE" => Ok(CrudOp::Delete),
            other => Err(anyhow!("unknown crud op: {other}")),
        }
    }
}

/// One pending local write, in upload order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrudEntry {
    pub op_id: i64,
    pub op: CrudOp,
    #[serde(rename = "type")]
    pub table: String,
    #[serde(rename = "id")]
    pub row_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(rename = "old", skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<serde_json::Value>,
}

/// Up to `limit` queued entries. `has_more` distinguishes a full queue
/// drain from a partial one; an empty queue returns no batch at all.
#[derive(Debug, Clone)]
pub struct CrudBatch {
    pub entries: Vec<CrudEntry>,
    pub has_more: bool,
}

impl CrudBatch {
    /// Op id of the final entry, consumed by [`complete`].
    pub fn last_op_id(&self) -> i64 {
        self.entries.last().map(|e| e.op_id).unwrap_or(0)
    }
}

/// All entries of the earliest queued transaction.
#[derive(Debug, Clone)]
pub struct CrudTransaction {
    pub tx_id: Option<i64>,
    pub entries: Vec<CrudEntry>,
}

impl CrudTransaction {
    pub fn last_op_id(&self) -> i64 {
        self.entries.last().map(|e| e.op_id).unwrap_or(0)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrudEntry> {
    let op_str: String = row.get(1)?;
    let data: Option<String> = row.get(4)?;
    let previous: Option<String> = row.get(6)?;
    Ok(CrudEntry {
        op_id: row.get(0)?,
        op: CrudOp::from_str(&op_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
        })?,
        table: row.get(2)?,
        row_id: row.get(3)?,
        data: data.as_deref().and_then(|d| serde_json::from_str(d).ok()),
        metadata: row.get(5)?,
        previous_values: previous.as_deref().and_then(|d| serde_json::from_str(d).ok()),
        tx_id: row.get(7)?,
    })
}

const ENTRY_COLUMNS: &str =
    "op_id, op, table_name, row_id, data, metadata, previous_values, tx_id";

/// Mint a transaction id grouping subsequent writes into one upload unit.
pub fn next_tx_id(conn: &Connection) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_local_meta (key, value) VALUES ('last_tx_id', '1')
         ON CONFLICT (key) DO UPDATE SET value = CAST(value AS INTEGER) + 1",
        [],
    )?;
    let id: i64 = conn.query_row(
        "SELECT CAST(value AS INTEGER) FROM sync_local_meta WHERE key = 'last_tx_id'",
        [],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Append a local write to the queue.
///
/// Also flags the `$local` bucket with the sentinel target, meaning a
/// checkpoint advance is required before downloaded data may be applied
/// over this write.
#[allow(clippy::too_many_arguments)]
pub fn enqueue(
    conn: &Connection,
    op: CrudOp,
    table: &str,
    row_id: &str,
    tx_id: Option<i64>,
    data: Option<&serde_json::Value>,
    metadata: Option<&str>,
    previous_values: Option<&serde_json::Value>,
) -> Result<i64> {
    let data = data.map(serde_json::to_string).transpose()?;
    let previous = previous_values.map(serde_json::to_string).transpose()?;
    conn.prepare_cached(
        "INSERT INTO sync_crud (tx_id, op, table_name, row_id, data, metadata, previous_values)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![tx_id, op.as_str(), table, row_id, data, metadata, previous])?;
    let op_id = conn.last_insert_rowid();

    conn.prepare_cached(
        "INSERT INTO sync_buckets (name, target_op) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET target_op = excluded.target_op",
    )?
    .execute(params![LOCAL_BUCKET, MAX_OP_ID])?;

    Ok(op_id)
}

pub fn queue_is_empty(conn: &Connection) -> Result<bool> {
    let any: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM sync_crud LIMIT 1")?
        .query_row([], |row| row.get(0))
        .optional()?;
    Ok(any.is_none())
}

/// Fetch up to `limit` entries in op-id order. Returns `None` when the
/// queue is empty so callers can tell "nothing to upload" apart from an
/// empty batch.
pub fn get_crud_batch(conn: &Connection, limit: usize) -> Result<Option<CrudBatch>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_crud ORDER BY op_id ASC LIMIT ?1"
    ))?;
    let mut entries = stmt
        .query_map([limit as i64 + 1], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if entries.is_empty() {
        return Ok(None);
    }
    let has_more = entries.len() > limit;
    entries.truncate(limit);
    Ok(Some(CrudBatch { entries, has_more }))
}

/// Fetch the earliest queued transaction, fully materialized.
///
/// An untagged head entry forms a transaction of its own.
pub fn next_crud_transaction(conn: &Connection) -> Result<Option<CrudTransaction>> {
    let head = conn
        .prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_crud ORDER BY op_id ASC LIMIT 1"
        ))?
        .query_row([], row_to_entry)
        .optional()?;
    let Some(head) = head else {
        return Ok(None);
    };

    match head.tx_id {
        None => Ok(Some(CrudTransaction {
            tx_id: None,
            entries: vec![head],
        })),
        Some(tx_id) => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_crud WHERE tx_id = ?1 ORDER BY op_id ASC"
            ))?;
            let entries = stmt
                .query_map([tx_id], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(CrudTransaction {
                tx_id: Some(tx_id),
                entries,
            }))
        }
    }
}

/// Completion contract for an uploaded batch or transaction.
///
/// Deletes every entry up to and including `last_op_id`. If the server
/// supplied a write checkpoint and the queue fully drained, that token
/// becomes the `$local` target; otherwise the target stays at the
/// sentinel until a later upload cycle drains the queue.
pub fn complete(conn: &Connection, last_op_id: i64, write_checkpoint: Option<i64>) -> Result<()> {
    conn.prepare_cached("DELETE FROM sync_crud WHERE op_id <= ?1")?
        .execute([last_op_id])?;

    let target = match write_checkpoint {
        Some(checkpoint) if queue_is_empty(conn)? => checkpoint,
        _ => MAX_OP_ID,
    };
    conn.prepare_cached(
        "INSERT INTO sync_buckets (name, target_op) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET target_op = excluded.target_op",
    )?
    .execute(params![LOCAL_BUCKET, target])?;
    tracing::debug!("completed crud upload through op {last_op_id}, target_op = {target}");
    Ok(())
}
