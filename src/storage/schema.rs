// ABOUTME: SQLite schema for sync metadata and materialized data tables
// ABOUTME: Applies pragmas, creates tables, and enforces version compatibility

use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, SyncError};

/// Version of the internal table layout. Bumped when the layout changes
/// in a way older library versions cannot read.
pub const CORE_SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_buckets (
    name              TEXT PRIMARY KEY NOT NULL,
    last_op           INTEGER NOT NULL DEFAULT 0,
    last_applied_op   INTEGER NOT NULL DEFAULT 0,
    target_op         INTEGER NOT NULL DEFAULT 0,
    add_checksum      INTEGER NOT NULL DEFAULT 0,
    op_checksum       INTEGER NOT NULL DEFAULT 0,
    pending_delete    INTEGER NOT NULL DEFAULT 0,
    count_at_last     INTEGER NOT NULL DEFAULT 0,
    count_since_last  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sync_oplog (
    bucket    TEXT NOT NULL,
    op_id     INTEGER NOT NULL,
    key       TEXT NOT NULL,
    row_type  TEXT,
    row_id    TEXT,
    data      TEXT,
    checksum  INTEGER NOT NULL,
    PRIMARY KEY (bucket, op_id)
);

CREATE INDEX IF NOT EXISTS sync_oplog_by_key ON sync_oplog (bucket, key);
CREATE INDEX IF NOT EXISTS sync_oplog_by_row ON sync_oplog (row_type, row_id);

CREATE TABLE IF NOT EXISTS sync_updated_rows (
    row_type  TEXT NOT NULL,
    row_id    TEXT NOT NULL,
    PRIMARY KEY (row_type, row_id)
);

CREATE TABLE IF NOT EXISTS sync_crud (
    op_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id            INTEGER,
    op               TEXT NOT NULL,
    table_name       TEXT NOT NULL,
    row_id           TEXT NOT NULL,
    data             TEXT,
    metadata         TEXT,
    previous_values  TEXT,
    created_at       TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS sync_local_meta (
    key    TEXT PRIMARY KEY NOT NULL,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_state (
    priority        INTEGER PRIMARY KEY NOT NULL,
    last_synced_at  TEXT NOT NULL
);
"#;

/// Declared logical table, materialized as `data_<name>`.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The set of logical tables downloaded data materializes into.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }
}

/// Physical name of the materialization table backing a logical table.
pub fn physical_table_name(logical: &str) -> String {
    format!("data_{logical}")
}

/// Inverse of [`physical_table_name`], when the name carries the prefix.
pub fn logical_table_name(physical: &str) -> Option<&str> {
    physical.strip_prefix("data_")
}

/// Reject table names that cannot be safely interpolated into DDL.
pub fn validate_table_name(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid table name: {name:?}"))
    }
}

/// Apply connection pragmas used for every connection to the database.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal").ok();
    conn.pragma_update(None, "foreign_keys", "on")?;
    Ok(())
}

/// Create the internal tables and verify schema-version compatibility.
///
/// A database written by a newer library version is fatal: its layout may
/// carry state this version would silently drop.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let found: Option<i32> = conn
        .query_row(
            "SELECT value FROM sync_local_meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|v| v.parse().ok());

    match found {
        Some(found) if found > CORE_SCHEMA_VERSION => {
            return Err(SyncError::VersionMismatch {
                found,
                supported: CORE_SCHEMA_VERSION,
            });
        }
        Some(CORE_SCHEMA_VERSION) => {}
        _ => {
            // Fresh database, or an older layout upgraded in place.
            conn.execute(
                "INSERT INTO sync_local_meta (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                [CORE_SCHEMA_VERSION.to_string()],
            )?;
        }
    }

    Ok(())
}

/// Create the materialization table for every declared logical table.
pub fn apply_schema(conn: &Connection, schema: &Schema) -> Result<()> {
    for table in &schema.tables {
        validate_table_name(&table.name)
            .map_err(|_| rusqlite::Error::InvalidParameterName(table.name.clone()))?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (id TEXT PRIMARY KEY NOT NULL, data TEXT)",
            physical_table_name(&table.name)
        );
        conn.execute_batch(&ddl)?;
    }
    tracing::debug!("applied schema with {} logical tables", schema.tables.len());
    Ok(())
}
