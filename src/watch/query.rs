// ABOUTME: Query execution helpers for watched queries
// ABOUTME: Resolves the tables a query plan reads and converts rows to JSON

use std::collections::BTreeSet;

use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::storage::schema::logical_table_name;

/// One query execution's result set, rows encoded as JSON objects keyed
/// by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<JsonValue>,
}

/// Convert a single SQLite value to JSON.
///
/// BLOBs become `{"_type": "blob", "data": "<base64>"}` so they stay
/// distinguishable from plain strings; non-finite floats are stored as
/// strings since JSON cannot represent them.
pub fn sqlite_value_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::Number(i.into()),
        ValueRef::Real(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or_else(|| JsonValue::String(f.to_string()))
            } else {
                JsonValue::String(f.to_string())
            }
        }
        ValueRef::Text(s) => JsonValue::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b);
            serde_json::json!({
                "_type": "blob",
                "data": encoded
            })
        }
    }
}

/// Execute a read-only query and materialize the full result set.
pub fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = Vec::new();
    let mut raw = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    while let Some(row) = raw.next()? {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            object.insert(column.clone(), sqlite_value_to_json(row.get_ref(index)?));
        }
        rows.push(JsonValue::Object(object));
    }
    Ok(QueryResult { columns, rows })
}

/// Resolve which logical tables a query's plan reads.
///
/// Inspects `EXPLAIN QUERY PLAN` output rather than trusting the caller
/// to declare dependencies: joins, subqueries, and views all surface the
/// tables they actually touch. Physical `data_<t>` names map back to
/// their logical table.
pub fn resolve_query_tables(conn: &Connection, sql: &str) -> Result<BTreeSet<String>> {
    let plan_sql = format!("EXPLAIN QUERY PLAN {sql}");
    let mut stmt = conn.prepare(&plan_sql)?;
    let column_count = stmt.column_count();
    let detail_index = column_count.saturating_sub(1);

    let mut tables = BTreeSet::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let detail: String = row.get(detail_index)?;
        if let Some(table) = table_from_plan_detail(&detail) {
            let logical = logical_table_name(&table).unwrap_or(&table);
            tables.insert(logical.to_string());
        }
    }
    Ok(tables)
}

/// Extract the table name from one plan detail line, e.g.
/// `SCAN data_lists` or `SEARCH TABLE data_lists USING INDEX ...`.
fn table_from_plan_detail(detail: &str) -> Option<String> {
    let mut words = detail.split_whitespace();
    match words.next()? {
        "SCAN" | "SEARCH" => {}
        _ => return None,
    }
    let mut candidate = words.next()?;
    if candidate == "TABLE" {
        candidate = words.next()?;
    }
    Some(candidate.to_string())
}
