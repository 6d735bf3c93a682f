// ABOUTME: Sync status snapshot published to consumers via a watch channel
// ABOUTME: "Has synced" is recomputed from persisted sync_state rows at init

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::sync::models::BucketPriority;

/// Completion watermark for one priority band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityStatus {
    pub priority: BucketPriority,
    pub last_synced_at: DateTime<Utc>,
}

/// Point-in-time view of the engine's sync progress.
///
/// Ordinary checksum-retry cycles only ever show up here as the
/// `downloading` flag staying set; they never surface as errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub connected: bool,
    pub connecting: bool,
    pub downloading: bool,
    pub uploading: bool,
    /// A full sync has completed at some point in this database's life.
    pub has_synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub priority_status: Vec<PriorityStatus>,
}

impl SyncStatus {
    /// Whether a sync covering `priority` has ever completed. A full
    /// sync covers every band.
    pub fn has_synced_for(&self, priority: BucketPriority) -> bool {
        if self.has_synced {
            return true;
        }
        self.priority_status.iter().any(|s| s.priority.covers(priority))
    }

    /// Rebuild the persisted part of the status from `sync_state` rows.
    pub fn from_storage(conn: &Connection) -> Result<SyncStatus> {
        let mut stmt = conn.prepare_cached(
            "SELECT priority, last_synced_at FROM sync_state ORDER BY priority",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let priority: i32 = row.get(0)?;
                let at: String = row.get(1)?;
                Ok((priority, at))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut status = SyncStatus::default();
        for (priority, at) in rows {
            let Ok(at) = DateTime::parse_from_rfc3339(&at) else {
                tracing::warn!("ignoring unparseable sync_state timestamp for priority {priority}");
                continue;
            };
            let at = at.with_timezone(&Utc);
            if priority == BucketPriority::FULL_SYNC_SENTINEL {
                status.has_synced = true;
                status.last_synced_at = Some(at);
            } else {
                status.priority_status.push(PriorityStatus {
                    priority: BucketPriority(priority),
                    last_synced_at: at,
                });
            }
        }
        Ok(status)
    }
}
