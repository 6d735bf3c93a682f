// ABOUTME: Serde models for the connector-facing sync protocol lines
// ABOUTME: Checkpoints, checkpoint diffs, bucket data batches, and priorities

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Priority band of a bucket. Lower numbers sync and publish first;
/// band 0 is foundational data that may always be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketPriority(pub i32);

impl BucketPriority {
    pub const HIGHEST: BucketPriority = BucketPriority(0);
    pub const DEFAULT: BucketPriority = BucketPriority(3);

    /// Priority key recorded in `sync_state` for a completed full sync.
    pub const FULL_SYNC_SENTINEL: i32 = i32::MAX;

    /// Whether a sync at this threshold covers a bucket declared at
    /// `declared`. A threshold covers its own band and every
    /// higher-priority (lower-numbered) band.
    pub fn covers(self, declared: BucketPriority) -> bool {
        declared.0 <= self.0
    }
}

/// Op ids travel as JSON strings or integers depending on the server
/// runtime's integer width.
fn parse_op_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct OpIdVisitor;

    impl Visitor<'_> for OpIdVisitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an op id as an integer or decimal string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<i64, E> {
            Ok(value as i64)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<i64, E> {
            Ok(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<i64, E> {
            value
                .parse()
                .map_err(|_| E::custom(format!("invalid op id: {value}")))
        }
    }

    deserializer.deserialize_any(OpIdVisitor)
}

fn parse_optional_op_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "parse_op_id")] i64);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

/// Server-declared checksum for one bucket at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BucketChecksum {
    pub bucket: String,
    pub checksum: Checksum,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub priority: Option<BucketPriority>,
}

impl BucketChecksum {
    pub fn priority(&self) -> BucketPriority {
        self.priority.unwrap_or(BucketPriority::DEFAULT)
    }
}

/// A server-declared target state the replica must converge to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Checkpoint {
    #[serde(deserialize_with = "parse_op_id")]
    pub last_op_id: i64,
    #[serde(default, deserialize_with = "parse_optional_op_id")]
    pub write_checkpoint: Option<i64>,
    pub buckets: Vec<BucketChecksum>,
}

impl Checkpoint {
    /// Fold an incremental diff over this checkpoint, producing the
    /// equivalent full checkpoint validation consumes.
    pub fn apply_diff(&self, diff: &CheckpointDiff) -> Checkpoint {
        let mut buckets: Vec<BucketChecksum> = self
            .buckets
            .iter()
            .filter(|b| {
                !diff.removed_buckets.contains(&b.bucket)
                    && !diff.updated_buckets.iter().any(|u| u.bucket == b.bucket)
            })
            .cloned()
            .collect();
        buckets.extend(diff.updated_buckets.iter().cloned());
        buckets.sort_by(|a, b| a.bucket.cmp(&b.bucket));
        Checkpoint {
            last_op_id: diff.last_op_id,
            write_checkpoint: diff.write_checkpoint,
            buckets,
        }
    }
}

/// Updated/removed bucket checksums relative to the last full checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckpointDiff {
    #[serde(deserialize_with = "parse_op_id")]
    pub last_op_id: i64,
    #[serde(default)]
    pub updated_buckets: Vec<BucketChecksum>,
    #[serde(default)]
    pub removed_buckets: Vec<String>,
    #[serde(default, deserialize_with = "parse_optional_op_id")]
    pub write_checkpoint: Option<i64>,
}

/// Signals that every operation up to `last_op_id` has been sent for the
/// given priority band (or for all buckets when `priority` is absent).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckpointComplete {
    #[serde(deserialize_with = "parse_op_id")]
    pub last_op_id: i64,
    #[serde(default)]
    pub priority: Option<BucketPriority>,
}

/// Kind of a downloaded oplog operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Put,
    Remove,
    Move,
    Clear,
}

/// One downloaded operation within a bucket's data line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OplogOperation {
    #[serde(deserialize_with = "parse_op_id")]
    pub op_id: i64,
    pub op: OpType,
    #[serde(default)]
    pub row_type: Option<String>,
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(default)]
    pub subkey: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub checksum: Checksum,
}

impl OplogOperation {
    /// Composite key detecting multiple writes to the same logical row
    /// within a bucket.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.row_type.as_deref().unwrap_or(""),
            self.row_id.as_deref().unwrap_or(""),
            self.subkey.as_deref().unwrap_or("")
        )
    }

    pub fn data_json(&self) -> Option<String> {
        self.data.as_ref().map(|d| d.to_string())
    }
}

/// Ordered operations for one bucket, as produced by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BucketData {
    pub bucket: String,
    pub data: Vec<OplogOperation>,
    #[serde(default)]
    pub has_more: bool,
}

/// A batch of bucket data lines applied in one storage transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncDataBatch {
    pub buckets: Vec<BucketData>,
}

impl SyncDataBatch {
    pub fn new(buckets: Vec<BucketData>) -> Self {
        Self { buckets }
    }
}

/// One line of the download stream, externally tagged the way the server
/// frames them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum SyncLine {
    #[serde(rename = "checkpoint")]
    Checkpoint(Checkpoint),
    #[serde(rename = "checkpoint_diff")]
    CheckpointDiff(CheckpointDiff),
    #[serde(rename = "checkpoint_complete")]
    CheckpointComplete(CheckpointComplete),
    #[serde(rename = "data")]
    Data(BucketData),
}
