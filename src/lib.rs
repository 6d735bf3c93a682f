// ABOUTME: Local-first SQLite synchronization engine
// ABOUTME: Bucketed op-log download, checksum validation, offline write upload

//! A client-side synchronization engine that keeps an embedded SQLite
//! store eventually consistent with a remote bucket-oriented change log,
//! while local writes queue for upload and reconcile once acknowledged.
//!
//! The wire transport is out of scope: a connector drives the engine by
//! feeding it [`sync::models::SyncLine`]s and draining the CRUD queue
//! via [`sync::upload`].

pub mod checksum;
pub mod db;
pub mod error;
pub mod storage;
pub mod sync;
pub mod watch;

pub use checksum::Checksum;
pub use db::{LifecycleState, QueryStream, SyncDatabase, SyncDatabaseConfig};
pub use error::{Result, SyncError};
pub use storage::buckets::{BucketRequest, BucketState, LOCAL_BUCKET, MAX_OP_ID};
pub use storage::crud::{CrudBatch, CrudEntry, CrudOp, CrudTransaction};
pub use storage::schema::{Schema, Table};
pub use sync::engine::{
    ChecksumMismatch, MaterializeHandler, OperationHandler, RowOpKind, RowOperation,
    SyncLocalResult,
};
pub use sync::models::{
    BucketChecksum, BucketData, BucketPriority, Checkpoint, CheckpointComplete, CheckpointDiff,
    OpType, OplogOperation, SyncDataBatch, SyncLine,
};
pub use sync::status::SyncStatus;
pub use sync::upload::{upload_pending_writes, BackendConnector, UploadError, UploadStats};
pub use watch::notifier::{ChangeEvent, ChangeStream, WatchOptions};
pub use watch::query::QueryResult;
