// ABOUTME: Database facade - lifecycle, transactions, local writes, and watch APIs
// ABOUTME: Owns the connections, the commit notification feed, and sync status

pub mod locks;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, Connection, TransactionBehavior};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::storage::buckets::{self, BucketRequest, LOCAL_BUCKET, MAX_OP_ID};
use crate::storage::crud::{self, CrudBatch, CrudOp, CrudTransaction};
use crate::storage::schema::{self, physical_table_name, Schema};
use crate::sync::engine::{self, MaterializeHandler, OperationHandler, SyncLocalResult};
use crate::sync::models::{BucketPriority, Checkpoint, SyncDataBatch};
use crate::sync::status::SyncStatus;
use crate::watch::notifier::{self, ChangeStream, CommitNotification, WatchOptions};
use crate::watch::query::{self, QueryResult};

use locks::ConnectionPool;

/// Lifecycle of a database handle. Operations issued before `Ready`
/// await readiness instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// Configuration for opening a [`SyncDatabase`].
#[derive(Debug, Clone)]
pub struct SyncDatabaseConfig {
    /// Path to the database file. Multiple connections are opened
    /// against it, so it must be a real file, not `:memory:`.
    pub path: PathBuf,
    pub schema: Schema,
    /// Budget for every read/write lock acquisition.
    pub lock_timeout: Duration,
    /// Size of the concurrent-reader pool.
    pub read_connections: usize,
}

impl SyncDatabaseConfig {
    pub fn new(path: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            path: path.into(),
            schema,
            lock_timeout: Duration::from_secs(30),
            read_connections: 4,
        }
    }
}

struct DbInner {
    lock_timeout: Duration,
    pool: ConnectionPool,
    lifecycle: watch::Sender<LifecycleState>,
    status: watch::Sender<SyncStatus>,
    commit_tx: broadcast::Sender<CommitNotification>,
    touched: Arc<StdMutex<BTreeSet<String>>>,
    handlers: StdRwLock<Vec<Box<dyn OperationHandler>>>,
    upload_guard: Arc<tokio::sync::Mutex<()>>,
}

/// Handle to a local-first synchronized database. Cheap to clone; all
/// clones share one connection pool and lifecycle.
#[derive(Clone)]
pub struct SyncDatabase {
    inner: Arc<DbInner>,
}

impl SyncDatabase {
    /// Open (or create) the database and run the initialization
    /// sequence: storage adapter, sync metadata tables, version
    /// compatibility, user schema, persisted sync status.
    pub async fn open(config: SyncDatabaseConfig) -> Result<Self> {
        let (lifecycle, _) = watch::channel(LifecycleState::Initializing);
        tracing::info!("opening sync database at {}", config.path.display());

        let write = Connection::open(&config.path)?;
        schema::configure_connection(&write)?;
        schema::init_schema(&write)?;
        schema::apply_schema(&write, &config.schema)?;

        let touched: Arc<StdMutex<BTreeSet<String>>> = Arc::new(StdMutex::new(BTreeSet::new()));
        {
            let touched = touched.clone();
            write.update_hook(Some(
                move |_action: rusqlite::hooks::Action, _db: &str, table: &str, _rowid: i64| {
                    touched
                        .lock()
                        .expect("touched buffer poisoned")
                        .insert(table.to_string());
                },
            ));
        }

        let mut readers = Vec::with_capacity(config.read_connections);
        for _ in 0..config.read_connections.max(1) {
            let reader = Connection::open(&config.path)?;
            schema::configure_connection(&reader)?;
            reader.pragma_update(None, "query_only", "on")?;
            readers.push(reader);
        }

        let initial_status = SyncStatus::from_storage(&write)?;
        let (status, _) = watch::channel(initial_status);
        let (commit_tx, _) = broadcast::channel(64);

        let inner = Arc::new(DbInner {
            lock_timeout: config.lock_timeout,
            pool: ConnectionPool::new(write, readers),
            lifecycle,
            status,
            commit_tx,
            touched,
            handlers: StdRwLock::new(vec![
                Box::new(MaterializeHandler) as Box<dyn OperationHandler>
            ]),
            upload_guard: Arc::new(tokio::sync::Mutex::new(())),
        });
        inner.lifecycle.send_replace(LifecycleState::Ready);
        tracing::info!("sync database ready");
        Ok(Self { inner })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.lifecycle.borrow()
    }

    async fn ensure_ready(&self) -> Result<()> {
        let mut rx = self.inner.lifecycle.subscribe();
        loop {
            match *rx.borrow_and_update() {
                LifecycleState::Ready => return Ok(()),
                LifecycleState::Closed => return Err(SyncError::Closed),
                _ => {}
            }
            rx.changed().await.map_err(|_| SyncError::Closed)?;
        }
    }

    /// Mark the handle closed. In-flight operations finish; new ones
    /// fail with [`SyncError::Closed`].
    pub fn close(&self) {
        self.inner.lifecycle.send_replace(LifecycleState::Closed);
        tracing::info!("sync database closed");
    }

    /// Run a read-only transaction on a pooled reader. The transaction
    /// is always rolled back, so it can never leave side effects.
    pub async fn read_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.ensure_ready().await?;
        let guard = self.inner.pool.read(self.inner.lock_timeout).await?;
        guard.execute_batch("BEGIN")?;
        let result = f(&guard);
        let rollback = guard.execute_batch("ROLLBACK");
        let value = result?;
        rollback?;
        Ok(value)
    }

    /// Run a write transaction under the exclusive lock. Commits on
    /// `Ok`, rolls back on `Err`, and publishes a commit notification
    /// naming every table the transaction touched.
    pub async fn write_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.ensure_ready().await?;
        let mut guard = self.inner.pool.write(self.inner.lock_timeout).await?;
        self.inner
            .touched
            .lock()
            .expect("touched buffer poisoned")
            .clear();
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                let tables = std::mem::take(
                    &mut *self.inner.touched.lock().expect("touched buffer poisoned"),
                );
                if !tables.is_empty() {
                    // No receivers is fine; nobody is watching yet.
                    let _ = self.inner.commit_tx.send(CommitNotification { tables });
                }
                Ok(value)
            }
            Err(err) => {
                drop(tx);
                self.inner
                    .touched
                    .lock()
                    .expect("touched buffer poisoned")
                    .clear();
                Err(err)
            }
        }
    }

    // ---- sync engine entry points -------------------------------------

    /// Apply a batch of downloaded bucket data to the oplog store.
    pub async fn save_sync_data(&self, batch: &SyncDataBatch) -> Result<()> {
        self.inner.status.send_modify(|s| s.downloading = true);
        self.write_transaction(|conn| engine::save_sync_data(conn, batch))
            .await
    }

    /// Validate a checkpoint and commit it, exposing downloaded data
    /// to readers when the local-write gate allows.
    pub async fn sync_local_database(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<BucketPriority>,
    ) -> Result<SyncLocalResult> {
        let result = self
            .write_transaction(|conn| {
                let handlers = self
                    .inner
                    .handlers
                    .read()
                    .expect("handler registry poisoned");
                engine::sync_local_database(conn, checkpoint, priority, &handlers)
            })
            .await?;
        if result.is_applied() {
            let persisted = self
                .read_transaction(SyncStatus::from_storage)
                .await?;
            self.inner.status.send_modify(|s| {
                s.downloading = false;
                s.has_synced = persisted.has_synced;
                s.last_synced_at = persisted.last_synced_at;
                s.priority_status = persisted.priority_status;
            });
        }
        Ok(result)
    }

    /// Advance the `$local` bucket's target to a freshly-minted op id,
    /// re-checking queue emptiness after the mint closes the race with
    /// concurrent local writes. Returns whether the target moved.
    pub async fn update_local_target<F, Fut>(&self, mint: F) -> anyhow::Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<i64>>,
    {
        let pending = self
            .read_transaction(|conn| {
                let Some(local) = buckets::find_bucket(conn, LOCAL_BUCKET)? else {
                    return Ok(false);
                };
                if local.target_op != MAX_OP_ID {
                    return Ok(false);
                }
                crud::queue_is_empty(conn)
            })
            .await?;
        if !pending {
            return Ok(false);
        }

        let op_id = mint().await?;

        let updated = self
            .write_transaction(|conn| {
                // A local write may have slipped in while minting.
                if !crud::queue_is_empty(conn)? {
                    return Ok(false);
                }
                let Some(local) = buckets::find_bucket(conn, LOCAL_BUCKET)? else {
                    return Ok(false);
                };
                if local.target_op != MAX_OP_ID {
                    return Ok(false);
                }
                conn.execute(
                    "UPDATE sync_buckets SET target_op = ?2 WHERE name = ?1",
                    params![LOCAL_BUCKET, op_id],
                )?;
                Ok(true)
            })
            .await?;
        if updated {
            tracing::debug!("advanced $local target to {op_id}");
        }
        Ok(updated)
    }

    /// Register an additional downstream operation handler. Handlers run
    /// in registration order when a checkpoint publishes.
    pub fn register_operation_handler(&self, handler: Box<dyn OperationHandler>) {
        self.inner
            .handlers
            .write()
            .expect("handler registry poisoned")
            .push(handler);
    }

    // ---- connector-facing state ---------------------------------------

    /// Per-bucket download progress for stream resume.
    pub async fn bucket_states(&self) -> Result<Vec<BucketRequest>> {
        self.read_transaction(buckets::bucket_states).await
    }

    /// Stable per-install identifier.
    pub async fn client_id(&self) -> Result<String> {
        self.write_transaction(buckets::client_id).await
    }

    // ---- CRUD queue ---------------------------------------------------

    pub async fn get_crud_batch(&self, limit: usize) -> Result<Option<CrudBatch>> {
        self.read_transaction(|conn| crud::get_crud_batch(conn, limit))
            .await
    }

    pub async fn get_next_crud_transaction(&self) -> Result<Option<CrudTransaction>> {
        self.read_transaction(crud::next_crud_transaction).await
    }

    /// Complete an uploaded batch/transaction, clearing its queue
    /// entries and advancing the `$local` target.
    pub async fn complete_crud(
        &self,
        last_op_id: i64,
        write_checkpoint: Option<i64>,
    ) -> Result<()> {
        self.write_transaction(|conn| crud::complete(conn, last_op_id, write_checkpoint))
            .await
    }

    /// Exclusive-upload guard: at most one upload cycle per handle.
    pub(crate) fn try_begin_upload(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.inner.upload_guard.clone().try_lock_owned().ok()
    }

    // ---- local writes -------------------------------------------------

    /// Insert or replace a row locally and queue the write for upload.
    pub async fn put(&self, table: &str, id: &str, data: serde_json::Value) -> Result<()> {
        self.local_write(table, id, CrudOp::Put, Some(data)).await
    }

    /// Merge fields into a row locally and queue a patch for upload.
    pub async fn patch(&self, table: &str, id: &str, data: serde_json::Value) -> Result<()> {
        self.local_write(table, id, CrudOp::Patch, Some(data)).await
    }

    /// Delete a row locally and queue the delete for upload.
    pub async fn delete_row(&self, table: &str, id: &str) -> Result<()> {
        self.local_write(table, id, CrudOp::Delete, None).await
    }

    async fn local_write(
        &self,
        table: &str,
        id: &str,
        op: CrudOp,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        schema::validate_table_name(table)
            .map_err(|_| rusqlite::Error::InvalidParameterName(table.to_string()))?;
        let physical = physical_table_name(table);
        self.write_transaction(move |conn| {
            use rusqlite::OptionalExtension;
            let previous: Option<String> = conn
                .prepare_cached(&format!("SELECT data FROM \"{physical}\" WHERE id = ?1"))?
                .query_row([id], |row| row.get::<_, Option<String>>(0))
                .optional()?
                .flatten();
            let previous_json: Option<serde_json::Value> =
                previous.as_deref().and_then(|p| serde_json::from_str(p).ok());

            let stored = match (op, &data) {
                (CrudOp::Patch, Some(patch)) => {
                    // Patches merge over the existing document.
                    let mut merged = previous_json.clone().unwrap_or_else(
                        || serde_json::Value::Object(serde_json::Map::new()),
                    );
                    if let (Some(base), Some(fields)) =
                        (merged.as_object_mut(), patch.as_object())
                    {
                        for (key, value) in fields {
                            base.insert(key.clone(), value.clone());
                        }
                    }
                    Some(merged)
                }
                (_, Some(document)) => Some(document.clone()),
                (_, None) => None,
            };

            match op {
                CrudOp::Delete => {
                    conn.prepare_cached(&format!("DELETE FROM \"{physical}\" WHERE id = ?1"))?
                        .execute([id])?;
                }
                _ => {
                    let serialized = serde_json::to_string(
                        stored.as_ref().expect("put/patch carry a document"),
                    )?;
                    conn.prepare_cached(&format!(
                        "INSERT OR REPLACE INTO \"{physical}\" (id, data) VALUES (?1, ?2)"
                    ))?
                    .execute(params![id, serialized])?;
                }
            }

            let tx_id = crud::next_tx_id(conn)?;
            crud::enqueue(
                conn,
                op,
                table,
                id,
                Some(tx_id),
                data.as_ref(),
                None,
                previous_json.as_ref(),
            )?;
            Ok(())
        })
        .await
    }

    // ---- status -------------------------------------------------------

    /// Snapshot of the current sync status.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch channel following status transitions.
    pub fn status_stream(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.status.send_modify(|s| {
            s.connected = connected;
            s.connecting = false;
            if !connected {
                s.downloading = false;
                s.uploading = false;
            }
        });
    }

    pub fn set_connecting(&self) {
        self.inner.status.send_modify(|s| {
            s.connecting = true;
        });
    }

    pub(crate) fn set_uploading(&self, uploading: bool) {
        self.inner.status.send_modify(|s| s.uploading = uploading);
    }

    /// Whether a full sync has ever completed for this database.
    pub fn has_synced(&self) -> bool {
        self.inner.status.borrow().has_synced
    }

    /// Wait until a sync covering `priority` (or a full sync, when
    /// `None`) has completed at least once.
    pub async fn wait_for_first_sync(&self, priority: Option<BucketPriority>) -> Result<()> {
        self.ensure_ready().await?;
        let mut rx = self.inner.status.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                let done = match priority {
                    None => status.has_synced,
                    Some(p) => status.has_synced_for(p),
                };
                if done {
                    return Ok(());
                }
            }
            rx.changed().await.map_err(|_| SyncError::Closed)?;
        }
    }

    // ---- change notification ------------------------------------------

    /// Register interest in a set of logical tables.
    pub fn on_change(&self, tables: &[&str], options: WatchOptions) -> ChangeStream {
        notifier::subscribe(
            self.inner.commit_tx.subscribe(),
            tables.iter().map(|t| t.to_string()).collect(),
            options,
        )
    }

    /// Run a query now and re-run it whenever a table its plan reads
    /// changes. Errors from re-runs are delivered on the stream rather
    /// than tearing down other registrations.
    pub async fn watch_query(
        &self,
        sql: &str,
        params: Vec<Value>,
        options: WatchOptions,
    ) -> Result<QueryStream> {
        self.ensure_ready().await?;
        let sql = sql.to_string();
        let (tables, initial) = {
            let sql = sql.clone();
            let params = params.clone();
            self.read_transaction(move |conn| {
                let tables = query::resolve_query_tables(conn, &sql)?;
                let initial = query::run_query(conn, &sql, &params)?;
                Ok((tables, initial))
            })
            .await?
        };
        tracing::debug!("watching query over tables {tables:?}");

        let token = options
            .cancel
            .clone()
            .unwrap_or_default()
            .child_token();
        let table_refs: Vec<&str> = tables.iter().map(|t| t.as_str()).collect();
        let mut changes = self.on_change(
            &table_refs,
            WatchOptions {
                throttle: options.throttle,
                cancel: Some(token.clone()),
            },
        );

        let (tx, rx) = mpsc::channel(4);
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }
            while let Some(_event) = changes.next().await {
                let Some(db) = upgrade(&weak) else { break };
                let sql = sql.clone();
                let params = params.clone();
                let result = db
                    .read_transaction(move |conn| query::run_query(conn, &sql, &params))
                    .await;
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        });

        Ok(QueryStream {
            rx: ReceiverStream::new(rx),
            token,
        })
    }
}

fn upgrade(weak: &Weak<DbInner>) -> Option<SyncDatabase> {
    weak.upgrade().map(|inner| SyncDatabase { inner })
}

/// Stream of query results for a watched query: the immediate first run,
/// then one re-run per coalesced change notification.
pub struct QueryStream {
    rx: ReceiverStream<Result<QueryResult>>,
    token: CancellationToken,
}

impl QueryStream {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl futures::Stream for QueryStream {
    type Item = Result<QueryResult>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
