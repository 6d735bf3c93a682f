// ABOUTME: Cooperative read/write lock discipline over the SQLite connections
// ABOUTME: One acquisition gate, one exclusive writer, pooled readers, bounded timeouts

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};

use crate::error::{LockKind, Result, SyncError};

/// Connection pool implementing the engine's concurrency policy: a
/// single logical writer, multiple logical readers, and one gate that
/// serializes every acquisition path. The gate is held only while
/// acquiring, so readers proceed concurrently once admitted; a writer
/// waiting on the exclusive lock still blocks later acquisitions,
/// preventing reader streams from starving it.
pub struct ConnectionPool {
    gate: Mutex<()>,
    write: Mutex<Connection>,
    read_slots: Semaphore,
    readers: std::sync::Mutex<Vec<Connection>>,
}

pub struct WriteGuard<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl std::fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard").finish_non_exhaustive()
    }
}

impl Deref for WriteGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}

pub struct ReadGuard<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuard").finish_non_exhaustive()
    }
}

impl Deref for ReadGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .readers
                .lock()
                .expect("reader pool poisoned")
                .push(conn);
        }
    }
}

impl ConnectionPool {
    pub fn new(write: Connection, readers: Vec<Connection>) -> Self {
        let read_slots = Semaphore::new(readers.len());
        Self {
            gate: Mutex::new(()),
            write: Mutex::new(write),
            read_slots,
            readers: std::sync::Mutex::new(readers),
        }
    }

    /// Acquire the exclusive write lock within `timeout`.
    ///
    /// The timeout is the deadlock surface for nested acquisition: a
    /// caller holding this lock and requesting it again times out with a
    /// distinct error instead of hanging.
    pub async fn write(&self, timeout: Duration) -> Result<WriteGuard<'_>> {
        let acquire = async {
            let _gate = self.gate.lock().await;
            self.write.lock().await
        };
        match tokio::time::timeout(timeout, acquire).await {
            Ok(guard) => Ok(WriteGuard { guard }),
            Err(_) => Err(SyncError::LockTimeout {
                kind: LockKind::Write,
                timeout,
            }),
        }
    }

    /// Acquire a pooled read connection within `timeout`. Readers run
    /// concurrently with each other; only acquisition is serialized.
    pub async fn read(&self, timeout: Duration) -> Result<ReadGuard<'_>> {
        let acquire = async {
            let _gate = self.gate.lock().await;
            self.read_slots
                .acquire()
                .await
                .expect("read semaphore never closed")
        };
        match tokio::time::timeout(timeout, acquire).await {
            Ok(permit) => {
                let conn = self
                    .readers
                    .lock()
                    .expect("reader pool poisoned")
                    .pop()
                    .expect("permit implies an available connection");
                Ok(ReadGuard {
                    conn: Some(conn),
                    pool: self,
                    _permit: permit,
                })
            }
            Err(_) => Err(SyncError::LockTimeout {
                kind: LockKind::Read,
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(readers: usize) -> ConnectionPool {
        let write = Connection::open_in_memory().unwrap();
        let read = (0..readers)
            .map(|_| Connection::open_in_memory().unwrap())
            .collect();
        ConnectionPool::new(write, read)
    }

    #[tokio::test]
    async fn nested_write_acquisition_times_out() {
        let pool = pool(1);
        let _held = pool.write(Duration::from_secs(1)).await.unwrap();
        let err = pool.write(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::LockTimeout {
                kind: LockKind::Write,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn readers_run_concurrently() {
        let pool = pool(2);
        let first = pool.read(Duration::from_millis(100)).await.unwrap();
        let second = pool.read(Duration::from_millis(100)).await.unwrap();
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn read_times_out_when_slots_exhausted() {
        let pool = pool(1);
        let _held = pool.read(Duration::from_secs(1)).await.unwrap();
        let err = pool.read(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::LockTimeout {
                kind: LockKind::Read,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn writer_does_not_block_admitted_readers() {
        let pool = pool(1);
        let reader = pool.read(Duration::from_millis(100)).await.unwrap();
        let writer = pool.write(Duration::from_millis(100)).await.unwrap();
        drop(writer);
        drop(reader);
    }
}
