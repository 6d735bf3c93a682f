// ABOUTME: Table-change notification: filtering, trailing-edge throttling, cancellation
// ABOUTME: Deliveries go through the single-flight executor, one pending batch at most

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::storage::schema::physical_table_name;
use crate::watch::serial::SerialExecutor;

/// Raw table names touched by one committed write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotification {
    pub tables: BTreeSet<String>,
}

/// One delivered change: the union of watched logical tables touched
/// since the previous delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub tables: BTreeSet<String>,
}

/// Registration options for [`subscribe`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Trailing-edge throttle window: all changes within this span of
    /// the first one coalesce into a single notification.
    pub throttle: Duration,
    /// External cancellation signal; the registration also cancels when
    /// its stream is dropped.
    pub cancel: Option<CancellationToken>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(30),
            cancel: None,
        }
    }
}

/// Stream of coalesced change events for one registration. Dropping the
/// stream cancels the registration.
pub struct ChangeStream {
    rx: ReceiverStream<ChangeEvent>,
    token: CancellationToken,
}

impl ChangeStream {
    /// Stop the registration. No further events are delivered, even
    /// ones already scheduled.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Map raw (storage-layer) table names back to the watched logical
/// names. Watching `lists` also matches its physical `data_lists`.
fn expansion_map(tables: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(tables.len() * 2);
    for table in tables {
        map.insert(table.clone(), table.clone());
        map.insert(physical_table_name(table), table.clone());
    }
    map
}

/// Register interest in a set of logical tables against a commit
/// notification feed.
pub fn subscribe(
    commit_rx: broadcast::Receiver<CommitNotification>,
    tables: Vec<String>,
    options: WatchOptions,
) -> ChangeStream {
    let throttle = options.throttle;
    let token = options
        .cancel
        .map(|parent| parent.child_token())
        .unwrap_or_default();
    let (out_tx, out_rx) = mpsc::channel(1);

    let ready: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(BTreeSet::new()));
    let executor = SerialExecutor::new();

    // Delivery side: single-flight, bounded at one pending batch.
    {
        let executor = executor.clone();
        let ready = ready.clone();
        let token = token.clone();
        tokio::spawn(async move {
            executor
                .run(move || {
                    let ready = ready.clone();
                    let out_tx = out_tx.clone();
                    let token = token.clone();
                    async move {
                        if token.is_cancelled() {
                            return;
                        }
                        let batch = std::mem::take(&mut *ready.lock().expect("ready set poisoned"));
                        if batch.is_empty() {
                            return;
                        }
                        tokio::select! {
                            _ = token.cancelled() => {}
                            sent = out_tx.send(ChangeEvent { tables: batch }) => {
                                if sent.is_err() {
                                    token.cancel();
                                }
                            }
                        }
                    }
                })
                .await;
        });
    }

    // Accumulation side: intersect, throttle, then hand off.
    {
        let token = token.clone();
        let executor_for_close = executor.clone();
        tokio::spawn(async move {
            let watched = expansion_map(&tables);
            let mut commit_rx = commit_rx;
            let mut window: BTreeSet<String> = BTreeSet::new();
            let mut armed = false;
            let timer = tokio::time::sleep(Duration::from_secs(0));
            tokio::pin!(timer);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.as_mut(), if armed => {
                        armed = false;
                        if !window.is_empty() {
                            ready
                                .lock()
                                .expect("ready set poisoned")
                                .extend(std::mem::take(&mut window));
                            executor.schedule();
                        }
                    }
                    received = commit_rx.recv() => {
                        let hits: Vec<String> = match received {
                            Ok(notification) => notification
                                .tables
                                .iter()
                                .filter_map(|raw| watched.get(raw))
                                .cloned()
                                .collect(),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                // Lost notifications: assume every watched
                                // table may have changed.
                                tracing::warn!("change feed lagged by {skipped}; flagging all watched tables");
                                watched.values().cloned().collect()
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if !hits.is_empty() {
                            window.extend(hits);
                            if !armed {
                                armed = true;
                                timer.as_mut().reset(tokio::time::Instant::now() + throttle);
                            }
                        }
                    }
                }
            }
            executor_for_close.close();
        });
    }

    ChangeStream {
        rx: ReceiverStream::new(out_rx),
        token,
    }
}
