// ABOUTME: Single-flight executor for change-notification delivery
// ABOUTME: Explicit idle/scheduled/running state machine; redundant schedules coalesce

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Idle,
    Scheduled,
    Running,
}

struct Inner {
    state: Mutex<ExecState>,
    notify: Notify,
    closed: AtomicBool,
}

/// Runs at most one delivery at a time for a registration.
///
/// `schedule` while a run is in progress records a single pending run;
/// further schedules coalesce into it, so a slow consumer bounds queued
/// work at one pending delivery regardless of producer rate.
#[derive(Clone)]
pub struct SerialExecutor {
    inner: Arc<Inner>,
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ExecState::Idle),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Request a run. Returns `false` when the request coalesced into an
    /// already-pending one.
    pub fn schedule(&self) -> bool {
        let mut state = self.inner.state.lock().expect("executor state poisoned");
        match *state {
            ExecState::Idle => {
                *state = ExecState::Scheduled;
                drop(state);
                self.inner.notify.notify_one();
                true
            }
            ExecState::Scheduled => false,
            ExecState::Running => {
                *state = ExecState::Scheduled;
                drop(state);
                self.inner.notify.notify_one();
                true
            }
        }
    }

    /// Dispose the executor. The run loop exits before its next job; no
    /// further jobs execute even if one was scheduled.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drive the executor, calling `job` once per effective schedule.
    /// Intended to be spawned as the registration's consumer task.
    pub async fn run<F, Fut>(&self, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            loop {
                if self.is_closed() {
                    return;
                }
                {
                    let mut state = self.inner.state.lock().expect("executor state poisoned");
                    if *state == ExecState::Scheduled {
                        *state = ExecState::Running;
                        break;
                    }
                }
                self.inner.notify.notified().await;
            }

            job().await;

            if self.is_closed() {
                return;
            }
            let mut state = self.inner.state.lock().expect("executor state poisoned");
            if *state == ExecState::Running {
                *state = ExecState::Idle;
            }
            // A schedule that arrived mid-run left the state at
            // Scheduled; the outer loop picks it up immediately.
        }
    }
}
