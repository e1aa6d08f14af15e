use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job was dropped before completion")]
    JobDropped,
}

/// Cheap snapshot of the executor for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
}

/// Receives one job's eventual result. A job failure resolves only its own
/// handle; other jobs are untouched.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    pub async fn join(self) -> Result<T, QueueError> {
        self.rx.await.map_err(|_| QueueError::JobDropped)
    }
}

struct QueueState {
    backlog: VecDeque<BoxFuture<'static, ()>>,
    active: usize,
}

struct QueueInner {
    max_parallel: usize,
    state: Mutex<QueueState>,
}

/// Bounded-concurrency executor: at most `max_parallel` jobs run at once,
/// waiting jobs start in FIFO order as slots free up. The queue itself has
/// no retry policy; that belongs to callers.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_parallel: max_parallel.max(1),
                state: Mutex::new(QueueState {
                    backlog: VecDeque::new(),
                    active: 0,
                }),
            }),
        }
    }

    /// Appends the task to the backlog and starts it immediately if a slot
    /// is free. Submission never blocks; the result arrives on the handle.
    pub fn submit<F, T>(&self, task: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let _ = tx.send(task.await);
        }
        .boxed();

        if let Ok(mut state) = self.inner.state.lock() {
            state.backlog.push_back(job);
        }
        self.pump();
        JobHandle { rx }
    }

    pub fn status(&self) -> QueueStatus {
        self.inner
            .state
            .lock()
            .map(|state| QueueStatus {
                active: state.active,
                queued: state.backlog.len(),
            })
            .unwrap_or_default()
    }

    fn pump(&self) {
        loop {
            let job = {
                let Ok(mut state) = self.inner.state.lock() else {
                    return;
                };
                if state.active >= self.inner.max_parallel {
                    return;
                }
                let Some(job) = state.backlog.pop_front() else {
                    return;
                };
                state.active += 1;
                debug!(
                    active = state.active,
                    queued = state.backlog.len(),
                    "starting queued job"
                );
                job
            };

            let queue = self.clone();
            tokio::spawn(async move {
                // An inner spawn isolates panics: the slot is released and
                // the next job starts even if this one panicked.
                let _ = tokio::spawn(job).await;
                if let Ok(mut state) = queue.inner.state.lock() {
                    state.active -= 1;
                }
                queue.pump();
            });
        }
    }
}
