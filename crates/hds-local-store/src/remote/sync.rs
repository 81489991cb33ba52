//! Background queue for advisory remote calls.
//!
//! Cleanup commits locally first and then enqueues the remote side here. A
//! failing remote is retried a bounded number of times, logged and counted;
//! it never feeds back into local state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::remote::RemoteSessionStore;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

pub enum SyncTask {
    MarkCleaned { session_id: String },
    BatchCleanup,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
pub struct RemoteSync {
    sender: mpsc::UnboundedSender<SyncTask>,
    pending: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl RemoteSync {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(remote: Arc<dyn RemoteSessionStore>, policy: RetryPolicy) -> anyhow::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("Remote sync requires a tokio runtime: {}", e))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        handle.spawn(Self::run_worker_loop(
            receiver,
            remote,
            policy,
            pending.clone(),
            failures.clone(),
        ));
        info!("Remote sync worker started");

        Ok(Self {
            sender,
            pending,
            failures,
        })
    }

    pub fn mark_cleaned(&self, session_id: &str) {
        self.enqueue(SyncTask::MarkCleaned {
            session_id: session_id.to_string(),
        });
    }

    pub fn batch_cleanup(&self) {
        self.enqueue(SyncTask::BatchCleanup);
    }

    /// Waits until every task enqueued before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(SyncTask::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(SyncTask::Shutdown);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Tasks that were dropped after exhausting their retries.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn enqueue(&self, task: SyncTask) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Remote sync worker is gone; dropping task");
        }
    }

    async fn run_worker_loop(
        mut receiver: mpsc::UnboundedReceiver<SyncTask>,
        remote: Arc<dyn RemoteSessionStore>,
        policy: RetryPolicy,
        pending: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
    ) {
        while let Some(task) = receiver.recv().await {
            match task {
                SyncTask::MarkCleaned { session_id } => {
                    let ok = with_retries(policy, "mark_cleaned", || {
                        remote.mark_session_cleaned(&session_id)
                    })
                    .await
                    .is_some();
                    if ok {
                        debug!("Remote record for session {} marked cleaned", session_id);
                    } else {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                SyncTask::BatchCleanup => {
                    match with_retries(policy, "batch_cleanup", || remote.run_batch_cleanup()).await {
                        Some(count) => debug!("Remote batch cleanup touched {} records", count),
                        None => {
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                SyncTask::Flush(done) => {
                    let _ = done.send(());
                }
                SyncTask::Shutdown => {
                    info!("Remote sync worker shutting down");
                    break;
                }
            }
        }
    }
}

async fn with_retries<T, F, Fut>(policy: RetryPolicy, operation: &str, mut call: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Some(value),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    "Remote {} failed (attempt {}/{}): {}",
                    operation,
                    attempt,
                    policy.max_retries + 1,
                    e
                );
                tokio::time::sleep(policy.base_delay * attempt).await;
            }
            Err(e) => {
                error!("Remote {} gave up after {} attempts: {}", operation, attempt + 1, e);
                metrics::inc_remote_sync_failure(operation);
                return None;
            }
        }
    }
}
