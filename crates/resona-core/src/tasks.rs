//! Background task supervisor
//!
//! Structured replacement for fire-and-forget: background work
//! (semantic consolidation, catalyst detection, co-occurrence
//! recording) is submitted to a bounded queue and run by a supervised
//! worker. Job failures are logged and swallowed; they never reach the
//! foreground caller. Shutdown drains jobs already queued, then stops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Message {
    Run { name: &'static str, job: Job },
    Shutdown,
}

/// Handle for submitting background jobs; cheap to clone
#[derive(Clone)]
pub struct TaskHandle {
    tx: mpsc::Sender<Message>,
}

impl TaskHandle {
    /// Submit a job. Under backpressure (full queue) or after shutdown
    /// the job is dropped with a warning; background work is
    /// best-effort by contract.
    pub fn submit<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let wrapped: Job = Box::pin(async move {
            if let Err(e) = job.await {
                tracing::warn!(task = name, error = %e, "background task failed");
            }
        });

        if let Err(e) = self.tx.try_send(Message::Run { name, job: wrapped }) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "supervisor stopped",
            };
            tracing::warn!(task = name, reason, "background task dropped");
        }
    }
}

/// Owner of the background worker. Created by the application entry
/// point and torn down deterministically via [`Supervisor::shutdown`].
pub struct Supervisor {
    handle_tx: mpsc::Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Spawn the worker with the given queue depth
    pub fn new(queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(queue_depth.max(1));

        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Run { name, job } => {
                        tracing::debug!(task = name, "background task starting");
                        job.await;
                    }
                    Message::Shutdown => break,
                }
            }
            tracing::debug!("background supervisor stopped");
        });

        Self {
            handle_tx: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// A submission handle
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            tx: self.handle_tx.clone(),
        }
    }

    /// Stop the worker after it finishes jobs already queued ahead of
    /// the shutdown message
    pub async fn shutdown(&self) {
        let _ = self.handle_tx.send(Message::Shutdown).await;
        let worker = self
            .worker
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "supervisor worker join failed");
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let supervisor = Supervisor::new(8);
        let handle = supervisor.handle();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            handle.submit("ordered", async move {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        supervisor.shutdown().await;

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let supervisor = Supervisor::new(8);
        let handle = supervisor.handle();
        let ran = Arc::new(AtomicUsize::new(0));

        handle.submit("doomed", async {
            Err(crate::error::CoreError::InvalidInput("expected".into()))
        });
        let ran_clone = ran.clone();
        handle.submit("after", async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        supervisor.shutdown().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let supervisor = Supervisor::new(8);
        let handle = supervisor.handle();
        supervisor.shutdown().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        handle.submit("late", async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
