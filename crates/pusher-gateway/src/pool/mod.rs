//! Per-identity delivery pool.
//!
//! The first token of every push is sent inline so a broken payload or
//! credential fails the call; the remaining tokens go to a fixed set of
//! worker tasks over an unbounded queue. Every attempt, inline or queued,
//! is reported to the response sink.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::apns::{DeliveryError, Notification, Transport};

/// Queue depth at which (and at every multiple of which) a backlog warning
/// is logged.
pub const BACKLOG_WARN_THRESHOLD: usize = 1_000;

/// Outcome of one (notification, token) attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub owner: String,
    pub topic: String,
    pub token: String,
    /// Environment the attempt went to.
    pub sandbox: bool,
    /// `apns-id` on success.
    pub id: Option<String>,
    pub error: Option<DeliveryError>,
}

impl DeliveryResponse {
    /// HTTP-style status: 200 on success, the provider status otherwise.
    pub fn status(&self) -> u16 {
        self.error.as_ref().map_or(200, DeliveryError::status)
    }
}

/// What happened during the inline part of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// The token that succeeded inline and its `apns-id`.
    pub delivered: Option<(String, String)>,
    /// Tokens APNS rejected as invalid before the first success.
    pub rejected: Vec<(String, DeliveryError)>,
    /// Tokens handed to the workers.
    pub queued: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("delivery pool for {0} is closed")]
    Closed(String),

    /// A non-token error on the inline send; nothing after `token` was tried.
    #[error("push to {token} failed: {error}")]
    Aborted {
        token: String,
        error: DeliveryError,
        /// Token errors seen before the abort.
        rejected: Vec<(String, DeliveryError)>,
    },
}

struct Job {
    notification: Arc<Notification>,
    token: String,
}

struct PoolShared {
    bundle_id: String,
    transport: Arc<dyn Transport>,
    sandbox: Arc<AtomicBool>,
    sink: Option<mpsc::UnboundedSender<DeliveryResponse>>,
    pending: AtomicUsize,
}

impl PoolShared {
    /// One send, with panics in the transport turned into transport errors.
    async fn deliver(
        &self,
        notification: &Notification,
        token: &str,
    ) -> (bool, Result<String, DeliveryError>) {
        let sandbox = self.sandbox.load(Ordering::Acquire);
        let result = AssertUnwindSafe(self.transport.send(notification, token, sandbox))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(bundle_id = %self.bundle_id, "Transport panicked during send");
                Err(DeliveryError::Transport("sender panicked".to_string()))
            });
        (sandbox, result)
    }

    fn emit(
        &self,
        notification: &Notification,
        token: &str,
        sandbox: bool,
        result: &Result<String, DeliveryError>,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };
        let (id, error) = match result {
            Ok(id) => (Some(id.clone()), None),
            Err(e) => (None, Some(e.clone())),
        };
        let response = DeliveryResponse {
            owner: notification.owner.clone(),
            topic: notification.topic.clone(),
            token: token.to_string(),
            sandbox,
            id,
            error,
        };
        if sink.send(response).is_err() {
            debug!(bundle_id = %self.bundle_id, "Response sink closed, dropping response");
        }
    }
}

/// Bounded set of senders for one identity.
pub struct DeliveryPool {
    shared: Arc<PoolShared>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryPool {
    /// Spawn `workers` (at least one) tasks on the current runtime.
    pub fn new(
        bundle_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        sandbox: Arc<AtomicBool>,
        workers: usize,
        sink: Option<mpsc::UnboundedSender<DeliveryResponse>>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            bundle_id: bundle_id.into(),
            transport,
            sandbox,
            sink,
            pending: AtomicUsize::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let count = workers.max(1);
        let handles = (0..count)
            .map(|_| tokio::spawn(run_worker(Arc::clone(&shared), Arc::clone(&rx))))
            .collect();

        info!(bundle_id = %shared.bundle_id, workers = count, "Delivery pool started");

        Self {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn bundle_id(&self) -> &str {
        &self.shared.bundle_id
    }

    pub fn sandbox(&self) -> bool {
        self.shared.sandbox.load(Ordering::Acquire)
    }

    /// Switch environments; affects sends that start after this call.
    pub fn set_sandbox(&self, sandbox: bool) {
        self.shared.sandbox.store(sandbox, Ordering::Release);
    }

    /// Jobs queued but not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Deliver `notification` to every token.
    ///
    /// Tokens are tried inline until one succeeds; token errors move on to
    /// the next token, any other error aborts the call. After the first
    /// success the rest are queued and the call returns without waiting.
    pub async fn push(
        &self,
        notification: Arc<Notification>,
        tokens: &[String],
    ) -> Result<PushReport, PoolError> {
        if tokens.is_empty() {
            return Ok(PushReport::default());
        }
        // Holding a sender clone keeps the queue open until the tail is queued.
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PoolError::Closed(self.shared.bundle_id.clone()))?;

        let mut report = PushReport::default();
        let mut remaining = tokens.iter();

        for token in remaining.by_ref() {
            let (sandbox, result) = self.shared.deliver(&notification, token).await;
            self.shared.emit(&notification, token, sandbox, &result);
            match result {
                Ok(id) => {
                    report.delivered = Some((token.clone(), id));
                    break;
                }
                Err(error) if error.is_token() => {
                    debug!(
                        bundle_id = %self.shared.bundle_id,
                        reason = ?error.reason(),
                        "Token rejected, trying next"
                    );
                    report.rejected.push((token.clone(), error));
                }
                Err(error) => {
                    return Err(PoolError::Aborted {
                        token: token.clone(),
                        error,
                        rejected: report.rejected,
                    });
                }
            }
        }

        for token in remaining {
            let depth = self.shared.pending.fetch_add(1, Ordering::Relaxed) + 1;
            if depth % BACKLOG_WARN_THRESHOLD == 0 {
                warn!(
                    bundle_id = %self.shared.bundle_id,
                    pending = depth,
                    "Delivery backlog growing"
                );
            }
            let job = Job {
                notification: Arc::clone(&notification),
                token: token.clone(),
            };
            if queue.send(job).is_err() {
                self.shared.pending.fetch_sub(1, Ordering::Relaxed);
                return Err(PoolError::Closed(self.shared.bundle_id.clone()));
            }
            report.queued.push(token.clone());
        }

        Ok(report)
    }

    /// Stop accepting work. Queued jobs still run. Idempotent.
    pub fn close(&self) {
        let taken = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            info!(
                bundle_id = %self.shared.bundle_id,
                pending = self.pending(),
                "Delivery pool closed"
            );
        }
    }

    /// Close and wait for the workers to drain the queue.
    pub async fn shutdown(&self) {
        self.close();
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(
                    bundle_id = %self.shared.bundle_id,
                    error = %e,
                    "Delivery worker ended abnormally"
                );
            }
        }
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(
    shared: Arc<PoolShared>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        shared.pending.fetch_sub(1, Ordering::Relaxed);
        let (sandbox, result) = shared.deliver(&job.notification, &job.token).await;
        shared.emit(&job.notification, &job.token, sandbox, &result);
    }
    debug!(bundle_id = %shared.bundle_id, "Delivery worker exiting");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests;
