//! Entry point for callers: topic resolution, recipient lookup, delivery
//! and the purge of dead tokens.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::apns::{DeliveryError, Notification};
use crate::pool::{DeliveryPool, DeliveryResponse, PoolError, PushReport};
use crate::registry::CertificateRegistry;
use crate::storage::{DatabaseError, TokenDatabase};

pub const MIN_TOKEN_LEN: usize = 64;
pub const MAX_TOKEN_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("invalid device token: {0}")]
    InvalidToken(String),

    #[error("owner must not be empty")]
    InvalidOwner,

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("delivery pool for {0} is closed")]
    Closed(String),

    /// A non-token error stopped the push; `summary` holds what happened
    /// up to that point.
    #[error("push failed: {error}")]
    PushFailed {
        error: DeliveryError,
        summary: PushSummary,
    },
}

/// Notification contents, independent of recipients.
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    /// Raw JSON body sent to APNS.
    pub payload: Vec<u8>,
    pub id: Option<String>,
    pub expiration: Option<i64>,
    pub low_priority: bool,
    pub collapse_id: Option<String>,
}

impl PushRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    fn notification(&self, topic: &str, owner: &str) -> Notification {
        let mut notification = Notification::new(topic, self.payload.clone())
            .with_owner(owner)
            .with_low_priority(self.low_priority);
        if let Some(id) = &self.id {
            notification = notification.with_id(id.clone());
        }
        if let Some(expiration) = self.expiration {
            notification = notification.with_expiration(expiration);
        }
        if let Some(collapse_id) = &self.collapse_id {
            notification = notification.with_collapse_id(collapse_id.clone());
        }
        notification
    }
}

/// What happened to one token during a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TokenOutcome {
    /// Accepted inline; `id` is the `apns-id`.
    Delivered { id: String },
    /// APNS reported the token dead; it will be purged.
    Rejected { reason: String },
    /// Handed to the workers; the result arrives through the response drain.
    Queued,
    /// The send that aborted the push.
    Failed { reason: String },
    /// Never attempted because the push aborted first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenReport {
    pub owner: String,
    pub token: String,
    #[serde(flatten)]
    pub outcome: TokenOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub topic: String,
    pub sandbox: bool,
    pub outcomes: Vec<TokenReport>,
}

impl PushSummary {
    /// Number of tokens attempted or queued per owner, in push order.
    pub fn per_owner(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for report in &self.outcomes {
            if report.outcome == TokenOutcome::Skipped {
                continue;
            }
            match counts.last_mut() {
                Some((owner, n)) if *owner == report.owner => *n += 1,
                _ => counts.push((report.owner.clone(), 1)),
            }
        }
        counts
    }

    fn record_report(&mut self, owner: &str, report: PushReport) {
        for (token, error) in report.rejected {
            self.push_outcome(owner, token, TokenOutcome::Rejected {
                reason: error.to_string(),
            });
        }
        if let Some((token, id)) = report.delivered {
            self.push_outcome(owner, token, TokenOutcome::Delivered { id });
        }
        for token in report.queued {
            self.push_outcome(owner, token, TokenOutcome::Queued);
        }
    }

    fn push_outcome(&mut self, owner: &str, token: String, outcome: TokenOutcome) {
        self.outcomes.push(TokenReport {
            owner: owner.to_string(),
            token,
            outcome,
        });
    }
}

/// Whether `token` looks like an APNS device token: hex, 64 to 200 chars.
pub fn validate_token(token: &str) -> Result<(), CoordinatorError> {
    let len = token.len();
    if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&len) {
        return Err(CoordinatorError::InvalidToken(format!(
            "length {len} outside {MIN_TOKEN_LEN}..={MAX_TOKEN_LEN}"
        )));
    }
    if !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoordinatorError::InvalidToken(
            "not a hex string".to_string(),
        ));
    }
    Ok(())
}

pub struct DeliveryCoordinator {
    registry: Arc<CertificateRegistry>,
    store: TokenDatabase,
}

impl DeliveryCoordinator {
    pub const fn new(registry: Arc<CertificateRegistry>, store: TokenDatabase) -> Self {
        Self { registry, store }
    }

    pub const fn registry(&self) -> &Arc<CertificateRegistry> {
        &self.registry
    }

    pub const fn store(&self) -> &TokenDatabase {
        &self.store
    }

    async fn pool(&self, topic: &str) -> Result<Arc<DeliveryPool>, CoordinatorError> {
        self.registry
            .resolve_pool(topic)
            .await
            .ok_or_else(|| CoordinatorError::UnknownTopic(topic.to_string()))
    }

    /// Save a device token under the topic's current environment.
    #[instrument(skip(self, token), fields(token_len = token.len()))]
    pub async fn register_token(
        &self,
        topic: &str,
        owner: &str,
        token: &str,
    ) -> Result<(), CoordinatorError> {
        let pool = self.pool(topic).await?;
        if owner.is_empty() {
            return Err(CoordinatorError::InvalidOwner);
        }
        validate_token(token)?;
        self.store.save(owner, topic, token, pool.sandbox()).await?;
        debug!(sandbox = pool.sandbox(), "Token registered");
        Ok(())
    }

    /// Owners with at least one token for the topic.
    pub async fn owners(&self, topic: &str) -> Result<Vec<String>, CoordinatorError> {
        let pool = self.pool(topic).await?;
        Ok(self.store.owners(topic, pool.sandbox()).await?)
    }

    /// Tokens an owner registered for the topic.
    pub async fn tokens(&self, topic: &str, owner: &str) -> Result<Vec<String>, CoordinatorError> {
        let pool = self.pool(topic).await?;
        Ok(self
            .store
            .query(topic, pool.sandbox(), &[owner.to_string()])
            .await?)
    }

    /// Drop every token an owner registered for the topic.
    #[instrument(skip(self))]
    pub async fn remove_owner(&self, topic: &str, owner: &str) -> Result<u64, CoordinatorError> {
        let pool = self.pool(topic).await?;
        let removed = self.store.delete_owner(topic, pool.sandbox(), owner).await?;
        info!(removed, "Owner tokens removed");
        Ok(removed)
    }

    /// Push to every token of `owners`, or of every owner when empty.
    #[instrument(skip(self, owners, request), fields(owners = owners.len()))]
    pub async fn push(
        &self,
        topic: &str,
        owners: &[String],
        request: &PushRequest,
    ) -> Result<PushSummary, CoordinatorError> {
        let mut pool = self.pool(topic).await?;
        let sandbox = pool.sandbox();
        let owners = if owners.is_empty() {
            self.store.owners(topic, sandbox).await?
        } else {
            owners.to_vec()
        };

        let mut summary = PushSummary {
            topic: topic.to_string(),
            sandbox,
            outcomes: Vec::new(),
        };

        for owner in &owners {
            let tokens = self
                .store
                .query(topic, sandbox, std::slice::from_ref(owner))
                .await?;
            if tokens.is_empty() {
                debug!(owner = %owner, "Owner has no tokens");
                continue;
            }
            let notification = Arc::new(request.notification(topic, owner));

            let mut result = pool.push(Arc::clone(&notification), &tokens).await;
            if matches!(result, Err(PoolError::Closed(_))) {
                // The identity was replaced mid-push; follow it once.
                pool = self.pool(topic).await?;
                result = pool.push(notification, &tokens).await;
            }

            match result {
                Ok(report) => summary.record_report(owner, report),
                Err(PoolError::Closed(bundle_id)) => {
                    return Err(CoordinatorError::Closed(bundle_id));
                }
                Err(PoolError::Aborted {
                    token,
                    error,
                    rejected,
                }) => {
                    summary.record_report(owner, PushReport {
                        rejected,
                        ..PushReport::default()
                    });
                    summary.push_outcome(owner, token.clone(), TokenOutcome::Failed {
                        reason: error.to_string(),
                    });
                    for skipped in tokens.iter().skip_while(|t| **t != token).skip(1) {
                        summary.push_outcome(owner, skipped.clone(), TokenOutcome::Skipped);
                    }
                    error!(
                        owner = %owner,
                        token = %token,
                        kind = error.kind().as_str(),
                        error = %error,
                        "Push aborted"
                    );
                    return Err(CoordinatorError::PushFailed { error, summary });
                }
            }
        }

        info!(tokens = summary.outcomes.len(), "Push dispatched");
        Ok(summary)
    }

    /// Consume every delivery response: log it and purge dead tokens.
    ///
    /// The task holds only the store and ends once every sender of `rx`
    /// is gone.
    pub fn spawn_response_drain(
        &self,
        rx: mpsc::UnboundedReceiver<DeliveryResponse>,
    ) -> JoinHandle<()> {
        tokio::spawn(drain(self.store.clone(), rx))
    }
}

async fn drain(store: TokenDatabase, mut rx: mpsc::UnboundedReceiver<DeliveryResponse>) {
    while let Some(response) = rx.recv().await {
        handle_response(&store, &response).await;
    }
    debug!("Response drain finished");
}

async fn handle_response(store: &TokenDatabase, response: &DeliveryResponse) {
    let Some(error) = &response.error else {
        debug!(
            status = response.status(),
            topic = %response.topic,
            owner = %response.owner,
            token = %response.token,
            id = response.id.as_deref().unwrap_or_default(),
            "Delivered"
        );
        return;
    };
    warn!(
        status = response.status(),
        topic = %response.topic,
        owner = %response.owner,
        token = %response.token,
        reason = %error,
        "Delivery failed"
    );
    if !error.is_token() {
        return;
    }
    let purged = store
        .delete(
            &response.topic,
            &response.token,
            error.invalid_since(),
            response.sandbox,
        )
        .await;
    match purged {
        Ok(true) => info!(topic = %response.topic, token = %response.token, "Token purged"),
        Ok(false) => {
            debug!(
                topic = %response.topic,
                token = %response.token,
                "Token newer than invalidation, kept"
            );
        }
        Err(e) => {
            error!(
                topic = %response.topic,
                token = %response.token,
                error = %e,
                "Token purge failed"
            );
        }
    }
}
