//! HTTP surface over the coordinator.

mod apns;
mod certificates;
pub mod error;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tokio::sync::Mutex;
use tracing::error;

use crate::coordinator::DeliveryCoordinator;
use crate::registry::CertificateRegistry;
pub use error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DeliveryCoordinator>,
    /// Where registry changes are persisted; `None` keeps them in memory.
    pub snapshot_path: Option<PathBuf>,
    /// Held from taking a snapshot until it is on disk, so writes land in
    /// the order the snapshots were taken.
    persist_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(coordinator: Arc<DeliveryCoordinator>, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            coordinator,
            snapshot_path,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    fn registry(&self) -> &CertificateRegistry {
        self.coordinator.registry()
    }

    /// Rewrite the credential snapshot. Failures are logged; the change
    /// itself already took effect.
    async fn persist(&self) {
        let Some(path) = self.snapshot_path.clone() else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.registry().snapshot().await;
        match tokio::task::spawn_blocking(move || snapshot.save(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to save credential snapshot"),
            Err(e) => error!(error = %e, "Snapshot writer panicked"),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/certificates",
            get(certificates::list).post(certificates::add),
        )
        .route(
            "/certificates/{id}",
            get(certificates::get).delete(certificates::remove),
        )
        .route("/certificates/{id}/sandbox", put(certificates::set_sandbox))
        .route("/apns", get(apns::topics))
        .route("/apns/{topic}", get(apns::identity))
        .route("/apns/{topic}/push", post(apns::push))
        .route("/apns/{topic}/users", get(apns::users))
        .route(
            "/apns/{topic}/users/{user}",
            get(apns::tokens)
                .post(apns::register)
                .delete(apns::remove_user),
        )
        .route("/apns/{topic}/users/{user}/push", post(apns::push_user))
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests;
