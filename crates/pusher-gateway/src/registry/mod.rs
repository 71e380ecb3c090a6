//! Registry of application identities and the delivery pools serving them.
//!
//! Each bundle ID owns exactly one [`DeliveryPool`]. Topics route to the pool
//! of the identity that last claimed them; an identity without topics is
//! routed under its bundle ID.

pub mod credential;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pusher_core::db::base64_decode;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

use crate::apns::TransportFactory;
use crate::pool::{DeliveryPool, DeliveryResponse};
pub use credential::{
    Credential, CredentialError, CredentialKind, CredentialMaterial, IdentityInfo, Secret,
};
pub use snapshot::{CertificateEntry, CredentialSnapshot, ProviderTokenEntry, SnapshotError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid credential: {0}")]
    InvalidCredential(#[from] CredentialError),
}

/// An identity together with its current environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    #[serde(flatten)]
    pub info: IdentityInfo,
    pub sandbox: bool,
}

struct Entry {
    credential: Credential,
    /// Shared with the live pool.
    sandbox: Arc<AtomicBool>,
    pool: Arc<DeliveryPool>,
}

impl Entry {
    fn registration(&self) -> Registration {
        Registration {
            info: self.credential.info.clone(),
            sandbox: self.sandbox.load(Ordering::Acquire),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Keyed by bundle ID.
    credentials: HashMap<String, Entry>,
    /// Topic (or bundle ID) to pool.
    routes: HashMap<String, Arc<DeliveryPool>>,
}

impl Inner {
    fn unroute(&mut self, pool: &Arc<DeliveryPool>) {
        self.routes.retain(|_, p| !Arc::ptr_eq(p, pool));
    }

    fn lookup(&self, key: &str) -> Option<&Entry> {
        self.credentials.get(key).or_else(|| {
            let pool = self.routes.get(key)?;
            self.credentials.get(pool.bundle_id())
        })
    }
}

/// Owns every registered identity. Shared as `Arc<CertificateRegistry>`.
pub struct CertificateRegistry {
    inner: RwLock<Inner>,
    factory: Arc<dyn TransportFactory>,
    workers: usize,
    sink: Option<mpsc::UnboundedSender<DeliveryResponse>>,
}

impl CertificateRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        workers: usize,
        sink: Option<mpsc::UnboundedSender<DeliveryResponse>>,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            factory,
            workers: workers.max(1),
            sink,
        }
    }

    /// Register an identity, replacing any previous one with the same
    /// bundle ID. Returns the registration and whether one was replaced.
    pub async fn add_credential(
        &self,
        material: CredentialMaterial,
        sandbox: bool,
    ) -> Result<(Registration, bool), RegistryError> {
        let credential = Credential::parse(material)?;
        let transport = self.factory.build(&credential)?;
        let flag = Arc::new(AtomicBool::new(sandbox));
        let bundle_id = credential.bundle_id().to_string();
        let pool = Arc::new(DeliveryPool::new(
            bundle_id.clone(),
            transport,
            Arc::clone(&flag),
            self.workers,
            self.sink.clone(),
        ));
        let routes = credential.routes();
        let entry = Entry {
            credential,
            sandbox: flag,
            pool: Arc::clone(&pool),
        };
        let registration = entry.registration();

        let mut inner = self.inner.write().await;
        let replaced = inner.credentials.remove(&bundle_id);
        if let Some(old) = &replaced {
            inner.unroute(&old.pool);
            old.pool.close();
        }
        for route in routes {
            let previous = inner.routes.insert(route.clone(), Arc::clone(&pool));
            if let Some(previous) = previous {
                warn!(
                    topic = %route,
                    from = %previous.bundle_id(),
                    to = %bundle_id,
                    "Topic moved to another identity"
                );
            }
        }
        inner.credentials.insert(bundle_id.clone(), entry);
        drop(inner);

        info!(
            bundle_id = %bundle_id,
            topics = registration.info.topics.len(),
            sandbox,
            replaced = replaced.is_some(),
            "Credential registered"
        );
        Ok((registration, replaced.is_some()))
    }

    /// Close the identity's pool and forget it and its topics.
    pub async fn remove_credential(&self, bundle_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.credentials.remove(bundle_id) else {
            return false;
        };
        inner.unroute(&entry.pool);
        drop(inner);

        entry.pool.close();
        info!(bundle_id = %bundle_id, "Credential removed");
        true
    }

    /// Switch an identity between sandbox and production in place.
    pub async fn set_sandbox(&self, bundle_id: &str, sandbox: bool) -> bool {
        let inner = self.inner.write().await;
        let Some(entry) = inner.credentials.get(bundle_id) else {
            return false;
        };
        entry.pool.set_sandbox(sandbox);
        info!(bundle_id = %bundle_id, sandbox, "Environment changed");
        true
    }

    /// Pool serving a topic or bundle ID.
    pub async fn resolve_pool(&self, key: &str) -> Option<Arc<DeliveryPool>> {
        let inner = self.inner.read().await;
        inner
            .routes
            .get(key)
            .or_else(|| inner.credentials.get(key).map(|e| &e.pool))
            .cloned()
    }

    /// Identity registered under a bundle ID or serving a topic.
    pub async fn identity(&self, key: &str) -> Option<Registration> {
        self.inner.read().await.lookup(key).map(Entry::registration)
    }

    /// Every identity, sorted by bundle ID.
    pub async fn list_identities(&self) -> Vec<Registration> {
        let inner = self.inner.read().await;
        let mut list: Vec<Registration> =
            inner.credentials.values().map(Entry::registration).collect();
        list.sort_by(|a, b| a.info.bundle_id.cmp(&b.info.bundle_id));
        list
    }

    /// Every routable topic, sorted.
    pub async fn list_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.read().await.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Material for every identity, sorted by bundle ID.
    pub async fn snapshot(&self) -> CredentialSnapshot {
        let inner = self.inner.read().await;
        let mut entries: Vec<&Entry> = inner.credentials.values().collect();
        entries.sort_by(|a, b| a.credential.bundle_id().cmp(b.credential.bundle_id()));

        let mut snapshot = CredentialSnapshot::default();
        for entry in entries {
            let sandbox = entry.sandbox.load(Ordering::Acquire);
            match &entry.credential.secret {
                Secret::Certificate { cert_pem, key_pem } => {
                    snapshot.certificates.push(CertificateEntry {
                        cert: cert_pem.clone(),
                        key: key_pem.clone(),
                        sandbox,
                    });
                }
                Secret::Token(signer) => snapshot.provider_tokens.push(ProviderTokenEntry {
                    signer: signer.to_record(),
                    bundle_id: entry.credential.info.bundle_id.clone(),
                    topics: entry.credential.info.topics.clone(),
                    sandbox,
                }),
            }
        }
        snapshot
    }

    /// Register every identity in `snapshot`. Entries that no longer parse
    /// (an expired certificate, say) are logged and skipped.
    pub async fn restore(&self, snapshot: &CredentialSnapshot) -> usize {
        let mut restored = 0;
        for entry in &snapshot.certificates {
            let material = CredentialMaterial::Certificate {
                cert_pem: entry.cert.clone(),
                key_pem: entry.key.clone(),
            };
            match self.add_credential(material, entry.sandbox).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(error = %e, "Skipping stored certificate"),
            }
        }
        for entry in &snapshot.provider_tokens {
            let private_key = match base64_decode(&entry.signer.private_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(
                        bundle_id = %entry.bundle_id,
                        error = %e,
                        "Skipping stored provider token"
                    );
                    continue;
                }
            };
            let material = CredentialMaterial::ProviderToken {
                team_id: entry.signer.team_id.clone(),
                key_id: entry.signer.key_id.clone(),
                private_key,
                bundle_id: entry.bundle_id.clone(),
                topics: entry.topics.clone(),
            };
            match self.add_credential(material, entry.sandbox).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    warn!(
                        bundle_id = %entry.bundle_id,
                        error = %e,
                        "Skipping stored provider token"
                    );
                }
            }
        }
        info!(restored, "Credentials restored");
        restored
    }

    /// Forget every identity, then wait for each pool to drain.
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<DeliveryPool>> = {
            let mut inner = self.inner.write().await;
            inner.routes.clear();
            inner.credentials.drain().map(|(_, e)| e.pool).collect()
        };
        for pool in &pools {
            pool.shutdown().await;
        }
        info!(pools = pools.len(), "Delivery pools shut down");
    }
}
