//! Shared test helpers: a scripted transport and factory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::apns::{DeliveryError, Notification, Transport, TransportFactory, classify};
use crate::pool::DeliveryResponse;
use crate::registry::credential::{Credential, CredentialError};

/// Token that makes [`MockTransport`] panic mid-send.
pub const PANIC_TOKEN: &str = "panic";

/// Transport answering from a per-token script. Unscripted tokens succeed
/// with `apns-id` `id-<token>`.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<HashMap<String, Result<String, DeliveryError>>>,
    calls: Mutex<Vec<(String, bool)>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every send first sleeps for `delay`.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn respond(&self, token: &str, result: Result<String, DeliveryError>) {
        self.script.lock().unwrap().insert(token.to_string(), result);
    }

    /// Script an APNS error for `token`.
    pub fn fail(&self, token: &str, status: u16, reason: &str) {
        self.respond(token, Err(classify(status, reason, None)));
    }

    /// Tokens sent so far, in order, with the environment used.
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.calls().into_iter().map(|(t, _)| t).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        _notification: &Notification,
        token: &str,
        sandbox: bool,
    ) -> Result<String, DeliveryError> {
        self.calls
            .lock()
            .unwrap()
            .push((token.to_string(), sandbox));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        assert!(token != PANIC_TOKEN, "scripted panic");
        self.script
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .unwrap_or_else(|| Ok(format!("id-{token}")))
    }
}

/// Factory handing out one shared [`MockTransport`] and counting builds.
#[derive(Default)]
pub struct MockFactory {
    pub transport: Arc<MockTransport>,
    built: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bundle IDs a transport was built for, in order.
    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

impl TransportFactory for MockFactory {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn Transport>, CredentialError> {
        self.built
            .lock()
            .unwrap()
            .push(credential.bundle_id().to_string());
        Ok(Arc::clone(&self.transport) as Arc<dyn Transport>)
    }
}

/// Receive `n` responses or fail after a generous timeout.
pub async fn collect_responses(
    rx: &mut mpsc::UnboundedReceiver<DeliveryResponse>,
    n: usize,
) -> Vec<DeliveryResponse> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery response")
            .expect("response channel closed");
        out.push(next);
    }
    out
}
