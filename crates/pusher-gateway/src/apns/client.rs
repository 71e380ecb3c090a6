//! HTTP/2 transport to the APNS provider API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pusher_core::GatewayConfig;
use pusher_core::db::unix_timestamp;
use tracing::debug;

use super::error::{self, DeliveryError};
use super::notification::Notification;
use crate::auth::ProviderTokenSigner;
use crate::registry::credential::{Credential, CredentialError, Secret};

/// Sends one notification to one device token.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the `apns-id` APNS assigned (or echoed) on success.
    async fn send(
        &self,
        notification: &Notification,
        token: &str,
        sandbox: bool,
    ) -> Result<String, DeliveryError>;
}

/// Builds a transport for a freshly parsed credential.
pub trait TransportFactory: Send + Sync {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn Transport>, CredentialError>;
}

/// Provider base URLs per environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub production: String,
    pub sandbox: String,
}

impl Endpoints {
    pub fn select(&self, sandbox: bool) -> &str {
        if sandbox {
            &self.sandbox
        } else {
            &self.production
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            production: pusher_core::config::PRODUCTION_URL.to_string(),
            sandbox: pusher_core::config::SANDBOX_URL.to_string(),
        }
    }
}

/// Settings shared by every client the factory builds.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub endpoints: Endpoints,
    pub timeout: Duration,
    pub http2_prior_knowledge: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            timeout: Duration::from_secs(15),
            http2_prior_knowledge: false,
        }
    }
}

impl From<&GatewayConfig> for ClientSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            endpoints: Endpoints {
                production: config.production_url.clone(),
                sandbox: config.sandbox_url.clone(),
            },
            timeout: config.request_timeout(),
            http2_prior_knowledge: config.http2_prior_knowledge,
        }
    }
}

/// reqwest client bound to one identity.
pub struct ApnsClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    signer: Option<Arc<ProviderTokenSigner>>,
}

impl ApnsClient {
    pub fn new(
        credential: &Credential,
        settings: &ClientSettings,
    ) -> Result<Self, CredentialError> {
        let mut builder = reqwest::Client::builder().timeout(settings.timeout);
        if settings.http2_prior_knowledge {
            builder = builder.http2_prior_knowledge();
        }

        let signer = match &credential.secret {
            Secret::Certificate { cert_pem, key_pem } => {
                let pem = format!("{cert_pem}\n{key_pem}");
                let identity = reqwest::Identity::from_pem(pem.as_bytes())
                    .map_err(|e| CredentialError::Certificate(e.to_string()))?;
                builder = builder.identity(identity);
                None
            }
            Secret::Token(signer) => Some(Arc::clone(signer)),
        };

        let http = builder
            .build()
            .map_err(|e| CredentialError::Certificate(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoints: settings.endpoints.clone(),
            signer,
        })
    }
}

#[async_trait]
impl Transport for ApnsClient {
    async fn send(
        &self,
        notification: &Notification,
        token: &str,
        sandbox: bool,
    ) -> Result<String, DeliveryError> {
        let url = format!(
            "{}{}",
            self.endpoints.select(sandbox).trim_end_matches('/'),
            Notification::path(token)
        );

        let mut request = self.http.post(url).body(notification.payload.clone());
        for (name, value) in notification.apns_headers(unix_timestamp()) {
            request = request.header(name, value);
        }
        if let Some(signer) = &self.signer {
            let bearer = signer
                .issue_token()
                .map_err(|e| DeliveryError::Credential(e.to_string()))?;
            request = request.header("authorization", bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| error::from_transport(&e))?;

        let status = response.status().as_u16();
        let id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if status == 200 {
            debug!(topic = %notification.topic, apns_id = %id, "APNS accepted notification");
            return Ok(id);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| error::from_transport(&e))?;
        Err(error::from_response(status, &body))
    }
}

/// Builds [`ApnsClient`]s.
#[derive(Debug, Clone, Default)]
pub struct ApnsTransportFactory {
    settings: ClientSettings,
}

impl ApnsTransportFactory {
    pub const fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }
}

impl TransportFactory for ApnsTransportFactory {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn Transport>, CredentialError> {
        Ok(Arc::new(ApnsClient::new(credential, &self.settings)?))
    }
}
