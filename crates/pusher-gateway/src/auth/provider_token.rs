//! ES256 provider-token issuance with a 55-minute cache.

use std::sync::{PoisonError, RwLock};

use jsonwebtoken::EncodingKey;
use pusher_core::db::{base64_decode, base64_encode, unix_timestamp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::claims::{ProviderClaims, provider_header};

/// How long a signed token is reused before a fresh one is minted.
pub const TOKEN_LIFETIME_SECS: i64 = 55 * 60;

const ID_LEN: usize = 10;

/// Provider-token errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    #[error("bad provider token team ID")]
    BadTeamId,

    #[error("bad provider token key id")]
    BadKeyId,

    #[error("bad provider token private key: {0}")]
    BadPrivateKey(String),

    #[error("provider token not set")]
    MissingKey,

    #[error("signing failed: {0}")]
    Signing(String),
}

struct CachedToken {
    bearer: String,
    created: i64,
}

impl CachedToken {
    const fn is_fresh(&self, now: i64) -> bool {
        now - self.created < TOKEN_LIFETIME_SECS
    }
}

/// Signs bearer tokens for one (team, key) pair.
pub struct ProviderTokenSigner {
    team_id: String,
    key_id: String,
    /// PKCS#8 DER, kept for persistence.
    key_der: Vec<u8>,
    encoding_key: EncodingKey,
    cache: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for ProviderTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokenSigner")
            .field("team_id", &self.team_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// JSON form: `{"teamId","keyId","privateKey"}`, the key as base64 PKCS#8 DER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerRecord {
    pub team_id: String,
    pub key_id: String,
    pub private_key: String,
}

impl ProviderTokenSigner {
    /// Validate the identifiers and key, then prove the key can sign.
    ///
    /// `private_key` is a PKCS#8 P-256 key, PEM or DER.
    pub fn new(team_id: &str, key_id: &str, private_key: &[u8]) -> Result<Self, SignerError> {
        if !is_apple_id(team_id) {
            return Err(SignerError::BadTeamId);
        }
        if !is_apple_id(key_id) {
            return Err(SignerError::BadKeyId);
        }
        let key_der = pkcs8_der(private_key)?;

        let signer = Self {
            team_id: team_id.to_string(),
            key_id: key_id.to_string(),
            encoding_key: EncodingKey::from_ec_der(&key_der),
            key_der,
            cache: RwLock::new(None),
        };
        signer
            .sign(0)
            .map_err(|e| SignerError::BadPrivateKey(e.to_string()))?;
        Ok(signer)
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Current bearer string, `bearer <jwt>`.
    pub fn issue_token(&self) -> Result<String, SignerError> {
        self.issue_token_at(unix_timestamp())
    }

    /// [`Self::issue_token`] with an explicit clock.
    pub fn issue_token_at(&self, now: i64) -> Result<String, SignerError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh(now)) {
                return Ok(cached.bearer.clone());
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh(now)) {
            return Ok(cached.bearer.clone());
        }
        let bearer = format!("bearer {}", self.sign(now)?);
        debug!(key_id = %self.key_id, iat = now, "Provider token signed");
        *cache = Some(CachedToken {
            bearer: bearer.clone(),
            created: now,
        });
        Ok(bearer)
    }

    fn sign(&self, iat: i64) -> Result<String, SignerError> {
        let claims = ProviderClaims {
            iss: self.team_id.clone(),
            iat,
        };
        jsonwebtoken::encode(&provider_header(&self.key_id), &claims, &self.encoding_key)
            .map_err(|e| SignerError::Signing(e.to_string()))
    }

    pub fn to_record(&self) -> SignerRecord {
        SignerRecord {
            team_id: self.team_id.clone(),
            key_id: self.key_id.clone(),
            private_key: base64_encode(&self.key_der),
        }
    }

    pub fn from_record(record: &SignerRecord) -> Result<Self, SignerError> {
        let der = base64_decode(&record.private_key)
            .map_err(|e| SignerError::BadPrivateKey(e.to_string()))?;
        Self::new(&record.team_id, &record.key_id, &der)
    }
}

/// Bearer string for an optional signer; `None` is an unconfigured identity.
pub fn bearer_token(signer: Option<&ProviderTokenSigner>) -> Result<String, SignerError> {
    signer.ok_or(SignerError::MissingKey)?.issue_token()
}

fn is_apple_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Accept a PKCS#8 key as PEM (`PRIVATE KEY`) or raw DER.
fn pkcs8_der(data: &[u8]) -> Result<Vec<u8>, SignerError> {
    let trimmed = data.trim_ascii_start();
    if !trimmed.starts_with(b"-----BEGIN") {
        return Ok(data.to_vec());
    }
    let (_, pem) = x509_parser::pem::parse_x509_pem(trimmed)
        .map_err(|e| SignerError::BadPrivateKey(format!("invalid PEM: {e}")))?;
    if pem.label != "PRIVATE KEY" {
        return Err(SignerError::BadPrivateKey(format!(
            "expected a PKCS#8 PRIVATE KEY block, found {}",
            pem.label
        )));
    }
    Ok(pem.contents)
}
