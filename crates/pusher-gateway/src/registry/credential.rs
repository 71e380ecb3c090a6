//! Application identities: client certificates and provider-token keys.
//!
//! Certificates name their bundle ID in the subject UID and list their topics
//! in Apple's topic extension. Token identities are told both explicitly.

use std::sync::Arc;

use pusher_core::db::unix_timestamp;
use serde::Serialize;
use x509_parser::der_parser::parse_der;
use x509_parser::pem::Pem;
use x509_parser::prelude::X509Certificate;

use crate::auth::{ProviderTokenSigner, SignerError};

/// Subject attribute holding the bundle ID (`UID`).
const OID_USER_ID: &str = "0.9.2342.19200300.100.1.1";
/// Apple push topics extension.
const OID_TOPICS: &str = "1.2.840.113635.100.6.3.6";
const OID_DEVELOPMENT: &str = "1.2.840.113635.100.6.3.1";
const OID_PRODUCTION: &str = "1.2.840.113635.100.6.3.2";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("invalid private key: {0}")]
    PrivateKey(String),

    #[error("certificate expired or not yet valid")]
    Expired,

    #[error("credential carries no bundle ID")]
    MissingBundleId,

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Raw material supplied when registering an identity.
#[derive(Debug, Clone)]
pub enum CredentialMaterial {
    /// PEM certificate chain (leaf first) and its PEM private key.
    Certificate { cert_pem: String, key_pem: String },
    /// Provider-token key and the topics it may push to.
    ProviderToken {
        team_id: String,
        key_id: String,
        /// PKCS#8 P-256 key, PEM or DER.
        private_key: Vec<u8>,
        bundle_id: String,
        topics: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    Certificate,
    ProviderToken,
}

/// Public description of a registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityInfo {
    pub bundle_id: String,
    pub topics: Vec<String>,
    pub kind: CredentialKind,
    /// Certificate expiry, unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    /// Environments the certificate is issued for. Token keys work in both.
    pub development: bool,
    pub production: bool,
}

/// What a transport needs to authenticate.
#[derive(Debug, Clone)]
pub enum Secret {
    Certificate {
        cert_pem: String,
        key_pem: String,
    },
    Token(Arc<ProviderTokenSigner>),
}

/// A validated identity ready to back a delivery pool.
#[derive(Debug, Clone)]
pub struct Credential {
    pub info: IdentityInfo,
    pub secret: Secret,
}

impl Credential {
    pub fn parse(material: CredentialMaterial) -> Result<Self, CredentialError> {
        match material {
            CredentialMaterial::Certificate { cert_pem, key_pem } => {
                Self::from_certificate(cert_pem, key_pem)
            }
            CredentialMaterial::ProviderToken {
                team_id,
                key_id,
                private_key,
                bundle_id,
                topics,
            } => {
                if bundle_id.is_empty() {
                    return Err(CredentialError::MissingBundleId);
                }
                let signer = ProviderTokenSigner::new(&team_id, &key_id, &private_key)?;
                Ok(Self {
                    info: IdentityInfo {
                        bundle_id,
                        topics: normalize_topics(topics),
                        kind: CredentialKind::ProviderToken,
                        expires: None,
                        development: true,
                        production: true,
                    },
                    secret: Secret::Token(Arc::new(signer)),
                })
            }
        }
    }

    fn from_certificate(cert_pem: String, key_pem: String) -> Result<Self, CredentialError> {
        let pem = Pem::iter_from_buffer(cert_pem.as_bytes())
            .filter_map(Result::ok)
            .find(|p| p.label == "CERTIFICATE")
            .ok_or_else(|| CredentialError::Certificate("no CERTIFICATE block".to_string()))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| CredentialError::Certificate(e.to_string()))?;

        let now = unix_timestamp();
        let validity = cert.validity();
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            return Err(CredentialError::Expired);
        }

        check_private_key(&key_pem)?;

        let bundle_id = bundle_id(&cert).ok_or(CredentialError::MissingBundleId)?;
        let topics = topics(&cert)?;
        let development = has_extension(&cert, OID_DEVELOPMENT);
        let production = has_extension(&cert, OID_PRODUCTION);

        Ok(Self {
            info: IdentityInfo {
                bundle_id,
                topics,
                kind: CredentialKind::Certificate,
                expires: Some(validity.not_after.timestamp()),
                development,
                production,
            },
            secret: Secret::Certificate { cert_pem, key_pem },
        })
    }

    pub fn bundle_id(&self) -> &str {
        &self.info.bundle_id
    }

    /// Keys this identity is routed under: its topics, or the bundle ID
    /// when it declares none.
    pub fn routes(&self) -> Vec<String> {
        if self.info.topics.is_empty() {
            vec![self.info.bundle_id.clone()]
        } else {
            self.info.topics.clone()
        }
    }
}

fn normalize_topics(topics: Vec<String>) -> Vec<String> {
    let mut topics: Vec<String> = topics.into_iter().filter(|t| !t.is_empty()).collect();
    topics.sort();
    topics.dedup();
    topics
}

fn check_private_key(key_pem: &str) -> Result<(), CredentialError> {
    let pem = Pem::iter_from_buffer(key_pem.as_bytes())
        .filter_map(Result::ok)
        .find(|p| p.label.ends_with("PRIVATE KEY"))
        .ok_or_else(|| CredentialError::PrivateKey("no PRIVATE KEY block".to_string()))?;
    if pem.contents.is_empty() {
        return Err(CredentialError::PrivateKey("empty key".to_string()));
    }
    Ok(())
}

/// Bundle ID from the subject UID, else from an
/// `Apple Push Services: <bundle>` common name.
fn bundle_id(cert: &X509Certificate<'_>) -> Option<String> {
    let subject = cert.subject();
    let uid = subject
        .iter_attributes()
        .find(|a| a.attr_type().to_id_string() == OID_USER_ID)
        .and_then(|a| a.as_str().ok())
        .map(str::to_string);
    uid.or_else(|| {
        subject
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .find_map(|cn| cn.split_once(": ").map(|(_, id)| id.trim().to_string()))
    })
    .filter(|id| !id.is_empty())
}

/// Top-level strings of the topics extension. Nested sequences describe
/// each topic's kind and are skipped.
fn topics(cert: &X509Certificate<'_>) -> Result<Vec<String>, CredentialError> {
    let Some(ext) = cert
        .extensions()
        .iter()
        .find(|e| e.oid.to_id_string() == OID_TOPICS)
    else {
        return Ok(Vec::new());
    };
    let (_, obj) = parse_der(ext.value)
        .map_err(|e| CredentialError::Certificate(format!("topics extension: {e}")))?;
    let items = obj
        .as_sequence()
        .map_err(|e| CredentialError::Certificate(format!("topics extension: {e}")))?;
    Ok(normalize_topics(
        items
            .iter()
            .filter_map(|item| item.as_str().ok())
            .map(str::to_string)
            .collect(),
    ))
}

fn has_extension(cert: &X509Certificate<'_>, oid: &str) -> bool {
    cert.extensions().iter().any(|e| e.oid.to_id_string() == oid)
}
