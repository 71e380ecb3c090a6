//! JWT header and claims for APNS provider tokens.

use jsonwebtoken::{Algorithm, Header};
use serde::{Deserialize, Serialize};

/// Claims APNS expects in a provider token: nothing beyond issuer and age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderClaims {
    /// Team ID.
    pub iss: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
}

/// `{"alg":"ES256","kid":<key id>}`, with no `typ` member.
pub fn provider_header(key_id: &str) -> Header {
    let mut header = Header::new(Algorithm::ES256);
    header.typ = None;
    header.kid = Some(key_id.to_string());
    header
}
