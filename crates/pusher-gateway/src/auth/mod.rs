//! Provider-token authentication for APNS.
//!
//! Builds and caches the ES256 bearer tokens token-based identities send in
//! the `authorization` header.

pub mod claims;
pub mod provider_token;

pub use claims::ProviderClaims;
pub use provider_token::{ProviderTokenSigner, SignerError, SignerRecord, bearer_token};
