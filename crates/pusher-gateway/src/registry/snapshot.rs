//! Durable JSON copy of the registered credentials.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::SignerRecord;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("malformed snapshot {path}: {message}")]
    Json { path: String, message: String },
}

/// A certificate identity as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateEntry {
    /// PEM certificate chain.
    pub cert: String,
    /// PEM private key.
    pub key: String,
    #[serde(default)]
    pub sandbox: bool,
}

/// A provider-token identity as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTokenEntry {
    #[serde(flatten)]
    pub signer: SignerRecord,
    pub bundle_id: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub sandbox: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSnapshot {
    #[serde(default)]
    pub certificates: Vec<CertificateEntry>,
    #[serde(default)]
    pub provider_tokens: Vec<ProviderTokenEntry>,
}

impl CredentialSnapshot {
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty() && self.provider_tokens.is_empty()
    }

    /// Read a snapshot; a missing file is an empty snapshot.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No credential snapshot");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(SnapshotError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };
        serde_json::from_str(&content).map_err(|e| SnapshotError::Json {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Write as pretty JSON, replacing the previous file atomically. Each
    /// call stages into its own temporary file in the target directory.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let io_err = |e: std::io::Error| SnapshotError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let json = serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Json {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        debug!(
            path = %path.display(),
            certificates = self.certificates.len(),
            provider_tokens = self.provider_tokens.len(),
            "Credential snapshot saved"
        );
        Ok(())
    }
}
