//! `/certificates` routes: identity management.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use pusher_core::db::base64_decode;
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, AppState};
use crate::registry::CredentialMaterial;

/// Registration body: a PEM certificate and key, or a provider-token key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CredentialBody {
    #[serde(rename_all = "camelCase")]
    ProviderToken {
        team_id: String,
        key_id: String,
        /// PEM text, or base64 of the PKCS#8 DER bytes.
        private_key: String,
        bundle_id: String,
        #[serde(default)]
        topics: Vec<String>,
        #[serde(default)]
        sandbox: bool,
    },
    Certificate {
        cert: String,
        key: String,
        #[serde(default)]
        sandbox: bool,
    },
}

impl CredentialBody {
    fn into_material(self) -> Result<(CredentialMaterial, bool), ApiError> {
        match self {
            Self::Certificate { cert, key, sandbox } => Ok((
                CredentialMaterial::Certificate {
                    cert_pem: cert,
                    key_pem: key,
                },
                sandbox,
            )),
            Self::ProviderToken {
                team_id,
                key_id,
                private_key,
                bundle_id,
                topics,
                sandbox,
            } => {
                let private_key = if private_key.trim_start().starts_with("-----BEGIN") {
                    private_key.into_bytes()
                } else {
                    base64_decode(private_key.trim())
                        .map_err(|e| ApiError::BadRequest(format!("privateKey: {e}")))?
                };
                Ok((
                    CredentialMaterial::ProviderToken {
                        team_id,
                        key_id,
                        private_key,
                        bundle_id,
                        topics,
                    },
                    sandbox,
                ))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SandboxBody {
    pub sandbox: bool,
}

/// `GET /certificates`
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "certificates": state.registry().list_identities().await }))
}

/// `POST /certificates`: 201 for a new identity, 200 when replacing one.
pub async fn add(
    State(state): State<AppState>,
    Json(body): Json<CredentialBody>,
) -> Result<Response, ApiError> {
    let (material, sandbox) = body.into_material()?;
    let (registration, replaced) = state.registry().add_credential(material, sandbox).await?;
    state.persist().await;

    if replaced {
        return Ok(Json(registration).into_response());
    }
    let location = format!("/certificates/{}", registration.info.bundle_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(registration),
    )
        .into_response())
}

/// `GET /certificates/{id}`
pub async fn get(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let registration = state
        .registry()
        .identity(&id)
        .await
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(registration).into_response())
}

/// `DELETE /certificates/{id}`
pub async fn remove(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if !state.registry().remove_credential(&id).await {
        return Err(ApiError::not_found(&id));
    }
    state.persist().await;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /certificates/{id}/sandbox`
pub async fn set_sandbox(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<SandboxBody>,
) -> Result<Response, ApiError> {
    if !state.registry().set_sandbox(&id, body.sandbox).await {
        return Err(ApiError::not_found(&id));
    }
    state.persist().await;
    get(Path(id), State(state)).await
}
