//! `/apns` routes: topics, device tokens and pushes.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, AppState};
use crate::coordinator::{PushRequest, PushSummary};

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub token: String,
}

/// Push body. `payload` is sent as JSON; a string payload is sent verbatim.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    #[serde(default)]
    pub users: Vec<String>,
    pub payload: Value,
    /// Unix seconds.
    pub expiration: Option<i64>,
    #[serde(default)]
    pub low_priority: bool,
    pub collapse_id: Option<String>,
    pub id: Option<String>,
}

impl PushBody {
    fn request(&self) -> Result<PushRequest, ApiError> {
        let payload = match &self.payload {
            Value::String(raw) => raw.clone().into_bytes(),
            Value::Null => return Err(ApiError::BadRequest("payload is required".to_string())),
            other => serde_json::to_vec(other)
                .map_err(|e| ApiError::BadRequest(format!("payload: {e}")))?,
        };
        Ok(PushRequest {
            payload,
            id: self.id.clone(),
            expiration: self.expiration,
            low_priority: self.low_priority,
            collapse_id: self.collapse_id.clone(),
        })
    }
}

/// `{"push": {owner: count}, "outcomes": [...]}`
fn push_response(summary: &PushSummary) -> Json<Value> {
    let counts: BTreeMap<String, usize> = summary.per_owner().into_iter().collect();
    Json(json!({ "push": counts, "outcomes": summary.outcomes }))
}

/// `GET /apns`
pub async fn topics(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "topics": state.registry().list_topics().await }))
}

/// `GET /apns/{topic}`
pub async fn identity(
    Path(topic): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let registration = state
        .registry()
        .identity(&topic)
        .await
        .ok_or_else(|| ApiError::not_found(&topic))?;
    Ok(Json(registration).into_response())
}

/// `GET /apns/{topic}/users`
pub async fn users(
    Path(topic): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let users = state.coordinator.owners(&topic).await?;
    Ok(Json(json!({ "users": users })))
}

/// `GET /apns/{topic}/users/{user}`
pub async fn tokens(
    Path((topic, user)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let tokens = state.coordinator.tokens(&topic, &user).await?;
    Ok(Json(json!({ "tokens": tokens })))
}

/// `POST /apns/{topic}/users/{user}`
pub async fn register(
    Path((topic, user)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> Result<StatusCode, ApiError> {
    state
        .coordinator
        .register_token(&topic, &user, &body.token)
        .await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /apns/{topic}/users/{user}`
pub async fn remove_user(
    Path((topic, user)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if state.coordinator.remove_owner(&topic, &user).await? == 0 {
        return Err(ApiError::not_found(&user));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /apns/{topic}/push`
pub async fn push(
    Path(topic): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PushBody>,
) -> Result<Json<Value>, ApiError> {
    let request = body.request()?;
    let summary = state.coordinator.push(&topic, &body.users, &request).await?;
    Ok(push_response(&summary))
}

/// `POST /apns/{topic}/users/{user}/push`
pub async fn push_user(
    Path((topic, user)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<PushBody>,
) -> Result<Json<Value>, ApiError> {
    let request = body.request()?;
    let summary = state
        .coordinator
        .push(&topic, std::slice::from_ref(&user), &request)
        .await?;
    Ok(Json(json!({
        "push": summary.outcomes.len(),
        "outcomes": summary.outcomes,
    })))
}
