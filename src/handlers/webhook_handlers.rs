// handlers/webhook_handlers.rs
use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::errors::WebhookError;
use crate::models::provider::ProviderKind;
use crate::state::AppState;

async fn ingest(
    state: &AppState,
    provider: ProviderKind,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Json<Value>, WebhookError> {
    let disposition = state.gateway.ingest(provider, headers, body).await?;

    // Anything past verification is acknowledged so the provider stops redelivering.
    Ok(Json(json!({
        "status": "ok",
        "result": disposition.as_str(),
    })))
}

pub async fn provider_a_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    ingest(&state, ProviderKind::ProviderA, &headers, &body).await
}

pub async fn provider_b_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    ingest(&state, ProviderKind::ProviderB, &headers, &body).await
}
