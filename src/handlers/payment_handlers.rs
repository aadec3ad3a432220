// handlers/payment_handlers.rs
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::models::payment::{
    CommissionRateUpdate, ProcessPayment, RequestPayment, TransactionStatusView,
};
use crate::models::transaction::PaymentStatus;
use crate::state::AppState;

fn accepted_status(status: PaymentStatus) -> StatusCode {
    if status == PaymentStatus::Processing {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    }
}

pub async fn request_payment(
    State(state): State<AppState>,
    Json(request): Json<RequestPayment>,
) -> Result<impl IntoResponse> {
    request.validate()?;
    info!(
        property_id = %request.property_id,
        renter_id = %request.renter_id,
        method = %request.method,
        "Received payment request"
    );

    let tx = state.orchestrator.request_payment(request).await?;

    Ok((
        accepted_status(tx.payment_status),
        Json(json!({
            "success": true,
            "transaction": TransactionStatusView::from(&tx),
        })),
    ))
}

pub async fn get_transaction_status(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse> {
    let details = state.orchestrator.get_transaction_status(&reference).await?;

    Ok(Json(json!({
        "success": true,
        "transaction": details.transaction,
        "related": details.related,
    })))
}

pub async fn process_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ProcessPayment>,
) -> Result<impl IntoResponse> {
    request.validate()?;
    let tx = state
        .orchestrator
        .process_payment(id, &request.payer_handle)
        .await?;

    Ok((
        accepted_status(tx.payment_status),
        Json(json!({
            "success": true,
            "transaction": TransactionStatusView::from(&tx),
        })),
    ))
}

pub async fn reconcile_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let applied = state.orchestrator.reconcile(id).await?;

    Ok(Json(json!({
        "success": true,
        "result": applied.result.as_str(),
        "transaction": TransactionStatusView::from(&applied.transaction),
    })))
}

pub async fn release_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let receipt = state.orchestrator.release_escrow(id).await?;

    Ok(Json(json!({
        "success": true,
        "receipt": receipt,
    })))
}

pub async fn refund_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let receipt = state.orchestrator.refund_escrow(id).await?;

    Ok(Json(json!({
        "success": true,
        "receipt": receipt,
    })))
}

pub async fn update_commission_rate(
    State(state): State<AppState>,
    Json(update): Json<CommissionRateUpdate>,
) -> Result<impl IntoResponse> {
    let rate = state
        .commission
        .set_rate(update.rate)
        .await
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "commission_rate": rate.value(),
    })))
}
