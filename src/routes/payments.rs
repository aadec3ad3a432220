use axum::{
    routing::{get, post, put},
    Router,
};

use crate::handlers::payment_handlers;
use crate::state::AppState;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(payment_handlers::request_payment))
        .route("/:id", get(payment_handlers::get_transaction_status))
        .route("/:id/process", post(payment_handlers::process_payment))
        .route("/:id/reconcile", post(payment_handlers::reconcile_payment))
        .route("/:id/release", post(payment_handlers::release_escrow))
        .route("/:id/refund", post(payment_handlers::refund_escrow))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route(
        "/commission-rate",
        put(payment_handlers::update_commission_rate),
    )
}
