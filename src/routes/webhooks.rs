use axum::{routing::post, Router};

use crate::handlers::webhook_handlers;
use crate::state::AppState;

pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/provider-a", post(webhook_handlers::provider_a_callback))
        .route("/provider-b", post(webhook_handlers::provider_b_callback))
}
