// SPDX-License-Identifier: MIT
//! HTTP surface: `/api/chat`, `/api/pubkey`, `/health`, `/metrics`.

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::RouterContext;

pub fn build_router(ctx: Arc<RouterContext>) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/pubkey", get(handlers::pubkey))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
