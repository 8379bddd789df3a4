// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport: the five routes from SPEC_FULL.md §6, wired onto a
//! shared `Arc<AppState>`.

pub mod auth;
pub mod events;
pub mod http;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum `Router` for the broker's HTTP surface.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", get(events::events))
        .route("/token", get(http::token_get).post(http::token_post))
        .route("/send", get(http::send_get).post(http::send_post))
        .route("/kick", get(http::kick_get).post(http::kick_post))
        .route("/info", get(http::info_get).post(http::info_post))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
