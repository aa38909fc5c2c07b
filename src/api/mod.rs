pub mod auth;
pub mod error;
mod handlers;
mod terminal_ws;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{delete, get},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use auth::Credentials;
use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub gateway: Gateway,
    pub shutdown: ShutdownCoordinator,
    /// Basic-auth credentials; everything is open when unset.
    pub credentials: Option<Arc<Credentials>>,
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let rest = Router::new()
        .route("/api/terminals", get(list_terminals).post(create_terminal))
        .route("/api/terminals/{id}", delete(stop_terminal))
        .route("/api/decks/{deck_id}/terminals", delete(stop_deck_terminals))
        .route("/api/decks/{deck_id}/status", get(deck_status))
        .route("/api/decks/{deck_id}/previous", get(previous_terminals));

    let rest = match state.credentials.clone() {
        Some(creds) => rest.layer(axum::middleware::from_fn(move |req, next| {
            let c = creds.clone();
            async move { auth::require_basic_auth(c, req, next).await }
        })),
        None => rest,
    };

    // The streaming endpoint checks credentials itself so that failures
    // surface as WebSocket close codes.
    let streaming = Router::new().route("/api/terminals/{id}", get(terminal_ws::terminal_ws));

    let router = Router::new()
        .route("/health", get(health))
        .merge(rest)
        .merge(streaming)
        .fallback(terminal_ws::fallback)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
