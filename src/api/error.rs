use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::session::RegistryError;

/// Realm advertised in `WWW-Authenticate` challenges.
pub const AUTH_REALM: &str = "Basic realm=\"deckterm\"";

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No credentials provided.
    AuthRequired,
    /// 401 - Credentials provided but wrong.
    AuthInvalid,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - Generic not-found.
    NotFound,
    /// 404 - No deck with this id.
    DeckNotFound(String),
    /// 404 - No terminal with this id.
    TerminalNotFound(String),
    /// 503 - Session capacity reached or server draining.
    AtCapacity,
    /// 500 - The shell could not be started.
    SpawnFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound | ApiError::DeckNotFound(_) | ApiError::TerminalNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SpawnFailed(_) | ApiError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotFound => "not_found",
            ApiError::DeckNotFound(_) => "deck_not_found",
            ApiError::TerminalNotFound(_) => "terminal_not_found",
            ApiError::AtCapacity => "at_capacity",
            ApiError::SpawnFailed(_) => "spawn_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => "Authentication required.".to_string(),
            ApiError::AuthInvalid => "Invalid credentials.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::DeckNotFound(id) => format!("Deck not found: {}.", id),
            ApiError::TerminalNotFound(id) => format!("Terminal not found: {}.", id),
            ApiError::AtCapacity => "Too many terminals. Try again later.".to_string(),
            ApiError::SpawnFailed(detail) => format!("Failed to start terminal: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DeckNotFound(id) => ApiError::DeckNotFound(id),
            RegistryError::NotFound(id) => ApiError::TerminalNotFound(id),
            RegistryError::MaxSessionsReached => ApiError::AtCapacity,
            RegistryError::Spawn(e) => ApiError::SpawnFailed(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        let challenge = matches!(self, ApiError::AuthRequired | ApiError::AuthInvalid);
        let mut response = (self.status_code(), Json(body)).into_response();
        if challenge {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(AUTH_REALM),
            );
        }
        response
    }
}
