use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Configured Basic-auth username and password.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Decode `Authorization: Basic <base64(user:password)>`.
fn extract_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Check request headers against the configured credentials.
///
/// Missing or undecodable credentials are `AuthRequired`; a well-formed
/// header with the wrong user or password is `AuthInvalid`.
pub fn verify_basic(headers: &HeaderMap, expected: &Credentials) -> Result<(), ApiError> {
    let (user, password) = extract_basic(headers).ok_or(ApiError::AuthRequired)?;
    // Evaluate both halves so timing does not reveal which one failed.
    let user_ok = user.as_bytes().ct_eq(expected.user.as_bytes());
    let password_ok = password.as_bytes().ct_eq(expected.password.as_bytes());
    if bool::from(user_ok & password_ok) {
        Ok(())
    } else {
        Err(ApiError::AuthInvalid)
    }
}

/// Auth middleware for the REST routes.
pub async fn require_basic_auth(
    expected: Arc<Credentials>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    verify_basic(req.headers(), &expected)?;
    Ok(next.run(req).await)
}
