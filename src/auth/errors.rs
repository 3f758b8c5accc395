//! Authentication and authorization error types.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::jwt::JwtError;

/// CSRF double-submit failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfError {
    /// Session token carries no csrf claim
    MissingJwt,
    /// Request has no csrf header
    MissingHeader,
    /// Header does not unsign or does not match the claim
    Mismatch,
}

impl CsrfError {
    pub fn message(&self) -> &'static str {
        match self {
            CsrfError::MissingJwt => "CSRF token missing from session",
            CsrfError::MissingHeader => "CSRF header missing",
            CsrfError::Mismatch => "CSRF token mismatch",
        }
    }
}

impl std::fmt::Display for CsrfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for CsrfError {}

/// Errors produced by the guard chain. Never reach business logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token missing, expired, invalid or badly signed
    Unauthorized,
    /// Double-submit check failed
    Csrf(CsrfError),
    /// Role, permission or impersonation violation
    Forbidden,
    /// Route declares no requirement
    MisconfiguredRoute,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::Csrf(_) | AuthError::Forbidden | AuthError::MisconfiguredRoute => {
                StatusCode::FORBIDDEN
            }
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthError::Unauthorized => "Unauthorized",
            AuthError::Csrf(e) => e.message(),
            // Same body as Forbidden so route metadata does not leak
            AuthError::Forbidden | AuthError::MisconfiguredRoute => "Forbidden",
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(_: JwtError) -> Self {
        AuthError::Unauthorized
    }
}

impl From<CsrfError> for AuthError {
    fn from(e: CsrfError) -> Self {
        AuthError::Csrf(e)
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MisconfiguredRoute => f.write_str("Route declares no requirement"),
            other => f.write_str(other.message()),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
        }

        (
            self.status_code(),
            Json(ErrorResponse {
                error: self.message(),
            }),
        )
            .into_response()
    }
}
