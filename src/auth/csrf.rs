//! Double-submit CSRF validation.
//!
//! The same random value lives in three places: signed inside the csrf
//! cookie, as the `csrf` claim of the access/refresh token, and echoed by the
//! client in the csrf header on state-changing requests. The header carries
//! the signed cookie value; it must unsign with the csrf secret and match the
//! claim.

use axum::http::{HeaderMap, Method};

use super::cookie::{CookieKind, TransportConfig};
use super::errors::CsrfError;
use super::signer::CookieSigner;
use crate::jwt::TokenKind;

/// Methods that never change state and are exempt from CSRF checks.
pub fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Validate the double-submit pair for a request authenticated with a token
/// of `kind`. `claim_csrf` is the csrf claim of that token.
pub fn validate_csrf(
    method: &Method,
    headers: &HeaderMap,
    claim_csrf: Option<&str>,
    kind: TokenKind,
    transport: &TransportConfig,
    signer: &CookieSigner,
) -> Result<(), CsrfError> {
    if is_safe_method(method) {
        return Ok(());
    }

    // No session cookie: bearer clients are not exposed to CSRF
    if transport.read(headers, CookieKind::from(kind)).is_none() {
        return Ok(());
    }

    let claim = claim_csrf.ok_or(CsrfError::MissingJwt)?;

    let header = headers
        .get(transport.csrf_header.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(CsrfError::MissingHeader)?;

    match signer.unsign(header) {
        Some(value) if value == claim => Ok(()),
        _ => Err(CsrfError::Mismatch),
    }
}
