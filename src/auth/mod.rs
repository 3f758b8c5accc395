//! Token transport, CSRF defense and the per-route guard chain.
//!
//! Sessions are four cookies: a short-lived access token, a refresh token
//! scoped to the refresh endpoint, a ws token scoped to the real-time
//! transport and a signed csrf cookie. Non-browser clients may send the
//! access token as a bearer header instead, which exempts them from CSRF.

mod cookie;
mod csrf;
mod errors;
mod guard;
mod ip;
mod signer;

pub use cookie::{
    ACCESS_COOKIE_NAME, ACCESS_TTL_SECS, CSRF_COOKIE_NAME, CSRF_HEADER_NAME, CookieKind,
    CookieSettings, REFRESH_COOKIE_NAME, REFRESH_PATH, REFRESH_TTL_SECS, TransportConfig,
    WS_COOKIE_NAME, WS_PATH, get_bearer, get_cookie,
};
pub use csrf::{is_safe_method, validate_csrf};
pub use errors::{AuthError, CsrfError};
pub use guard::{
    Auth, AuthenticatedUser, GuardState, ProtocolContext, Requirement, TokenSource, authenticate,
    authorize, require_auth,
};
pub use ip::extract_client_ip;
pub use signer::{CookieSigner, generate_csrf_value};
