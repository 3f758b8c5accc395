//! Rate limiting for the login endpoint.
//!
//! Uses a token bucket algorithm with per-IP tracking to prevent brute force attacks.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::{num::NonZeroU32, sync::Arc};

use crate::auth::extract_client_ip;
use crate::server_config;

/// Per-IP rate limiter.
pub type IpLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Sustained login attempts per second per IP.
const LOGIN_PER_SEC: NonZeroU32 = NonZeroU32::new(1).unwrap();

/// Burst of login attempts allowed per IP.
const LOGIN_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

#[derive(Clone)]
pub struct RateLimitConfig {
    /// 5 attempts, then 1 per second
    pub login: Arc<IpLimiter>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::with_quota(Quota::per_second(LOGIN_PER_SEC).allow_burst(LOGIN_BURST))
    }

    pub fn with_quota(login: Quota) -> Self {
        Self {
            login: Arc::new(RateLimiter::keyed(login)),
        }
    }
}

/// Middleware for rate limiting login attempts.
pub async fn rate_limit_login(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, server_config::ip_header()) {
        Ok(ip) => ip,
        Err(_) => {
            return (StatusCode::FORBIDDEN, "Unable to determine client IP.").into_response();
        }
    };

    match config.login.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many authentication attempts. Please wait before trying again.",
        )
            .into_response(),
    }
}
