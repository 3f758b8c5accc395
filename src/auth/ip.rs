//! Client IP extraction for per-client rate limiting.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};

/// Extract the client IP.
///
/// When `forwarded_header` is set (running behind a proxy), the first address
/// of that header is used and a missing header is an error; otherwise the
/// socket address from `ConnectInfo`.
pub fn extract_client_ip(
    request: &Request,
    forwarded_header: Option<&str>,
) -> Result<String, &'static str> {
    match forwarded_header {
        Some(name) => {
            let value = request
                .headers()
                .get(name)
                .ok_or("IP header not present")?
                .to_str()
                .map_err(|_| "IP header contains invalid characters")?;
            value
                .split(',')
                .next()
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .ok_or("IP header is empty")
        }
        None => request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .ok_or("No client IP available"),
    }
}
