//! Global server configuration initialized once at startup.
//!
//! These values are immutable after initialization and shared across all
//! request handlers.

use std::sync::OnceLock;

static IP_HEADER: OnceLock<Option<String>> = OnceLock::new();

pub fn init(ip_header: Option<String>) {
    IP_HEADER.get_or_init(|| ip_header);
}

/// Header carrying the client IP when running behind a proxy. `None` until
/// initialized, in which case the socket address is used.
pub fn ip_header() -> Option<&'static str> {
    IP_HEADER.get().and_then(|h| h.as_deref())
}
