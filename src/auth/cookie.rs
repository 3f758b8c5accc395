//! Cookie and header transport for session tokens.
//!
//! Every token kind is bound to its own cookie name, path and max-age. The
//! access token may alternatively arrive as `Authorization: Bearer <token>`.

use axum::http::{HeaderMap, header};

use crate::jwt::TokenKind;

/// Default cookie names.
pub const ACCESS_COOKIE_NAME: &str = "sharegate-access";
pub const REFRESH_COOKIE_NAME: &str = "sharegate-refresh";
pub const WS_COOKIE_NAME: &str = "sharegate-ws";
pub const CSRF_COOKIE_NAME: &str = "sharegate-csrf";

/// Default header carrying the signed CSRF value on state-changing requests.
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

/// Default paths the refresh and ws cookies are scoped to.
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const WS_PATH: &str = "/api/ws";

/// Default lifetimes in seconds.
pub const ACCESS_TTL_SECS: u64 = 30 * 60;
pub const REFRESH_TTL_SECS: u64 = 4 * 60 * 60;

/// The four session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieKind {
    Access,
    Refresh,
    Ws,
    Csrf,
}

impl From<TokenKind> for CookieKind {
    fn from(kind: TokenKind) -> Self {
        match kind {
            TokenKind::Access => CookieKind::Access,
            TokenKind::Refresh => CookieKind::Refresh,
            TokenKind::Ws => CookieKind::Ws,
        }
    }
}

/// Delivery settings for one cookie.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    pub path: String,
    pub max_age: u64,
    pub http_only: bool,
}

/// Delivery settings for the whole session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub access: CookieSettings,
    pub refresh: CookieSettings,
    pub ws: CookieSettings,
    pub csrf: CookieSettings,
    pub csrf_header: String,
    pub secure: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            access: CookieSettings {
                name: ACCESS_COOKIE_NAME.to_string(),
                path: "/".to_string(),
                max_age: ACCESS_TTL_SECS,
                http_only: true,
            },
            refresh: CookieSettings {
                name: REFRESH_COOKIE_NAME.to_string(),
                path: REFRESH_PATH.to_string(),
                max_age: REFRESH_TTL_SECS,
                http_only: true,
            },
            ws: CookieSettings {
                name: WS_COOKIE_NAME.to_string(),
                path: WS_PATH.to_string(),
                max_age: REFRESH_TTL_SECS,
                http_only: true,
            },
            csrf: CookieSettings {
                name: CSRF_COOKIE_NAME.to_string(),
                path: "/".to_string(),
                max_age: REFRESH_TTL_SECS,
                http_only: false,
            },
            csrf_header: CSRF_HEADER_NAME.to_string(),
            secure: false,
        }
    }
}

impl TransportConfig {
    pub fn settings(&self, kind: CookieKind) -> &CookieSettings {
        match kind {
            CookieKind::Access => &self.access,
            CookieKind::Refresh => &self.refresh,
            CookieKind::Ws => &self.ws,
            CookieKind::Csrf => &self.csrf,
        }
    }

    /// Build a `Set-Cookie` value. `max_age` overrides the configured one.
    pub fn set_cookie(&self, kind: CookieKind, value: &str, max_age: Option<u64>) -> String {
        let settings = self.settings(kind);
        let http_only = if settings.http_only { "; HttpOnly" } else { "" };
        let secure = if self.secure { "; Secure" } else { "" };
        format!(
            "{}={}{}; SameSite=Strict; Path={}; Max-Age={}{}",
            settings.name,
            value,
            http_only,
            settings.path,
            max_age.unwrap_or(settings.max_age),
            secure
        )
    }

    /// Build a `Set-Cookie` value that immediately expires the cookie.
    pub fn clear_cookie(&self, kind: CookieKind) -> String {
        self.set_cookie(kind, "", Some(0))
    }

    /// Read the cookie of the given kind from the request.
    pub fn read<'a>(&self, headers: &'a HeaderMap, kind: CookieKind) -> Option<&'a str> {
        get_cookie(headers, &self.settings(kind).name).filter(|v| !v.is_empty())
    }
}

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == name {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Extract a bearer token from the Authorization header.
pub fn get_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_get_cookie_multiple() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("foo=bar; sharegate-access=abc123; sharegate-refresh=xyz789"),
        );

        assert_eq!(get_cookie(&headers, "sharegate-access"), Some("abc123"));
        assert_eq!(get_cookie(&headers, "sharegate-refresh"), Some("xyz789"));
        assert_eq!(get_cookie(&headers, "foo"), Some("bar"));
        assert_eq!(get_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_get_cookie_with_spaces() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("  sharegate-access = abc123  ; foo=bar"),
        );

        assert_eq!(get_cookie(&headers, "sharegate-access"), Some("abc123"));
    }

    #[test]
    fn test_get_cookie_no_header() {
        let headers = HeaderMap::new();
        assert_eq!(get_cookie(&headers, "sharegate-access"), None);
    }

    #[test]
    fn test_read_ignores_cleared_cookie() {
        let transport = TransportConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("sharegate-access="));

        assert_eq!(transport.read(&headers, CookieKind::Access), None);
    }

    #[test]
    fn test_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok.en.value"),
        );
        assert_eq!(get_bearer(&headers), Some("tok.en.value"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(get_bearer(&headers), None);
    }

    #[test]
    fn test_cookie_paths_and_flags() {
        let transport = TransportConfig {
            secure: true,
            ..TransportConfig::default()
        };

        let access = transport.set_cookie(CookieKind::Access, "a", None);
        assert_eq!(
            access,
            "sharegate-access=a; HttpOnly; SameSite=Strict; Path=/; Max-Age=1800; Secure"
        );

        let refresh = transport.set_cookie(CookieKind::Refresh, "r", Some(10));
        assert!(refresh.contains("Path=/api/auth/refresh"));
        assert!(refresh.contains("Max-Age=10"));

        let ws = transport.set_cookie(CookieKind::Ws, "w", None);
        assert!(ws.contains("Path=/api/ws"));

        let csrf = transport.set_cookie(CookieKind::Csrf, "c", None);
        assert!(!csrf.contains("HttpOnly"));
        assert!(csrf.contains("Path=/;"));

        let cleared = transport.clear_cookie(CookieKind::Refresh);
        assert!(cleared.starts_with("sharegate-refresh=;"));
        assert!(cleared.contains("Max-Age=0"));
        assert!(cleared.contains("Path=/api/auth/refresh"));
    }
}
