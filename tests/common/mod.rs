#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, header},
};
use serde_json::Value;
use sharegate::auth::{ACCESS_COOKIE_NAME, CSRF_COOKIE_NAME, CSRF_HEADER_NAME, REFRESH_COOKIE_NAME};
use sharegate::cli::{Secrets, build_sessions};
use sharegate::db::{Database, NewUser, hash_password};
use sharegate::jwt::Role;
use sharegate::presence::{GroupWhitelist, InProcessHub, PresenceService, PresenceSettings};
use sharegate::rate_limit::RateLimitConfig;
use sharegate::session::SessionManager;
use sharegate::{ServerConfig, create_app};
use tower::ServiceExt;
use url::Url;

pub const PASSWORD: &str = "correct horse battery staple";

pub fn test_secrets() -> Secrets {
    Secrets {
        access: "test-access-secret-0123456789abcdef".to_string(),
        refresh: "test-refresh-secret-0123456789abcdef".to_string(),
        csrf: "test-csrf-secret-0123456789abcdef".to_string(),
    }
}

pub struct TestApp {
    pub app: Router,
    pub db: Database,
    pub sessions: Arc<SessionManager>,
    pub presence: PresenceService,
}

/// Single-process app on an in-memory database.
pub async fn test_app() -> TestApp {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let sessions = Arc::new(build_sessions(
        &test_secrets(),
        &Url::parse("http://localhost").expect("Invalid URL"),
    ));
    let presence = PresenceService::start(
        Box::new(InProcessHub::new().join(0)),
        Arc::new(GroupWhitelist::new(db.clone())),
        Some(db.clone()),
        PresenceSettings::default(),
    );
    let config = ServerConfig {
        db: db.clone(),
        sessions: sessions.clone(),
        presence: presence.clone(),
        rate_limit: Arc::new(RateLimitConfig::new()),
    };

    TestApp {
        app: create_app(&config),
        db,
        sessions,
        presence,
    }
}

/// Create a user with [`PASSWORD`]. Returns the user ID.
pub async fn create_user(db: &Database, login: &str, role: Role, permissions: &[&str]) -> i64 {
    let hash = hash_password(PASSWORD).unwrap();
    db.users()
        .create(
            &NewUser::new(login, role)
                .with_permissions(permissions)
                .with_password_hash(hash),
        )
        .await
        .unwrap()
}

/// Request builder carrying a client address, as the server would see it.
pub fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(addr))
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `Set-Cookie` values of a response.
pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

/// Cookies a browser would hold after a response.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    pub cookies: HashMap<String, String>,
}

impl CookieJar {
    pub fn from_response(response: &Response<Body>) -> Self {
        let mut jar = Self::default();
        jar.update(response);
        jar
    }

    pub fn update(&mut self, response: &Response<Body>) {
        for set_cookie in set_cookies(response) {
            let pair = set_cookie.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                if value.is_empty() {
                    self.cookies.remove(name);
                } else {
                    self.cookies.insert(name.to_string(), value.to_string());
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> &str {
        self.cookies.get(name).map(String::as_str).unwrap_or("")
    }

    /// `Cookie` header with the given cookies.
    pub fn header(&self, names: &[&str]) -> String {
        names
            .iter()
            .filter_map(|name| self.cookies.get(*name).map(|v| format!("{}={}", name, v)))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Access and csrf cookies, as sent to general API routes.
    pub fn api_header(&self) -> String {
        self.header(&[ACCESS_COOKIE_NAME, CSRF_COOKIE_NAME])
    }

    /// Refresh and csrf cookies, as sent to the refresh endpoint.
    pub fn refresh_header(&self) -> String {
        self.header(&[REFRESH_COOKIE_NAME, CSRF_COOKIE_NAME])
    }

    pub fn csrf(&self) -> &str {
        self.get(CSRF_COOKIE_NAME)
    }
}

/// Log in and return the response.
pub async fn login_response(app: &Router, login: &str, password: &str) -> Response<Body> {
    app.clone()
        .oneshot(
            request("POST", "/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "login": login, "password": password }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap()
}

/// Log in and return the session cookies and the response body.
pub async fn login(app: &Router, login: &str) -> (CookieJar, Value) {
    let response = login_response(app, login, PASSWORD).await;
    assert_eq!(response.status(), 200);
    let jar = CookieJar::from_response(&response);
    (jar, body_json(response).await)
}

/// Authenticated state-changing request with the double-submit header.
pub fn post_with_csrf(uri: &str, cookie: String, csrf: &str) -> Request<Body> {
    request("POST", uri)
        .header(header::COOKIE, cookie)
        .header(CSRF_HEADER_NAME, csrf)
        .body(Body::empty())
        .unwrap()
}
