//! Session endpoints: login, refresh, logout, identity and impersonation.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header::SET_COOKIE},
    middleware,
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{ApiError, ResultExt};
use super::guarded;
use crate::auth::{Auth, ProtocolContext, Requirement};
use crate::db::Database;
use crate::jwt::{Identity, Role, TokenKind};
use crate::rate_limit::{RateLimitConfig, rate_limit_login};
use crate::session::{SessionManager, SessionTokens};

/// Maximum accepted login length.
const MAX_LOGIN_LENGTH: usize = 128;

#[derive(Clone)]
pub struct AuthState {
    pub db: Database,
    pub sessions: Arc<SessionManager>,
    pub rate_limit: Arc<RateLimitConfig>,
}

pub fn router(state: AuthState) -> Router {
    let sessions = state.sessions.clone();
    let controller = Requirement::authenticated();
    let public = Requirement::skip(ProtocolContext::Public);

    let login_route = post(login).layer(middleware::from_fn_with_state(
        state.rate_limit.clone(),
        rate_limit_login,
    ));

    Router::new()
        .route(
            "/login",
            guarded(login_route, &sessions, public.over(&controller)),
        )
        .route(
            "/logout",
            guarded(post(logout), &sessions, public.over(&controller)),
        )
        .route(
            "/refresh",
            guarded(
                post(refresh),
                &sessions,
                Requirement::default()
                    .token(TokenKind::Refresh)
                    .over(&controller),
            ),
        )
        .route("/me", guarded(get(me), &sessions, controller.clone()))
        .route(
            "/impersonate/logout",
            guarded(post(logout_impersonate), &sessions, controller.clone()),
        )
        .route(
            "/impersonate/{id}",
            guarded(
                post(impersonate),
                &sessions,
                Requirement::default()
                    .role(Role::Administrator)
                    .over(&controller),
            ),
        )
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    login: String,
    password: String,
    /// Identifies the client application; generated when absent
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    identity: Identity,
    access_expires_at: u64,
    refresh_expires_at: u64,
}

/// Response carrying the four session cookies and the identity.
fn session_response(sessions: &SessionManager, tokens: SessionTokens) -> Response {
    let cookies = tokens.set_cookies(sessions.transport());
    (
        StatusCode::OK,
        AppendHeaders(cookies.into_iter().map(|c| (SET_COOKIE, c))),
        Json(SessionResponse {
            access_expires_at: tokens.access.expires_at,
            refresh_expires_at: tokens.refresh.expires_at,
            identity: tokens.identity,
        }),
    )
        .into_response()
}

async fn login(
    State(state): State<AuthState>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let login = request.login.trim();
    if login.is_empty() || login.len() > MAX_LOGIN_LENGTH {
        return Err(ApiError::bad_request("Invalid login"));
    }

    let user = state
        .db
        .users()
        .verify_credentials(login, &request.password)
        .await
        .db_err("Failed to verify credentials")?
        .ok_or_else(|| {
            warn!(login = %login, "Login failed");
            ApiError::unauthorized("Invalid login or password")
        })?;

    let client_id = request
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let tokens = state
        .sessions
        .issue_all(&user.to_identity(Some(client_id)))?;
    Ok(session_response(&state.sessions, tokens))
}

/// Reload the user so role and permission changes apply, keep the
/// impersonation fields and the original refresh expiration.
async fn refresh(
    State(state): State<AuthState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    let current = &auth.identity;
    let user = state
        .db
        .users()
        .get_by_id(current.id)
        .await
        .db_err("Failed to load user")?
        .ok_or_else(|| ApiError::unauthorized("Unauthorized"))?;

    let identity = Identity {
        impersonated_from_id: current.impersonated_from_id,
        impersonated_client_id: current.impersonated_client_id.clone(),
        ..user.to_identity(current.client_id.clone())
    };

    let tokens = state.sessions.refresh_with(&identity, auth.claims.exp)?;
    Ok(session_response(&state.sessions, tokens))
}

async fn logout(State(state): State<AuthState>) -> impl IntoResponse {
    let cookies = state.sessions.revoke();
    (
        StatusCode::OK,
        AppendHeaders(cookies.into_iter().map(|c| (SET_COOKIE, c))),
        Json(serde_json::json!({ "success": true })),
    )
}

async fn me(Auth(auth): Auth) -> Json<Identity> {
    Json(auth.identity)
}

async fn impersonate(
    State(state): State<AuthState>,
    Auth(auth): Auth,
    Path(target_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state
        .db
        .users()
        .get_by_id(target_id)
        .await
        .db_err("Failed to load user")?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let tokens = state
        .sessions
        .impersonate(&auth.identity, &target.to_identity(None))?;
    Ok(session_response(&state.sessions, tokens))
}

async fn logout_impersonate(
    State(state): State<AuthState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    let admin_id = state.sessions.impersonator_id(&auth.identity)?;
    let original = state
        .db
        .users()
        .get_by_id(admin_id)
        .await
        .db_err("Failed to load user")?
        .ok_or_else(|| ApiError::forbidden("Forbidden"))?;

    let tokens = state
        .sessions
        .logout_impersonate(&auth.identity, &original.to_identity(None))?;
    info!(admin_id, "Returned from impersonation");
    Ok(session_response(&state.sessions, tokens))
}
