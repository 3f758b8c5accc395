mod auth;
mod error;
mod presence;

use axum::{Router, middleware, routing::MethodRouter};
use std::sync::Arc;

use crate::auth::{GuardState, Requirement, require_auth};
use crate::db::Database;
use crate::presence::PresenceService;
use crate::rate_limit::RateLimitConfig;
use crate::session::SessionManager;

pub use error::{ApiError, ResultExt};

/// Put a route behind the guard chain with its resolved requirement.
pub fn guarded<S>(
    route: MethodRouter<S>,
    sessions: &Arc<SessionManager>,
    requirement: Requirement,
) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.layer(middleware::from_fn_with_state(
        GuardState::new(sessions.clone(), requirement),
        require_auth,
    ))
}

/// Create the API router.
pub fn create_api_router(
    db: Database,
    sessions: Arc<SessionManager>,
    presence: PresenceService,
    rate_limit: Arc<RateLimitConfig>,
) -> Router {
    let auth_state = auth::AuthState {
        db: db.clone(),
        sessions: sessions.clone(),
        rate_limit,
    };

    let presence_state = presence::PresenceState { db, presence };

    Router::new()
        .nest("/auth", auth::router(auth_state))
        .merge(presence::router(presence_state, &sessions))
}
