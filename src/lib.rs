pub mod api;
pub mod auth;
pub mod cli;
pub mod db;
pub mod jobs;
pub mod jwt;
pub mod presence;
pub mod rate_limit;
pub mod server_config;
pub mod session;
pub mod supervisor;
pub mod worker;

use api::create_api_router;
use axum::Router;
use db::Database;
use presence::{
    CachedWhitelist, GroupWhitelist, PresenceBus, PresenceService, PresenceSettings,
};
use rate_limit::RateLimitConfig;
use session::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Token codec, csrf signer and cookie settings
    pub sessions: Arc<SessionManager>,
    /// Presence of this worker, connected to its siblings
    pub presence: PresenceService,
    pub rate_limit: Arc<RateLimitConfig>,
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    let api_router = create_api_router(
        config.db.clone(),
        config.sessions.clone(),
        config.presence.clone(),
        config.rate_limit.clone(),
    );

    Router::new().nest("/api", api_router)
}

/// Start the presence service on `bus`, with visibility derived from group
/// membership in `db`.
pub fn start_presence(bus: Box<dyn PresenceBus>, db: &Database, persist: bool) -> PresenceService {
    let whitelist = Arc::new(CachedWhitelist::new(GroupWhitelist::new(db.clone())));
    jobs::spawn_whitelist_refresh(whitelist.clone());

    PresenceService::start(
        bus,
        whitelist,
        Some(db.clone()),
        PresenceSettings {
            persist,
            ..PresenceSettings::default()
        },
    )
}

/// Run the server on the given listener. This function blocks until the server exits.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}
