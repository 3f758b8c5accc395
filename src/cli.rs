//! CLI argument parsing, validation, and startup helpers.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{error, info};
use url::Url;

use crate::auth::{CookieSigner, TransportConfig};
use crate::db::{Database, NewUser, hash_password};
use crate::jwt::{Role, TokenCodec, TokenSecrets};
use crate::session::SessionManager;

const MIN_SECRET_LENGTH: usize = 32;

pub const ACCESS_SECRET_ENV: &str = "ACCESS_TOKEN_SECRET";
pub const REFRESH_SECRET_ENV: &str = "REFRESH_TOKEN_SECRET";
pub const CSRF_SECRET_ENV: &str = "CSRF_SECRET";
pub const ADMIN_PASSWORD_ENV: &str = "ADMIN_PASSWORD";

/// Every permission granted to an administrator created from the CLI.
const ADMIN_PERMISSIONS: &[&str] = &["personal_space", "shares", "spaces", "admin"];

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "Sharegate", about = "Session, identity and presence server")]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "SHAREGATE_PORT", default_value = "7292")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "SHAREGATE_DATABASE", default_value = "sharegate.db")]
    pub database: String,

    /// Public URL of the server; https enables Secure cookies
    #[arg(long, env = "SHAREGATE_PUBLIC_URL", default_value = "http://localhost:7292")]
    pub public_url: String,

    /// Number of worker processes. 1 runs a single process
    #[arg(short, long, env = "SHAREGATE_WORKERS", default_value = "1")]
    pub workers: usize,

    /// Do not replace workers that exit
    #[arg(long)]
    pub no_auto_restart: bool,

    /// Worker restarts allowed before the coordinator gives up
    #[arg(long, default_value = "10")]
    pub max_restarts: u32,

    /// Unix socket of the presence relay (multi-worker mode)
    #[arg(long, env = "SHAREGATE_RELAY_SOCKET")]
    pub relay_socket: Option<PathBuf>,

    /// Persist explicit status changes as the user's preferred status
    #[arg(long)]
    pub persist_status: bool,

    /// Header carrying the client IP when behind a proxy (e.g. x-forwarded-for)
    #[arg(long, env = "SHAREGATE_IP_HEADER")]
    pub ip_header: Option<String>,

    /// File with KEY=VALUE secret lines. Prefer the environment variables
    #[arg(long)]
    pub secrets_file: Option<PathBuf>,

    /// Create an administrator with this login, password from ADMIN_PASSWORD
    #[arg(long)]
    pub create_admin: Option<String>,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

impl Args {
    /// Relay socket path, derived from the port when not given.
    pub fn relay_socket_path(&self) -> PathBuf {
        self.relay_socket.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("sharegate-{}.sock", self.port))
        })
    }
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Signing secrets of the process.
#[derive(Clone)]
pub struct Secrets {
    pub access: String,
    pub refresh: String,
    pub csrf: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets { .. }")
    }
}

impl Secrets {
    /// Environment handed to worker processes.
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (ACCESS_SECRET_ENV.to_string(), self.access.clone()),
            (REFRESH_SECRET_ENV.to_string(), self.refresh.clone()),
            (CSRF_SECRET_ENV.to_string(), self.csrf.clone()),
        ]
    }

    pub fn token_secrets(&self) -> TokenSecrets {
        TokenSecrets {
            access: self.access.as_bytes().to_vec(),
            refresh: self.refresh.as_bytes().to_vec(),
        }
    }
}

/// Parse `KEY=VALUE` lines, ignoring blanks and `#` comments.
pub fn parse_secrets_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Pick one secret from the environment, falling back to the file entries,
/// and check its length. The environment variable is removed once read.
fn take_secret(name: &str, file: &[(String, String)]) -> Result<String, String> {
    let secret = if let Ok(secret) = std::env::var(name) {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var(name) };
        secret
    } else if let Some((_, value)) = file.iter().find(|(k, _)| k == name) {
        value.clone()
    } else {
        return Err(format!(
            "{} is required. Set the environment variable (recommended) or use --secrets-file",
            name
        ));
    };

    if secret.len() < MIN_SECRET_LENGTH {
        return Err(format!(
            "{} is shorter than {} characters. Use a longer secret",
            name, MIN_SECRET_LENGTH
        ));
    }
    Ok(secret)
}

/// Load the three signing secrets.
/// Returns None and logs an error if any secret cannot be loaded.
pub fn load_secrets(secrets_file: Option<&std::path::Path>) -> Option<Secrets> {
    let file = match secrets_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(content) => parse_secrets_file(&content),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read secrets file");
                return None;
            }
        },
        None => Vec::new(),
    };

    let load = || -> Result<Secrets, String> {
        Ok(Secrets {
            access: take_secret(ACCESS_SECRET_ENV, &file)?,
            refresh: take_secret(REFRESH_SECRET_ENV, &file)?,
            csrf: take_secret(CSRF_SECRET_ENV, &file)?,
        })
    };

    match load() {
        Ok(secrets) => Some(secrets),
        Err(message) => {
            error!("{}", message);
            None
        }
    }
}

/// Parse and validate the public URL.
/// Returns None and logs an error if validation fails.
pub fn validate_public_url(public_url: &str) -> Option<Url> {
    let url = match Url::parse(public_url) {
        Ok(url) => url,
        Err(e) => {
            error!(url = %public_url, error = %e, "Invalid public URL");
            return None;
        }
    };

    let is_https = url.scheme() == "https";
    let is_localhost = url.host_str() == Some("localhost");

    if !is_https && !is_localhost {
        error!("public URL must use HTTPS for non-localhost deployments");
        return None;
    }

    Some(url)
}

/// Session manager for the given secrets; cookies are Secure behind https.
pub fn build_sessions(secrets: &Secrets, public_url: &Url) -> SessionManager {
    let transport = TransportConfig {
        secure: public_url.scheme() == "https",
        ..TransportConfig::default()
    };
    SessionManager::new(
        TokenCodec::new(&secrets.token_secrets()),
        CookieSigner::new(secrets.csrf.as_bytes()),
        transport,
    )
}

/// Handle the --create-admin flag: create the administrator unless the
/// login already exists.
pub async fn handle_create_admin(db: &Database, login: &str) {
    match db.users().get_by_login(login).await {
        Ok(Some(existing)) => {
            info!(login = %existing.login, id = existing.id, "Admin already exists");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Failed to check for existing admin");
            std::process::exit(1);
        }
    }

    let Ok(password) = std::env::var(ADMIN_PASSWORD_ENV) else {
        error!("{} is required with --create-admin", ADMIN_PASSWORD_ENV);
        std::process::exit(1);
    };
    // SAFETY: single-threaded startup, nothing else reads this variable.
    unsafe { std::env::remove_var(ADMIN_PASSWORD_ENV) };

    let hash = match hash_password(&password) {
        Ok(hash) => hash,
        Err(e) => {
            error!(error = %e, "Failed to hash admin password");
            std::process::exit(1);
        }
    };

    let user = NewUser::new(login, Role::Administrator)
        .with_permissions(ADMIN_PERMISSIONS)
        .with_password_hash(hash);
    match db.users().create(&user).await {
        Ok(id) => info!(login = %login, id, "Admin user created"),
        Err(e) => {
            error!(error = %e, "Failed to create admin user");
            std::process::exit(1);
        }
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

/// Bind the HTTP listener. Workers share the port through `SO_REUSEPORT`.
pub fn bind_listener(port: u16, reuse_port: bool) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    if reuse_port {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    socket.listen(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secrets_file() {
        let parsed = parse_secrets_file(
            "# signing keys\nACCESS_TOKEN_SECRET = abc\n\nCSRF_SECRET=x=y\nnot a pair\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("ACCESS_TOKEN_SECRET".to_string(), "abc".to_string()),
                ("CSRF_SECRET".to_string(), "x=y".to_string()),
            ]
        );
    }

    #[test]
    fn test_validate_public_url() {
        assert!(validate_public_url("https://share.example.com").is_some());
        assert!(validate_public_url("http://localhost:7292").is_some());
        assert!(validate_public_url("http://share.example.com").is_none());
        assert!(validate_public_url("not a url").is_none());
    }

    #[test]
    fn test_secure_cookies_follow_scheme() {
        let secrets = Secrets {
            access: "a".repeat(32),
            refresh: "r".repeat(32),
            csrf: "c".repeat(32),
        };
        let https = build_sessions(&secrets, &Url::parse("https://share.example.com").unwrap());
        assert!(https.transport().secure);
        let local = build_sessions(&secrets, &Url::parse("http://localhost").unwrap());
        assert!(!local.transport().secure);
    }
}
