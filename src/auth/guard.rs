//! Per-route guard chain.
//!
//! Evaluation order for a route:
//! 1. context bypass (public route, WebDAV, document editor) allows the
//!    request without touching tokens and tags it with its `ProtocolContext`;
//! 2. token verification, then CSRF validation for cookie sessions;
//! 3. role check, then permission check.
//!
//! Requirements are plain values resolved at router construction: a
//! controller-level default overridden field by field by the route's own
//! requirement.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, Method, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

use super::cookie::{CookieKind, get_bearer};
use super::csrf::validate_csrf;
use super::errors::AuthError;
use crate::jwt::{Identity, Role, TokenClaims, TokenKind};
use crate::session::SessionManager;

/// Identifier logged for requests whose token yields no login.
const UNKNOWN_LOGIN: &str = "unauthorized";

/// Alternative credential paths that skip token verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolContext {
    /// Explicitly public route (login, public links)
    Public,
    /// WebDAV clients authenticate with their own scheme
    WebDav,
    /// Document-editor callbacks carry their own signed payload
    DocumentEditor,
}

/// Declared requirement of a controller or a route. `None` fields inherit.
#[derive(Debug, Clone, Default)]
pub struct Requirement {
    pub token: Option<TokenKind>,
    pub role: Option<Role>,
    /// `Some(vec![])` is a deliberate bypass of the permission check
    pub permissions: Option<Vec<String>>,
    pub bypass: Option<ProtocolContext>,
}

impl Requirement {
    /// Authenticated, no role or permission restriction.
    pub fn authenticated() -> Self {
        Self {
            permissions: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Skip token verification entirely.
    pub fn skip(context: ProtocolContext) -> Self {
        Self {
            bypass: Some(context),
            ..Self::default()
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn token(mut self, kind: TokenKind) -> Self {
        self.token = Some(kind);
        self
    }

    /// Pass if the identity holds any of `permissions`.
    pub fn any_permission<I, P>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.permissions = Some(permissions.into_iter().map(Into::into).collect());
        self
    }

    /// Resolve `self` (the more specific requirement) over `parent`.
    pub fn over(&self, parent: &Requirement) -> Requirement {
        Requirement {
            token: self.token.or(parent.token),
            role: self.role.or(parent.role),
            permissions: self
                .permissions
                .clone()
                .or_else(|| parent.permissions.clone()),
            bypass: self.bypass.or(parent.bypass),
        }
    }

    pub fn token_kind(&self) -> TokenKind {
        self.token.unwrap_or(TokenKind::Access)
    }
}

/// How the token reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cookie,
    Bearer,
}

/// Identity established by the guard chain, stored in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub identity: Identity,
    pub claims: TokenClaims,
    pub source: TokenSource,
}

/// Verify the token of `kind` on a request and run CSRF validation.
/// On failure returns the error and the attempted login for audit logging.
pub fn authenticate(
    sessions: &SessionManager,
    method: &Method,
    headers: &HeaderMap,
    kind: TokenKind,
) -> Result<AuthenticatedUser, (AuthError, String)> {
    let transport = sessions.transport();

    let (token, source) = match transport.read(headers, CookieKind::from(kind)) {
        Some(token) => (token, TokenSource::Cookie),
        // ws tokens are only ever accepted from their cookie
        None if kind != TokenKind::Ws => match get_bearer(headers) {
            Some(token) => (token, TokenSource::Bearer),
            None => return Err((AuthError::Unauthorized, UNKNOWN_LOGIN.to_string())),
        },
        None => return Err((AuthError::Unauthorized, UNKNOWN_LOGIN.to_string())),
    };

    let claims = sessions.codec().verify(token, kind).map_err(|e| {
        let login = sessions
            .codec()
            .attempted_login(token, kind)
            .unwrap_or_else(|| UNKNOWN_LOGIN.to_string());
        (AuthError::from(e), login)
    })?;

    if source == TokenSource::Cookie {
        validate_csrf(
            method,
            headers,
            claims.csrf.as_deref(),
            kind,
            transport,
            sessions.signer(),
        )
        .map_err(|e| (AuthError::from(e), claims.identity.login.clone()))?;
    }

    Ok(AuthenticatedUser {
        identity: claims.identity.clone(),
        claims,
        source,
    })
}

/// Role and permission checks. Administrators always pass both.
pub fn authorize(identity: &Identity, requirement: &Requirement) -> Result<(), AuthError> {
    if let Some(required) = requirement.role {
        if !identity.is_admin() && !identity.role.satisfies(required) {
            return Err(AuthError::Forbidden);
        }
    }

    let Some(permissions) = &requirement.permissions else {
        return Err(AuthError::MisconfiguredRoute);
    };

    if permissions.is_empty() || identity.is_admin() {
        return Ok(());
    }

    if permissions.iter().any(|p| identity.has_permission(p)) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

/// State of one guarded route.
#[derive(Clone)]
pub struct GuardState {
    sessions: Arc<SessionManager>,
    requirement: Arc<Requirement>,
}

impl GuardState {
    pub fn new(sessions: Arc<SessionManager>, requirement: Requirement) -> Self {
        Self {
            sessions,
            requirement: Arc::new(requirement),
        }
    }
}

/// Middleware running the guard chain for one route.
pub async fn require_auth(
    State(guard): State<GuardState>,
    mut request: Request,
    next: Next,
) -> Response {
    let requirement = &guard.requirement;

    if let Some(context) = requirement.bypass {
        request.extensions_mut().insert(context);
        return next.run(request).await;
    }

    let user = match authenticate(
        &guard.sessions,
        request.method(),
        request.headers(),
        requirement.token_kind(),
    ) {
        Ok(user) => user,
        Err((error, login)) => {
            warn!(
                login = %login,
                method = %request.method(),
                path = %request.uri().path(),
                reason = %error,
                "Authentication failed"
            );
            return error.into_response();
        }
    };

    if let Err(error) = authorize(&user.identity, requirement) {
        match error {
            AuthError::MisconfiguredRoute => warn!(
                method = %request.method(),
                path = %request.uri().path(),
                "Route declares no permission requirement, denying"
            ),
            _ => warn!(
                login = %user.identity.login,
                path = %request.uri().path(),
                "Access denied"
            ),
        }
        return error.into_response();
    }

    request.extensions_mut().insert(user);
    next.run(request).await
}

/// Extractor for handlers behind `require_auth`.
pub struct Auth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .map(Auth)
            .ok_or(AuthError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CookieSigner, TransportConfig};
    use crate::jwt::TokenCodec;
    use crate::jwt::tests::{alice, test_secrets};
    use axum::http::{HeaderValue, header};

    fn sessions() -> SessionManager {
        SessionManager::new(
            TokenCodec::new(&test_secrets()),
            CookieSigner::new(b"csrf-secret-for-tests"),
            TransportConfig::default(),
        )
    }

    fn with_role(role: Role, permissions: &[&str]) -> Identity {
        Identity {
            role,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            ..alice()
        }
    }

    #[test]
    fn test_admin_passes_any_requirement() {
        let admin = with_role(Role::Administrator, &[]);
        let requirement = Requirement::default()
            .role(Role::User)
            .any_permission(["shares", "spaces"]);

        assert_eq!(authorize(&admin, &requirement), Ok(()));
    }

    #[test]
    fn test_no_permissions_fails_non_empty_requirement() {
        let user = with_role(Role::User, &[]);
        let requirement = Requirement::default().any_permission(["shares"]);

        assert_eq!(authorize(&user, &requirement), Err(AuthError::Forbidden));
    }

    #[test]
    fn test_any_permission_matches() {
        let user = with_role(Role::User, &["spaces"]);
        let requirement = Requirement::default().any_permission(["shares", "spaces"]);

        assert_eq!(authorize(&user, &requirement), Ok(()));
    }

    #[test]
    fn test_empty_requirement_always_passes() {
        let guest = with_role(Role::Guest, &[]);
        assert_eq!(authorize(&guest, &Requirement::authenticated()), Ok(()));
    }

    #[test]
    fn test_undeclared_requirement_denies() {
        let user = with_role(Role::User, &["shares"]);
        assert_eq!(
            authorize(&user, &Requirement::default()),
            Err(AuthError::MisconfiguredRoute)
        );
    }

    #[test]
    fn test_role_rank() {
        let guest = with_role(Role::Guest, &[]);
        let user = with_role(Role::User, &[]);
        let requirement = Requirement::authenticated().role(Role::User);

        assert_eq!(authorize(&guest, &requirement), Err(AuthError::Forbidden));
        assert_eq!(authorize(&user, &requirement), Ok(()));
    }

    #[test]
    fn test_route_requirement_overrides_controller() {
        let controller = Requirement::default()
            .role(Role::User)
            .any_permission(["shares"]);
        let route = Requirement::authenticated().role(Role::Administrator);

        let resolved = route.over(&controller);
        assert_eq!(resolved.role, Some(Role::Administrator));
        assert_eq!(resolved.permissions, Some(Vec::new()));
        assert_eq!(resolved.token_kind(), TokenKind::Access);

        let inherited = Requirement::default().over(&controller);
        assert_eq!(inherited.role, Some(Role::User));
        assert_eq!(inherited.permissions, Some(vec!["shares".to_string()]));
    }

    #[test]
    fn test_authenticate_bearer_skips_csrf() {
        let sessions = sessions();
        let tokens = sessions.issue_all(&alice()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", tokens.access.token)).unwrap(),
        );

        let user = authenticate(&sessions, &Method::POST, &headers, TokenKind::Access).unwrap();
        assert_eq!(user.source, TokenSource::Bearer);
        assert_eq!(user.identity.id, alice().id);
    }

    #[test]
    fn test_authenticate_cookie_requires_csrf() {
        let sessions = sessions();
        let tokens = sessions.issue_all(&alice()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("sharegate-access={}", tokens.access.token)).unwrap(),
        );

        let (error, login) =
            authenticate(&sessions, &Method::POST, &headers, TokenKind::Access).unwrap_err();
        assert_eq!(error, AuthError::Csrf(crate::auth::CsrfError::MissingHeader));
        assert_eq!(login, "alice");

        headers.insert(
            "x-csrf-token",
            HeaderValue::from_str(&tokens.csrf_cookie).unwrap(),
        );
        let user = authenticate(&sessions, &Method::POST, &headers, TokenKind::Access).unwrap();
        assert_eq!(user.source, TokenSource::Cookie);
    }

    #[test]
    fn test_authenticate_missing_token() {
        let sessions = sessions();
        let (error, login) =
            authenticate(&sessions, &Method::GET, &HeaderMap::new(), TokenKind::Access)
                .unwrap_err();
        assert_eq!(error, AuthError::Unauthorized);
        assert_eq!(login, "unauthorized");
    }

    #[test]
    fn test_ws_token_not_accepted_as_bearer() {
        let sessions = sessions();
        let tokens = sessions.issue_all(&alice()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", tokens.ws.token)).unwrap(),
        );

        assert!(authenticate(&sessions, &Method::GET, &headers, TokenKind::Ws).is_err());
    }
}
