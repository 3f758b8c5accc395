//! Session issuance, refresh, revocation and impersonation.
//!
//! A session is always handled as a unit of four cookies: access, refresh,
//! ws and csrf. One random CSRF value is shared by the access and refresh
//! tokens and is placed, signed, in the csrf cookie.

use tracing::{debug, info};

use crate::auth::{CookieKind, CookieSigner, TransportConfig, generate_csrf_value};
use crate::jwt::{Identity, IssuedToken, JwtError, TokenClaims, TokenCodec, TokenKind, now_secs};

/// Lifetimes used when a session is first issued.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl SessionConfig {
    pub fn from_transport(transport: &TransportConfig) -> Self {
        Self {
            access_ttl_secs: transport.access.max_age,
            refresh_ttl_secs: transport.refresh.max_age,
        }
    }
}

/// The four tokens making up a session.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub identity: Identity,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
    pub ws: IssuedToken,
    /// Raw CSRF value (also the `csrf` claim of access and refresh)
    pub csrf: String,
    /// Signed CSRF value stored in the csrf cookie
    pub csrf_cookie: String,
}

impl SessionTokens {
    /// `Set-Cookie` values for all four cookies, each with its own path and max-age.
    pub fn set_cookies(&self, transport: &TransportConfig) -> Vec<String> {
        vec![
            transport.set_cookie(
                CookieKind::Access,
                &self.access.token,
                Some(self.access.max_age()),
            ),
            transport.set_cookie(
                CookieKind::Refresh,
                &self.refresh.token,
                Some(self.refresh.max_age()),
            ),
            transport.set_cookie(CookieKind::Ws, &self.ws.token, Some(self.ws.max_age())),
            transport.set_cookie(
                CookieKind::Csrf,
                &self.csrf_cookie,
                Some(self.refresh.max_age()),
            ),
        ]
    }
}

/// Errors from session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The token being refreshed has no lifetime left
    Expired,
    /// Impersonation rule violated
    Forbidden,
    /// Codec misconfiguration
    Signing(JwtError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Expired => write!(f, "Session expired"),
            SessionError::Forbidden => write!(f, "Forbidden"),
            SessionError::Signing(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<JwtError> for SessionError {
    fn from(e: JwtError) -> Self {
        SessionError::Signing(e)
    }
}

/// Orchestrates the token codec and the csrf cookie signer.
#[derive(Clone)]
pub struct SessionManager {
    codec: TokenCodec,
    signer: CookieSigner,
    transport: TransportConfig,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(codec: TokenCodec, signer: CookieSigner, transport: TransportConfig) -> Self {
        let config = SessionConfig::from_transport(&transport);
        Self {
            codec,
            signer,
            transport,
            config,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn signer(&self) -> &CookieSigner {
        &self.signer
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Issue a complete session, used at login.
    pub fn issue_all(&self, identity: &Identity) -> Result<SessionTokens, SessionError> {
        let now = now_secs()?;
        let tokens = self.issue_session(
            identity,
            now,
            now + self.config.access_ttl_secs,
            now + self.config.refresh_ttl_secs,
        )?;
        info!(user_id = identity.id, login = %identity.login, "Session issued");
        Ok(tokens)
    }

    /// Refresh a session from the claims of a verified refresh token.
    pub fn refresh(&self, existing: &TokenClaims) -> Result<SessionTokens, SessionError> {
        self.refresh_with(&existing.identity, existing.exp)
    }

    /// Refresh a session for `identity`, keeping the original refresh
    /// expiration. The new refresh and ws tokens expire exactly at
    /// `original_exp`; the access token never outlives it.
    pub fn refresh_with(
        &self,
        identity: &Identity,
        original_exp: u64,
    ) -> Result<SessionTokens, SessionError> {
        let now = now_secs()?;
        if original_exp <= now {
            return Err(SessionError::Expired);
        }

        let access_exp = (now + self.config.access_ttl_secs).min(original_exp);
        let tokens = self.issue_session(identity, now, access_exp, original_exp)?;
        debug!(
            user_id = identity.id,
            remaining = original_exp - now,
            "Session refreshed"
        );
        Ok(tokens)
    }

    fn issue_session(
        &self,
        identity: &Identity,
        now: u64,
        access_exp: u64,
        refresh_exp: u64,
    ) -> Result<SessionTokens, SessionError> {
        let csrf = generate_csrf_value();

        let access =
            self.codec
                .issue_until(identity, TokenKind::Access, now, access_exp, Some(&csrf))?;
        let refresh =
            self.codec
                .issue_until(identity, TokenKind::Refresh, now, refresh_exp, Some(&csrf))?;
        let ws = self
            .codec
            .issue_until(identity, TokenKind::Ws, now, refresh_exp, None)?;

        let csrf_cookie = self.signer.sign(&csrf);

        Ok(SessionTokens {
            identity: identity.clone(),
            access,
            refresh,
            ws,
            csrf,
            csrf_cookie,
        })
    }

    /// `Set-Cookie` values clearing all four cookies at their paths.
    pub fn revoke(&self) -> Vec<String> {
        [
            CookieKind::Access,
            CookieKind::Refresh,
            CookieKind::Ws,
            CookieKind::Csrf,
        ]
        .into_iter()
        .map(|kind| self.transport.clear_cookie(kind))
        .collect()
    }

    /// Start a session as `target` on behalf of `admin`.
    pub fn impersonate(
        &self,
        admin: &Identity,
        target: &Identity,
    ) -> Result<SessionTokens, SessionError> {
        if !admin.is_admin() || admin.is_impersonated() || admin.id == target.id {
            return Err(SessionError::Forbidden);
        }

        let identity = Identity {
            impersonated_from_id: Some(admin.id),
            impersonated_client_id: admin.client_id.clone(),
            client_id: None,
            ..target.clone()
        };

        info!(admin_id = admin.id, target_id = target.id, "Impersonation started");
        self.issue_all(&identity)
    }

    /// Id of the administrator behind an impersonated identity.
    pub fn impersonator_id(&self, current: &Identity) -> Result<i64, SessionError> {
        current.impersonated_from_id.ok_or(SessionError::Forbidden)
    }

    /// End an impersonation, restoring a session for `original` (the
    /// identity resolved from `current.impersonated_from_id`).
    pub fn logout_impersonate(
        &self,
        current: &Identity,
        original: &Identity,
    ) -> Result<SessionTokens, SessionError> {
        let from_id = self.impersonator_id(current)?;
        if original.id != from_id || !original.is_admin() {
            return Err(SessionError::Forbidden);
        }

        let identity = Identity {
            impersonated_from_id: None,
            impersonated_client_id: None,
            client_id: current.impersonated_client_id.clone(),
            ..original.clone()
        };

        info!(admin_id = from_id, target_id = current.id, "Impersonation ended");
        self.issue_all(&identity)
    }
}
