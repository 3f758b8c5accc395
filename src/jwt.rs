//! Signed token generation and validation.
//!
//! Three token kinds share one claims layout: `access` (short-lived, general
//! API use), `refresh` (long-lived, only sent to the refresh endpoint) and
//! `ws` (only sent to the real-time transport). Each kind is signed with the
//! secret configured for it and carries its kind in the `typ` claim, so a
//! token of one kind never verifies as another.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// User role. Lower rank is more privileged, so "at least this role" is
/// `role.rank() <= required.rank()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Administrator,
    User,
    Guest,
    Link,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Administrator => 0,
            Role::User => 1,
            Role::Guest => 2,
            Role::Link => 3,
        }
    }

    /// Whether this role satisfies a route that requires `required`.
    pub fn satisfies(self, required: Role) -> bool {
        self.rank() <= required.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::User => "user",
            Role::Guest => "guest",
            Role::Link => "link",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "administrator" => Role::Administrator,
            "guest" => Role::Guest,
            "link" => Role::Link,
            _ => Role::User,
        }
    }
}

/// Identity claim set embedded in every signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: i64,
    pub login: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_from_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Administrator
    }

    pub fn is_impersonated(&self) -> bool {
        self.impersonated_from_id.is_some()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Kind of signed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    Ws,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Ws => "ws",
        }
    }
}

/// Claims carried by every signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub identity: Identity,
    /// CSRF value shared with the csrf cookie (access and refresh only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf: Option<String>,
    #[serde(rename = "typ")]
    pub kind: TokenKind,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Result of signing a token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub kind: TokenKind,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl IssuedToken {
    /// Seconds of validity left at issuance; used as the cookie max-age.
    pub fn max_age(&self) -> u64 {
        self.expires_at.saturating_sub(self.issued_at)
    }
}

/// Secrets for each signed token kind.
#[derive(Clone)]
pub struct TokenSecrets {
    pub access: Vec<u8>,
    pub refresh: Vec<u8>,
}

#[derive(Clone)]
struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &[u8]) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }
        Some(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        })
    }
}

/// Signs and verifies tokens. Pure computation, no I/O.
#[derive(Clone)]
pub struct TokenCodec {
    access: Option<KeyPair>,
    refresh: Option<KeyPair>,
}

/// Current Unix time in seconds.
pub fn now_secs() -> Result<u64, JwtError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| JwtError::Signing("system clock before Unix epoch"))
}

impl TokenCodec {
    /// Build a codec. An empty secret is accepted here and reported as a
    /// signing error when a token of that kind is first issued or verified.
    pub fn new(secrets: &TokenSecrets) -> Self {
        Self {
            access: KeyPair::from_secret(&secrets.access),
            refresh: KeyPair::from_secret(&secrets.refresh),
        }
    }

    // Long-lived ws tokens share the refresh secret.
    fn keys(&self, kind: TokenKind) -> Result<&KeyPair, JwtError> {
        let keys = match kind {
            TokenKind::Access => self.access.as_ref(),
            TokenKind::Refresh | TokenKind::Ws => self.refresh.as_ref(),
        };
        keys.ok_or(JwtError::Signing("missing signing secret"))
    }

    /// Sign a token valid for `ttl_secs` from now.
    pub fn issue(
        &self,
        identity: &Identity,
        kind: TokenKind,
        ttl_secs: u64,
        csrf: Option<&str>,
    ) -> Result<IssuedToken, JwtError> {
        let now = now_secs()?;
        self.issue_until(identity, kind, now, now + ttl_secs, csrf)
    }

    /// Sign a token with an explicit expiration.
    pub fn issue_until(
        &self,
        identity: &Identity,
        kind: TokenKind,
        issued_at: u64,
        expires_at: u64,
        csrf: Option<&str>,
    ) -> Result<IssuedToken, JwtError> {
        let keys = self.keys(kind)?;

        let claims = TokenClaims {
            identity: identity.clone(),
            csrf: match kind {
                TokenKind::Ws => None,
                _ => csrf.map(str::to_string),
            },
            kind,
            iat: issued_at,
            exp: expires_at,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &keys.encoding)
            .map_err(|_| JwtError::Signing("failed to encode token"))?;

        Ok(IssuedToken {
            token,
            kind,
            issued_at,
            expires_at,
        })
    }

    /// Verify a token of the given kind and return its claims.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<TokenClaims, JwtError> {
        let keys = self.keys(kind)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<TokenClaims>(token, &keys.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                ErrorKind::InvalidSignature => JwtError::MalformedSignature,
                _ => JwtError::Invalid,
            })?;

        if data.claims.kind != kind {
            return Err(JwtError::Invalid);
        }

        Ok(data.claims)
    }

    /// Login from a correctly signed token of `kind`, ignoring expiration.
    /// Only for audit logging of rejected requests.
    pub fn attempted_login(&self, token: &str, kind: TokenKind) -> Option<String> {
        let keys = self.keys(kind).ok()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<TokenClaims>(token, &keys.decoding, &validation)
            .ok()
            .filter(|data| data.claims.kind == kind)
            .map(|data| data.claims.identity.login)
    }
}

/// Errors that can occur during token operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwtError {
    /// Token is past its expiration
    Expired,
    /// Token is not a well-formed token of the expected kind
    Invalid,
    /// Signature does not match
    MalformedSignature,
    /// Codec is misconfigured
    Signing(&'static str),
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::Expired => write!(f, "Token expired"),
            JwtError::Invalid => write!(f, "Invalid token"),
            JwtError::MalformedSignature => write!(f, "Malformed token signature"),
            JwtError::Signing(reason) => write!(f, "Signing error: {}", reason),
        }
    }
}

impl std::error::Error for JwtError {}
