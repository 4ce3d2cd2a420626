//! Caller identity: a validated session, or a best-effort network fingerprint.
//!
//! The anonymous key comes from the network address and is trivially changed by
//! switching network path. Nothing stronger exists without a login, so it is
//! kept as-is.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const UNKNOWN_IDENTITY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication is not configured")]
    NotConfigured,
    #[error("invalid session token: {0}")]
    InvalidToken(String),
}

/// Validates session tokens issued by the account system.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserRecord, AuthError>;
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// HS256 session tokens signed with the shared `JWT_SECRET`.
pub struct JwtAuthService {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtAuthService {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl AuthService for JwtAuthService {
    async fn validate(&self, token: &str) -> Result<UserRecord, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NotConfigured)?;
        let data = decode::<SessionClaims>(token, key, &self.validation)
            .map_err(|error| AuthError::InvalidToken(error.to_string()))?;

        Ok(UserRecord {
            id: data.claims.user_id,
            roles: data.claims.roles,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Authenticated(UserRecord),
    Anonymous { key: String },
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    auth: Arc<dyn AuthService>,
    trust_proxy_headers: bool,
}

impl IdentityResolver {
    pub fn new(auth: Arc<dyn AuthService>, trust_proxy_headers: bool) -> Self {
        Self {
            auth,
            trust_proxy_headers,
        }
    }

    /// Never fails. A missing, malformed or expired token silently yields an
    /// anonymous identity.
    pub async fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Identity {
        if let Some(token) = bearer_token(headers) {
            match self.auth.validate(token).await {
                Ok(user) => return Identity::Authenticated(user),
                Err(error) => debug!("Bearer token rejected, treating caller as anonymous: {error}"),
            }
        }

        Identity::Anonymous {
            key: self.network_key(headers, peer),
        }
    }

    /// Network fingerprint for `peer`. Without a trusted proxy the socket
    /// address wins; behind one the forwarded headers name the real client.
    pub fn network_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let peer_ip = peer.map(|addr| addr.ip().to_string());

        let key = if self.trust_proxy_headers {
            extract_client_ip(headers).or(peer_ip)
        } else {
            peer_ip.or_else(|| extract_client_ip(headers))
        };

        key.unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() { None } else { Some(token) }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("x-real-ip")
}
