use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::{
    error::ApiError,
    identity::{Identity, IdentityResolver, UserRecord},
    quota::{ANONYMOUS_DOWNLOAD_LIMIT, Clock, QuotaTracker},
    rate_limit::{RateDecision, SlidingWindowLimiter},
};

pub const DOWNLOAD_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-download-limit");
pub const DOWNLOADS_USED_HEADER: HeaderName = HeaderName::from_static("x-downloads-used");
pub const DOWNLOADS_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-downloads-remaining");
pub const UNLIMITED: &str = "unlimited";

/// Outcome of a successful admission, attached to the request for the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAdmission {
    Unlimited {
        user: UserRecord,
    },
    Metered {
        identity_key: String,
        used: u32,
        remaining: u32,
    },
}

impl RequestAdmission {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Unlimited { .. })
    }

    /// Label for logs: the user id or the anonymous key.
    pub fn caller(&self) -> &str {
        match self {
            Self::Unlimited { user } => &user.id,
            Self::Metered { identity_key, .. } => identity_key,
        }
    }

    pub fn quota_headers(&self) -> [(HeaderName, HeaderValue); 3] {
        match self {
            Self::Unlimited { .. } => [
                (DOWNLOAD_LIMIT_HEADER, HeaderValue::from_static(UNLIMITED)),
                (DOWNLOADS_USED_HEADER, HeaderValue::from_static("0")),
                (DOWNLOADS_REMAINING_HEADER, HeaderValue::from_static(UNLIMITED)),
            ],
            Self::Metered {
                used, remaining, ..
            } => [
                (DOWNLOAD_LIMIT_HEADER, HeaderValue::from(ANONYMOUS_DOWNLOAD_LIMIT)),
                (DOWNLOADS_USED_HEADER, HeaderValue::from(*used)),
                (DOWNLOADS_REMAINING_HEADER, HeaderValue::from(*remaining)),
            ],
        }
    }
}

/// Decides, before any metadata or stream work, whether a request may proceed.
pub struct DownloadGate {
    identity: IdentityResolver,
    quota: Arc<QuotaTracker>,
    anonymous_limiter: SlidingWindowLimiter,
    authenticated_limiter: SlidingWindowLimiter,
}

impl DownloadGate {
    pub fn new(identity: IdentityResolver, quota: Arc<QuotaTracker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            quota,
            anonymous_limiter: SlidingWindowLimiter::anonymous(clock.clone()),
            authenticated_limiter: SlidingWindowLimiter::authenticated(clock),
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub async fn admit(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<RequestAdmission, ApiError> {
        match self.identity.resolve(headers, peer).await {
            Identity::Authenticated(user) => {
                if let RateDecision::Limited {
                    retry_after_seconds,
                } = self.authenticated_limiter.check(&user.id)
                {
                    warn!(user_id = %user.id, retry_after_seconds, "Authenticated caller rate limited");
                    return Err(ApiError::rate_limited(
                        "Too many download requests. Please slow down.",
                        retry_after_seconds,
                    ));
                }

                Ok(RequestAdmission::Unlimited { user })
            }
            Identity::Anonymous { key } => {
                let decision = self.quota.check_and_consume(&key);
                if !decision.admitted {
                    info!(identity_key = %key, used = decision.used, "Anonymous download quota exhausted");
                    return Err(ApiError::quota_exceeded(decision.used));
                }

                if let RateDecision::Limited {
                    retry_after_seconds,
                } = self.anonymous_limiter.check(&key)
                {
                    warn!(identity_key = %key, retry_after_seconds, "Anonymous caller rate limited");
                    return Err(ApiError::rate_limited(
                        "Too many download requests. Please login for unlimited downloads.",
                        retry_after_seconds,
                    )
                    .with_quota(decision.used, decision.remaining));
                }

                Ok(RequestAdmission::Metered {
                    identity_key: key,
                    used: decision.used,
                    remaining: decision.remaining,
                })
            }
        }
    }

    pub fn prune_limiters(&self) {
        self.anonymous_limiter.prune();
        self.authenticated_limiter.prune();
    }
}

pub fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Middleware in front of the info and download routes.
pub async fn admit_request(
    State(gate): State<Arc<DownloadGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = peer_addr(&request);
    match gate.admit(request.headers(), peer).await {
        Ok(admission) => {
            request.extensions_mut().insert(admission);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}
