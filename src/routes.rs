use std::{collections::HashSet, sync::Arc};

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Request, State, rejection::JsonRejection},
    http::{
        HeaderValue, Method, StatusCode,
        header::{
            CONTENT_DISPOSITION, REFERRER_POLICY, STRICT_TRANSPORT_SECURITY,
            X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
        },
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

use crate::{
    config::{AppConfig, normalize_origin},
    error::ApiError,
    gate::{
        DOWNLOAD_LIMIT_HEADER, DOWNLOADS_REMAINING_HEADER, DOWNLOADS_USED_HEADER, DownloadGate,
        RequestAdmission, admit_request, peer_addr,
    },
    identity::{AuthService, IdentityResolver},
    quota::{Clock, QuotaTracker},
    rate_limit::SlowDown,
    resolver::MediaResolver,
    transfer::{DownloadRequest, MediaKind, TransferOrchestrator},
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub quota: Arc<QuotaTracker>,
    pub gate: Arc<DownloadGate>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub slow_down: Arc<SlowDown>,
}

impl AppState {
    /// Wires the components once per process. Tests build isolated instances
    /// with their own clock and collaborators.
    pub fn new(
        config: &AppConfig,
        auth: Arc<dyn AuthService>,
        resolver: Arc<dyn MediaResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let quota = Arc::new(QuotaTracker::new(clock.clone()));
        let identity = IdentityResolver::new(auth, config.trust_proxy_headers);
        let gate = Arc::new(DownloadGate::new(identity, quota.clone(), clock.clone()));

        Self {
            quota,
            gate,
            orchestrator: Arc::new(TransferOrchestrator::new(resolver, !config.is_production())),
            slow_down: Arc::new(SlowDown::new(clock)),
        }
    }

    /// Periodic cleanup for everything keyed by caller.
    pub fn prune(&self) {
        self.gate.prune_limiters();
        self.slow_down.prune();
    }
}

pub fn build_router(state: AppState, allowed_origins: &HashSet<String>) -> Router {
    let info = Router::new()
        .route("/api/download/info", post(video_info))
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            admit_request,
        ));

    // Slow-down runs first so throttled callers wait before touching the quota.
    let downloads = Router::new()
        .route("/api/download/mp3", post(download_audio))
        .route("/api/download/mp4", post(download_video))
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            admit_request,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            slow_down_requests,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(info)
        .merge(downloads)
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(allowed_origins))
}

pub fn build_cors_layer(allowed_origins: &HashSet<String>) -> CorsLayer {
    let allowed_origins = Arc::new(allowed_origins.clone());
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins.iter().collect::<Vec<_>>()
    );

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            DOWNLOAD_LIMIT_HEADER,
            DOWNLOADS_USED_HEADER,
            DOWNLOADS_REMAINING_HEADER,
        ])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Route not found")
}

async fn video_info(
    State(state): State<AppState>,
    Extension(admission): Extension<RequestAdmission>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = state
        .orchestrator
        .validate(read_payload(payload)?, MediaKind::Video)?;
    let info = state.orchestrator.describe(&request.url).await?;

    let mut response = Json(info).into_response();
    for (name, value) in admission.quota_headers() {
        response.headers_mut().insert(name, value);
    }
    Ok(response)
}

async fn download_audio(
    State(state): State<AppState>,
    Extension(admission): Extension<RequestAdmission>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = state
        .orchestrator
        .validate(read_payload(payload)?, MediaKind::Audio)?;
    state.orchestrator.serve(request, &admission).await
}

async fn download_video(
    State(state): State<AppState>,
    Extension(admission): Extension<RequestAdmission>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = state
        .orchestrator
        .validate(read_payload(payload)?, MediaKind::Video)?;
    state.orchestrator.serve(request, &admission).await
}

fn read_payload(
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<DownloadRequest, ApiError> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => Err(
            ApiError::payload_too_large("Request body is too large"),
        ),
        Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
    }
}

async fn slow_down_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let key = state
        .gate
        .identity()
        .network_key(request.headers(), peer_addr(&request));
    let delay = state.slow_down.register(&key);
    if !delay.is_zero() {
        debug!(identity_key = %key, delay_ms = delay.as_millis() as u64, "Slowing down download request");
        tokio::time::sleep(delay).await;
    }

    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    response
}
