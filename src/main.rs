use std::{io, net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tubegrab::{
    config::{AppConfig, ConfigError},
    identity::JwtAuthService,
    quota::{SystemClock, spawn_sweeper},
    resolver::YtDlpResolver,
    routes::{AppState, build_router},
};

#[derive(Debug, Error)]
enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("HTTP server error: {0}")]
    Serve(#[source] io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tubegrab=info,tower_http=info")),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let config = AppConfig::from_env()?;

    if config.trust_proxy_headers {
        info!("TRUST_PROXY_HEADERS=true: forwarded headers identify anonymous callers.");
    } else {
        warn!("TRUST_PROXY_HEADERS=false: the socket address identifies anonymous callers.");
    }
    if config.jwt_secret.is_none() {
        warn!("JWT_SECRET is not set. Every caller will be treated as anonymous.");
    }
    if !config.is_production() {
        warn!("APP_ENV is not production. Internal error details are returned to callers.");
    }

    let state = AppState::new(
        &config,
        Arc::new(JwtAuthService::new(config.jwt_secret.as_deref())),
        Arc::new(YtDlpResolver::new(config.yt_dlp_bin.clone())),
        Arc::new(SystemClock),
    );

    let sweeper = spawn_sweeper(state.quota.clone(), config.quota_sweep_interval, {
        let state = state.clone();
        move || state.prune()
    });

    let app = build_router(state, &config.allowed_origins);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
    info!("Server ready on http://{}", config.bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(ServerError::Serve);

    sweeper.abort();
    served
}
