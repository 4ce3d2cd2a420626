#![allow(dead_code)]

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::{Router, body::Bytes};
use futures_util::stream;
use tubegrab::{
    config::AppConfig,
    identity::{AuthError, AuthService, UserRecord},
    quota::SystemClock,
    resolver::{ByteStream, MediaFormat, MediaInfo, MediaResolver, ResolverError, is_supported_video_url},
    routes::{AppState, build_router},
};

pub const MEMBER_TOKEN: &str = "member-token";
pub const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
const CHUNK_SIZE: usize = 64 * 1024;

pub struct MemberAuth;

#[async_trait]
impl AuthService for MemberAuth {
    async fn validate(&self, token: &str) -> Result<UserRecord, AuthError> {
        if token == MEMBER_TOKEN {
            Ok(UserRecord {
                id: "member-1".to_string(),
                roles: vec!["user".to_string()],
            })
        } else {
            Err(AuthError::InvalidToken("unknown token".to_string()))
        }
    }
}

pub struct FakeResolver {
    pub duration_seconds: u64,
    pub payload_len: usize,
    pub announce_length: bool,
    pub info_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
}

impl FakeResolver {
    pub fn new(payload_len: usize) -> Arc<Self> {
        Arc::new(Self {
            duration_seconds: 212,
            payload_len,
            announce_length: true,
            info_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        })
    }

    pub fn with_duration(duration_seconds: u64) -> Arc<Self> {
        Arc::new(Self {
            duration_seconds,
            payload_len: 1024,
            announce_length: true,
            info_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        })
    }

    pub fn without_length(payload_len: usize) -> Arc<Self> {
        Arc::new(Self {
            duration_seconds: 212,
            payload_len,
            announce_length: false,
            info_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        })
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaResolver for FakeResolver {
    fn accepts_url(&self, url: &str) -> bool {
        is_supported_video_url(url)
    }

    async fn fetch_info(&self, _url: &str) -> Result<MediaInfo, ResolverError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let length = self.announce_length.then_some(self.payload_len as u64);

        Ok(MediaInfo {
            title: "Never Gonna Give You Up".to_string(),
            duration_seconds: self.duration_seconds,
            thumbnail_url: Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg".to_string()),
            author: Some("Rick Astley".to_string()),
            view_count: Some(1_000_000_000),
            is_private: false,
            is_live: false,
            formats: vec![
                MediaFormat {
                    id: "18".to_string(),
                    container: "mp4".to_string(),
                    quality_label: Some("360p".to_string()),
                    has_audio: true,
                    has_video: true,
                    height: Some(360),
                    bitrate_kbps: Some(500.0),
                    audio_bitrate_kbps: Some(96.0),
                    content_length: length,
                },
                MediaFormat {
                    id: "140".to_string(),
                    container: "m4a".to_string(),
                    quality_label: None,
                    has_audio: true,
                    has_video: false,
                    height: None,
                    bitrate_kbps: Some(129.0),
                    audio_bitrate_kbps: Some(128.0),
                    content_length: length,
                },
            ],
        })
    }

    async fn open_stream(
        &self,
        _url: &str,
        _format: &MediaFormat,
    ) -> Result<ByteStream, ResolverError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let payload = vec![7_u8; self.payload_len];
        let chunks: Vec<io::Result<Bytes>> = payload
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

pub fn app(resolver: Arc<FakeResolver>) -> Router {
    let config = AppConfig::default();
    let state = AppState::new(
        &config,
        Arc::new(MemberAuth),
        resolver,
        Arc::new(SystemClock),
    );
    build_router(state, &config.allowed_origins)
}

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}")
}
