use std::{
    io::{self, ErrorKind},
    pin::Pin,
    process::Stdio,
};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt, future, stream};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    task::JoinHandle,
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

const YT_DLP_METADATA_TIMEOUT_SECONDS: u64 = 180;
const SUPPORTED_HOSTS: [&str; 5] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub id: String,
    pub container: String,
    pub quality_label: Option<String>,
    pub has_audio: bool,
    pub has_video: bool,
    pub height: Option<u32>,
    pub bitrate_kbps: Option<f32>,
    pub audio_bitrate_kbps: Option<f32>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub title: String,
    pub duration_seconds: u64,
    pub thumbnail_url: Option<String>,
    pub author: Option<String>,
    pub view_count: Option<u64>,
    pub is_private: bool,
    pub is_live: bool,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("This video is not available")]
    Unavailable,
    #[error("This video requires authentication")]
    SignInRequired,
    #[error("media resolver failed: {0}")]
    Failed(String),
}

/// Metadata lookup and byte streaming for a third-party video platform.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    fn accepts_url(&self, url: &str) -> bool;

    async fn fetch_info(&self, url: &str) -> Result<MediaInfo, ResolverError>;

    /// Opens the byte stream for `format`. Dropping the stream must release
    /// whatever produces it.
    async fn open_stream(&self, url: &str, format: &MediaFormat)
    -> Result<ByteStream, ResolverError>;
}

pub fn is_supported_video_url(input: &str) -> bool {
    let input = input.trim();
    let candidate = if input.contains("://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };

    let Ok(parsed) = Url::parse(&candidate) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };

    SUPPORTED_HOSTS.contains(&host.as_str()) && !parsed.path().trim_matches('/').is_empty()
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    availability: Option<String>,
    is_live: Option<bool>,
    live_status: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    tbr: Option<f32>,
    abr: Option<f32>,
    filesize: Option<f64>,
}

impl From<YtDlpFormat> for MediaFormat {
    fn from(item: YtDlpFormat) -> Self {
        let has_video = matches!(item.vcodec.as_deref(), Some(value) if value != "none");
        let has_audio = matches!(item.acodec.as_deref(), Some(value) if value != "none");
        let quality_label = if has_video {
            item.height
                .map(|height| format!("{height}p"))
                .or(item.format_note)
        } else {
            None
        };

        MediaFormat {
            id: item.format_id,
            container: item
                .ext
                .unwrap_or_else(|| String::from(if has_video { "mp4" } else { "m4a" })),
            quality_label,
            has_audio,
            has_video,
            height: item.height,
            bitrate_kbps: item.tbr,
            audio_bitrate_kbps: item.abr,
            content_length: item
                .filesize
                .filter(|size| *size > 0.0)
                .map(|size| size as u64),
        }
    }
}

impl From<YtDlpVideoInfo> for MediaInfo {
    fn from(info: YtDlpVideoInfo) -> Self {
        let is_live = info.is_live.unwrap_or(false)
            || matches!(
                info.live_status.as_deref(),
                Some("is_live" | "is_upcoming" | "was_live" | "post_live")
            );

        MediaInfo {
            title: info
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Untitled".to_string()),
            duration_seconds: info.duration.map(|value| value.round() as u64).unwrap_or(0),
            thumbnail_url: info.thumbnail,
            author: info.uploader.or(info.channel),
            view_count: info.view_count,
            is_private: matches!(
                info.availability.as_deref(),
                Some("private" | "premium_only" | "subscriber_only" | "needs_auth")
            ),
            is_live,
            formats: info.formats.into_iter().map(MediaFormat::from).collect(),
        }
    }
}

pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, ResolverError> {
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(
            Duration::from_secs(YT_DLP_METADATA_TIMEOUT_SECONDS),
            command_future,
        )
        .await
        .map_err(|_| ResolverError::Failed("yt-dlp metadata lookup timed out".to_string()))?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ResolverError::Failed(format!(
                    "{} is not installed. Install yt-dlp and restart the server.",
                    self.binary
                ))
            } else {
                ResolverError::Failed(format!("could not run {}: {error}", self.binary))
            }
        })?;

        if !output.status.success() {
            return Err(classify_failure(&output.stderr));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    fn accepts_url(&self, url: &str) -> bool {
        is_supported_video_url(url)
    }

    async fn fetch_info(&self, url: &str) -> Result<MediaInfo, ResolverError> {
        let output = self
            .run(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                url.to_string(),
            ])
            .await?;

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout).map_err(|error| {
            ResolverError::Failed(format!("could not parse yt-dlp metadata: {error}"))
        })?;

        Ok(info.into())
    }

    async fn open_stream(
        &self,
        url: &str,
        format: &MediaFormat,
    ) -> Result<ByteStream, ResolverError> {
        let child = Command::new(&self.binary)
            .args([
                "--no-playlist",
                "--no-warnings",
                "--quiet",
                "--no-part",
                "-f",
                format.id.as_str(),
                "-o",
                "-",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| ResolverError::Failed(format!("could not start yt-dlp: {error}")))?;

        debug!(format_id = %format.id, "Started yt-dlp stream");
        child_output_stream(child)
    }
}

/// Streams a child's stdout, then checks its exit status. A non-zero exit
/// becomes a trailing error item carrying the classified stderr, so a failed
/// child never looks like a complete stream. Dropping the stream drops the
/// child, which `kill_on_drop` terminates.
fn child_output_stream(mut child: Child) -> Result<ByteStream, ResolverError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ResolverError::Failed("yt-dlp stdout was not captured".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ResolverError::Failed("yt-dlp stderr was not captured".to_string()))?;

    let stderr_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Err(error) = stderr.read_to_end(&mut buffer).await {
            debug!("Could not read yt-dlp stderr: {error}");
        }
        buffer
    });

    let exit_check = stream::once(exit_failure(child, stderr_task)).filter_map(future::ready);

    Ok(Box::pin(ReaderStream::new(stdout).chain(exit_check)))
}

/// Waits for the child and turns a non-zero exit into an error item.
async fn exit_failure(
    mut child: Child,
    stderr_task: JoinHandle<Vec<u8>>,
) -> Option<io::Result<Bytes>> {
    let status = match child.wait().await {
        Ok(status) => status,
        Err(error) => return Some(Err(error)),
    };
    if status.success() {
        return None;
    }

    let stderr = stderr_task.await.unwrap_or_default();
    let failure = classify_failure(&stderr);
    debug!(%status, "yt-dlp stream exited with failure: {failure}");
    Some(Err(io::Error::other(failure)))
}

fn classify_failure(stderr: &[u8]) -> ResolverError {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the request")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("video unavailable") || lower.contains("private video") {
        ResolverError::Unavailable
    } else if lower.contains("sign in") {
        ResolverError::SignInRequired
    } else {
        ResolverError::Failed(message)
    }
}
