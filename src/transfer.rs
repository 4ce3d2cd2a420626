//! Metadata lookup and streamed delivery of one admitted request.
//!
//! Everything before the first byte fails closed with a structured error. Once
//! bytes are flowing, failures can only cut the connection.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA},
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, Sleep, sleep_until, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ApiError, FieldError},
    gate::RequestAdmission,
    resolver::{ByteStream, MediaFormat, MediaInfo, MediaResolver, ResolverError},
};

pub const MAX_DURATION_SECONDS: u64 = 2 * 60 * 60;
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_LISTED_FORMATS: usize = 10;
const MAX_FILENAME_TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn default_quality(self) -> Quality {
        match self {
            Self::Audio => Quality::HighestAudio,
            Self::Video => Quality::Highest,
        }
    }

    fn format_matches(self, format: &MediaFormat) -> bool {
        match self {
            Self::Audio => format.has_audio && !format.has_video,
            Self::Video => format.has_audio && format.has_video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    Highest,
    Lowest,
    HighestVideo,
    LowestVideo,
    HighestAudio,
    LowestAudio,
    /// A concrete resolution label such as `720p` or `1080p60`.
    Label(String),
}

impl Quality {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let quality = match value {
            "highest" => Self::Highest,
            "lowest" => Self::Lowest,
            "highestvideo" => Self::HighestVideo,
            "lowestvideo" => Self::LowestVideo,
            "highestaudio" => Self::HighestAudio,
            "lowestaudio" => Self::LowestAudio,
            label if is_resolution_label(label) => Self::Label(label.to_string()),
            _ => return None,
        };
        Some(quality)
    }
}

fn is_resolution_label(value: &str) -> bool {
    let Some((height, fps)) = value.split_once('p') else {
        return false;
    };
    !height.is_empty()
        && height.len() <= 4
        && height.chars().all(|c| c.is_ascii_digit())
        && fps.len() <= 3
        && fps.chars().all(|c| c.is_ascii_digit())
}

/// Body of the info and download routes.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub url: String,
    pub kind: MediaKind,
    pub quality: Quality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSummary {
    pub itag: String,
    pub quality: Option<String>,
    pub container: String,
    pub has_audio: bool,
    pub has_video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub title: String,
    pub duration: u64,
    pub thumbnail: Option<String>,
    pub author: Option<String>,
    pub view_count: Option<u64>,
    pub formats: Vec<FormatSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub success: bool,
    pub data: VideoSummary,
}

impl From<MediaInfo> for VideoSummary {
    fn from(info: MediaInfo) -> Self {
        Self {
            title: info.title,
            duration: info.duration_seconds,
            thumbnail: info.thumbnail_url,
            author: info.author,
            view_count: info.view_count,
            formats: info
                .formats
                .into_iter()
                .take(MAX_LISTED_FORMATS)
                .map(|format| FormatSummary {
                    itag: format.id,
                    quality: format.quality_label,
                    container: format.container,
                    has_audio: format.has_audio,
                    has_video: format.has_video,
                })
                .collect(),
        }
    }
}

pub struct TransferOrchestrator {
    resolver: Arc<dyn MediaResolver>,
    expose_internal_detail: bool,
    timeout: Duration,
}

impl TransferOrchestrator {
    pub fn new(resolver: Arc<dyn MediaResolver>, expose_internal_detail: bool) -> Self {
        Self {
            resolver,
            expose_internal_detail,
            timeout: TRANSFER_TIMEOUT,
        }
    }

    pub fn validate(&self, payload: DownloadRequest, kind: MediaKind) -> Result<ValidatedRequest, ApiError> {
        let mut fields = Vec::new();

        let url = payload
            .url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        if url.is_none() {
            fields.push(FieldError {
                field: "url",
                message: "URL is required".to_string(),
            });
        }

        let quality = match payload.quality.as_deref().map(str::trim) {
            None | Some("") => Some(kind.default_quality()),
            Some(value) => Quality::parse(value),
        };
        if quality.is_none() {
            fields.push(FieldError {
                field: "quality",
                message: "Invalid quality option".to_string(),
            });
        }

        match (url, quality) {
            (Some(url), Some(quality)) if fields.is_empty() => {
                if !self.resolver.accepts_url(&url) {
                    return Err(ApiError::bad_request("Invalid YouTube URL"));
                }
                Ok(ValidatedRequest { url, kind, quality })
            }
            _ => Err(ApiError::validation(fields)),
        }
    }

    pub async fn describe(&self, url: &str) -> Result<InfoResponse, ApiError> {
        let info = self
            .resolver
            .fetch_info(url)
            .await
            .map_err(|error| self.resolver_error(error, "Failed to get video information"))?;
        check_asset(&info)?;

        info!(title = %info.title, duration = info.duration_seconds, "Video info retrieved");
        Ok(InfoResponse {
            success: true,
            data: info.into(),
        })
    }

    /// Streams the selected format to the caller. Headers are only committed
    /// after the first chunk arrives, so anything failing before that point is
    /// still reported as a structured error.
    pub async fn serve(
        &self,
        request: ValidatedRequest,
        admission: &RequestAdmission,
    ) -> Result<Response, ApiError> {
        let session_id = Uuid::new_v4();
        let deadline = Instant::now() + self.timeout;

        let info = timeout_at(deadline, self.resolver.fetch_info(&request.url))
            .await
            .map_err(|_| self.timed_out(session_id))?
            .map_err(|error| self.resolver_error(error, "Download failed"))?;
        check_asset(&info)?;

        let format = select_format(&info.formats, request.kind, &request.quality)
            .cloned()
            .ok_or_else(|| ApiError::bad_request("No suitable format available"))?;

        let mut source = timeout_at(deadline, self.resolver.open_stream(&request.url, &format))
            .await
            .map_err(|_| self.timed_out(session_id))?
            .map_err(|error| self.resolver_error(error, "Download failed"))?;

        let first_chunk = match timeout_at(deadline, source.next()).await {
            Err(_) => return Err(self.timed_out(session_id)),
            Ok(Some(Err(error))) => {
                warn!(%session_id, "Source stream failed before the first byte: {error}");
                return Err(self.stream_error(error));
            }
            Ok(None) => {
                warn!(%session_id, format_id = %format.id, "Source stream ended without any data");
                return Err(ApiError::internal_fault(
                    "Download failed",
                    "the source produced no data",
                    self.expose_internal_detail,
                ));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        info!(
            %session_id,
            caller = admission.caller(),
            authenticated = admission.is_authenticated(),
            format_id = %format.id,
            expected_bytes = ?format.content_length,
            "Starting transfer"
        );

        let session = TransferSession {
            id: session_id,
            source_url: request.url.clone(),
            selected_format_id: format.id.clone(),
            expected_byte_length: format.content_length,
            bytes_sent: 0,
            deadline,
        };
        let body = Body::from_stream(TransferBody::new(session, first_chunk, source));

        let filename = attachment_filename(&info.title, &format.container, Utc::now().timestamp_millis());
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(&format.container, request.kind)),
        );
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_str(&build_content_disposition(&filename))
                .map_err(|_| ApiError::internal("Could not build the download header."))?,
        );
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(EXPIRES, HeaderValue::from_static("0"));
        if let Some(length) = format.content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        for (name, value) in admission.quota_headers() {
            headers.insert(name, value);
        }

        Ok((headers, body).into_response())
    }

    fn timed_out(&self, session_id: Uuid) -> ApiError {
        warn!(%session_id, "Transfer deadline reached before any byte was sent");
        ApiError::timeout()
    }

    /// Failures carried inside the byte stream keep their resolver
    /// classification when the source attached one.
    fn stream_error(&self, error: io::Error) -> ApiError {
        if let Some(failure) = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ResolverError>())
            && matches!(failure, ResolverError::Unavailable | ResolverError::SignInRequired)
        {
            return ApiError::asset_unavailable(failure.to_string());
        }

        ApiError::internal_fault("Download failed", error, self.expose_internal_detail)
    }

    fn resolver_error(&self, error: ResolverError, context: &str) -> ApiError {
        match error {
            ResolverError::Unavailable | ResolverError::SignInRequired => {
                ApiError::asset_unavailable(error.to_string())
            }
            ResolverError::Failed(detail) => {
                warn!("{context}: {detail}");
                ApiError::internal_fault(context, detail, self.expose_internal_detail)
            }
        }
    }
}

pub fn check_asset(info: &MediaInfo) -> Result<(), ApiError> {
    if info.duration_seconds > MAX_DURATION_SECONDS {
        return Err(ApiError::asset_unavailable(
            "Video is too long. Maximum duration is 2 hours.",
        ));
    }
    if info.is_private || info.is_live {
        return Err(ApiError::asset_unavailable(
            "This video is not available for download",
        ));
    }
    Ok(())
}

/// Picks the format to stream. Equal candidates resolve to the first listed.
pub fn select_format<'a>(
    formats: &'a [MediaFormat],
    kind: MediaKind,
    quality: &Quality,
) -> Option<&'a MediaFormat> {
    let candidates = || formats.iter().filter(move |format| kind.format_matches(format));

    let video_rank = |format: &MediaFormat| {
        (
            format.height.unwrap_or(0),
            format.bitrate_kbps.unwrap_or(0.0),
        )
    };
    let audio_rank = |format: &MediaFormat| {
        (
            format.audio_bitrate_kbps.or(format.bitrate_kbps).unwrap_or(0.0),
            0.0_f32,
        )
    };

    match quality {
        Quality::Highest | Quality::HighestVideo if kind == MediaKind::Video => {
            pick(candidates(), video_rank, true)
        }
        Quality::Lowest | Quality::LowestVideo if kind == MediaKind::Video => {
            pick(candidates(), video_rank, false)
        }
        Quality::Lowest | Quality::LowestVideo | Quality::LowestAudio => {
            pick(candidates(), audio_rank, false)
        }
        Quality::Highest | Quality::HighestVideo | Quality::HighestAudio => {
            pick(candidates(), audio_rank, true)
        }
        Quality::Label(label) => candidates()
            .find(|format| format.quality_label.as_deref() == Some(label.as_str()))
            .or_else(|| select_format(formats, kind, &Quality::Highest)),
    }
}

fn pick<'a, I, K, F>(candidates: I, rank: F, highest: bool) -> Option<&'a MediaFormat>
where
    I: Iterator<Item = &'a MediaFormat>,
    F: Fn(&MediaFormat) -> K,
    K: PartialOrd,
{
    candidates.fold(None::<&'a MediaFormat>, |best, format| match best {
        None => Some(format),
        Some(current) => {
            let (candidate_rank, current_rank) = (rank(format), rank(current));
            let better = if highest {
                candidate_rank > current_rank
            } else {
                candidate_rank < current_rank
            };
            Some(if better { format } else { current })
        }
    })
}

/// `<title>_<millis>.<ext>` with the title reduced to word characters and
/// whitespace, at most 50 characters of it.
pub fn attachment_filename(title: &str, container: &str, timestamp_millis: i64) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
        .take(MAX_FILENAME_TITLE_CHARS)
        .collect();
    let stem = cleaned.trim();
    let stem = if stem.is_empty() { "download" } else { stem };
    format!("{stem}_{timestamp_millis}.{container}")
}

pub fn content_type_for(container: &str, kind: MediaKind) -> &'static str {
    match (container.to_ascii_lowercase().as_str(), kind) {
        ("mp4", MediaKind::Video) => "video/mp4",
        ("mp4" | "m4a", _) => "audio/mp4",
        ("webm", MediaKind::Video) => "video/webm",
        ("webm", MediaKind::Audio) => "audio/webm",
        ("mkv", _) => "video/x-matroska",
        ("3gp", _) => "video/3gpp",
        ("mp3", _) => "audio/mpeg",
        ("opus" | "ogg", _) => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

/// One streamed download, from admission to completion or termination.
#[derive(Debug)]
struct TransferSession {
    id: Uuid,
    source_url: String,
    selected_format_id: String,
    expected_byte_length: Option<u64>,
    bytes_sent: u64,
    deadline: Instant,
}

/// Response body that forwards source chunks until the source ends, fails, or
/// the session deadline passes. The source is dropped as soon as the session
/// ends, which terminates the producer behind it.
struct TransferBody {
    session: TransferSession,
    first_chunk: Option<Bytes>,
    source: Option<ByteStream>,
    deadline: Pin<Box<Sleep>>,
}

impl TransferBody {
    fn new(session: TransferSession, first_chunk: Bytes, source: ByteStream) -> Self {
        let deadline = Box::pin(sleep_until(session.deadline));
        Self {
            session,
            first_chunk: Some(first_chunk),
            source: Some(source),
            deadline,
        }
    }

    fn finish(&mut self) {
        self.source = None;
    }
}

impl Stream for TransferBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(chunk) = this.first_chunk.take() {
            this.session.bytes_sent += chunk.len() as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }

        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(None);
        };

        if this.deadline.as_mut().poll(cx).is_ready() {
            warn!(
                session_id = %this.session.id,
                url = %this.session.source_url,
                bytes_sent = this.session.bytes_sent,
                "Transfer deadline reached mid-stream, terminating connection"
            );
            this.finish();
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "transfer deadline exceeded",
            ))));
        }

        match source.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.session.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                warn!(
                    session_id = %this.session.id,
                    bytes_sent = this.session.bytes_sent,
                    "Source stream failed mid-transfer: {error}"
                );
                this.finish();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                info!(
                    session_id = %this.session.id,
                    format_id = %this.session.selected_format_id,
                    bytes_sent = this.session.bytes_sent,
                    expected_bytes = ?this.session.expected_byte_length,
                    "Transfer complete"
                );
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TransferBody {
    fn drop(&mut self) {
        if self.source.is_some() {
            debug!(
                session_id = %self.session.id,
                bytes_sent = self.session.bytes_sent,
                "Caller went away before the transfer finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, audio: bool, video: bool, height: Option<u32>, abr: Option<f32>) -> MediaFormat {
        MediaFormat {
            id: id.to_string(),
            container: if video { "mp4" } else { "m4a" }.to_string(),
            quality_label: height.map(|height| format!("{height}p")),
            has_audio: audio,
            has_video: video,
            height,
            bitrate_kbps: None,
            audio_bitrate_kbps: abr,
            content_length: None,
        }
    }

    fn catalogue() -> Vec<MediaFormat> {
        vec![
            format("18", true, true, Some(360), None),
            format("22", true, true, Some(720), None),
            format("22b", true, true, Some(720), None),
            format("137", false, true, Some(1080), None),
            format("139", true, false, None, Some(48.0)),
            format("140", true, false, None, Some(128.0)),
            format("140b", true, false, None, Some(128.0)),
        ]
    }

    #[test]
    fn quality_parsing_accepts_enumerated_values_and_resolution_labels() {
        assert_eq!(Quality::parse("highestaudio"), Some(Quality::HighestAudio));
        assert_eq!(Quality::parse("720p"), Some(Quality::Label("720p".to_string())));
        assert_eq!(Quality::parse("1080p60"), Some(Quality::Label("1080p60".to_string())));
        assert_eq!(Quality::parse("best"), None);
        assert_eq!(Quality::parse("p"), None);
        assert_eq!(Quality::parse("720px"), None);
    }

    #[test]
    fn audio_selection_prefers_highest_bitrate_audio_only_first_listed() {
        let formats = catalogue();
        let chosen = select_format(&formats, MediaKind::Audio, &Quality::HighestAudio).unwrap();
        assert_eq!(chosen.id, "140");

        let lowest = select_format(&formats, MediaKind::Audio, &Quality::LowestAudio).unwrap();
        assert_eq!(lowest.id, "139");
    }

    #[test]
    fn video_selection_requires_muxed_formats_and_breaks_ties_by_order() {
        let formats = catalogue();
        assert_eq!(
            select_format(&formats, MediaKind::Video, &Quality::Highest).unwrap().id,
            "22"
        );
        assert_eq!(
            select_format(&formats, MediaKind::Video, &Quality::Lowest).unwrap().id,
            "18"
        );
    }

    #[test]
    fn resolution_label_falls_back_to_highest() {
        let formats = catalogue();
        let exact = select_format(&formats, MediaKind::Video, &Quality::Label("360p".into()));
        assert_eq!(exact.unwrap().id, "18");

        let missing = select_format(&formats, MediaKind::Video, &Quality::Label("1440p".into()));
        assert_eq!(missing.unwrap().id, "22");
    }

    #[test]
    fn no_matching_format_yields_none() {
        let formats = vec![format("137", false, true, Some(1080), None)];
        assert!(select_format(&formats, MediaKind::Video, &Quality::Highest).is_none());
        assert!(select_format(&formats, MediaKind::Audio, &Quality::HighestAudio).is_none());
    }

    #[test]
    fn filenames_are_sanitized_capped_and_timestamped() {
        assert_eq!(
            attachment_filename("Rick Astley - Never Gonna Give You Up (Official)", "mp4", 1700000000000),
            "Rick Astley  Never Gonna Give You Up Official_1700000000000.mp4"
        );

        let long = "a".repeat(80);
        let name = attachment_filename(&long, "m4a", 1);
        assert_eq!(name, format!("{}_1.m4a", "a".repeat(50)));

        assert_eq!(attachment_filename("!!!", "webm", 7), "download_7.webm");
    }

    #[test]
    fn content_disposition_has_ascii_and_encoded_names() {
        let header = build_content_disposition("clip_1.mp4");
        assert_eq!(
            header,
            "attachment; filename=\"clip_1.mp4\"; filename*=UTF-8''clip_1.mp4"
        );
    }

    #[test]
    fn content_types_follow_container_and_kind() {
        assert_eq!(content_type_for("mp4", MediaKind::Video), "video/mp4");
        assert_eq!(content_type_for("m4a", MediaKind::Audio), "audio/mp4");
        assert_eq!(content_type_for("webm", MediaKind::Audio), "audio/webm");
        assert_eq!(content_type_for("flv", MediaKind::Video), "application/octet-stream");
    }

    #[test]
    fn assets_over_two_hours_or_private_or_live_are_rejected() {
        let mut info = MediaInfo {
            title: "t".to_string(),
            duration_seconds: 8000,
            thumbnail_url: None,
            author: None,
            view_count: None,
            is_private: false,
            is_live: false,
            formats: Vec::new(),
        };
        let error = check_asset(&info).unwrap_err();
        assert!(error.message.contains("too long"));

        info.duration_seconds = MAX_DURATION_SECONDS;
        assert!(check_asset(&info).is_ok());

        info.is_live = true;
        assert!(check_asset(&info).unwrap_err().message.contains("not available"));
    }

    #[test]
    fn summary_lists_at_most_ten_formats() {
        let info = MediaInfo {
            title: "t".to_string(),
            duration_seconds: 10,
            thumbnail_url: None,
            author: Some("a".to_string()),
            view_count: Some(3),
            is_private: false,
            is_live: false,
            formats: (0..14)
                .map(|i| format(&i.to_string(), true, true, Some(360), None))
                .collect(),
        };
        let summary = VideoSummary::from(info);
        assert_eq!(summary.formats.len(), 10);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["viewCount"], 3);
        assert_eq!(json["formats"][0]["hasAudio"], true);
    }

    mod orchestration {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        use async_trait::async_trait;
        use axum::{body::to_bytes, http::StatusCode};
        use futures_util::stream;

        use super::*;

        #[derive(Clone, Copy)]
        enum Source {
            Complete,
            StallBeforeFirstByte,
            StallAfterFirstChunk,
            FailBeforeFirstByte,
            FailAfterFirstChunk,
            Empty,
            UnavailableBeforeFirstByte,
        }

        struct DropFlag(Arc<AtomicBool>);

        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        struct FakeResolver {
            duration_seconds: u64,
            source: Source,
            opened: AtomicUsize,
            dropped: Arc<AtomicBool>,
        }

        impl FakeResolver {
            fn new(source: Source) -> Arc<Self> {
                Arc::new(Self {
                    duration_seconds: 212,
                    source,
                    opened: AtomicUsize::new(0),
                    dropped: Arc::new(AtomicBool::new(false)),
                })
            }
        }

        #[async_trait]
        impl MediaResolver for FakeResolver {
            fn accepts_url(&self, url: &str) -> bool {
                url.starts_with("https://youtu.be/")
            }

            async fn fetch_info(&self, _url: &str) -> Result<MediaInfo, ResolverError> {
                let mut video = format("18", true, true, Some(360), None);
                video.content_length = Some(6);
                Ok(MediaInfo {
                    title: "Clip: one/two".to_string(),
                    duration_seconds: self.duration_seconds,
                    thumbnail_url: None,
                    author: None,
                    view_count: None,
                    is_private: false,
                    is_live: false,
                    formats: vec![video, format("140", true, false, None, Some(128.0))],
                })
            }

            async fn open_stream(
                &self,
                _url: &str,
                _format: &MediaFormat,
            ) -> Result<ByteStream, ResolverError> {
                self.opened.fetch_add(1, Ordering::SeqCst);
                let guard = DropFlag(self.dropped.clone());
                let chunks: Vec<io::Result<Bytes>> = match self.source {
                    Source::Complete | Source::StallAfterFirstChunk => vec![
                        Ok(Bytes::from_static(b"abc")),
                        Ok(Bytes::from_static(b"def")),
                    ],
                    Source::StallBeforeFirstByte | Source::Empty => Vec::new(),
                    Source::FailBeforeFirstByte => vec![Err(io::Error::other("pipe closed"))],
                    Source::FailAfterFirstChunk => vec![
                        Ok(Bytes::from_static(b"abc")),
                        Err(io::Error::other("yt-dlp exited with status 1")),
                        Ok(Bytes::from_static(b"never sent")),
                    ],
                    Source::UnavailableBeforeFirstByte => {
                        vec![Err(io::Error::other(ResolverError::SignInRequired))]
                    }
                };
                let stalls = matches!(
                    self.source,
                    Source::StallBeforeFirstByte | Source::StallAfterFirstChunk
                );

                let body = stream::iter(chunks);
                let body: ByteStream = if stalls {
                    Box::pin(body.chain(stream::pending()))
                } else {
                    Box::pin(body)
                };
                Ok(Box::pin(body.map(move |item| {
                    let _held = &guard;
                    item
                })))
            }
        }

        fn admission() -> RequestAdmission {
            RequestAdmission::Metered {
                identity_key: "192.0.2.1".to_string(),
                used: 2,
                remaining: 3,
            }
        }

        fn video_request() -> ValidatedRequest {
            ValidatedRequest {
                url: "https://youtu.be/abc".to_string(),
                kind: MediaKind::Video,
                quality: Quality::Highest,
            }
        }

        #[tokio::test(start_paused = true)]
        async fn complete_transfer_streams_all_bytes_with_headers() {
            let resolver = FakeResolver::new(Source::Complete);
            let orchestrator = TransferOrchestrator::new(resolver.clone(), false);

            let response = orchestrator.serve(video_request(), &admission()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let headers = response.headers();
            assert_eq!(headers[CONTENT_TYPE], "video/mp4");
            assert_eq!(headers[CONTENT_LENGTH], "6");
            assert_eq!(headers[CACHE_CONTROL], "no-cache, no-store, must-revalidate");
            assert_eq!(headers["x-downloads-used"], "2");
            assert_eq!(headers["x-downloads-remaining"], "3");
            let disposition = headers[CONTENT_DISPOSITION].to_str().unwrap();
            assert!(disposition.starts_with("attachment; filename=\"Clip onetwo_"));
            assert!(disposition.contains(".mp4\""));

            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"abcdef");
            assert!(resolver.dropped.load(Ordering::SeqCst));
        }

        #[tokio::test(start_paused = true)]
        async fn deadline_before_first_byte_is_a_timeout_response() {
            let resolver = FakeResolver::new(Source::StallBeforeFirstByte);
            let orchestrator = TransferOrchestrator::new(resolver.clone(), false);

            let error = orchestrator.serve(video_request(), &admission()).await.unwrap_err();
            assert_eq!(error.status, StatusCode::REQUEST_TIMEOUT);
            assert_eq!(error.message, "Download timeout");
            assert!(resolver.dropped.load(Ordering::SeqCst));
        }

        #[tokio::test(start_paused = true)]
        async fn deadline_mid_stream_cuts_the_body_and_releases_the_source() {
            let resolver = FakeResolver::new(Source::StallAfterFirstChunk);
            let orchestrator = TransferOrchestrator::new(resolver.clone(), false);

            let response = orchestrator.serve(video_request(), &admission()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!resolver.dropped.load(Ordering::SeqCst));

            assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
            assert!(resolver.dropped.load(Ordering::SeqCst));
        }

        #[tokio::test]
        async fn source_failure_after_first_chunk_ends_the_body_with_an_error() {
            let resolver = FakeResolver::new(Source::FailAfterFirstChunk);
            let orchestrator = TransferOrchestrator::new(resolver.clone(), false);

            let response = orchestrator.serve(video_request(), &admission()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let mut body = response.into_body().into_data_stream();
            assert_eq!(&body.next().await.unwrap().unwrap()[..], b"abc");
            assert!(body.next().await.unwrap().is_err());
            assert!(resolver.dropped.load(Ordering::SeqCst));
        }

        #[tokio::test]
        async fn source_ending_without_data_is_an_internal_error() {
            let resolver = FakeResolver::new(Source::Empty);
            let orchestrator = TransferOrchestrator::new(resolver, false);

            let error = orchestrator.serve(video_request(), &admission()).await.unwrap_err();
            assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(error.message, "Download failed");
        }

        #[tokio::test]
        async fn classified_source_failure_before_first_byte_is_a_bad_request() {
            let resolver = FakeResolver::new(Source::UnavailableBeforeFirstByte);
            let orchestrator = TransferOrchestrator::new(resolver, false);

            let error = orchestrator.serve(video_request(), &admission()).await.unwrap_err();
            assert_eq!(error.status, StatusCode::BAD_REQUEST);
            assert_eq!(error.message, "This video requires authentication");
        }

        #[tokio::test]
        async fn source_failure_before_first_byte_is_an_internal_error() {
            let resolver = FakeResolver::new(Source::FailBeforeFirstByte);
            let orchestrator = TransferOrchestrator::new(resolver, false);

            let error = orchestrator.serve(video_request(), &admission()).await.unwrap_err();
            assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(error.message, "Download failed");
        }

        #[tokio::test]
        async fn over_long_assets_are_rejected_before_any_stream_is_opened() {
            let resolver = Arc::new(FakeResolver {
                duration_seconds: 8000,
                source: Source::Complete,
                opened: AtomicUsize::new(0),
                dropped: Arc::new(AtomicBool::new(false)),
            });
            let orchestrator = TransferOrchestrator::new(resolver.clone(), false);

            let error = orchestrator.serve(video_request(), &admission()).await.unwrap_err();
            assert_eq!(error.status, StatusCode::BAD_REQUEST);
            assert_eq!(error.message, "Video is too long. Maximum duration is 2 hours.");
            assert_eq!(resolver.opened.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn audio_requests_stream_the_audio_only_format() {
            let resolver = FakeResolver::new(Source::Complete);
            let orchestrator = TransferOrchestrator::new(resolver, false);
            let request = ValidatedRequest {
                kind: MediaKind::Audio,
                quality: Quality::HighestAudio,
                ..video_request()
            };

            let response = orchestrator.serve(request, &admission()).await.unwrap();
            assert_eq!(response.headers()[CONTENT_TYPE], "audio/mp4");
            assert!(response.headers().get(CONTENT_LENGTH).is_none());
        }

        #[test]
        fn validation_reports_missing_fields_and_bad_urls() {
            let orchestrator = TransferOrchestrator::new(FakeResolver::new(Source::Complete), false);

            let missing = orchestrator
                .validate(DownloadRequest::default(), MediaKind::Video)
                .unwrap_err();
            assert_eq!(missing.message, "Validation failed");

            let bad_quality = orchestrator
                .validate(
                    DownloadRequest {
                        url: Some("https://youtu.be/abc".to_string()),
                        quality: Some("ultra".to_string()),
                    },
                    MediaKind::Video,
                )
                .unwrap_err();
            assert_eq!(bad_quality.code, Some("VALIDATION_FAILED"));

            let bad_url = orchestrator
                .validate(
                    DownloadRequest {
                        url: Some("https://example.com/v".to_string()),
                        quality: None,
                    },
                    MediaKind::Audio,
                )
                .unwrap_err();
            assert_eq!(bad_url.message, "Invalid YouTube URL");

            let ok = orchestrator
                .validate(
                    DownloadRequest {
                        url: Some(" https://youtu.be/abc ".to_string()),
                        quality: None,
                    },
                    MediaKind::Audio,
                )
                .unwrap();
            assert_eq!(ok.url, "https://youtu.be/abc");
            assert_eq!(ok.quality, Quality::HighestAudio);
        }
    }
}
