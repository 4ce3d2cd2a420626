//! HTTP client for the download service.
//!
//! Drives a [`ProgressEstimator`] while a download is in flight: synthetic
//! timers run until the first body bytes arrive, then progress follows the
//! transfer itself.

use std::time::Duration;

use rand::{SeedableRng, rngs::StdRng};
use reqwest::{
    StatusCode,
    header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderName},
};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::debug;

use crate::{
    gate::{DOWNLOAD_LIMIT_HEADER, DOWNLOADS_REMAINING_HEADER, DOWNLOADS_USED_HEADER, UNLIMITED},
    progress::{ProgressEstimator, ProgressSnapshot},
    transfer::{InfoResponse, MediaKind},
};

const CONNECT_TIMEOUT_SECONDS: u64 = 10;
const LOCAL_LIMIT_MESSAGE: &str =
    "Download limit reached. Please log in for unlimited downloads.";

#[derive(Debug, Error)]
pub enum ClientError {
    /// The caller is out of anonymous downloads, or was told to slow down.
    #[error("{message}")]
    LimitReached {
        message: String,
        used: Option<u32>,
        remaining: Option<u32>,
    },
    #[error("download failed: {0}")]
    Failed(String),
}

impl ClientError {
    pub fn is_limit_reached(&self) -> bool {
        matches!(self, Self::LimitReached { .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        Self::Failed(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSnapshot {
    Unlimited,
    Metered { limit: u32, used: u32, remaining: u32 },
}

impl QuotaSnapshot {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let read = |name: HeaderName| headers.get(name).and_then(|value| value.to_str().ok());

        let limit = read(DOWNLOAD_LIMIT_HEADER)?;
        if limit == UNLIMITED {
            return Some(Self::Unlimited);
        }

        Some(Self::Metered {
            limit: limit.parse().ok()?,
            used: read(DOWNLOADS_USED_HEADER)?.parse().ok()?,
            remaining: read(DOWNLOADS_REMAINING_HEADER)?.parse().ok()?,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Metered { remaining: 0, .. })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    message: Option<String>,
    limit: Option<u32>,
    used: Option<u32>,
    remaining: Option<u32>,
}

#[derive(Debug)]
pub struct DownloadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub quota: Option<QuotaSnapshot>,
}

pub struct DownloadClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    last_quota: Option<QuotaSnapshot>,
}

impl DownloadClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.filter(|value| !value.trim().is_empty()),
            last_quota: None,
        })
    }

    /// Quota state from the most recent admitted response.
    pub fn last_quota(&self) -> Option<QuotaSnapshot> {
        self.last_quota
    }

    pub async fn info(&mut self, url: &str) -> Result<InfoResponse, ClientError> {
        let response = self.post("info", url, None).send().await?;
        let response = self.check(response).await?;
        response
            .json::<InfoResponse>()
            .await
            .map_err(|error| ClientError::Failed(format!("invalid info response: {error}")))
    }

    /// Downloads `url` as audio or video, reporting every progress change to
    /// `on_progress`. The final report is always exactly 100%.
    pub async fn download<F>(
        &mut self,
        url: &str,
        kind: MediaKind,
        quality: Option<&str>,
        mut on_progress: F,
    ) -> Result<DownloadedFile, ClientError>
    where
        F: FnMut(ProgressSnapshot),
    {
        if self.token.is_none() && self.last_quota.is_some_and(|quota| quota.is_exhausted()) {
            return Err(ClientError::LimitReached {
                message: LOCAL_LIMIT_MESSAGE.to_string(),
                used: match self.last_quota {
                    Some(QuotaSnapshot::Metered { used, .. }) => Some(used),
                    _ => None,
                },
                remaining: Some(0),
            });
        }

        let mut estimator = ProgressEstimator::new(kind);
        let mut rng = StdRng::from_entropy();
        on_progress(estimator.start(Instant::now()));

        let result = self
            .transfer(url, kind, quality, &mut estimator, &mut rng, &mut on_progress)
            .await;
        match result {
            Ok(file) => {
                on_progress(estimator.complete(Instant::now()));
                estimator.reset();
                Ok(file)
            }
            Err(error) => {
                estimator.reset();
                Err(error)
            }
        }
    }

    async fn transfer<F>(
        &mut self,
        url: &str,
        kind: MediaKind,
        quality: Option<&str>,
        estimator: &mut ProgressEstimator,
        rng: &mut StdRng,
        on_progress: &mut F,
    ) -> Result<DownloadedFile, ClientError>
    where
        F: FnMut(ProgressSnapshot),
    {
        let started = Instant::now();
        let profile = estimator.profile();
        let mut ramp = interval_at(started + profile.ramp_interval, profile.ramp_interval);
        ramp.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let processing = sleep_until(started + profile.processing_delay);
        tokio::pin!(processing);
        let mut processing_pending = true;

        let endpoint = match kind {
            MediaKind::Audio => "mp3",
            MediaKind::Video => "mp4",
        };
        let send = self.post(endpoint, url, quality).send();
        tokio::pin!(send);

        let response = loop {
            tokio::select! {
                result = &mut send => break result?,
                _ = ramp.tick() => {
                    if let Some(snapshot) = estimator.tick(Instant::now(), rng) {
                        on_progress(snapshot);
                    }
                }
                _ = &mut processing, if processing_pending => {
                    processing_pending = false;
                    if let Some(snapshot) = estimator.processing_timer_fired(Instant::now()) {
                        on_progress(snapshot);
                    }
                }
            }
        };
        let mut response = self.check(response).await?;

        let total = response.content_length();
        let headers = response.headers();
        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| format!("download.{endpoint}"));
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let mut bytes = Vec::new();
        loop {
            let chunk = if estimator.timers_active() {
                tokio::select! {
                    chunk = response.chunk() => chunk?,
                    _ = ramp.tick() => {
                        if let Some(snapshot) = estimator.tick(Instant::now(), rng) {
                            on_progress(snapshot);
                        }
                        continue;
                    }
                    _ = &mut processing, if processing_pending => {
                        processing_pending = false;
                        if let Some(snapshot) = estimator.processing_timer_fired(Instant::now()) {
                            on_progress(snapshot);
                        }
                        continue;
                    }
                }
            } else {
                response.chunk().await?
            };

            let Some(chunk) = chunk else {
                break;
            };
            bytes.extend_from_slice(&chunk);
            on_progress(estimator.on_bytes(bytes.len() as u64, total, Instant::now(), rng));
        }

        if let Some(expected) = total
            && (bytes.len() as u64) < expected
        {
            return Err(ClientError::Failed(format!(
                "transfer ended after {} of {expected} bytes",
                bytes.len()
            )));
        }

        debug!(filename = %filename, bytes = bytes.len(), "Download finished");
        Ok(DownloadedFile {
            filename,
            content_type,
            bytes,
            quota: self.last_quota,
        })
    }

    fn post(&self, endpoint: &str, url: &str, quality: Option<&str>) -> reqwest::RequestBuilder {
        let request = self
            .http
            .post(format!("{}/api/download/{endpoint}", self.base_url))
            .json(&serde_json::json!({ "url": url, "quality": quality }));

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Records quota headers and turns non-success statuses into errors.
    async fn check(&mut self, response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if let Some(quota) = QuotaSnapshot::from_headers(response.headers()) {
            self.last_quota = Some(quota);
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let payload = response.json::<ErrorPayload>().await.ok();
        let message = payload
            .as_ref()
            .and_then(|payload| payload.message.clone())
            .unwrap_or_else(|| format!("server responded with {status}"));

        if status == StatusCode::TOO_MANY_REQUESTS {
            let used = payload.as_ref().and_then(|payload| payload.used);
            let remaining = payload.as_ref().and_then(|payload| payload.remaining);
            if let (Some(limit), Some(used), Some(remaining)) =
                (payload.as_ref().and_then(|payload| payload.limit), used, remaining)
            {
                self.last_quota = Some(QuotaSnapshot::Metered {
                    limit,
                    used,
                    remaining,
                });
            }
            return Err(ClientError::LimitReached {
                message,
                used,
                remaining,
            });
        }

        Err(ClientError::Failed(message))
    }
}

/// Server-chosen filename, preferring the RFC 5987 `filename*` form. Only the
/// final path component is kept, so the name can never leave the directory it
/// is saved into.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            let encoded = encoded
                .split_once("''")
                .map(|(_, rest)| rest)
                .unwrap_or(encoded);
            if let Ok(decoded) = urlencoding::decode(encoded)
                && let Some(name) = base_file_name(&decoded)
            {
                return Some(name);
            }
        } else if let Some(quoted) = part.strip_prefix("filename=")
            && let Some(name) = base_file_name(quoted.trim_matches('"'))
        {
            plain = Some(name);
        }
    }
    plain
}

fn base_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(limit: &'static str, used: &'static str, remaining: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(DOWNLOAD_LIMIT_HEADER, HeaderValue::from_static(limit));
        headers.insert(DOWNLOADS_USED_HEADER, HeaderValue::from_static(used));
        headers.insert(DOWNLOADS_REMAINING_HEADER, HeaderValue::from_static(remaining));
        headers
    }

    #[test]
    fn quota_headers_parse_for_both_caller_kinds() {
        assert_eq!(
            QuotaSnapshot::from_headers(&headers("unlimited", "0", "unlimited")),
            Some(QuotaSnapshot::Unlimited)
        );

        let metered = QuotaSnapshot::from_headers(&headers("5", "5", "0")).unwrap();
        assert_eq!(
            metered,
            QuotaSnapshot::Metered {
                limit: 5,
                used: 5,
                remaining: 0
            }
        );
        assert!(metered.is_exhausted());
        assert_eq!(QuotaSnapshot::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn disposition_prefers_the_encoded_filename() {
        assert_eq!(
            filename_from_disposition(
                "attachment; filename=\"caf_.mp4\"; filename*=UTF-8''caf%C3%A9.mp4"
            )
            .as_deref(),
            Some("café.mp4")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=\"clip_1.m4a\"").as_deref(),
            Some("clip_1.m4a")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn disposition_names_are_reduced_to_their_last_component() {
        assert_eq!(
            filename_from_disposition("attachment; filename*=UTF-8''..%2F..%2F.bashrc").as_deref(),
            Some(".bashrc")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=\"..\\..\\clip.mp4\"").as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=\"safe.mp4\"; filename*=UTF-8''..").as_deref(),
            Some("safe.mp4")
        );
        assert_eq!(filename_from_disposition("attachment; filename*=UTF-8''%2F"), None);
    }

    #[tokio::test]
    async fn exhausted_anonymous_quota_is_refused_without_a_request() {
        let mut client = DownloadClient::new("http://127.0.0.1:9", None).unwrap();
        client.last_quota = Some(QuotaSnapshot::Metered {
            limit: 5,
            used: 5,
            remaining: 0,
        });

        let mut reports = 0;
        let error = client
            .download("https://youtu.be/abc", MediaKind::Audio, None, |_| reports += 1)
            .await
            .unwrap_err();

        assert!(error.is_limit_reached());
        assert_eq!(reports, 0);
    }
}
