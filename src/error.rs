use std::fmt;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::quota::ANONYMOUS_DOWNLOAD_LIMIT;

const REDACTED_DETAIL: &str = "Internal server error";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    used: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QuotaFields {
    limit: u32,
    used: u32,
    remaining: u32,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    quota: Option<QuotaFields>,
    retry_after_seconds: Option<u64>,
    fields: Vec<FieldError>,
    detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, code: Option<&'static str>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            quota: None,
            retry_after_seconds: None,
            fields: Vec::new(),
            detail: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, Some("INVALID_REQUEST"))
    }

    pub fn validation(fields: Vec<FieldError>) -> Self {
        let mut error = Self::new(
            StatusCode::BAD_REQUEST,
            "Validation failed",
            Some("VALIDATION_FAILED"),
        );
        error.fields = fields;
        error
    }

    /// Private, live, over-duration or otherwise unusable assets. The message is
    /// shown to the caller as-is, so it must not carry resolver internals.
    pub fn asset_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, Some("ASSET_UNAVAILABLE"))
    }

    pub fn quota_exceeded(used: u32) -> Self {
        let mut error = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Download limit exceeded. You have used all {ANONYMOUS_DOWNLOAD_LIMIT} free downloads. Please login for unlimited downloads."
            ),
            Some("DOWNLOAD_LIMIT_EXCEEDED"),
        );
        error.quota = Some(QuotaFields {
            limit: ANONYMOUS_DOWNLOAD_LIMIT,
            used,
            remaining: 0,
        });
        error
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: u64) -> Self {
        let mut error = Self::new(StatusCode::TOO_MANY_REQUESTS, message, Some("RATE_LIMITED"));
        error.retry_after_seconds = Some(retry_after_seconds);
        error
    }

    /// Attaches the caller's anonymous quota counters to the body.
    pub fn with_quota(mut self, used: u32, remaining: u32) -> Self {
        self.quota = Some(QuotaFields {
            limit: ANONYMOUS_DOWNLOAD_LIMIT,
            used,
            remaining,
        });
        self
    }

    pub fn timeout() -> Self {
        Self::new(
            StatusCode::REQUEST_TIMEOUT,
            "Download timeout",
            Some("DOWNLOAD_TIMEOUT"),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message, Some("NOT_FOUND"))
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message, Some("PAYLOAD_TOO_LARGE"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, None)
    }

    /// An unclassified fault. `detail` reaches the caller only when
    /// `expose_detail` is set (development mode).
    pub fn internal_fault(
        message: impl Into<String>,
        detail: impl fmt::Display,
        expose_detail: bool,
    ) -> Self {
        let mut error = Self::internal(message);
        error.detail = Some(if expose_detail {
            detail.to_string()
        } else {
            REDACTED_DETAIL.to_string()
        });
        error
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after_seconds
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            message: self.message,
            code: self.code,
            limit: self.quota.map(|quota| quota.limit),
            used: self.quota.map(|quota| quota.used),
            remaining: self.quota.map(|quota| quota.remaining),
            retry_after_seconds: self.retry_after_seconds,
            fields: self.fields,
            error: self.detail,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
