use std::time::Duration;

use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    StatusCode,
};
use serde_json::Value;

use crate::{errors::BackendError, REQUEST_ID_HEADER};

/// Retry/backoff configuration (defaults use 3 attempts + jittered exponential backoff).
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Jittered exponential backoff for the given attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = if attempt == 0 {
            0
        } else {
            (attempt - 1).min(10)
        };
        let base = self.base_backoff.saturating_mul(2u32.saturating_pow(exp));
        let capped = std::cmp::min(base, self.max_backoff);
        let jitter = 0.5 + fastrand::f64(); // 0.5x .. 1.5x
        let seconds = (capped.as_secs_f64() * jitter).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Structured header list with validation.
#[derive(Clone, Debug, Default)]
pub struct HeaderList(Vec<HeaderEntry>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a header entry. Panics if key or value is empty/whitespace-only.
    ///
    /// # Panics
    /// Panics if the header key or value is empty or contains only whitespace.
    /// This is a fail-fast behavior to catch configuration errors early.
    pub fn push(&mut self, entry: HeaderEntry) {
        assert!(
            entry.is_valid(),
            "Invalid header: key and value must be non-empty (got key={:?}, value={:?})",
            entry.key,
            entry.value
        );
        self.0.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }
}

#[derive(Clone, Debug)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.key.trim().is_empty() || self.value.trim().is_empty())
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in [REQUEST_ID_HEADER, "X-Trace-Id"] {
        if let Some(value) = headers.get(name) {
            if let Ok(s) = value.to_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// True when the response declares a JSON body.
pub(crate) fn is_json_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let mime = v.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Pick the user-facing message out of an error body.
///
/// Candidates, in order: `message`, `detail.message`, the `msg` of every
/// `detail[]` entry joined with `"; "`, and a plain-string `detail`.
pub(crate) fn extract_error_message(value: &Value) -> Option<String> {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };

    if let Some(msg) = value.get("message").and_then(|v| v.as_str()).and_then(non_empty) {
        return Some(msg);
    }
    let detail = value.get("detail")?;
    if let Some(msg) = detail
        .get("message")
        .and_then(|v| v.as_str())
        .and_then(non_empty)
    {
        return Some(msg);
    }
    if let Some(items) = detail.as_array() {
        let joined = items
            .iter()
            .filter_map(|item| item.get("msg").and_then(|v| v.as_str()))
            .filter_map(non_empty)
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    detail.as_str().and_then(non_empty)
}

/// Build the error for a response that is not an event stream.
pub(crate) fn parse_backend_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
) -> BackendError {
    let request_id = request_id_from_headers(headers);
    let fallback = format!("request failed ({})", status.as_u16());

    let parsed = serde_json::from_str::<Value>(&body).ok();
    let message = parsed
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or(fallback);
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_i64());

    BackendError {
        status: status.as_u16(),
        code,
        message,
        request_id,
        raw_body: (!body.is_empty()).then_some(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn backoff_respects_max_and_jitter() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(1),
        };

        let delay = retry.backoff_delay(5);
        assert!(delay <= Duration::from_secs(1));
        assert!(delay >= Duration::from_millis(250));
    }

    #[test]
    fn message_field_wins() {
        let body = json!({"message": "quota exceeded", "detail": "ignored"});
        assert_eq!(extract_error_message(&body).as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn nested_detail_message_is_used() {
        let body = json!({"detail": {"message": "model not found"}});
        assert_eq!(extract_error_message(&body).as_deref(), Some("model not found"));
    }

    #[test]
    fn validation_details_are_joined() {
        let body = json!({"detail": [
            {"loc": ["body", "user_prompt"], "msg": "field required"},
            {"loc": ["body", "session_id"], "msg": "field required"}
        ]});
        assert_eq!(
            extract_error_message(&body).as_deref(),
            Some("field required; field required")
        );
    }

    #[test]
    fn plain_detail_string_is_used() {
        let body = json!({"detail": "Not authenticated"});
        assert_eq!(extract_error_message(&body).as_deref(), Some("Not authenticated"));
    }

    #[test]
    fn falls_back_to_status_when_nothing_matches() {
        let err = parse_backend_error(
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            "<html>bad gateway</html>".to_string(),
        );
        assert_eq!(err.message, "request failed (502)");
        assert_eq!(err.status, 502);
        assert!(err.raw_body.is_some());
    }

    #[test]
    fn envelope_code_is_kept() {
        let err = parse_backend_error(
            StatusCode::OK,
            &HeaderMap::new(),
            json!({"code": 401, "message": "Current user is not logged in", "data": null})
                .to_string(),
        );
        assert_eq!(err.code, Some(401));
        assert_eq!(err.message, "Current user is not logged in");
    }

    #[test]
    fn json_content_type_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(is_json_response(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        assert!(!is_json_response(&headers));
    }

    #[test]
    #[should_panic(expected = "Invalid header")]
    fn header_list_panics_on_whitespace_only() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("   ", "value"));
    }
}
