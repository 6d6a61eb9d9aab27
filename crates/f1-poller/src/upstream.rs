//! OpenF1 REST access.
//!
//! `UpstreamApi` is the seam between the polling engine and HTTP: the engine
//! only ever asks for "the JSON array at this path with these query params".
//! `RequestPacer` spaces request starts so the whole invocation stays inside
//! the upstream budget (requests per second and per minute).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Length of the sliding window for the per-minute budget.
const BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Errors returned by the upstream API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response body: {0}")]
    InvalidBody(String),
}

impl UpstreamError {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::RateLimited => "rate_limited",
            UpstreamError::Status(_) => "http_status",
            UpstreamError::Transport(_) => "transport",
            UpstreamError::InvalidBody(_) => "invalid_body",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() {
            UpstreamError::InvalidBody(e.to_string())
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// Read access to the upstream REST resource family.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Fetches the JSON array served at `path` for the given query params.
    async fn get_records(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, UpstreamError>;
}

/// HTTP client for the OpenF1 API.
pub struct OpenF1Client {
    http: Client,
    base_url: String,
}

impl OpenF1Client {
    /// Creates a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl UpstreamApi for OpenF1Client {
    async fn get_records(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, params);

        let response = self.http.get(&url).query(params).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited);
        }
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        match response.json::<Value>().await? {
            Value::Array(records) => Ok(records),
            other => Err(UpstreamError::InvalidBody(format!(
                "expected JSON array, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Spaces upstream requests by arrival time.
///
/// Every request start waits until at least `min_spacing` has passed since
/// the previous start, and until fewer than `max_per_minute` starts fall in
/// the trailing minute. Waiters are served in order; the lock is held while
/// sleeping so concurrent callers cannot claim the same slot.
pub struct RequestPacer {
    min_spacing: Duration,
    max_per_minute: u32,
    starts: Mutex<VecDeque<Instant>>,
}

impl RequestPacer {
    /// `max_per_minute == 0` disables the per-minute budget.
    pub fn new(min_spacing: Duration, max_per_minute: u32) -> Self {
        Self {
            min_spacing,
            max_per_minute,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// A pacer that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Waits for the next request slot and claims it.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut starts = self.starts.lock().await;
        let now = Instant::now();
        let ready_at = self.ready_at(&mut starts, now);

        if ready_at > now {
            tokio::time::sleep_until(ready_at).await;
        }

        starts.push_back(ready_at);
        ready_at - now
    }

    /// Earliest instant the next request could start, without claiming it.
    pub async fn next_slot(&self) -> Instant {
        let mut starts = self.starts.lock().await;
        self.ready_at(&mut starts, Instant::now())
    }

    fn ready_at(&self, starts: &mut VecDeque<Instant>, now: Instant) -> Instant {
        while let Some(&oldest) = starts.front() {
            if now.duration_since(oldest) >= BUDGET_WINDOW {
                starts.pop_front();
            } else {
                break;
            }
        }

        let mut ready_at = now;
        if let Some(&last) = starts.back() {
            ready_at = ready_at.max(last + self.min_spacing);
        }
        let budget = self.max_per_minute as usize;
        if budget > 0 && starts.len() >= budget {
            let oldest_in_window = starts[starts.len() - budget];
            ready_at = ready_at.max(oldest_in_window + BUDGET_WINDOW);
        }
        ready_at
    }
}
