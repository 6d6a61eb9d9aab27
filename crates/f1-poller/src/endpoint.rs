//! Single-endpoint incremental fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use f1_common::{Endpoint, parse_timestamp, value_to_key};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::upstream::{RequestPacer, UpstreamApi, UpstreamError};

/// A failed poll. The caller skips the endpoint for this cycle and leaves its
/// cursor where it was.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{endpoint}: request timed out")]
    Timeout { endpoint: Endpoint },

    #[error("{endpoint}: rate limited by upstream")]
    RateLimited { endpoint: Endpoint },

    #[error("{endpoint}: HTTP status {status}")]
    Http { endpoint: Endpoint, status: u16 },

    #[error("{endpoint}: transport error: {message}")]
    Transport { endpoint: Endpoint, message: String },

    #[error("{endpoint}: unexpected response body: {message}")]
    InvalidBody { endpoint: Endpoint, message: String },
}

impl EndpointError {
    fn from_upstream(endpoint: Endpoint, err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout => EndpointError::Timeout { endpoint },
            UpstreamError::RateLimited => EndpointError::RateLimited { endpoint },
            UpstreamError::Status(status) => EndpointError::Http { endpoint, status },
            UpstreamError::Transport(message) => EndpointError::Transport { endpoint, message },
            UpstreamError::InvalidBody(message) => EndpointError::InvalidBody { endpoint, message },
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            EndpointError::Timeout { endpoint }
            | EndpointError::RateLimited { endpoint }
            | EndpointError::Http { endpoint, .. }
            | EndpointError::Transport { endpoint, .. }
            | EndpointError::InvalidBody { endpoint, .. } => *endpoint,
        }
    }

    /// Short label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointError::Timeout { .. } => "timeout",
            EndpointError::RateLimited { .. } => "rate_limited",
            EndpointError::Http { .. } => "http_status",
            EndpointError::Transport { .. } => "transport",
            EndpointError::InvalidBody { .. } => "invalid_body",
        }
    }
}

/// Result of a successful poll.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// Records to forward (after downsampling, if enabled).
    pub records: Vec<Value>,
    /// Number of records the upstream returned.
    pub fetched: usize,
    /// Cursor after this poll. Equal to the incoming cursor when the
    /// response carried no newer timestamp.
    pub new_cursor: Option<DateTime<Utc>>,
}

/// Executes bounded, cursor-filtered fetches against one endpoint at a time.
pub struct EndpointPoller {
    upstream: Arc<dyn UpstreamApi>,
    pacer: Arc<RequestPacer>,
    request_timeout: Duration,
    downsample_car_data: bool,
}

impl EndpointPoller {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        pacer: Arc<RequestPacer>,
        request_timeout: Duration,
        downsample_car_data: bool,
    ) -> Self {
        Self {
            upstream,
            pacer,
            request_timeout,
            downsample_car_data,
        }
    }

    /// Fetches records of `endpoint` at or after `cursor` for `session_key`.
    pub async fn poll(
        &self,
        endpoint: Endpoint,
        cursor: Option<DateTime<Utc>>,
        session_key: &str,
    ) -> Result<PollOutcome, EndpointError> {
        let params = query_params(endpoint, cursor, session_key);

        let waited = self.pacer.acquire().await;
        if !waited.is_zero() {
            debug!("{}: paced for {}ms", endpoint, waited.as_millis());
        }

        let records = tokio::time::timeout(
            self.request_timeout,
            self.upstream.get_records(endpoint.path(), &params),
        )
        .await
        .map_err(|_| EndpointError::Timeout { endpoint })?
        .map_err(|e| EndpointError::from_upstream(endpoint, e))?;

        let fetched = records.len();
        let new_cursor = advance_cursor(cursor, &records, endpoint.timestamp_field());

        let records = if endpoint.is_downsampled() && self.downsample_car_data {
            let thinned = downsample_per_second(records, endpoint.timestamp_field());
            debug!("{}: downsampled {} -> {} records", endpoint, fetched, thinned.len());
            thinned
        } else {
            records
        };

        Ok(PollOutcome {
            records,
            fetched,
            new_cursor,
        })
    }
}

/// Builds the query for one poll: session scope plus optional lower bound.
pub fn query_params(
    endpoint: Endpoint,
    cursor: Option<DateTime<Utc>>,
    session_key: &str,
) -> Vec<(String, String)> {
    let mut params = vec![("session_key".to_string(), session_key.to_string())];
    if let Some(cursor) = cursor {
        params.push((
            format!("{}>=", endpoint.timestamp_field()),
            format_cursor(cursor),
        ));
    }
    params
}

/// Renders a cursor the way it is sent upstream.
pub fn format_cursor(cursor: DateTime<Utc>) -> String {
    cursor.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Maximum of the incoming cursor and every parseable record timestamp.
pub fn advance_cursor(
    cursor: Option<DateTime<Utc>>,
    records: &[Value],
    timestamp_field: &str,
) -> Option<DateTime<Utc>> {
    records
        .iter()
        .filter_map(|record| record.get(timestamp_field)?.as_str())
        .filter_map(parse_timestamp)
        .fold(cursor, |max, ts| match max {
            Some(current) if current >= ts => Some(current),
            _ => Some(ts),
        })
}

/// Keeps the last record per driver per one-second bucket.
///
/// Records without a driver number or a parseable timestamp are dropped.
/// Buckets keep the order in which they were first seen.
pub fn downsample_per_second(records: Vec<Value>, timestamp_field: &str) -> Vec<Value> {
    let mut buckets: HashMap<(String, i64), usize> = HashMap::new();
    let mut kept: Vec<Value> = Vec::new();

    for record in records {
        let driver = record.get("driver_number").and_then(value_to_key);
        let second = record
            .get(timestamp_field)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .map(|ts| ts.timestamp());

        let (Some(driver), Some(second)) = (driver, second) else {
            continue;
        };

        match buckets.get(&(driver.clone(), second)) {
            Some(&idx) => kept[idx] = record,
            None => {
                buckets.insert((driver, second), kept.len());
                kept.push(record);
            }
        }
    }

    kept
}
