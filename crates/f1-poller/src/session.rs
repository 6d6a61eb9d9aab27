//! Active-session detection and per-session dimension data.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use f1_common::{Dimension, PollerState, Session};
use serde_json::Value;
use tracing::{info, warn};

use crate::upstream::{RequestPacer, UpstreamApi, UpstreamError};

/// What the session listing says relative to the stored state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// Nothing is running (or the lookup failed).
    NoSession,
    /// A session is running and it is not the one in the stored state.
    NewSession(Session),
    /// The stored session is still running.
    SameSession(Session),
}

impl SessionStatus {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionStatus::NoSession => None,
            SessionStatus::NewSession(s) | SessionStatus::SameSession(s) => Some(s),
        }
    }
}

/// Queries the upstream session listing.
pub struct SessionTracker {
    upstream: Arc<dyn UpstreamApi>,
    pacer: Arc<RequestPacer>,
    request_timeout: Duration,
    grace_period: chrono::Duration,
}

impl SessionTracker {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        pacer: Arc<RequestPacer>,
        request_timeout: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            upstream,
            pacer,
            request_timeout,
            grace_period: chrono::Duration::from_std(grace_period)
                .unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// Classifies the latest upstream session against `state`.
    ///
    /// Upstream failures are logged and reported as `NoSession`: an
    /// invocation that cannot confirm a session does no work.
    pub async fn detect(&self, state: &PollerState) -> SessionStatus {
        let params = [("session_key".to_string(), "latest".to_string())];
        let records = match self.fetch(Dimension::Sessions.path(), &params).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Session lookup failed ({}): {}", e.kind(), e);
                return SessionStatus::NoSession;
            }
        };

        let now = Utc::now();
        let Some(session) = records
            .into_iter()
            .next()
            .and_then(|record| Session::from_record(record, now))
        else {
            return SessionStatus::NoSession;
        };

        if !session.is_live(now, self.grace_period) {
            info!(
                "Session {} ended at {:?} (more than {}m ago), no active session",
                session.key,
                session.date_end,
                self.grace_period.num_minutes()
            );
            return SessionStatus::NoSession;
        }

        if state.session_key.as_deref() == Some(session.key.as_str()) {
            SessionStatus::SameSession(session)
        } else {
            SessionStatus::NewSession(session)
        }
    }

    /// Fetches the driver roster of a session.
    pub async fn fetch_roster(&self, session_key: &str) -> Result<Vec<Value>, UpstreamError> {
        let params = [("session_key".to_string(), session_key.to_string())];
        self.fetch(Dimension::Drivers.path(), &params).await
    }

    async fn fetch(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, UpstreamError> {
        self.pacer.acquire().await;
        tokio::time::timeout(self.request_timeout, self.upstream.get_records(path, params))
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }
}
