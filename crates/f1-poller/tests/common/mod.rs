//! Scripted upstream, recording sink and config helpers shared by the
//! controller tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use f1_common::{Endpoint, Envelope, PollerState};
use serde_json::{Value, json};
use tokio::time::Instant;

use f1_poller::config::PollerConfig;
use f1_poller::sink::{RecordSink, SinkError};
use f1_poller::state::MemoryStateStore;
use f1_poller::upstream::{UpstreamApi, UpstreamError};

pub const SESSION_KEY: &str = "9839";

/// Default timestamp base for served records.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 7, 13, 0, 0).unwrap()
}

/// Config with both required identifiers filled in.
pub fn test_config() -> PollerConfig {
    let mut config = PollerConfig::default();
    config.sink.stream = Some("test_envelopes".to_string());
    config.state.key = Some("memory".to_string());
    config
}

/// How the fake answers polls of one endpoint.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Two records (drivers 1 and 44), one second newer on every call.
    Records,
    Empty,
    Status(u16),
    RateLimited,
    /// Never answers within any sane timeout.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub at: Instant,
}

impl Request {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub struct FakeUpstream {
    session: Option<Value>,
    sessions_status: Option<u16>,
    roster_status: Option<u16>,
    roster: Vec<Value>,
    behaviors: HashMap<Endpoint, Behavior>,
    bases: HashMap<Endpoint, DateTime<Utc>>,
    calls: Mutex<HashMap<Endpoint, i64>>,
    served_max: Mutex<HashMap<Endpoint, DateTime<Utc>>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeUpstream {
    /// Upstream with no running session.
    pub fn idle() -> Self {
        Self {
            session: None,
            sessions_status: None,
            roster_status: None,
            roster: Vec::new(),
            behaviors: HashMap::new(),
            bases: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            served_max: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Upstream reporting `session_key` as running, with a 20-driver roster.
    pub fn live(session_key: &str) -> Self {
        let mut upstream = Self::idle();
        upstream.session = Some(json!({
            "session_key": session_key.parse::<i64>().unwrap(),
            "session_name": "Race",
            "date_start": "2025-12-07T13:00:00+00:00",
            "date_end": null,
        }));
        upstream.with_roster(20)
    }

    pub fn with_roster(mut self, drivers: usize) -> Self {
        self.roster = (0..drivers)
            .map(|i| json!({"driver_number": i + 1, "name_acronym": format!("D{:02}", i + 1)}))
            .collect();
        self
    }

    pub fn failing_session_lookup(mut self, status: u16) -> Self {
        self.sessions_status = Some(status);
        self
    }

    pub fn failing_roster(mut self, status: u16) -> Self {
        self.roster_status = Some(status);
        self
    }

    pub fn with_behavior(mut self, endpoint: Endpoint, behavior: Behavior) -> Self {
        self.behaviors.insert(endpoint, behavior);
        self
    }

    pub fn with_base(mut self, endpoint: Endpoint, base: DateTime<Utc>) -> Self {
        self.bases.insert(endpoint, base);
        self
    }

    /// Newest record timestamp served for `endpoint`.
    pub fn served_max(&self, endpoint: Endpoint) -> Option<DateTime<Utc>> {
        self.served_max.lock().unwrap().get(&endpoint).copied()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, endpoint: Endpoint) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == endpoint.path())
            .collect()
    }

    fn serve_records(&self, endpoint: Endpoint) -> Vec<Value> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(endpoint).or_insert(0);
            *n += 1;
            *n
        };
        let base = self.bases.get(&endpoint).copied().unwrap_or_else(base_time);
        let ts = base + chrono::Duration::seconds(n);

        self.served_max
            .lock()
            .unwrap()
            .entry(endpoint)
            .and_modify(|max| *max = (*max).max(ts))
            .or_insert(ts);

        [1, 44]
            .into_iter()
            .map(|driver| {
                let mut record = json!({
                    "session_key": 9839,
                    "driver_number": driver,
                });
                record[endpoint.timestamp_field()] = json!(ts.to_rfc3339());
                record
            })
            .collect()
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn get_records(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, UpstreamError> {
        self.requests.lock().unwrap().push(Request {
            path: path.to_string(),
            params: params.to_vec(),
            at: Instant::now(),
        });

        match path {
            "/sessions" => match self.sessions_status {
                Some(status) => Err(UpstreamError::Status(status)),
                None => Ok(self.session.iter().cloned().collect()),
            },
            "/drivers" => match self.roster_status {
                Some(status) => Err(UpstreamError::Status(status)),
                None => Ok(self.roster.clone()),
            },
            _ => {
                let endpoint = Endpoint::ALL
                    .into_iter()
                    .find(|e| e.path() == path)
                    .unwrap_or_else(|| panic!("unexpected path {}", path));

                match self.behaviors.get(&endpoint).copied().unwrap_or(Behavior::Records) {
                    Behavior::Records => Ok(self.serve_records(endpoint)),
                    Behavior::Empty => Ok(Vec::new()),
                    Behavior::Status(status) => Err(UpstreamError::Status(status)),
                    Behavior::RateLimited => Err(UpstreamError::RateLimited),
                    Behavior::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(Vec::new())
                    }
                }
            }
        }
    }
}

/// Sink that records every accepted batch and fails the listed calls.
pub struct RecordingSink {
    max: usize,
    fail_calls: Vec<usize>,
    calls: Mutex<usize>,
    batches: Mutex<Vec<Vec<Envelope>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::failing_on(Vec::new())
    }

    /// Fails the zero-based sink calls in `fail_calls`.
    pub fn failing_on(fail_calls: Vec<usize>) -> Self {
        Self {
            max: 500,
            fail_calls,
            calls: Mutex::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn envelopes_for(&self, endpoint: &str) -> usize {
        self.batches()
            .iter()
            .flatten()
            .filter(|e| e.endpoint == endpoint)
            .count()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    fn max_batch_size(&self) -> usize {
        self.max
    }

    async fn put_batch(&self, batch: &[Envelope]) -> Result<usize, SinkError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        if self.fail_calls.contains(&call) {
            return Err(SinkError::Unavailable("stream unreachable".to_string()));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(batch.len())
    }
}

/// State document for a session already being polled.
pub fn same_session_document(invocation_count: u64) -> String {
    PollerState {
        session_key: Some(SESSION_KEY.to_string()),
        invocation_count,
        ..Default::default()
    }
    .to_json()
    .unwrap()
}

pub fn stored_state(store: &MemoryStateStore) -> PollerState {
    PollerState::from_json(&store.document().expect("state was written")).unwrap()
}
