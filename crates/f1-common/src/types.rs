//! Shared types for the F1 telemetry poller.
//!
//! Timestamps are always `DateTime<Utc>`. Upstream records stay opaque
//! (`serde_json::Value`); only the fields the poller needs (session key,
//! cursor timestamp, partition key) are ever read out of them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of cycles after which every tier has been polled at least once.
pub const CYCLES_PER_FULL_SWEEP: u32 = 6;

/// Partition key used when a record has no per-driver field.
pub const GLOBAL_PARTITION_KEY: &str = "global";

/// Cadence class of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Polled every cycle.
    A,
    /// Polled every 3rd cycle.
    B,
    /// Polled every 6th cycle (coincides with the full sweep).
    C,
}

impl Tier {
    /// Number of cycles between two polls of this tier.
    pub fn every_n_cycles(&self) -> u32 {
        match self {
            Tier::A => 1,
            Tier::B => 3,
            Tier::C => CYCLES_PER_FULL_SWEEP,
        }
    }

    /// Returns true if this tier is due on the given cycle.
    pub fn is_due(&self, cycle_index: u32) -> bool {
        (cycle_index % CYCLES_PER_FULL_SWEEP) % self.every_n_cycles() == 0
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::A => write!(f, "A"),
            Tier::B => write!(f, "B"),
            Tier::C => write!(f, "C"),
        }
    }
}

/// Expected record rate of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeClass {
    Low,
    High,
}

/// Upstream resources polled under the cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Position,
    CarData,
    Laps,
    RaceControl,
    Weather,
    Pit,
}

impl Endpoint {
    /// All polled endpoints, in polling order.
    pub const ALL: [Endpoint; 6] = [
        Endpoint::Position,
        Endpoint::CarData,
        Endpoint::Laps,
        Endpoint::RaceControl,
        Endpoint::Weather,
        Endpoint::Pit,
    ];

    /// Name used in envelopes and as the cursor key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Position => "position",
            Endpoint::CarData => "car_data",
            Endpoint::Laps => "laps",
            Endpoint::RaceControl => "race_control",
            Endpoint::Weather => "weather",
            Endpoint::Pit => "pit",
        }
    }

    /// URL path relative to the upstream base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Position => "/position",
            Endpoint::CarData => "/car_data",
            Endpoint::Laps => "/laps",
            Endpoint::RaceControl => "/race_control",
            Endpoint::Weather => "/weather",
            Endpoint::Pit => "/pit",
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Endpoint::Position | Endpoint::CarData => Tier::A,
            Endpoint::Laps => Tier::B,
            Endpoint::RaceControl | Endpoint::Weather | Endpoint::Pit => Tier::C,
        }
    }

    pub fn volume(&self) -> VolumeClass {
        match self {
            Endpoint::Position | Endpoint::CarData => VolumeClass::High,
            _ => VolumeClass::Low,
        }
    }

    /// Record field holding the timestamp used as cursor.
    ///
    /// Laps carry no `date`; their start time is the only monotonic field.
    pub fn timestamp_field(&self) -> &'static str {
        match self {
            Endpoint::Laps => "date_start",
            _ => "date",
        }
    }

    /// Record field used as sink partition key, if any.
    pub fn partition_key_field(&self) -> Option<&'static str> {
        match self {
            Endpoint::RaceControl | Endpoint::Weather => None,
            _ => Some("driver_number"),
        }
    }

    /// Returns true if responses are thinned to one record per driver-second.
    pub fn is_downsampled(&self) -> bool {
        matches!(self, Endpoint::CarData)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown endpoint: {}", s))
    }
}

/// Resources emitted once per session, outside the cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Sessions,
    Drivers,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Sessions => "sessions",
            Dimension::Drivers => "drivers",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Dimension::Sessions => "/sessions",
            Dimension::Drivers => "/drivers",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Activity status of an upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionActivity {
    Active,
    Ended,
    None,
}

/// A live event window as reported by the upstream session listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Opaque session key, normalized to a string.
    pub key: String,
    pub status: SessionActivity,
    pub date_start: Option<DateTime<Utc>>,
    pub date_end: Option<DateTime<Utc>>,
    /// The upstream record, forwarded as dimension data.
    pub raw: Value,
}

impl Session {
    /// Builds a session from an upstream session record.
    ///
    /// Returns `None` when the record has no usable `session_key`.
    pub fn from_record(record: Value, now: DateTime<Utc>) -> Option<Self> {
        let key = value_to_key(record.get("session_key")?)?;
        let date_start = record
            .get("date_start")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        let date_end = record
            .get("date_end")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);

        let status = match date_end {
            Some(end) if end <= now => SessionActivity::Ended,
            _ => SessionActivity::Active,
        };

        Some(Self {
            key,
            status,
            date_start,
            date_end,
            raw: record,
        })
    }

    /// Returns true if the session is running, or ended no longer than
    /// `grace` ago.
    pub fn is_live(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match self.date_end {
            Some(end) => now - end <= grace,
            None => true,
        }
    }
}

/// Normalizes a JSON scalar (number or string) into a key string.
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses an upstream timestamp.
///
/// Accepts RFC 3339 with offset, and offset-less ISO-8601 (read as UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc());
        }
    }

    None
}

/// Normalized record handed to the sink.
///
/// Serializes to `{endpoint, session_key, ingested_at, data}`; the partition
/// key is sink routing metadata and not part of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub endpoint: String,
    pub session_key: String,
    pub ingested_at: DateTime<Utc>,
    pub data: Value,
    #[serde(skip)]
    pub partition_key: String,
}

impl Envelope {
    /// Wraps one upstream record.
    pub fn new(
        endpoint: &str,
        session_key: &str,
        ingested_at: DateTime<Utc>,
        data: Value,
        partition_key_field: Option<&str>,
    ) -> Self {
        let partition_key = partition_key_field
            .and_then(|field| data.get(field))
            .and_then(value_to_key)
            .unwrap_or_else(|| GLOBAL_PARTITION_KEY.to_string());

        Self {
            endpoint: endpoint.to_string(),
            session_key: session_key.to_string(),
            ingested_at,
            data,
            partition_key,
        }
    }
}

/// Envelope row stored in ClickHouse.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct EnvelopeRow {
    pub endpoint: String,
    pub session_key: String,
    pub partition_key: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingested_at: DateTime<Utc>,
    /// Upstream record as JSON text.
    pub data: String,
}

impl From<&Envelope> for EnvelopeRow {
    fn from(envelope: &Envelope) -> Self {
        Self {
            endpoint: envelope.endpoint.clone(),
            session_key: envelope.session_key.clone(),
            partition_key: envelope.partition_key.clone(),
            ingested_at: envelope.ingested_at,
            data: envelope.data.to_string(),
        }
    }
}

/// Persisted poller state: session, invocation counter, cursor per endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerState {
    pub session_key: Option<String>,
    #[serde(default)]
    pub invocation_count: u64,
    #[serde(default)]
    pub cursors: BTreeMap<String, DateTime<Utc>>,
}

impl PollerState {
    /// Parses a stored state document.
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the cursor for an endpoint, if one has been recorded.
    pub fn cursor(&self, endpoint: Endpoint) -> Option<DateTime<Utc>> {
        self.cursors.get(endpoint.as_str()).copied()
    }

    /// Moves an endpoint's cursor forward. Never moves it backward.
    ///
    /// Returns true if the stored cursor changed.
    pub fn advance_cursor(&mut self, endpoint: Endpoint, ts: DateTime<Utc>) -> bool {
        match self.cursors.get(endpoint.as_str()) {
            Some(current) if *current >= ts => false,
            _ => {
                self.cursors.insert(endpoint.as_str().to_string(), ts);
                true
            }
        }
    }

    /// Switches to a new session: replaces the key and clears every cursor.
    /// The invocation counter is kept so it stays monotonic across sessions.
    pub fn begin_session(&mut self, session_key: &str) {
        self.session_key = Some(session_key.to_string());
        self.cursors.clear();
    }

    /// Merges this (in-memory) state with the currently stored one.
    ///
    /// Within one session every cursor becomes the maximum of both sides.
    /// Across sessions the state with the higher invocation counter wins,
    /// ties going to `self`.
    pub fn merged_with(&self, stored: &PollerState) -> PollerState {
        if stored.session_key != self.session_key {
            return if stored.invocation_count > self.invocation_count {
                stored.clone()
            } else {
                self.clone()
            };
        }

        let mut merged = self.clone();
        merged.invocation_count = self.invocation_count.max(stored.invocation_count);
        for (name, stored_ts) in &stored.cursors {
            merged
                .cursors
                .entry(name.clone())
                .and_modify(|ts| {
                    if *stored_ts > *ts {
                        *ts = *stored_ts;
                    }
                })
                .or_insert(*stored_ts);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 7, 13, 50, secs).unwrap()
    }

    #[test]
    fn test_endpoint_roundtrip_names() {
        for endpoint in Endpoint::ALL {
            assert_eq!(endpoint.as_str().parse::<Endpoint>().unwrap(), endpoint);
        }
        assert!("drivers".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_static_config() {
        assert_eq!(Endpoint::Laps.timestamp_field(), "date_start");
        assert_eq!(Endpoint::Position.timestamp_field(), "date");
        assert_eq!(Endpoint::Weather.partition_key_field(), None);
        assert_eq!(Endpoint::Pit.partition_key_field(), Some("driver_number"));
        assert!(Endpoint::CarData.is_downsampled());
        assert!(!Endpoint::Position.is_downsampled());
        assert_eq!(Endpoint::CarData.volume(), VolumeClass::High);
        assert_eq!(Endpoint::RaceControl.volume(), VolumeClass::Low);
    }

    #[test]
    fn test_tier_due() {
        assert!(Tier::A.is_due(7));
        assert!(Tier::B.is_due(3));
        assert!(Tier::B.is_due(9));
        assert!(!Tier::B.is_due(4));
        assert!(Tier::C.is_due(0));
        assert!(Tier::C.is_due(6));
        assert!(!Tier::C.is_due(3));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2023, 9, 16, 13, 3, 35).unwrap()
            + chrono::Duration::milliseconds(292);

        assert_eq!(parse_timestamp("2023-09-16T13:03:35.292000+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2023-09-16T13:03:35.292Z"), Some(expected));
        assert_eq!(parse_timestamp("2023-09-16T13:03:35.292"), Some(expected));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn test_session_from_record() {
        let now = ts(0);
        let record = json!({
            "session_key": 9839,
            "date_start": "2025-12-07T13:00:00+00:00",
            "date_end": "2025-12-07T15:00:00+00:00",
        });

        let session = Session::from_record(record, now).unwrap();
        assert_eq!(session.key, "9839");
        assert_eq!(session.status, SessionActivity::Active);
        assert!(session.is_live(now, chrono::Duration::minutes(5)));

        assert!(Session::from_record(json!({"meeting_key": 1}), now).is_none());
    }

    #[test]
    fn test_session_grace_period() {
        let record = json!({
            "session_key": "9839",
            "date_end": "2025-12-07T13:00:00+00:00",
        });
        let grace = chrono::Duration::minutes(5);

        let shortly_after = Utc.with_ymd_and_hms(2025, 12, 7, 13, 4, 0).unwrap();
        let session = Session::from_record(record.clone(), shortly_after).unwrap();
        assert_eq!(session.status, SessionActivity::Ended);
        assert!(session.is_live(shortly_after, grace));

        let much_later = Utc.with_ymd_and_hms(2025, 12, 7, 13, 6, 0).unwrap();
        let session = Session::from_record(record, much_later).unwrap();
        assert!(!session.is_live(much_later, grace));
    }

    #[test]
    fn test_envelope_partition_key() {
        let now = ts(0);
        let env = Envelope::new(
            "position",
            "9839",
            now,
            json!({"driver_number": 44, "date": "x"}),
            Some("driver_number"),
        );
        assert_eq!(env.partition_key, "44");

        let env = Envelope::new("weather", "9839", now, json!({"air_temperature": 21.0}), None);
        assert_eq!(env.partition_key, GLOBAL_PARTITION_KEY);
    }

    #[test]
    fn test_envelope_document_shape() {
        let env = Envelope::new("pit", "9839", ts(12), json!({"lap_number": 3}), Some("driver_number"));
        let doc = serde_json::to_value(&env).unwrap();

        assert_eq!(doc["endpoint"], "pit");
        assert_eq!(doc["session_key"], "9839");
        assert_eq!(doc["ingested_at"], "2025-12-07T13:50:12Z");
        assert_eq!(doc["data"]["lap_number"], 3);
        assert!(doc.get("partition_key").is_none());
    }

    #[test]
    fn test_state_parse_empty_defaults() {
        let state = PollerState::from_json(r#"{"session_key": null}"#).unwrap();
        assert_eq!(state, PollerState::default());
        assert!(PollerState::from_json("{not json").is_err());
    }

    #[test]
    fn test_advance_cursor_is_monotonic() {
        let mut state = PollerState::default();
        assert!(state.advance_cursor(Endpoint::Position, ts(10)));
        assert!(!state.advance_cursor(Endpoint::Position, ts(5)));
        assert_eq!(state.cursor(Endpoint::Position), Some(ts(10)));
        assert!(state.advance_cursor(Endpoint::Position, ts(11)));
        assert_eq!(state.cursor(Endpoint::Position), Some(ts(11)));
    }

    #[test]
    fn test_begin_session_clears_cursors() {
        let mut state = PollerState {
            session_key: Some("1".to_string()),
            invocation_count: 7,
            cursors: BTreeMap::new(),
        };
        state.advance_cursor(Endpoint::Laps, ts(1));

        state.begin_session("2");
        assert_eq!(state.session_key.as_deref(), Some("2"));
        assert!(state.cursors.is_empty());
        assert_eq!(state.invocation_count, 7);
    }

    #[test]
    fn test_merge_same_session_takes_max() {
        let mut ours = PollerState {
            session_key: Some("9839".to_string()),
            invocation_count: 4,
            cursors: BTreeMap::new(),
        };
        ours.advance_cursor(Endpoint::Position, ts(20));
        ours.advance_cursor(Endpoint::CarData, ts(5));

        let mut stored = ours.clone();
        stored.invocation_count = 5;
        stored.cursors.clear();
        stored.advance_cursor(Endpoint::Position, ts(10));
        stored.advance_cursor(Endpoint::CarData, ts(30));
        stored.advance_cursor(Endpoint::Weather, ts(2));

        let merged = ours.merged_with(&stored);
        assert_eq!(merged.invocation_count, 5);
        assert_eq!(merged.cursor(Endpoint::Position), Some(ts(20)));
        assert_eq!(merged.cursor(Endpoint::CarData), Some(ts(30)));
        assert_eq!(merged.cursor(Endpoint::Weather), Some(ts(2)));
    }

    #[test]
    fn test_merge_different_session_by_counter() {
        let ours = PollerState {
            session_key: Some("2".to_string()),
            invocation_count: 3,
            cursors: BTreeMap::new(),
        };
        let stored = PollerState {
            session_key: Some("1".to_string()),
            invocation_count: 3,
            cursors: BTreeMap::new(),
        };
        assert_eq!(ours.merged_with(&stored), ours);

        let newer = PollerState {
            invocation_count: 9,
            ..stored
        };
        assert_eq!(ours.merged_with(&newer), newer);
    }
}
