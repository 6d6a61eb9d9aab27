//! Configuration for f1-poller.
//!
//! Loaded from a TOML file, then environment overrides, then CLI overrides.
//! Business logic only ever sees the resulting `PollerConfig`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use f1_common::ClickHouseConfig;
use serde::Deserialize;

use crate::sink::DEFAULT_MAX_BATCH_SIZE;

/// Top-level configuration for f1-poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub log_level: String,
    pub upstream: UpstreamConfig,
    pub polling: PollingConfig,
    pub sink: SinkConfig,
    pub state: StateConfig,
    /// Time between invocations in daemon mode.
    pub trigger_interval: Duration,
}

/// Upstream API access.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Minimum spacing between request starts.
    pub rate_limit_delay: Duration,
    /// Request budget per trailing minute (0 = unlimited).
    pub max_requests_per_minute: u32,
    /// How long after `date_end` a session still counts as active.
    pub session_grace_period: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openf1.org/v1".to_string(),
            request_timeout: Duration::from_secs(5),
            rate_limit_delay: Duration::from_millis(350),
            max_requests_per_minute: 60,
            session_grace_period: Duration::from_secs(300),
        }
    }
}

/// Cycle loop parameters.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub cycle_period: Duration,
    pub cycles_per_invocation: u32,
    /// Hard wall-clock budget of one invocation.
    pub invocation_budget: Duration,
    /// Slack kept before the budget runs out for the final persist.
    pub deadline_margin: Duration,
    /// Persist state after every cycle, not only at the end.
    pub persist_each_cycle: bool,
    /// Thin `car_data` to one record per driver per second.
    pub downsample_car_data: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            cycle_period: Duration::from_secs(5),
            cycles_per_invocation: 11,
            invocation_budget: Duration::from_secs(65),
            deadline_margin: Duration::from_secs(1),
            persist_each_cycle: true,
            downsample_car_data: true,
        }
    }
}

/// Which record sink implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// ClickHouse table named by the stream identifier.
    ClickHouse,
    /// Newline-delimited JSON file at the stream identifier path.
    Jsonl,
}

impl SinkKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "clickhouse" => Some(SinkKind::ClickHouse),
            "jsonl" | "json" | "ndjson" => Some(SinkKind::Jsonl),
            _ => None,
        }
    }
}

/// Record sink settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Sink stream identifier. Required.
    pub stream: Option<String>,
    pub max_batch_size: usize,
    pub clickhouse: ClickHouseConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::ClickHouse,
            stream: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

/// State store settings.
#[derive(Debug, Clone, Default)]
pub struct StateConfig {
    /// State store key identifier. Required.
    pub key: Option<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            upstream: UpstreamConfig::default(),
            polling: PollingConfig::default(),
            sink: SinkConfig::default(),
            state: StateConfig::default(),
            trigger_interval: Duration::from_secs(60),
        }
    }
}

impl PollerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        PollerConfig::try_from(file)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OPENF1_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Some(ms) = lookup("REQUEST_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.upstream.request_timeout = Duration::from_millis(ms);
        }
        if let Some(stream) = lookup("SINK_STREAM") {
            self.sink.stream = Some(stream);
        }
        if let Some(key) = lookup("STATE_KEY") {
            self.state.key = Some(key);
        }
        if let Some(url) = lookup("CLICKHOUSE_URL") {
            self.sink.clickhouse.url = url;
        }
        if let Some(user) = lookup("CLICKHOUSE_USER") {
            self.sink.clickhouse.user = Some(user);
        }
        if let Some(pass) = lookup("CLICKHOUSE_PASSWORD") {
            self.sink.clickhouse.password = Some(pass);
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        base_url: Option<String>,
        sink_stream: Option<String>,
        state_key: Option<String>,
    ) {
        if let Some(url) = base_url {
            self.upstream.base_url = url;
        }
        if let Some(stream) = sink_stream {
            self.sink.stream = Some(stream);
        }
        if let Some(key) = state_key {
            self.state.key = Some(key);
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.sink.stream.as_deref().is_none_or(str::is_empty) {
            bail!("sink stream identifier is required (sink.stream or SINK_STREAM)");
        }
        if self.state.key.as_deref().is_none_or(str::is_empty) {
            bail!("state store key is required (state.key or STATE_KEY)");
        }
        if self.upstream.base_url.is_empty() {
            bail!("upstream base URL must not be empty");
        }
        if self.upstream.request_timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }
        if self.polling.cycle_period.is_zero() {
            bail!("cycle period must be greater than zero");
        }
        if self.polling.cycles_per_invocation == 0 {
            bail!("cycles per invocation must be at least 1");
        }
        if self.polling.invocation_budget <= self.polling.deadline_margin {
            bail!("invocation budget must exceed the deadline margin");
        }
        if self.sink.max_batch_size == 0 {
            bail!("sink max batch size must be at least 1");
        }
        if self.trigger_interval.is_zero() {
            bail!("trigger interval must be greater than zero");
        }
        Ok(())
    }

    /// Sink stream identifier; empty until validated.
    pub fn sink_stream(&self) -> &str {
        self.sink.stream.as_deref().unwrap_or_default()
    }

    /// State store key; empty until validated.
    pub fn state_key(&self) -> &str {
        self.state.key.as_deref().unwrap_or_default()
    }
}

/// TOML file structure for deserialization.
#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    upstream: UpstreamToml,
    #[serde(default)]
    polling: PollingToml,
    #[serde(default)]
    sink: SinkToml,
    #[serde(default)]
    state: StateToml,
    #[serde(default)]
    trigger: TriggerToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UpstreamToml {
    base_url: String,
    request_timeout_ms: u64,
    rate_limit_delay_ms: u64,
    max_requests_per_minute: u32,
    session_grace_period_secs: u64,
}

impl Default for UpstreamToml {
    fn default() -> Self {
        Self {
            base_url: "https://api.openf1.org/v1".to_string(),
            request_timeout_ms: 5000,
            rate_limit_delay_ms: 350,
            max_requests_per_minute: 60,
            session_grace_period_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PollingToml {
    cycle_period_secs: u64,
    cycles_per_invocation: u32,
    invocation_budget_secs: u64,
    deadline_margin_ms: u64,
    persist_each_cycle: bool,
    downsample_car_data: bool,
}

impl Default for PollingToml {
    fn default() -> Self {
        Self {
            cycle_period_secs: 5,
            cycles_per_invocation: 11,
            invocation_budget_secs: 65,
            deadline_margin_ms: 1000,
            persist_each_cycle: true,
            downsample_car_data: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SinkToml {
    kind: String,
    stream: Option<String>,
    max_batch_size: usize,
    clickhouse_url: String,
    clickhouse_database: String,
}

impl Default for SinkToml {
    fn default() -> Self {
        let clickhouse = ClickHouseConfig::default();
        Self {
            kind: "clickhouse".to_string(),
            stream: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            clickhouse_url: clickhouse.url,
            clickhouse_database: clickhouse.database,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StateToml {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TriggerToml {
    interval_secs: u64,
}

impl Default for TriggerToml {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl TryFrom<TomlConfig> for PollerConfig {
    type Error = anyhow::Error;

    fn try_from(toml: TomlConfig) -> Result<Self> {
        let Some(kind) = SinkKind::parse(&toml.sink.kind) else {
            bail!("unknown sink kind: {}", toml.sink.kind);
        };

        Ok(Self {
            log_level: toml.general.log_level,
            upstream: UpstreamConfig {
                base_url: toml.upstream.base_url,
                request_timeout: Duration::from_millis(toml.upstream.request_timeout_ms),
                rate_limit_delay: Duration::from_millis(toml.upstream.rate_limit_delay_ms),
                max_requests_per_minute: toml.upstream.max_requests_per_minute,
                session_grace_period: Duration::from_secs(toml.upstream.session_grace_period_secs),
            },
            polling: PollingConfig {
                cycle_period: Duration::from_secs(toml.polling.cycle_period_secs),
                cycles_per_invocation: toml.polling.cycles_per_invocation,
                invocation_budget: Duration::from_secs(toml.polling.invocation_budget_secs),
                deadline_margin: Duration::from_millis(toml.polling.deadline_margin_ms),
                persist_each_cycle: toml.polling.persist_each_cycle,
                downsample_car_data: toml.polling.downsample_car_data,
            },
            sink: SinkConfig {
                kind,
                stream: toml.sink.stream,
                max_batch_size: toml.sink.max_batch_size,
                clickhouse: ClickHouseConfig {
                    url: toml.sink.clickhouse_url,
                    database: toml.sink.clickhouse_database,
                    user: None,
                    password: None,
                },
            },
            state: StateConfig { key: toml.state.key },
            trigger_interval: Duration::from_secs(toml.trigger.interval_secs),
        })
    }
}
