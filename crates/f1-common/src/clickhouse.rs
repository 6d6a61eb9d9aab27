//! ClickHouse client wrapper for the F1 telemetry poller.
//!
//! Provides batch inserts of envelope rows and schema management.

use clickhouse::Client;
use thiserror::Error;

use crate::{Envelope, EnvelopeRow};

/// Errors that can occur during ClickHouse operations.
#[derive(Debug, Error)]
pub enum ClickHouseError {
    #[error("ClickHouse client error: {0}")]
    Client(#[from] clickhouse::error::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Schema creation failed: {0}")]
    Schema(String),

    #[error("Invalid table name: {0}")]
    InvalidTable(String),
}

/// Configuration for the ClickHouse client.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse HTTP URL (e.g., "http://localhost:8123").
    pub url: String,
    /// Database name.
    pub database: String,
    /// Username (optional).
    pub user: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "f1_telemetry".to_string(),
            user: None,
            password: None,
        }
    }
}

/// ClickHouse client wrapper.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
}

impl ClickHouseClient {
    /// Creates a new ClickHouse client with the given configuration.
    pub fn new(config: ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        Self { client }
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ClickHouseConfig::default())
    }

    /// Tests the connection by running a simple query.
    pub async fn ping(&self) -> Result<(), ClickHouseError> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| ClickHouseError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Creates the envelope table named `table` if it does not exist.
    pub async fn create_envelope_table(&self, table: &str) -> Result<(), ClickHouseError> {
        validate_table_name(table)?;
        let statement = envelope_table_ddl(table);

        self.client
            .query(&statement)
            .execute()
            .await
            .map_err(|e| ClickHouseError::Schema(format!("{}: {}", e, statement)))?;

        Ok(())
    }

    /// Performs a single batch insert of envelopes into `table`.
    pub async fn insert_envelopes(
        &self,
        table: &str,
        envelopes: &[Envelope],
    ) -> Result<(), ClickHouseError> {
        if envelopes.is_empty() {
            return Ok(());
        }
        validate_table_name(table)?;

        let mut insert = self.client.insert(table)?;
        for envelope in envelopes {
            insert.write(&EnvelopeRow::from(envelope)).await?;
        }
        insert.end().await?;
        Ok(())
    }
}

/// Renders the embedded schema for a concrete table name.
fn envelope_table_ddl(table: &str) -> String {
    let schema = include_str!("schema.sql");

    schema
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .replace("{table}", table)
        .trim()
        .trim_end_matches(';')
        .to_string()
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_.]` is allowed.
fn validate_table_name(table: &str) -> Result<(), ClickHouseError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(ClickHouseError::InvalidTable(table.to_string()))
    }
}
