//! Shared types and utilities for the F1 telemetry poller.
//!
//! This crate contains:
//! - Domain types (Endpoint, Tier, Session, Envelope, PollerState)
//! - ClickHouse client wrapper used by the ClickHouse record sink
//! - Schema definition for the envelope table

pub mod clickhouse;
pub mod types;

pub use clickhouse::{ClickHouseClient, ClickHouseConfig, ClickHouseError};
pub use types::*;
