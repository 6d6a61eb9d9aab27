//! f1-poller: incremental OpenF1 polling engine.
//!
//! This crate provides:
//! - Session detection and one-time dimension emission per session
//! - Tiered per-cycle endpoint scheduling
//! - Cursor-filtered, rate-paced endpoint fetches
//! - Batched envelope forwarding to a record sink
//! - Merge-on-write persistence of per-endpoint cursors

pub mod cadence;
pub mod config;
pub mod controller;
pub mod emitter;
pub mod endpoint;
pub mod session;
pub mod sink;
pub mod state;
pub mod upstream;

pub use config::PollerConfig;
pub use controller::{InvocationOutcome, InvocationReport, PollController, PollerError};
