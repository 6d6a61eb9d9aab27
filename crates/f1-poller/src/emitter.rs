//! Envelope packaging and batched forwarding to the record sink.
//!
//! Emission is best effort: a failed batch is logged and dropped, and the
//! caller carries on. Cursor progress is never tied to sink success.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use f1_common::Envelope;
use serde_json::Value;
use tracing::{debug, warn};

use crate::sink::RecordSink;

/// Outcome of one `emit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Envelopes built.
    pub envelopes: usize,
    /// Envelopes the sink accepted.
    pub sent: usize,
    /// Envelopes lost to failed or partially accepted batches.
    pub dropped: usize,
    /// Sink calls made.
    pub batches: usize,
    /// Sink calls that returned an error.
    pub failed_batches: usize,
}

impl EmitReport {
    /// True when at least one envelope did not reach the sink.
    pub fn is_partial_failure(&self) -> bool {
        self.dropped > 0
    }

    pub fn merge(&mut self, other: EmitReport) {
        self.envelopes += other.envelopes;
        self.sent += other.sent;
        self.dropped += other.dropped;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
    }
}

/// Wraps each record of one endpoint into an envelope.
///
/// All envelopes of a call share the same ingestion timestamp.
pub fn build_envelopes(
    endpoint_name: &str,
    session_key: &str,
    partition_key_field: Option<&str>,
    records: Vec<Value>,
    ingested_at: DateTime<Utc>,
) -> Vec<Envelope> {
    records
        .into_iter()
        .map(|record| {
            Envelope::new(
                endpoint_name,
                session_key,
                ingested_at,
                record,
                partition_key_field,
            )
        })
        .collect()
}

/// Forwards envelopes to a sink in batches no larger than the sink allows.
pub struct EventEmitter {
    sink: Arc<dyn RecordSink>,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    /// Sends `envelopes`, splitting them by the sink's batch limit.
    ///
    /// Never fails: sink errors are logged and counted as dropped envelopes.
    pub async fn emit(&self, envelopes: &[Envelope]) -> EmitReport {
        let mut report = EmitReport {
            envelopes: envelopes.len(),
            ..Default::default()
        };
        if envelopes.is_empty() {
            return report;
        }

        let batch_size = self.sink.max_batch_size().max(1);
        for (i, chunk) in envelopes.chunks(batch_size).enumerate() {
            report.batches += 1;
            match self.sink.put_batch(chunk).await {
                Ok(accepted) => {
                    let accepted = accepted.min(chunk.len());
                    if accepted < chunk.len() {
                        warn!(
                            "Sink accepted {}/{} envelopes of batch {}",
                            accepted,
                            chunk.len(),
                            i
                        );
                    }
                    report.sent += accepted;
                    report.dropped += chunk.len() - accepted;
                }
                Err(e) => {
                    warn!(
                        "Sink batch {} failed, dropping {} envelopes: {}",
                        i,
                        chunk.len(),
                        e
                    );
                    report.failed_batches += 1;
                    report.dropped += chunk.len();
                }
            }
        }

        debug!(
            "Emitted {}/{} envelopes in {} batches",
            report.sent, report.envelopes, report.batches
        );
        report
    }
}
