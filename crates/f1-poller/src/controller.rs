//! One polling invocation, end to end.
//!
//! Detect the session, emit dimension data on a session change, run the
//! fixed-length cycle loop, then persist the accumulated state. Nothing
//! inside the loop aborts the invocation; only the final persist can fail it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use f1_common::{Dimension, Endpoint, PollerState, Session};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cadence::{endpoints_for_cycle, tiers_for_cycle};
use crate::config::PollerConfig;
use crate::emitter::{EmitReport, EventEmitter, build_envelopes};
use crate::endpoint::EndpointPoller;
use crate::session::{SessionStatus, SessionTracker};
use crate::sink::RecordSink;
use crate::state::{CursorStore, StateStore, StateStoreError};
use crate::upstream::{RequestPacer, UpstreamApi};

/// Invocation-level failure.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to persist poller state: {0}")]
    StatePersist(#[source] StateStoreError),
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// No live session; nothing polled, state untouched.
    NoSession,
    /// Every configured cycle ran.
    Completed,
    /// The deadline cut the loop short.
    Truncated,
}

/// What happened in one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub index: u32,
    /// Endpoints a poll was started for.
    pub polled: Vec<Endpoint>,
    /// Endpoints skipped after an error, with the error kind.
    pub failed: Vec<(Endpoint, &'static str)>,
    /// Records returned by the upstream, before downsampling.
    pub records_fetched: usize,
    pub emit: EmitReport,
}

/// Result of `PollController::run_invocation`.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub outcome: InvocationOutcome,
    pub session_key: Option<String>,
    /// True when this invocation switched to a new session.
    pub new_session: bool,
    /// Emission of session and roster records, if a new session was seen.
    pub dimension_emit: Option<EmitReport>,
    pub cycles: Vec<CycleSummary>,
    /// State as written by the final persist (or as loaded, on `NoSession`).
    pub final_state: PollerState,
}

impl InvocationReport {
    fn no_session(state: PollerState) -> Self {
        Self {
            outcome: InvocationOutcome::NoSession,
            session_key: None,
            new_session: false,
            dimension_emit: None,
            cycles: Vec::new(),
            final_state: state,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.outcome == InvocationOutcome::Truncated
    }

    pub fn records_fetched(&self) -> usize {
        self.cycles.iter().map(|c| c.records_fetched).sum()
    }

    /// All emission results, dimension batch included.
    pub fn emit_totals(&self) -> EmitReport {
        let mut total = self.dimension_emit.unwrap_or_default();
        for cycle in &self.cycles {
            total.merge(cycle.emit);
        }
        total
    }

    pub fn endpoint_failures(&self) -> usize {
        self.cycles.iter().map(|c| c.failed.len()).sum()
    }

    /// Indices of cycles in which at least one envelope was dropped.
    pub fn cycles_with_sink_failures(&self) -> Vec<u32> {
        self.cycles
            .iter()
            .filter(|c| c.emit.is_partial_failure())
            .map(|c| c.index)
            .collect()
    }
}

/// Loop timing, copied out of `PollerConfig`.
#[derive(Debug, Clone)]
struct LoopSettings {
    cycle_period: Duration,
    cycles: u32,
    budget: Duration,
    margin: Duration,
    rate_limit_delay: Duration,
    request_timeout: Duration,
    persist_each_cycle: bool,
}

/// Runs polling invocations against one upstream, sink and state store.
///
/// A controller may be shared between overlapping invocations; they then
/// share the request pacer and therefore the upstream budget.
pub struct PollController {
    settings: LoopSettings,
    tracker: SessionTracker,
    poller: EndpointPoller,
    emitter: EventEmitter,
    cursors: CursorStore,
    pacer: Arc<RequestPacer>,
}

impl PollController {
    pub fn new(
        config: &PollerConfig,
        upstream: Arc<dyn UpstreamApi>,
        sink: Arc<dyn RecordSink>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let pacer = Arc::new(RequestPacer::new(
            config.upstream.rate_limit_delay,
            config.upstream.max_requests_per_minute,
        ));
        let request_timeout = config.upstream.request_timeout;

        Self {
            settings: LoopSettings {
                cycle_period: config.polling.cycle_period,
                cycles: config.polling.cycles_per_invocation,
                budget: config.polling.invocation_budget,
                margin: config.polling.deadline_margin,
                rate_limit_delay: config.upstream.rate_limit_delay,
                request_timeout,
                persist_each_cycle: config.polling.persist_each_cycle,
            },
            tracker: SessionTracker::new(
                Arc::clone(&upstream),
                Arc::clone(&pacer),
                request_timeout,
                config.upstream.session_grace_period,
            ),
            poller: EndpointPoller::new(
                upstream,
                Arc::clone(&pacer),
                request_timeout,
                config.polling.downsample_car_data,
            ),
            emitter: EventEmitter::new(sink),
            cursors: CursorStore::new(store),
            pacer,
        }
    }

    /// Runs one invocation.
    ///
    /// Returns an error only if the final state persist fails.
    pub async fn run_invocation(&self) -> Result<InvocationReport, PollerError> {
        let started = Instant::now();
        let deadline = started + self.settings.budget;

        let mut state = self.cursors.load().await;
        let status = self.tracker.detect(&state).await;

        let Some(session) = status.session().cloned() else {
            info!("No active session, nothing to poll");
            return Ok(InvocationReport::no_session(state));
        };
        let new_session = matches!(status, SessionStatus::NewSession(_));

        let session_key = session.key.clone();
        let dimension_emit = if new_session {
            info!(
                "New session {} (previous: {:?}), resetting cursors",
                session_key, state.session_key
            );
            state.begin_session(&session_key);
            Some(self.emit_dimensions(&session).await)
        } else {
            debug!("Continuing session {}", session_key);
            None
        };
        state.invocation_count += 1;

        let mut cycles = Vec::with_capacity(self.settings.cycles as usize);
        let mut truncated = false;
        let loop_start = Instant::now();

        for index in 0..self.settings.cycles {
            let mut summary = CycleSummary {
                index,
                ..Default::default()
            };
            let mut envelopes = Vec::new();

            for endpoint in endpoints_for_cycle(index) {
                if self.deadline_imminent(deadline).await {
                    warn!(
                        "Cycle {}: deadline near, skipping {} and the rest of the loop",
                        index, endpoint
                    );
                    truncated = true;
                    break;
                }

                summary.polled.push(endpoint);
                match self
                    .poller
                    .poll(endpoint, state.cursor(endpoint), &session_key)
                    .await
                {
                    Ok(outcome) => {
                        summary.records_fetched += outcome.fetched;
                        if let Some(ts) = outcome.new_cursor {
                            state.advance_cursor(endpoint, ts);
                        }
                        envelopes.extend(build_envelopes(
                            endpoint.as_str(),
                            &session_key,
                            endpoint.partition_key_field(),
                            outcome.records,
                            Utc::now(),
                        ));
                    }
                    Err(e) => {
                        warn!("Cycle {}: skipping {} ({}): {}", index, endpoint, e.kind(), e);
                        summary.failed.push((endpoint, e.kind()));
                    }
                }
            }

            summary.emit = self.emitter.emit(&envelopes).await;
            if summary.emit.is_partial_failure() {
                warn!(
                    "Cycle {}: sink dropped {}/{} envelopes",
                    index, summary.emit.dropped, summary.emit.envelopes
                );
            }
            info!(
                "Cycle {} (tiers {:?}): polled {}, failed {}, fetched {}, sent {}",
                index,
                tiers_for_cycle(index),
                summary.polled.len(),
                summary.failed.len(),
                summary.records_fetched,
                summary.emit.sent
            );
            cycles.push(summary);

            if truncated {
                break;
            }

            if self.settings.persist_each_cycle
                && let Err(e) = self.cursors.save(&state).await
            {
                warn!("Cycle {}: state checkpoint failed: {}", index, e);
            }

            if index + 1 < self.settings.cycles {
                let next = loop_start + self.settings.cycle_period * (index + 1);
                if next + self.settings.margin >= deadline {
                    warn!("Cycle {}: next cycle would overrun the deadline, stopping", index);
                    truncated = true;
                    break;
                }
                tokio::time::sleep_until(next).await;
            }
        }

        let final_state = match self.cursors.save(&state).await {
            Ok(written) => written,
            Err(e) => {
                error!(
                    "Failed to persist state to {} (session={}, invocation={}): {}",
                    self.cursors.key(),
                    session_key,
                    state.invocation_count,
                    e
                );
                return Err(PollerError::StatePersist(e));
            }
        };

        let report = InvocationReport {
            outcome: if truncated {
                InvocationOutcome::Truncated
            } else {
                InvocationOutcome::Completed
            },
            session_key: Some(session_key),
            new_session,
            dimension_emit,
            cycles,
            final_state,
        };

        info!(
            "Invocation {} done: session={}, cycles={}, fetched={}, sent={}, endpoint_failures={}, truncated={}, elapsed={}ms",
            report.final_state.invocation_count,
            report.session_key.as_deref().unwrap_or("-"),
            report.cycles.len(),
            report.records_fetched(),
            report.emit_totals().sent,
            report.endpoint_failures(),
            report.is_truncated(),
            started.elapsed().as_millis()
        );

        Ok(report)
    }

    /// True when one more poll plus the persist margin no longer fits.
    ///
    /// The poll starts no earlier than the pacer's next free slot, which can
    /// be up to a minute away once the per-minute budget is spent.
    async fn deadline_imminent(&self, deadline: Instant) -> bool {
        let next_slot = self.pacer.next_slot().await;
        let start = (Instant::now() + self.settings.rate_limit_delay).max(next_slot);
        start + self.settings.request_timeout + self.settings.margin > deadline
    }

    /// Emits the session record and the driver roster as one batch.
    ///
    /// A roster failure still emits the session record.
    async fn emit_dimensions(&self, session: &Session) -> EmitReport {
        let ingested_at = Utc::now();
        let mut envelopes = build_envelopes(
            Dimension::Sessions.as_str(),
            &session.key,
            None,
            vec![session.raw.clone()],
            ingested_at,
        );

        match self.tracker.fetch_roster(&session.key).await {
            Ok(drivers) => {
                info!("Session {}: {} drivers", session.key, drivers.len());
                envelopes.extend(build_envelopes(
                    Dimension::Drivers.as_str(),
                    &session.key,
                    Some("driver_number"),
                    drivers,
                    ingested_at,
                ));
            }
            Err(e) => {
                warn!(
                    "Session {}: roster fetch failed ({}): {}",
                    session.key,
                    e.kind(),
                    e
                );
            }
        }

        let report = self.emitter.emit(&envelopes).await;
        if report.is_partial_failure() {
            warn!(
                "Session {}: sink dropped {}/{} dimension envelopes",
                session.key, report.dropped, report.envelopes
            );
        }
        report
    }
}
