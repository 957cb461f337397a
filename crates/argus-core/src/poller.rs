//! Adaptive-backoff polling of the aggregator's job-status endpoint.
//!
//! Each active scan occupies one lightweight scheduled task, not a thread.
//! The loop outlives the request that started it: submission returns
//! immediately while the poller keeps fetching, updating the store, and
//! publishing snapshots until the job reaches a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::NotificationBus;
use crate::error::ScanError;
use crate::fingerprint::Fingerprint;
use crate::scan::{JobState, ScanState, ScanUpdate};
use crate::traits::{AggregatorClient, ResultStore};

/// Backoff and budget knobs for the polling loop.
///
/// The multiplier, ceiling, and budget were tuned empirically; treat them
/// as configuration, not contract.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Fixed delay before the first status fetch, giving the aggregator
    /// a moment to begin work.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each successful-but-unfinished
    /// fetch.
    pub backoff_factor: f64,
    /// Gentler multiplier applied after a transient fetch error, so slow
    /// upstreams are not punished as hard as slow analyses.
    pub error_backoff_factor: f64,
    /// Ceiling on the adaptive delay.
    pub max_delay: Duration,
    /// Fetch budget before switching to long-running mode.
    pub max_attempts: u32,
    /// Fixed interval of the indefinite long-running mode. The aggregator
    /// may take unbounded time; a slow job is never reported as failed.
    pub long_poll_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            error_backoff_factor: 1.5,
            max_delay: Duration::from_secs(300),
            max_attempts: 20,
            long_poll_interval: Duration::from_secs(600),
        }
    }
}

impl PollConfig {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_long_poll_interval(mut self, interval: Duration) -> Self {
        self.long_poll_interval = interval;
        self
    }

    /// Next delay after the current one, grown by `factor` and capped.
    fn next_delay(&self, current: Duration, factor: f64) -> Duration {
        let grown = Duration::from_secs_f64(current.as_secs_f64() * factor);
        std::cmp::min(grown, self.max_delay)
    }
}

/// Manages the retry/backoff timeline of scan jobs until completion.
///
/// At most one loop is live per scan id; `start` on an already-live scan
/// is a no-op. Loops hold no lock while suspended and deregister
/// themselves on exit.
#[derive(Clone)]
pub struct PollScheduler<S, A>
where
    S: ResultStore,
    A: AggregatorClient,
{
    store: S,
    client: A,
    bus: NotificationBus,
    config: PollConfig,
    live: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl<S, A> PollScheduler<S, A>
where
    S: ResultStore + 'static,
    A: AggregatorClient + 'static,
{
    pub fn new(store: S, client: A, bus: NotificationBus, config: PollConfig) -> Self {
        Self {
            store,
            client,
            bus,
            config,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin polling a job. Returns `false` (and does nothing) if a loop
    /// is already live for this scan.
    ///
    /// Also fires a one-shot direct check of the by-fingerprint report
    /// endpoint, which sometimes resolves faster than the job-status
    /// endpoint; whichever finishes first wins and the loser's result is
    /// discarded by the store's terminal guard.
    pub fn start(&self, scan_id: Uuid, job_id: String, fingerprint: Fingerprint) -> bool {
        let cancel = {
            let mut live = self.live.lock().unwrap();
            if live.contains_key(&scan_id) {
                tracing::debug!(scan_id = %scan_id, "Poll loop already live, start is a no-op");
                return false;
            }
            let cancel = CancellationToken::new();
            live.insert(scan_id, cancel.clone());
            cancel
        };

        tracing::info!(scan_id = %scan_id, job_id = %job_id, "Poll loop started");

        tokio::spawn(direct_check(
            self.store.clone(),
            self.client.clone(),
            self.bus.clone(),
            scan_id,
            fingerprint,
        ));

        let store = self.store.clone();
        let client = self.client.clone();
        let bus = self.bus.clone();
        let config = self.config.clone();
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            run_loop(&store, &client, &bus, &config, cancel, scan_id, job_id).await;
            live.lock().unwrap().remove(&scan_id);
        });

        true
    }

    /// Cancel a live loop (process shutdown). Returns `false` if none.
    pub fn stop(&self, scan_id: Uuid) -> bool {
        let live = self.live.lock().unwrap();
        match live.get(&scan_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, scan_id: Uuid) -> bool {
        self.live.lock().unwrap().contains_key(&scan_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

/// The main fetch → evaluate → reschedule loop for one job.
async fn run_loop<S, A>(
    store: &S,
    client: &A,
    bus: &NotificationBus,
    config: &PollConfig,
    cancel: CancellationToken,
    scan_id: Uuid,
    job_id: String,
) where
    S: ResultStore,
    A: AggregatorClient,
{
    let mut delay = config.initial_delay;
    let mut attempts: u32 = 0;
    let mut long_mode = false;

    loop {
        // Suspend with no locks held.
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                tracing::info!(scan_id = %scan_id, "Poll loop cancelled");
                return;
            }
        }

        // The direct check (or a competing writer) may already have
        // finished this scan.
        match store.get(scan_id).await {
            Ok(Some(record)) if record.is_terminal() => {
                tracing::debug!(scan_id = %scan_id, state = %record.state, "Scan already terminal, stopping poll");
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(scan_id = %scan_id, "Scan record vanished, stopping poll");
                return;
            }
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "Store read failed, will retry");
                continue;
            }
        }

        match client.fetch_status(&job_id).await {
            Ok(snapshot) => {
                attempts += 1;
                let state = snapshot.scan_state();
                let mut update = ScanUpdate::state(state);
                if let JobState::Failed { reason } = &snapshot.state {
                    update = update.with_error(reason.clone());
                }
                if let Some(report) = snapshot.report {
                    update = update.with_report(report);
                }

                if apply_and_publish(store, bus, scan_id, update).await {
                    tracing::info!(scan_id = %scan_id, job_id = %job_id, state = %state, "Scan reached terminal state");
                    return;
                }

                delay = config.next_delay(delay, config.backoff_factor);
            }
            Err(e) if e.is_retryable() => {
                attempts += 1;
                delay = config.next_delay(delay, config.error_backoff_factor);
                tracing::warn!(
                    scan_id = %scan_id,
                    job_id = %job_id,
                    error = %e,
                    next_delay_secs = delay.as_secs(),
                    "Transient fetch error, will retry"
                );
            }
            Err(e) => {
                // Permanent upstream error: the scan fails with a reason.
                tracing::warn!(scan_id = %scan_id, job_id = %job_id, error = %e, "Permanent fetch error, failing scan");
                let update = ScanUpdate::state(ScanState::Failed).with_error(e.to_string());
                apply_and_publish(store, bus, scan_id, update).await;
                return;
            }
        }

        if !long_mode && attempts >= config.max_attempts {
            long_mode = true;
            tracing::info!(
                scan_id = %scan_id,
                job_id = %job_id,
                attempts,
                interval_secs = config.long_poll_interval.as_secs(),
                "Poll budget exhausted, switching to long-running mode"
            );
        }
        if long_mode {
            delay = config.long_poll_interval;
        }
    }
}

/// One-shot query of the by-fingerprint report endpoint, raced against
/// the first poll of the status endpoint.
async fn direct_check<S, A>(
    store: S,
    client: A,
    bus: NotificationBus,
    scan_id: Uuid,
    fingerprint: Fingerprint,
) where
    S: ResultStore,
    A: AggregatorClient,
{
    match client.fetch_report(&fingerprint.sha256).await {
        Ok(Some(report)) if report.has_verdicts() => {
            tracing::info!(
                scan_id = %scan_id,
                fingerprint = fingerprint.short(),
                engines = report.summary.total(),
                "Direct check resolved scan from existing report"
            );
            let update = ScanUpdate::state(ScanState::Completed).with_report(report);
            apply_and_publish(&store, &bus, scan_id, update).await;
        }
        Ok(_) => {
            tracing::debug!(scan_id = %scan_id, fingerprint = fingerprint.short(), "Direct check: content not yet known");
        }
        Err(e) => {
            // Best effort only; the main loop carries the scan.
            tracing::debug!(scan_id = %scan_id, error = %e, "Direct check failed, ignoring");
        }
    }
}

/// Funnel a snapshot through the store's guarded update, publishing only
/// when the patch actually applied (a stale or post-terminal patch is
/// swallowed, so observers see exactly one terminal event).
///
/// Returns true once the stored record is terminal.
async fn apply_and_publish<S: ResultStore>(
    store: &S,
    bus: &NotificationBus,
    scan_id: Uuid,
    update: ScanUpdate,
) -> bool {
    let observed_at = update.observed_at;
    match store.update(scan_id, update).await {
        Ok(record) => {
            let applied = record.updated_at == observed_at;
            if applied {
                bus.publish(scan_id, record.state, record.report.clone(), record.error.clone());
            }
            record.is_terminal()
        }
        Err(ScanError::NotFound(_)) => {
            tracing::error!(scan_id = %scan_id, "Scan record vanished during update");
            true
        }
        Err(e) => {
            tracing::error!(scan_id = %scan_id, error = %e, "Store update failed");
            false
        }
    }
}
