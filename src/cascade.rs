/*!
 * CascadeDetector
 * Sliding-window rate of anomalies; state machine normal <-> cascade; a
 * settling countdown that backpressures the queue while a cascade is fresh.
 *
 * Modeled as an independent serial actor: a single
 * `tokio::spawn`ed task owns all mutable state, generalizing
 * `process::scheduler_task::SchedulerTask`'s command-channel + periodic-tick
 * loop from process scheduling to cascade bookkeeping.
 */

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::signals::{emit, SignalCategory, SignalEmitter, SignalPayload};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Sentinel returned by `max_concurrent_proposals` outside of a cascade.
pub const UNBOUNDED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStatus {
    Normal,
    Cascade,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSnapshot {
    pub status: CascadeStatus,
    pub rate: usize,
    pub cascades_detected: u64,
    pub total_anomalies: u64,
    pub settling_cycles_remaining: u32,
}

#[derive(Debug, Default)]
struct CascadeState {
    anomaly_times: VecDeque<u64>,
    in_cascade: bool,
    cascade_started_at: Option<u64>,
    last_above_threshold_at: Option<u64>,
    settling_cycles_remaining: u32,
    cascades_detected: u64,
    total_anomalies: u64,
}

enum Command {
    RecordAnomaly,
    PollingCycleCompleted,
    ShouldSettle(oneshot::Sender<bool>),
    MaxConcurrentProposals(oneshot::Sender<usize>),
    DedupMultiplier(oneshot::Sender<f64>),
    Snapshot(oneshot::Sender<CascadeSnapshot>),
    Reset,
}

/// Handle to the cascade-detector actor. Cheap to clone (wraps a channel
/// sender); every clone talks to the same background task.
#[derive(Debug, Clone)]
pub struct CascadeDetector {
    tx: mpsc::UnboundedSender<Command>,
}

impl CascadeDetector {
    /// Spawn the actor. The returned `JoinHandle` is owned by the caller
    /// (the supervisor) so it can detect a crashed task and respawn.
    pub fn spawn(
        config: Arc<Config>,
        clock: Arc<dyn MonotonicClock>,
        emitter: SignalEmitter,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ticker = tokio::time::interval(Duration::from_millis(config.check_interval_ms));
        let handle = tokio::spawn(run(CascadeState::default(), config, clock, emitter, rx, ticker));
        (Self { tx }, handle)
    }

    pub fn record_anomaly(&self) {
        let _ = self.tx.send(Command::RecordAnomaly);
    }

    pub fn polling_cycle_completed(&self) {
        let _ = self.tx.send(Command::PollingCycleCompleted);
    }

    pub async fn should_settle(&self) -> bool {
        self.request(Command::ShouldSettle).await.unwrap_or(false)
    }

    pub async fn max_concurrent_proposals(&self) -> usize {
        self.request(Command::MaxConcurrentProposals)
            .await
            .unwrap_or(UNBOUNDED)
    }

    pub async fn dedup_multiplier(&self) -> f64 {
        self.request(Command::DedupMultiplier).await.unwrap_or(1.0)
    }

    pub async fn snapshot(&self) -> CascadeSnapshot {
        self.request(Command::Snapshot).await.unwrap_or(CascadeSnapshot {
            status: CascadeStatus::Normal,
            rate: 0,
            cascades_detected: 0,
            total_anomalies: 0,
            settling_cycles_remaining: 0,
        })
    }

    pub fn reset(&self) {
        let _ = self.tx.send(Command::Reset);
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).ok()?;
        reply_rx.await.ok()
    }
}

async fn run(
    mut state: CascadeState,
    config: Arc<Config>,
    clock: Arc<dyn MonotonicClock>,
    emitter: SignalEmitter,
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut ticker: tokio::time::Interval,
) {
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => handle(&mut state, &config, clock.as_ref(), &emitter, cmd),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                cleanup_tick(&mut state, &config, clock.as_ref(), &emitter);
            }
        }
    }
}

fn handle(
    state: &mut CascadeState,
    config: &Config,
    clock: &dyn MonotonicClock,
    emitter: &SignalEmitter,
    cmd: Command,
) {
    match cmd {
        Command::RecordAnomaly => record_anomaly(state, config, clock, emitter),
        Command::PollingCycleCompleted => {
            state.settling_cycles_remaining = state.settling_cycles_remaining.saturating_sub(1);
        }
        Command::ShouldSettle(reply) => {
            let _ = reply.send(state.in_cascade && state.settling_cycles_remaining > 0);
        }
        Command::MaxConcurrentProposals(reply) => {
            let value = if state.in_cascade {
                config.max_concurrent_proposals
            } else {
                UNBOUNDED
            };
            let _ = reply.send(value);
        }
        Command::DedupMultiplier(reply) => {
            let _ = reply.send(if state.in_cascade { 0.2 } else { 1.0 });
        }
        Command::Snapshot(reply) => {
            let now = clock.now_ms();
            let rate = rate_in_window(&state.anomaly_times, now, config.cascade_window_ms);
            let _ = reply.send(CascadeSnapshot {
                status: if state.in_cascade {
                    CascadeStatus::Cascade
                } else {
                    CascadeStatus::Normal
                },
                rate,
                cascades_detected: state.cascades_detected,
                total_anomalies: state.total_anomalies,
                settling_cycles_remaining: state.settling_cycles_remaining,
            });
        }
        Command::Reset => {
            *state = CascadeState::default();
        }
    }
}

fn rate_in_window(times: &VecDeque<u64>, now: u64, window_ms: u64) -> usize {
    let cutoff = now.saturating_sub(window_ms);
    times.iter().filter(|&&t| t >= cutoff).count()
}

fn record_anomaly(state: &mut CascadeState, config: &Config, clock: &dyn MonotonicClock, emitter: &SignalEmitter) {
    let now = clock.now_ms();
    state.anomaly_times.push_back(now);
    state.total_anomalies += 1;

    let cutoff = now.saturating_sub(config.cascade_window_ms);
    while matches!(state.anomaly_times.front(), Some(&t) if t < cutoff) {
        state.anomaly_times.pop_front();
    }
    let rate = state.anomaly_times.len();

    match (state.in_cascade, rate >= config.cascade_threshold) {
        (false, false) => {}
        (false, true) => {
            state.in_cascade = true;
            state.cascade_started_at = Some(now);
            state.last_above_threshold_at = Some(now);
            state.settling_cycles_remaining = config.settling_cycles;
            state.cascades_detected += 1;
            info!(rate, threshold = config.cascade_threshold, "cascade detected");
            emit(
                emitter,
                SignalCategory::Monitor,
                SignalPayload::CascadeDetected {
                    rate,
                    threshold: config.cascade_threshold,
                    timestamp: Utc::now(),
                },
            );
        }
        (true, true) => {
            state.last_above_threshold_at = Some(now);
        }
        (true, false) => {}
    }
}

fn cleanup_tick(state: &mut CascadeState, config: &Config, clock: &dyn MonotonicClock, emitter: &SignalEmitter) {
    if !state.in_cascade {
        return;
    }
    let now = clock.now_ms();
    let Some(last) = state.last_above_threshold_at else {
        return;
    };
    if now.saturating_sub(last) >= config.cascade_exit_threshold_ms {
        let duration_ms = now.saturating_sub(state.cascade_started_at.unwrap_or(now));
        state.in_cascade = false;
        state.settling_cycles_remaining = 0;
        state.cascade_started_at = None;
        state.last_above_threshold_at = None;
        info!(duration_ms, "cascade resolved");
        emit(
            emitter,
            SignalCategory::Monitor,
            SignalPayload::CascadeResolved {
                duration_ms,
                timestamp: Utc::now(),
            },
        );
    }
}
