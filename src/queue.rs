/*!
 * AnomalyQueue
 * Dedup + lease-based work queue with a per-anomaly finite state machine.
 * The operational core of the pipeline — modeled the same way
 * as `CascadeDetector`: a single actor task owning all state, reached only
 * through request/reply messages.
 */

use crate::anomaly::Anomaly;
use crate::cascade::CascadeDetector;
use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::errors::QueueError;
use crate::fingerprint::Fingerprint;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a terminal-state record (resolved/escalated/ineffective) is kept
/// around after its `enqueued_at` before the cleanup tick evicts it. This
/// terminal records are retained long enough for `resolved_24h`/
/// `escalated_24h` stats to have anything to count, rather than being
/// deleted on `resolved` immediately.
const TERMINAL_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyState {
    Pending,
    Claimed,
    Verifying,
    Resolved,
    Escalated,
    Ineffective,
}

#[derive(Debug, Clone)]
pub struct QueuedAnomaly {
    pub anomaly_id: Uuid,
    pub anomaly: Anomaly,
    pub fingerprint: Fingerprint,
    pub state: AnomalyState,
    pub enqueued_at: u64,
    pub claimed_by: Option<String>,
    pub lease_expires: Option<u64>,
    pub attempt_count: u32,
}

#[derive(Debug, Clone)]
struct DedupRecord {
    #[allow(dead_code)]
    anomaly_id: Uuid,
    window_expires: u64,
}

#[derive(Debug, Clone)]
struct SuppressionRecord {
    #[allow(dead_code)]
    reason: String,
    expires: u64,
}

/// Opaque (to workers) handle proving exclusive claim on one queued anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    anomaly_id: Uuid,
    agent_id: String,
    lease_expires_ms: u64,
}

impl LeaseToken {
    pub fn anomaly_id(&self) -> Uuid {
        self.anomaly_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn lease_expires_ms(&self) -> u64 {
        self.lease_expires_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Deduplicated,
}

#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Fixed,
    Resolved,
    Escalated,
    Retry { reason: String },
    Ineffective { reason: String },
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub verifying: usize,
    pub escalated: usize,
    pub ineffective: usize,
    pub resolved_24h: usize,
    pub escalated_24h: usize,
}

#[derive(Default)]
struct QueueState {
    anomalies: HashMap<Uuid, QueuedAnomaly>,
    /// (enqueued_at, anomaly_id) for every currently-pending anomaly; gives
    /// O(log n) access to the oldest pending entry with ties broken by id.
    pending_index: BTreeSet<(u64, Uuid)>,
    dedup: HashMap<u64, DedupRecord>,
    suppression: HashMap<u64, SuppressionRecord>,
}

enum Command {
    Enqueue {
        anomaly: Anomaly,
        reply: oneshot::Sender<Result<EnqueueOutcome, QueueError>>,
    },
    ClaimNext {
        agent_id: String,
        reply: oneshot::Sender<Result<(LeaseToken, Anomaly), QueueError>>,
    },
    Release {
        token: LeaseToken,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Complete {
        token: LeaseToken,
        outcome: CompletionOutcome,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Suppress {
        family_hash: u64,
        reason: String,
        ttl_ms: u64,
    },
    Suppressed {
        family_hash: u64,
        reply: oneshot::Sender<bool>,
    },
    Stats(oneshot::Sender<QueueStats>),
    Reset,
}

#[derive(Debug, Clone)]
pub struct AnomalyQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl AnomalyQueue {
    pub fn spawn(
        config: Arc<Config>,
        clock: Arc<dyn MonotonicClock>,
        cascade: CascadeDetector,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ticker = tokio::time::interval(Duration::from_millis(config.check_interval_ms));
        let handle = tokio::spawn(run(QueueState::default(), config, clock, cascade, rx, ticker));
        (Self { tx }, handle)
    }

    pub async fn enqueue(&self, anomaly: Anomaly) -> Result<EnqueueOutcome, QueueError> {
        self.request(|reply| Command::Enqueue { anomaly, reply })
            .await
            .unwrap_or(Err(QueueError::NotFound(Uuid::nil())))
    }

    pub async fn claim_next(&self, agent_id: impl Into<String>) -> Result<(LeaseToken, Anomaly), QueueError> {
        let agent_id = agent_id.into();
        self.request(|reply| Command::ClaimNext { agent_id, reply })
            .await
            .unwrap_or(Err(QueueError::NotFound(Uuid::nil())))
    }

    pub async fn release(&self, token: LeaseToken) -> Result<(), QueueError> {
        self.request(|reply| Command::Release { token, reply })
            .await
            .unwrap_or(Err(QueueError::NotFound(Uuid::nil())))
    }

    pub async fn complete(&self, token: LeaseToken, outcome: CompletionOutcome) -> Result<(), QueueError> {
        self.request(|reply| Command::Complete { token, outcome, reply })
            .await
            .unwrap_or(Err(QueueError::NotFound(Uuid::nil())))
    }

    /// Propagates a suppression decided elsewhere (e.g. `RejectionTracker`)
    /// into the queue's own suppression table, per §4.6: the tracker does
    /// not insert suppressions itself.
    pub fn suppress(&self, family_hash: u64, reason: impl Into<String>, ttl_ms: u64) {
        let _ = self.tx.send(Command::Suppress {
            family_hash,
            reason: reason.into(),
            ttl_ms,
        });
    }

    pub async fn suppressed(&self, family_hash: u64) -> bool {
        self.request(|reply| Command::Suppressed { family_hash, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn stats(&self) -> QueueStats {
        self.request(Command::Stats).await.unwrap_or_default()
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
    mut state: QueueState,
    config: Arc<Config>,
    clock: Arc<dyn MonotonicClock>,
    cascade: CascadeDetector,
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut ticker: tokio::time::Interval,
) {
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => handle(&mut state, &config, clock.as_ref(), &cascade, cmd).await,
                    None => break,
                }
            }
            _ = ticker.tick() => {
                cleanup_tick(&mut state, clock.as_ref());
            }
        }
    }
}

async fn handle(
    state: &mut QueueState,
    config: &Config,
    clock: &dyn MonotonicClock,
    cascade: &CascadeDetector,
    cmd: Command,
) {
    match cmd {
        Command::Enqueue { anomaly, reply } => {
            let result = do_enqueue(state, config, clock, cascade, anomaly).await;
            let _ = reply.send(result);
        }
        Command::ClaimNext { agent_id, reply } => {
            let result = do_claim_next(state, config, clock, cascade, agent_id).await;
            let _ = reply.send(result);
        }
        Command::Release { token, reply } => {
            let _ = reply.send(do_release(state, token));
        }
        Command::Complete { token, outcome, reply } => {
            let _ = reply.send(do_complete(state, config, clock, token, outcome));
        }
        Command::Suppress { family_hash, reason, ttl_ms } => {
            let now = clock.now_ms();
            state
                .suppression
                .insert(family_hash, SuppressionRecord { reason, expires: now + ttl_ms });
        }
        Command::Suppressed { family_hash, reply } => {
            let now = clock.now_ms();
            let _ = reply.send(is_suppressed(state, family_hash, now));
        }
        Command::Stats(reply) => {
            let _ = reply.send(compute_stats(state, clock));
        }
        Command::Reset => {
            *state = QueueState::default();
        }
    }
}

fn is_suppressed(state: &QueueState, family_hash: u64, now: u64) -> bool {
    state
        .suppression
        .get(&family_hash)
        .is_some_and(|r| r.expires >= now)
}

async fn do_enqueue(
    state: &mut QueueState,
    config: &Config,
    clock: &dyn MonotonicClock,
    cascade: &CascadeDetector,
    anomaly: Anomaly,
) -> Result<EnqueueOutcome, QueueError> {
    let fingerprint = Fingerprint::from_anomaly(&anomaly)?;
    let now = clock.now_ms();

    if is_suppressed(state, fingerprint.family_hash(), now) {
        return Ok(EnqueueOutcome::Deduplicated);
    }

    let multiplier = cascade.dedup_multiplier().await;
    let effective_window = (config.dedup_window_ms as f64 * multiplier).round() as u64;
    let window_expires = now + effective_window;
    let fp_hash = fingerprint.hash();

    let outcome = match state.dedup.get_mut(&fp_hash) {
        Some(record) if now < record.window_expires => {
            record.window_expires = window_expires;
            EnqueueOutcome::Deduplicated
        }
        _ => {
            // Either no record yet, or the previous one aged out — a stale
            // record here is overwritten by the insert below rather than
            // waiting on the cleanup tick to evict it first.
            let id = anomaly.id.unwrap_or_else(Uuid::new_v4);
            state.dedup.insert(fp_hash, DedupRecord { anomaly_id: id, window_expires });
            state.pending_index.insert((now, id));
            state.anomalies.insert(
                id,
                QueuedAnomaly {
                    anomaly_id: id,
                    anomaly,
                    fingerprint,
                    state: AnomalyState::Pending,
                    enqueued_at: now,
                    claimed_by: None,
                    lease_expires: None,
                    attempt_count: 0,
                },
            );
            EnqueueOutcome::Enqueued
        }
    };

    cascade.record_anomaly();
    Ok(outcome)
}

async fn do_claim_next(
    state: &mut QueueState,
    config: &Config,
    clock: &dyn MonotonicClock,
    cascade: &CascadeDetector,
    agent_id: String,
) -> Result<(LeaseToken, Anomaly), QueueError> {
    if cascade.should_settle().await {
        return Err(QueueError::Settling);
    }

    let Some(&(enqueued_at, id)) = state.pending_index.iter().next() else {
        return Err(QueueError::Empty);
    };
    state.pending_index.remove(&(enqueued_at, id));

    let now = clock.now_ms();
    let entry = state.anomalies.get_mut(&id).expect("pending_index entry without a queued anomaly");
    entry.state = AnomalyState::Claimed;
    entry.claimed_by = Some(agent_id.clone());
    let lease_expires = now + config.lease_timeout_ms;
    entry.lease_expires = Some(lease_expires);
    entry.attempt_count += 1;

    let token = LeaseToken {
        anomaly_id: id,
        agent_id,
        lease_expires_ms: lease_expires,
    };
    Ok((token, entry.anomaly.clone()))
}

fn validate_lease<'a>(state: &'a mut QueueState, token: &LeaseToken) -> Result<&'a mut QueuedAnomaly, QueueError> {
    let entry = state
        .anomalies
        .get_mut(&token.anomaly_id)
        .ok_or(QueueError::InvalidLease)?;
    if entry.state != AnomalyState::Claimed || entry.claimed_by.as_deref() != Some(token.agent_id()) {
        return Err(QueueError::InvalidLease);
    }
    Ok(entry)
}

fn do_release(state: &mut QueueState, token: LeaseToken) -> Result<(), QueueError> {
    let enqueued_at = {
        let entry = validate_lease(state, &token)?;
        entry.state = AnomalyState::Pending;
        entry.claimed_by = None;
        entry.lease_expires = None;
        entry.enqueued_at
    };
    state.pending_index.insert((enqueued_at, token.anomaly_id));
    Ok(())
}

fn do_complete(
    state: &mut QueueState,
    config: &Config,
    clock: &dyn MonotonicClock,
    token: LeaseToken,
    outcome: CompletionOutcome,
) -> Result<(), QueueError> {
    // Normalize the two named-alias outcomes to their underlying `retry`.
    let outcome = match outcome {
        CompletionOutcome::Failed => CompletionOutcome::Retry {
            reason: "diagnosis failed".to_string(),
        },
        CompletionOutcome::Rejected => CompletionOutcome::Retry {
            reason: "proposal rejected".to_string(),
        },
        other => other,
    };

    let now = clock.now_ms();
    let (family_hash, enqueued_at, attempt_count) = {
        let entry = validate_lease(state, &token)?;
        entry.claimed_by = None;
        entry.lease_expires = None;
        (entry.fingerprint.family_hash(), entry.enqueued_at, entry.attempt_count)
    };

    let entry = state
        .anomalies
        .get_mut(&token.anomaly_id)
        .ok_or(QueueError::InvalidLease)?;

    let suppress = match outcome {
        CompletionOutcome::Fixed => {
            entry.state = AnomalyState::Verifying;
            None
        }
        CompletionOutcome::Resolved => {
            entry.state = AnomalyState::Resolved;
            None
        }
        CompletionOutcome::Escalated => {
            entry.state = AnomalyState::Escalated;
            Some("escalated".to_string())
        }
        CompletionOutcome::Retry { reason } => {
            if attempt_count >= config.max_attempts {
                entry.state = AnomalyState::Escalated;
                Some(reason)
            } else {
                entry.state = AnomalyState::Pending;
                state.pending_index.insert((enqueued_at, token.anomaly_id));
                None
            }
        }
        CompletionOutcome::Ineffective { reason: _ } => {
            entry.state = AnomalyState::Ineffective;
            None
        }
        CompletionOutcome::Failed | CompletionOutcome::Rejected => unreachable!("normalized above"),
    };

    if let Some(reason) = suppress {
        state.suppression.insert(
            family_hash,
            SuppressionRecord { reason, expires: now + config.suppression_window_ms },
        );
    }

    Ok(())
}

fn cleanup_tick(state: &mut QueueState, clock: &dyn MonotonicClock) {
    let now = clock.now_ms();

    let expired: Vec<Uuid> = state
        .anomalies
        .iter()
        .filter(|(_, e)| e.state == AnomalyState::Claimed && e.lease_expires.is_some_and(|le| le < now))
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        if let Some(entry) = state.anomalies.get_mut(&id) {
            entry.state = AnomalyState::Pending;
            entry.claimed_by = None;
            entry.lease_expires = None;
            state.pending_index.insert((entry.enqueued_at, id));
        }
    }

    state.dedup.retain(|_, r| r.window_expires >= now);
    state.suppression.retain(|_, r| r.expires >= now);

    let ttl_cutoff = now.saturating_sub(TERMINAL_TTL_MS);
    state.anomalies.retain(|_, e| {
        let terminal = matches!(
            e.state,
            AnomalyState::Resolved | AnomalyState::Escalated | AnomalyState::Ineffective
        );
        !(terminal && e.enqueued_at < ttl_cutoff)
    });
}

fn compute_stats(state: &QueueState, clock: &dyn MonotonicClock) -> QueueStats {
    let now = clock.now_ms();
    let cutoff = now.saturating_sub(TERMINAL_TTL_MS);
    let mut stats = QueueStats::default();
    for entry in state.anomalies.values() {
        match entry.state {
            AnomalyState::Pending => stats.pending += 1,
            AnomalyState::Claimed => stats.claimed += 1,
            AnomalyState::Verifying => stats.verifying += 1,
            AnomalyState::Escalated => {
                stats.escalated += 1;
                if entry.enqueued_at > cutoff {
                    stats.escalated_24h += 1;
                }
            }
            AnomalyState::Ineffective => stats.ineffective += 1,
            AnomalyState::Resolved => {
                if entry.enqueued_at > cutoff {
                    stats.resolved_24h += 1;
                }
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyDetails;
    use crate::clock::ManualClock;
    use crate::domain::{Direction, Metric, Severity, Skill};

    fn test_anomaly(skill: Skill, metric: Metric, value: f64, ewma: f64) -> Anomaly {
        Anomaly::new(
            skill,
            Severity::Warning,
            AnomalyDetails {
                metric: Some(metric),
                value: Some(value),
                ewma: Some(ewma),
                ..Default::default()
            },
        )
    }

    async fn spawn_pair(cfg: Config) -> (AnomalyQueue, CascadeDetector, Arc<ManualClock>, JoinHandle<()>, JoinHandle<()>) {
        let clock = Arc::new(ManualClock::new());
        let config = Arc::new(cfg);
        let (cascade, cascade_handle) = CascadeDetector::spawn(config.clone(), clock.clone(), None);
        let (queue, queue_handle) = AnomalyQueue::spawn(config, clock.clone(), cascade.clone());
        (queue, cascade, clock, queue_handle, cascade_handle)
    }

    #[tokio::test]
    async fn malformed_anomaly_is_rejected() {
        let (queue, _cascade, _clock, _qh, _ch) = spawn_pair(Config::default()).await;
        let bad = Anomaly::new(Skill::CodeGen, Severity::Warning, AnomalyDetails::default());
        assert_eq!(queue.enqueue(bad).await, Err(QueueError::InvalidAnomaly(crate::errors::FingerprintError::InvalidAnomaly)));
    }

    #[tokio::test]
    async fn enqueue_claim_complete_fixed_sets_verifying_and_one_attempt() {
        let (queue, _cascade, _clock, _qh, _ch) = spawn_pair(Config::default()).await;
        let anomaly = test_anomaly(Skill::CodeGen, Metric::LatencyMs, 10.0, 1.0);
        assert_eq!(queue.enqueue(anomaly).await.unwrap(), EnqueueOutcome::Enqueued);

        let (token, _claimed) = queue.claim_next("worker-1").await.unwrap();
        assert_eq!(token.lease_expires_ms(), Config::default().lease_timeout_ms);

        queue.complete(token, CompletionOutcome::Fixed).await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.verifying, 1);
    }

    /// Dedup within window, then window extension; a hit after the
    /// extended window has actually elapsed starts a fresh record.
    #[tokio::test]
    async fn dedup_within_window_and_extension() {
        let mut cfg = Config::default();
        cfg.dedup_window_ms = 100;
        let (queue, _cascade, clock, _qh, _ch) = spawn_pair(cfg).await;

        clock.set(0);
        let a = test_anomaly(Skill::CodeGen, Metric::LatencyMs, 10.0, 1.0);
        assert_eq!(queue.enqueue(a).await.unwrap(), EnqueueOutcome::Enqueued);

        // window_expires: 0 + 100 = 100
        clock.set(50);
        let a2 = test_anomaly(Skill::CodeGen, Metric::LatencyMs, 11.0, 1.0);
        assert_eq!(queue.enqueue(a2).await.unwrap(), EnqueueOutcome::Deduplicated);

        // window_expires: 50 + 100 = 150
        clock.set(120);
        let a3 = test_anomaly(Skill::CodeGen, Metric::LatencyMs, 12.0, 1.0);
        assert_eq!(queue.enqueue(a3).await.unwrap(), EnqueueOutcome::Deduplicated);

        // window_expires: 120 + 100 = 220; at t=220 the window has elapsed
        // (now < window_expires is false), so this starts a second record.
        clock.set(220);
        let a4 = test_anomaly(Skill::CodeGen, Metric::LatencyMs, 13.0, 1.0);
        assert_eq!(queue.enqueue(a4).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    /// Three-strike escalation with suppression.
    #[tokio::test]
    async fn three_retries_escalate_and_suppress() {
        let mut cfg = Config::default();
        cfg.max_attempts = 3;
        let (queue, _cascade, _clock, _qh, _ch) = spawn_pair(cfg).await;

        let a = test_anomaly(Skill::Planning, Metric::ErrorRate, 10.0, 1.0);
        queue.enqueue(a).await.unwrap();

        for reason in ["r1", "r2", "r3"] {
            let (token, _) = queue.claim_next("worker").await.unwrap();
            queue
                .complete(token, CompletionOutcome::Retry { reason: reason.to_string() })
                .await
                .unwrap();
        }

        let stats = queue.stats().await;
        assert_eq!(stats.escalated, 1);

        let fp = Fingerprint::new(Skill::Planning, Metric::ErrorRate, Direction::Above);
        assert!(queue.suppressed(fp.family_hash()).await);

        let dup = test_anomaly(Skill::Planning, Metric::ErrorRate, 11.0, 1.0);
        assert_eq!(queue.enqueue(dup).await.unwrap(), EnqueueOutcome::Deduplicated);
    }

    /// Lease expiry recovery.
    #[tokio::test]
    async fn lease_expiry_recovers_to_pending() {
        let mut cfg = Config::default();
        cfg.lease_timeout_ms = 50;
        cfg.check_interval_ms = 25;
        let (queue, _cascade, clock, _qh, _ch) = spawn_pair(cfg).await;

        clock.set(0);
        let a = test_anomaly(Skill::ToolUse, Metric::QueueDepth, 10.0, 1.0);
        queue.enqueue(a).await.unwrap();

        let (_token, _) = queue.claim_next("w1").await.unwrap();

        clock.set(60);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (token2, _) = queue.claim_next("w2").await.unwrap();
        assert_eq!(token2.agent_id(), "w2");
    }

    #[tokio::test]
    async fn empty_queue_returns_empty_error() {
        let (queue, _cascade, _clock, _qh, _ch) = spawn_pair(Config::default()).await;
        assert_eq!(queue.claim_next("w1").await, Err(QueueError::Empty));
    }

    #[tokio::test]
    async fn release_returns_anomaly_to_pending() {
        let (queue, _cascade, _clock, _qh, _ch) = spawn_pair(Config::default()).await;
        let a = test_anomaly(Skill::Summarization, Metric::MemoryUsageMb, 10.0, 1.0);
        queue.enqueue(a).await.unwrap();
        let (token, _) = queue.claim_next("w1").await.unwrap();
        queue.release(token).await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn invalid_lease_token_is_rejected() {
        let (queue, _cascade, _clock, _qh, _ch) = spawn_pair(Config::default()).await;
        let fake = LeaseToken {
            anomaly_id: Uuid::new_v4(),
            agent_id: "nobody".to_string(),
            lease_expires_ms: 0,
        };
        assert_eq!(queue.release(fake).await, Err(QueueError::InvalidLease));
    }
}
