/*!
 * RejectionTracker
 * Three-strike escalation policy over a sliding window, keyed by
 * `family_hash`. Does not itself suppress anything in the queue; it reports
 * a strategy and leaves propagation to the caller.
 */

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::fingerprint::Fingerprint;
use crate::signals::{emit, SignalCategory, SignalEmitter, SignalPayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RetryWithContext,
    ReduceScope,
    EscalateToHuman,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectionOutcome {
    pub strategy: Strategy,
    pub rejection_count: u32,
    pub should_suppress: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
struct RejectionRecord {
    count: u32,
    last_rejection_at: u64,
    reasons: Vec<String>,
    proposal_ids: Vec<String>,
}

enum Command {
    RecordRejection {
        fingerprint: Fingerprint,
        proposal_id: String,
        reason: String,
        reply: oneshot::Sender<RejectionOutcome>,
    },
    Clear {
        fingerprint: Fingerprint,
    },
    Reset,
}

#[derive(Debug, Clone)]
pub struct RejectionTracker {
    tx: mpsc::UnboundedSender<Command>,
}

impl RejectionTracker {
    pub fn spawn(
        config: Arc<Config>,
        clock: Arc<dyn MonotonicClock>,
        emitter: SignalEmitter,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ticker = tokio::time::interval(Duration::from_millis(config.check_interval_ms));
        let handle = tokio::spawn(run(HashMap::new(), config, clock, emitter, rx, ticker));
        (Self { tx }, handle)
    }

    pub async fn record_rejection(
        &self,
        fingerprint: Fingerprint,
        proposal_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> RejectionOutcome {
        let proposal_id = proposal_id.into();
        let reason = reason.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::RecordRejection { fingerprint, proposal_id, reason, reply: reply_tx })
            .is_err()
        {
            return fallback_outcome();
        }
        reply_rx.await.unwrap_or_else(|_| fallback_outcome())
    }

    pub fn clear_rejections(&self, fingerprint: Fingerprint) {
        let _ = self.tx.send(Command::Clear { fingerprint });
    }

    pub fn reset(&self) {
        let _ = self.tx.send(Command::Reset);
    }
}

fn fallback_outcome() -> RejectionOutcome {
    RejectionOutcome {
        strategy: Strategy::RetryWithContext,
        rejection_count: 0,
        should_suppress: false,
        message: "rejection tracker unavailable".to_string(),
    }
}

async fn run(
    mut records: HashMap<u64, RejectionRecord>,
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
                    Some(cmd) => handle(&mut records, &config, clock.as_ref(), &emitter, cmd),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let now = clock.now_ms();
                records.retain(|_, r| now.saturating_sub(r.last_rejection_at) < config.rejection_window_ms);
            }
        }
    }
}

fn handle(
    records: &mut HashMap<u64, RejectionRecord>,
    config: &Config,
    clock: &dyn MonotonicClock,
    emitter: &SignalEmitter,
    cmd: Command,
) {
    match cmd {
        Command::RecordRejection { fingerprint, proposal_id, reason, reply } => {
            let outcome = do_record_rejection(records, config, clock, emitter, fingerprint, proposal_id, reason);
            let _ = reply.send(outcome);
        }
        Command::Clear { fingerprint } => {
            records.remove(&fingerprint.family_hash());
        }
        Command::Reset => {
            records.clear();
        }
    }
}

fn do_record_rejection(
    records: &mut HashMap<u64, RejectionRecord>,
    config: &Config,
    clock: &dyn MonotonicClock,
    emitter: &SignalEmitter,
    fingerprint: Fingerprint,
    proposal_id: String,
    reason: String,
) -> RejectionOutcome {
    let now = clock.now_ms();
    let family_hash = fingerprint.family_hash();

    let stale = records
        .get(&family_hash)
        .is_some_and(|r| now.saturating_sub(r.last_rejection_at) >= config.rejection_window_ms);

    if stale {
        records.remove(&family_hash);
    }

    let record = records.entry(family_hash).or_insert_with(|| RejectionRecord {
        count: 0,
        last_rejection_at: now,
        reasons: Vec::new(),
        proposal_ids: Vec::new(),
    });

    record.count += 1;
    record.last_rejection_at = now;
    record.reasons.insert(0, reason);
    record.reasons.truncate(MAX_HISTORY);
    record.proposal_ids.insert(0, proposal_id);
    record.proposal_ids.truncate(MAX_HISTORY);

    let count = record.count;
    let reasons = record.reasons.clone();
    let proposal_ids = record.proposal_ids.clone();

    // First match wins: 1 -> retry, 2 -> reduce scope, 3+ (or >= max_rejections) -> escalate.
    let strategy = if count == 1 {
        Strategy::RetryWithContext
    } else if count == 2 && count < config.max_rejections {
        Strategy::ReduceScope
    } else {
        Strategy::EscalateToHuman
    };
    let should_suppress = matches!(strategy, Strategy::EscalateToHuman);
    let message = match strategy {
        Strategy::RetryWithContext => "first rejection; will retry with additional context".to_string(),
        Strategy::ReduceScope => "second rejection; taking a more conservative, reduced-scope approach".to_string(),
        Strategy::EscalateToHuman => format!("Escalating to human review after {count} rejections"),
    };

    if should_suppress {
        info!(family_hash, count, "healing blocked, escalating to human review");
        emit(
            emitter,
            SignalCategory::Healing,
            SignalPayload::HealingBlocked {
                fingerprint,
                family_hash,
                rejection_count: count,
                reasons,
                proposal_ids,
                suppression_ttl_minutes: config.suppression_ttl_minutes,
            },
        );
    }

    RejectionOutcome {
        strategy,
        rejection_count: count,
        should_suppress,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{Direction, Metric, Skill};
    use crate::signals::{RecordingSink, SignalPayload};

    fn spawn_with(max_rejections: u32, rejection_window_ms: u64) -> (RejectionTracker, Arc<ManualClock>, JoinHandle<()>) {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.max_rejections = max_rejections;
        cfg.rejection_window_ms = rejection_window_ms;
        cfg.check_interval_ms = 10_000;
        let (tracker, handle) = RejectionTracker::spawn(Arc::new(cfg), clock.clone(), None);
        (tracker, clock, handle)
    }

    fn spawn_recording(max_rejections: u32, rejection_window_ms: u64) -> (RejectionTracker, Arc<RecordingSink>, JoinHandle<()>) {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.max_rejections = max_rejections;
        cfg.rejection_window_ms = rejection_window_ms;
        cfg.check_interval_ms = 10_000;
        let sink = RecordingSink::new();
        let (tracker, handle) = RejectionTracker::spawn(Arc::new(cfg), clock, Some(sink.clone()));
        (tracker, sink, handle)
    }

    #[tokio::test]
    async fn three_strikes_escalate_and_suppress() {
        let (tracker, _clock, _h) = spawn_with(3, 3_600_000);
        let fp = Fingerprint::new(Skill::CodeGen, Metric::LatencyMs, Direction::Above);

        let r1 = tracker.record_rejection(fp, "p1", "bad patch").await;
        assert_eq!(r1.strategy, Strategy::RetryWithContext);
        assert!(!r1.should_suppress);
        assert!(r1.message.to_lowercase().contains("retry"));
        assert!(r1.message.to_lowercase().contains("context"));

        let r2 = tracker.record_rejection(fp, "p2", "still bad").await;
        assert_eq!(r2.strategy, Strategy::ReduceScope);
        assert!(!r2.should_suppress);
        assert!(r2.message.to_lowercase().contains("conservative"));

        let r3 = tracker.record_rejection(fp, "p3", "nope").await;
        assert_eq!(r3.strategy, Strategy::EscalateToHuman);
        assert!(r3.should_suppress);
        assert!(r3.message.contains("Escalating"));
        assert!(r3.message.contains('3'));
        assert_eq!(r3.rejection_count, 3);
    }

    #[tokio::test]
    async fn stale_record_resets_count() {
        let (tracker, clock, _h) = spawn_with(3, 100);
        let fp = Fingerprint::new(Skill::Retrieval, Metric::ErrorRate, Direction::Below);

        clock.set(0);
        tracker.record_rejection(fp, "p1", "r1").await;

        clock.set(500);
        let r = tracker.record_rejection(fp, "p2", "r2").await;
        assert_eq!(r.rejection_count, 1);
        assert_eq!(r.strategy, Strategy::RetryWithContext);
    }

    #[tokio::test]
    async fn clear_rejections_removes_family_record() {
        let (tracker, _clock, _h) = spawn_with(3, 3_600_000);
        let fp = Fingerprint::new(Skill::Planning, Metric::QueueDepth, Direction::Above);
        tracker.record_rejection(fp, "p1", "r1").await;
        tracker.clear_rejections(fp);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let r = tracker.record_rejection(fp, "p2", "r2").await;
        assert_eq!(r.rejection_count, 1);
    }

    #[tokio::test]
    async fn history_is_truncated_to_ten_newest_first() {
        let (tracker, sink, _h) = spawn_recording(100, 3_600_000);
        let fp = Fingerprint::new(Skill::ToolUse, Metric::MemoryUsageMb, Direction::Above);
        for i in 0..15 {
            tracker.record_rejection(fp, format!("p{i}"), format!("r{i}")).await;
        }
        let r = tracker.record_rejection(fp, "p-last", "r-last").await;
        assert_eq!(r.rejection_count, 16);
        assert!(r.should_suppress);

        let last_blocked = sink
            .drain()
            .into_iter()
            .filter_map(|(_, payload)| match payload {
                SignalPayload::HealingBlocked { reasons, proposal_ids, .. } => Some((reasons, proposal_ids)),
                _ => None,
            })
            .next_back()
            .expect("at least one healing_blocked signal");
        let (reasons, proposal_ids) = last_blocked;

        assert_eq!(reasons.len(), 10);
        assert_eq!(proposal_ids.len(), 10);
        assert_eq!(reasons[0], "r-last");
        assert_eq!(proposal_ids[0], "p-last");
        assert_eq!(reasons[1], "r14");
        assert_eq!(reasons[9], "r6");
    }
}
