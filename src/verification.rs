/*!
 * Verification
 * Soak-period recurrence tracking: a fix is "verified" once it survives a
 * configured number of polling cycles without its fingerprint recurring.
 * Actor-shaped the same way as `CascadeDetector`/`AnomalyQueue`.
 */

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::errors::VerificationError;
use crate::fingerprint::Fingerprint;
use crate::signals::{emit, SignalCategory, SignalEmitter, SignalPayload};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verifying,
    Verified,
    Ineffective,
}

#[derive(Debug, Clone)]
struct VerificationRecord {
    fingerprint: Fingerprint,
    proposal_id: String,
    #[allow(dead_code)]
    started_at: u64,
    total_cycles: u32,
    cycles_remaining: u32,
    outcome: VerificationOutcome,
}

/// Result of a `tick()` or `check_recurrences()` pass, only returned for
/// records that reached a terminal outcome this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleResult {
    Verified {
        fingerprint: Fingerprint,
        proposal_id: String,
    },
    Ineffective {
        fingerprint: Fingerprint,
        proposal_id: String,
        cycles_completed: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub verifying: usize,
    pub verified: usize,
    pub ineffective: usize,
}

#[derive(Default)]
struct State {
    records: HashMap<u64, VerificationRecord>,
}

enum Command {
    Start {
        fingerprint: Fingerprint,
        proposal_id: String,
        reply: oneshot::Sender<Result<(), VerificationError>>,
    },
    CheckRecurrences {
        fingerprint_hashes: Vec<u64>,
        reply: oneshot::Sender<Vec<CycleResult>>,
    },
    Tick {
        reply: oneshot::Sender<Vec<CycleResult>>,
    },
    Cancel {
        fingerprint: Fingerprint,
    },
    Stats(oneshot::Sender<VerificationStats>),
    Reset,
}

#[derive(Debug, Clone)]
pub struct Verification {
    tx: mpsc::UnboundedSender<Command>,
}

impl Verification {
    pub fn spawn(clock: Arc<dyn MonotonicClock>, config: Arc<Config>, emitter: SignalEmitter) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(State::default(), clock, config, emitter, rx));
        (Self { tx }, handle)
    }

    pub async fn start_verification(
        &self,
        fingerprint: Fingerprint,
        proposal_id: impl Into<String>,
    ) -> Result<(), VerificationError> {
        let proposal_id = proposal_id.into();
        self.request(|reply| Command::Start { fingerprint, proposal_id, reply })
            .await
            .unwrap_or(Err(VerificationError::NotFound))
    }

    /// `anomalies` is the set of fingerprints observed recurring this cycle;
    /// the caller has already filtered out malformed anomalies.
    pub async fn check_recurrences(&self, fingerprints: &[Fingerprint]) -> Vec<CycleResult> {
        let fingerprint_hashes = fingerprints.iter().map(Fingerprint::hash).collect();
        self.request(|reply| Command::CheckRecurrences { fingerprint_hashes, reply })
            .await
            .unwrap_or_default()
    }

    pub async fn tick(&self) -> Vec<CycleResult> {
        self.request(|reply| Command::Tick { reply }).await.unwrap_or_default()
    }

    pub fn cancel_verification(&self, fingerprint: Fingerprint) {
        let _ = self.tx.send(Command::Cancel { fingerprint });
    }

    pub async fn stats(&self) -> VerificationStats {
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
    mut state: State,
    clock: Arc<dyn MonotonicClock>,
    config: Arc<Config>,
    emitter: SignalEmitter,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        handle(&mut state, clock.as_ref(), &config, &emitter, cmd);
    }
}

fn handle(state: &mut State, clock: &dyn MonotonicClock, config: &Config, emitter: &SignalEmitter, cmd: Command) {
    match cmd {
        Command::Start { fingerprint, proposal_id, reply } => {
            let result = do_start(state, clock, config, fingerprint, proposal_id);
            let _ = reply.send(result);
        }
        Command::CheckRecurrences { fingerprint_hashes, reply } => {
            let result = do_check_recurrences(state, config, emitter, &fingerprint_hashes);
            let _ = reply.send(result);
        }
        Command::Tick { reply } => {
            let result = do_tick(state, emitter);
            let _ = reply.send(result);
        }
        Command::Cancel { fingerprint } => {
            state.records.remove(&fingerprint.hash());
        }
        Command::Stats(reply) => {
            let _ = reply.send(compute_stats(state));
        }
        Command::Reset => {
            *state = State::default();
        }
    }
}

fn do_start(
    state: &mut State,
    clock: &dyn MonotonicClock,
    config: &Config,
    fingerprint: Fingerprint,
    proposal_id: String,
) -> Result<(), VerificationError> {
    let key = fingerprint.hash();
    if let Some(existing) = state.records.get(&key) {
        if existing.outcome == VerificationOutcome::Verifying {
            return Err(VerificationError::AlreadyVerifying);
        }
    }
    state.records.insert(
        key,
        VerificationRecord {
            fingerprint,
            proposal_id,
            started_at: clock.now_ms(),
            total_cycles: config.soak_cycles,
            cycles_remaining: config.soak_cycles,
            outcome: VerificationOutcome::Verifying,
        },
    );
    Ok(())
}

/// `check_recurrences` runs before `tick` each cycle (caller contract, per
/// the lease/verification ordering invariant): a fingerprint recurring in
/// cycle N is marked ineffective here and is no longer `Verifying` by the
/// time `tick` runs in the same cycle.
fn do_check_recurrences(
    state: &mut State,
    config: &Config,
    emitter: &SignalEmitter,
    recurring_hashes: &[u64],
) -> Vec<CycleResult> {
    let mut results = Vec::new();
    for &key in recurring_hashes {
        let Some(record) = state.records.get_mut(&key) else {
            continue;
        };
        if record.outcome != VerificationOutcome::Verifying {
            continue;
        }
        record.outcome = VerificationOutcome::Ineffective;
        let cycles_completed = config.soak_cycles - record.cycles_remaining;
        info!(fingerprint_hash = key, cycles_completed, "healing ineffective");
        emit(
            emitter,
            SignalCategory::Healing,
            SignalPayload::HealingIneffective {
                fingerprint: record.fingerprint,
                fingerprint_hash: key,
                proposal_id: record.proposal_id.clone(),
                cycles_completed,
            },
        );
        results.push(CycleResult::Ineffective {
            fingerprint: record.fingerprint,
            proposal_id: record.proposal_id.clone(),
            cycles_completed,
        });
    }
    results
}

fn do_tick(state: &mut State, emitter: &SignalEmitter) -> Vec<CycleResult> {
    let mut results = Vec::new();
    for (key, record) in state.records.iter_mut() {
        if record.outcome != VerificationOutcome::Verifying {
            continue;
        }
        record.cycles_remaining = record.cycles_remaining.saturating_sub(1);
        if record.cycles_remaining == 0 {
            record.outcome = VerificationOutcome::Verified;
            info!(fingerprint_hash = *key, "healing verified");
            emit(
                emitter,
                SignalCategory::Healing,
                SignalPayload::HealingVerified {
                    fingerprint: record.fingerprint,
                    fingerprint_hash: *key,
                    proposal_id: record.proposal_id.clone(),
                    soak_cycles: record.total_cycles,
                },
            );
            results.push(CycleResult::Verified {
                fingerprint: record.fingerprint,
                proposal_id: record.proposal_id.clone(),
            });
        }
    }
    results
}

fn compute_stats(state: &State) -> VerificationStats {
    let mut stats = VerificationStats::default();
    for record in state.records.values() {
        match record.outcome {
            VerificationOutcome::Verifying => stats.verifying += 1,
            VerificationOutcome::Verified => stats.verified += 1,
            VerificationOutcome::Ineffective => stats.ineffective += 1,
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{Direction, Metric, Skill};

    fn spawn_with(soak_cycles: u32) -> (Verification, Arc<ManualClock>, JoinHandle<()>) {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.soak_cycles = soak_cycles;
        let (verification, handle) = Verification::spawn(clock.clone(), Arc::new(cfg), None);
        (verification, clock, handle)
    }

    #[tokio::test]
    async fn starting_twice_while_verifying_is_rejected() {
        let (v, _clock, _h) = spawn_with(3);
        let fp = Fingerprint::new(Skill::CodeGen, Metric::LatencyMs, Direction::Above);
        v.start_verification(fp, "p1").await.unwrap();
        assert_eq!(
            v.start_verification(fp, "p2").await,
            Err(VerificationError::AlreadyVerifying)
        );
    }

    /// soak_cycles=3, verified on tick 3.
    #[tokio::test]
    async fn verified_after_soak_cycles_elapse() {
        let (v, _clock, _h) = spawn_with(3);
        let fp = Fingerprint::new(Skill::CodeGen, Metric::LatencyMs, Direction::Above);
        v.start_verification(fp, "p1").await.unwrap();

        assert!(v.tick().await.is_empty());
        assert!(v.tick().await.is_empty());
        let results = v.tick().await;
        assert_eq!(
            results,
            vec![CycleResult::Verified {
                fingerprint: fp,
                proposal_id: "p1".to_string(),
            }]
        );

        let stats = v.stats().await;
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.verifying, 0);
    }

    /// A recurrence during soak marks the verification ineffective.
    #[tokio::test]
    async fn recurrence_marks_ineffective_before_tick() {
        let (v, _clock, _h) = spawn_with(5);
        let fp2 = Fingerprint::new(Skill::Retrieval, Metric::ErrorRate, Direction::Above);
        v.start_verification(fp2, "p2").await.unwrap();

        v.tick().await;

        let results = v.check_recurrences(&[fp2]).await;
        assert_eq!(
            results,
            vec![CycleResult::Ineffective {
                fingerprint: fp2,
                proposal_id: "p2".to_string(),
                cycles_completed: 1,
            }]
        );

        // Subsequent tick does not re-emit for an already-ineffective record.
        assert!(v.tick().await.is_empty());
        let stats = v.stats().await;
        assert_eq!(stats.ineffective, 1);
    }

    #[tokio::test]
    async fn cancel_verification_removes_record() {
        let (v, _clock, _h) = spawn_with(3);
        let fp = Fingerprint::new(Skill::Planning, Metric::TokenThroughput, Direction::Below);
        v.start_verification(fp, "p1").await.unwrap();
        v.cancel_verification(fp);
        // Cancelled, so a second start is no longer rejected.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        v.start_verification(fp, "p2").await.unwrap();
    }
}
