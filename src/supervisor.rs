/*!
 * Supervision
 * The four independent serial actors (AnomalyQueue, CascadeDetector,
 * RejectionTracker, Verification) are wired together at spawn time, so a
 * lone actor restarting in isolation would leave its dependents holding a
 * stale channel handle (e.g. `AnomalyQueue` holds a `CascadeDetector` clone
 * baked in at construction). A restart already clears all in-memory state,
 * so this supervisor restarts the whole actor cluster together whenever any
 * one member's task exits — a strictly in-memory system pays no extra
 * correctness cost for the wider blast radius, and it avoids
 * reference-juggling between the four actors.
 *
 * Modeled on `process::scheduler_task::SchedulerTask`'s background-task +
 * handle pattern, generalized from one supervised task to a small cluster.
 */

use crate::cascade::CascadeDetector;
use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::queue::AnomalyQueue;
use crate::rejection::RejectionTracker;
use crate::signals::SignalEmitter;
use crate::verification::Verification;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Cloneable bundle of handles to the current generation of the actor
/// cluster. Cheap to clone: every field just wraps a channel sender.
#[derive(Clone)]
pub struct PipelineHandle {
    pub queue: AnomalyQueue,
    pub cascade: CascadeDetector,
    pub verification: Verification,
    pub rejection: RejectionTracker,
}

struct ClusterHandles {
    cascade: JoinHandle<()>,
    queue: JoinHandle<()>,
    verification: JoinHandle<()>,
    rejection: JoinHandle<()>,
}

fn spawn_cluster(
    config: &Arc<Config>,
    clock: &Arc<dyn MonotonicClock>,
    signals: &SignalEmitter,
) -> (PipelineHandle, ClusterHandles) {
    let (cascade, cascade_handle) = CascadeDetector::spawn(config.clone(), clock.clone(), signals.clone());
    let (queue, queue_handle) = AnomalyQueue::spawn(config.clone(), clock.clone(), cascade.clone());
    let (verification, verification_handle) = Verification::spawn(clock.clone(), config.clone(), signals.clone());
    let (rejection, rejection_handle) = RejectionTracker::spawn(config.clone(), clock.clone(), signals.clone());

    (
        PipelineHandle { queue, cascade, verification, rejection },
        ClusterHandles {
            cascade: cascade_handle,
            queue: queue_handle,
            verification: verification_handle,
            rejection: rejection_handle,
        },
    )
}

/// Owns the current generation of the actor cluster and restarts it, with
/// entirely fresh state, whenever any member's background task exits.
pub struct Supervisor {
    current: Arc<RwLock<PipelineHandle>>,
    restarts: Arc<AtomicU64>,
}

impl Supervisor {
    /// Spawns the actor cluster and the supervising background task.
    pub fn spawn(
        config: Arc<Config>,
        clock: Arc<dyn MonotonicClock>,
        signals: SignalEmitter,
    ) -> (Self, JoinHandle<()>) {
        let (initial, handles) = spawn_cluster(&config, &clock, &signals);
        let current = Arc::new(RwLock::new(initial));
        let restarts = Arc::new(AtomicU64::new(0));

        let supervisor_loop = tokio::spawn(run(current.clone(), restarts.clone(), config, clock, signals, handles));

        (Self { current, restarts }, supervisor_loop)
    }

    /// A snapshot of the current generation's handles. Safe to hold across
    /// `await` points; if the cluster restarts underneath it, a held handle
    /// simply talks to actors that are no longer supervised — callers that
    /// need the current generation should re-fetch via this method.
    pub fn handle(&self) -> PipelineHandle {
        self.current.read().clone()
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

async fn run(
    current: Arc<RwLock<PipelineHandle>>,
    restarts: Arc<AtomicU64>,
    config: Arc<Config>,
    clock: Arc<dyn MonotonicClock>,
    signals: SignalEmitter,
    mut handles: ClusterHandles,
) {
    loop {
        let component = tokio::select! {
            res = &mut handles.cascade => { log_exit("cascade", res); "cascade" }
            res = &mut handles.queue => { log_exit("queue", res); "queue" }
            res = &mut handles.verification => { log_exit("verification", res); "verification" }
            res = &mut handles.rejection => { log_exit("rejection", res); "rejection" }
        };

        let total = restarts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(component, total_restarts = total, "restarting pipeline actor cluster with fresh state");

        let (fresh, fresh_handles) = spawn_cluster(&config, &clock, &signals);
        *current.write() = fresh;
        handles = fresh_handles;
    }
}

fn log_exit(component: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => warn!(component, "actor task returned unexpectedly"),
        Err(err) => warn!(component, error = %err, "actor task panicked"),
    }
}
