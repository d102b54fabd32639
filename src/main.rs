/*!
 * Self-Healing Anomaly Pipeline - Main Entry Point
 *
 * Wires the actor cluster (cascade detector, anomaly queue, verification,
 * rejection tracker) under a supervisor, registers the demo collector set,
 * and drives the polling loop until interrupted.
 */

use heal_pipeline::collectors::demo::{LatencyDemoCollector, QueueHealthDemoCollector};
use heal_pipeline::{Collector, CollectorRegistry, Config, Poller, Skill, StatsTracker, Supervisor, SystemClock};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("self-healing anomaly pipeline starting");
    info!("================================================");

    let config = Arc::new(Config::from_env());
    let clock = Arc::new(SystemClock) as Arc<dyn heal_pipeline::MonotonicClock>;

    info!("spawning actor cluster under supervisor");
    let (supervisor, _supervisor_task) = Supervisor::spawn(config.clone(), clock.clone(), None);
    let pipeline = supervisor.handle();

    info!("registering demo collectors");
    let mut registry = CollectorRegistry::new();
    registry.register(Box::new(LatencyDemoCollector::new(Skill::CodeGen, 120.0, 900.0, 40)) as Box<dyn Collector>);
    registry.register(Box::new(QueueHealthDemoCollector::new(Skill::Planning)) as Box<dyn Collector>);

    let stats = Arc::new(StatsTracker::new(config.ewma_alpha, config.ewma_stddev_threshold));

    let poller = Poller::new(
        registry,
        stats,
        pipeline.queue.clone(),
        pipeline.cascade.clone(),
        pipeline.verification.clone(),
        None,
        None,
        config.clone(),
    );

    info!(interval_ms = config.polling_interval_ms, "starting poller loop");
    let poller_task = poller.spawn();

    info!("pipeline is ready; press Ctrl+C to exit");
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");

    info!("shutdown signal received");
    poller_task.abort();
    info!(
        restarts = supervisor.restart_count(),
        "self-healing anomaly pipeline stopped"
    );
}
