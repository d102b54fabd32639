/*!
 * Poller loop
 * Fan-out to collectors at a configured interval; drives `StatsTracker` and
 * forwards verdicts into the queue.
 */

use crate::anomaly::{Anomaly, AnomalyDetails};
use crate::cascade::CascadeDetector;
use crate::collectors::CollectorRegistry;
use crate::config::Config;
use crate::domain::{Metric, Severity};
use crate::fingerprint::Fingerprint;
use crate::queue::AnomalyQueue;
use crate::signals::{emit, SignalCategory, SignalEmitter, SignalPayload};
use crate::stats::{StatsTracker, Verdict};
use crate::verification::Verification;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Sink for the per-collector metrics snapshot each tick. The external
/// key-value metrics store this would normally feed is out of scope here;
/// this trait exists so a caller can wire one in without the poller knowing
/// its shape.
pub trait MetricsSink: Send + Sync + Debug {
    fn store(&self, collector: &str, metrics: &HashMap<Metric, f64>);
}

pub type MetricsEmitter = Option<Arc<dyn MetricsSink>>;

pub struct Poller {
    registry: CollectorRegistry,
    stats: Arc<StatsTracker>,
    queue: AnomalyQueue,
    cascade: CascadeDetector,
    verification: Verification,
    signals: SignalEmitter,
    metrics_sink: MetricsEmitter,
    config: Arc<Config>,
}

impl Poller {
    pub fn new(
        registry: CollectorRegistry,
        stats: Arc<StatsTracker>,
        queue: AnomalyQueue,
        cascade: CascadeDetector,
        verification: Verification,
        signals: SignalEmitter,
        metrics_sink: MetricsEmitter,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            stats,
            queue,
            cascade,
            verification,
            signals,
            metrics_sink,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.polling_interval_ms));
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let mut cycle_fingerprints = Vec::new();

        for collector in self.registry.iter() {
            let metrics = match collector.collect() {
                Ok(metrics) => metrics,
                Err(reason) => {
                    warn!(collector = collector.name(), reason, "collector failed; skipping");
                    continue;
                }
            };

            if let Some(sink) = &self.metrics_sink {
                sink.store(collector.name(), &metrics);
            }

            if let Some((metric, severity, message)) = collector.check(&metrics) {
                let details = AnomalyDetails {
                    metric: Some(metric),
                    value: metrics.get(&metric).copied(),
                    extra: [("message".to_string(), serde_json::Value::String(message))].into(),
                    ..Default::default()
                };
                self.forward(collector.skill(), severity, details, &mut cycle_fingerprints)
                    .await;
            }

            for (&metric, &value) in metrics.iter() {
                if let Verdict::Anomaly { severity, details } = self.stats.update(collector.skill(), metric, value) {
                    self.forward(collector.skill(), severity, details, &mut cycle_fingerprints)
                        .await;
                }
            }
        }

        if !cycle_fingerprints.is_empty() {
            self.verification.check_recurrences(&cycle_fingerprints).await;
        }
        self.verification.tick().await;

        self.cascade.polling_cycle_completed();
    }

    async fn forward(
        &self,
        skill: crate::domain::Skill,
        severity: Severity,
        mut details: AnomalyDetails,
        cycle_fingerprints: &mut Vec<Fingerprint>,
    ) {
        enrich(&mut details);
        let anomaly = Anomaly::new(skill, severity, details.clone());

        emit(
            &self.signals,
            SignalCategory::Monitor,
            SignalPayload::AnomalyDetected {
                skill,
                severity,
                details,
                timestamp: Utc::now(),
            },
        );

        if let Ok(fingerprint) = Fingerprint::from_anomaly(&anomaly) {
            cycle_fingerprints.push(fingerprint);
        }

        if let Err(err) = self.queue.enqueue(anomaly).await {
            warn!(error = %err, "failed to enqueue anomaly");
        }
    }
}

/// Ensures `metric`, `value`, `ewma`, `stddev`, and `deviation_stddevs` are
/// present before an anomaly is forwarded downstream. Only
/// collector-originated anomalies are ever missing these — `StatsTracker`
/// verdicts already carry a full set.
fn enrich(details: &mut AnomalyDetails) {
    let value = *details.value.get_or_insert(0.0);
    let ewma = *details.ewma.get_or_insert(value);
    let stddev = details.stddev_or_default();
    details.stddev.get_or_insert(stddev);
    details
        .deviation_stddevs
        .get_or_insert_with(|| if stddev > 0.0 { (value - ewma).abs() / stddev } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeDetector;
    use crate::clock::ManualClock;
    use crate::collectors::demo::LatencyDemoCollector;
    use crate::domain::Skill;

    #[tokio::test]
    async fn tick_forwards_anomaly_and_completes_cascade_cycle() {
        let clock = Arc::new(ManualClock::new());
        let config = Arc::new(Config::default());
        let (cascade, _ch) = CascadeDetector::spawn(config.clone(), clock.clone(), None);
        let (queue, _qh) = AnomalyQueue::spawn(config.clone(), clock.clone(), cascade.clone());
        let (verification, _vh) = Verification::spawn(clock.clone(), config.clone(), None);

        let mut registry = CollectorRegistry::new();
        registry.register(Box::new(LatencyDemoCollector::new(Skill::CodeGen, 100.0, 500.0, 1_000_000)));

        let poller = Poller::new(registry, Arc::new(StatsTracker::new(0.3, 3.0)), queue.clone(), cascade, verification, None, None, config);

        for _ in 0..11 {
            poller.tick().await;
        }

        // With spike_every far beyond this run, the stream never deviates
        // enough to cross the anomaly threshold, so nothing reaches the queue.
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.claimed, 0);
    }
}
