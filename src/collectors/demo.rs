/*!
 * Demo collectors
 * Illustrative `Collector` implementations with synthetic, deterministic
 * samples — useful for the demo binary and for exercising the poller loop
 * without a real telemetry source wired in.
 */

use super::Collector;
use crate::domain::{Metric, Skill};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Emits a mostly-stable latency signal that spikes every `spike_every`th
/// sample, useful for exercising `StatsTracker`'s anomaly path end to end.
#[derive(Debug)]
pub struct LatencyDemoCollector {
    skill: Skill,
    tick: AtomicU64,
    baseline_ms: f64,
    spike_ms: f64,
    spike_every: u64,
}

impl LatencyDemoCollector {
    pub fn new(skill: Skill, baseline_ms: f64, spike_ms: f64, spike_every: u64) -> Self {
        Self {
            skill,
            tick: AtomicU64::new(0),
            baseline_ms,
            spike_ms,
            spike_every,
        }
    }
}

impl Collector for LatencyDemoCollector {
    fn name(&self) -> &str {
        "latency_demo"
    }

    fn skill(&self) -> Skill {
        self.skill
    }

    fn collect(&self) -> Result<HashMap<Metric, f64>, String> {
        let n = self.tick.fetch_add(1, Ordering::SeqCst);
        // Small deterministic wobble so the stream isn't perfectly flat.
        let wobble = ((n % 7) as f64 - 3.0) * 0.1;
        let value = if self.spike_every > 0 && n > 0 && n % self.spike_every == 0 {
            self.spike_ms
        } else {
            self.baseline_ms + wobble
        };
        let mut metrics = HashMap::new();
        metrics.insert(Metric::LatencyMs, value);
        Ok(metrics)
    }
}

/// Reports queue depth and error rate together, as a single collector might
/// when both numbers come from the same upstream probe.
#[derive(Debug)]
pub struct QueueHealthDemoCollector {
    skill: Skill,
    depth: AtomicU64,
}

impl QueueHealthDemoCollector {
    pub fn new(skill: Skill) -> Self {
        Self {
            skill,
            depth: AtomicU64::new(0),
        }
    }
}

impl Collector for QueueHealthDemoCollector {
    fn name(&self) -> &str {
        "queue_health_demo"
    }

    fn skill(&self) -> Skill {
        self.skill
    }

    fn collect(&self) -> Result<HashMap<Metric, f64>, String> {
        let n = self.depth.fetch_add(1, Ordering::SeqCst);
        let depth = (n % 5) as f64;
        let error_rate = 0.01 + (n % 3) as f64 * 0.001;
        let mut metrics = HashMap::new();
        metrics.insert(Metric::QueueDepth, depth);
        metrics.insert(Metric::ErrorRate, error_rate);
        Ok(metrics)
    }
}
