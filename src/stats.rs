/*!
 * StatsTracker
 * Per-(skill, metric) streaming mean/variance (Welford's algorithm) and
 * EWMA, generalized from `monitoring::anomaly::Detector`/`Stats`. Unlike the
 * teacher's single `RwLock<HashMap<String, Stats>>`, keys here are the
 * closed `(Skill, Metric)` enums and storage is a `DashMap` so unrelated
 * metrics never contend on the same lock.
 */

use crate::anomaly::AnomalyDetails;
use crate::domain::{Metric, Severity, Skill};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct StatsEntry {
    ewma: f64,
    count: u64,
    mean: f64,
    m2: f64,
}

impl StatsEntry {
    fn fresh(x: f64) -> Self {
        Self {
            ewma: x,
            count: 1,
            mean: x,
            m2: 0.0,
        }
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    fn stddev(&self) -> f64 {
        self.variance().max(0.0).sqrt()
    }
}

/// Snapshot returned by `StatsTracker::stats`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub count: u64,
    pub mean: f64,
    pub ewma: f64,
    pub stddev: f64,
}

/// Minimum number of samples before anomaly verdicts are emitted.
const MIN_SAMPLES: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Normal,
    Anomaly {
        severity: Severity,
        details: AnomalyDetails,
    },
}

pub struct StatsTracker {
    entries: DashMap<(Skill, Metric), StatsEntry, ahash::RandomState>,
    alpha: f64,
    threshold: f64,
}

impl StatsTracker {
    pub fn new(alpha: f64, threshold: f64) -> Self {
        Self {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            alpha,
            threshold,
        }
    }

    /// Update running statistics for `(skill, metric)` with sample `x` and
    /// return the resulting verdict. Non-numeric samples (NaN/infinite)
    /// return `Normal` without touching state.
    pub fn update(&self, skill: Skill, metric: Metric, x: f64) -> Verdict {
        if !x.is_finite() {
            return Verdict::Normal;
        }

        match self.entries.entry((skill, metric)) {
            Entry::Vacant(slot) => {
                slot.insert(StatsEntry::fresh(x));
                Verdict::Normal
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.count += 1;
                let delta = x - entry.mean;
                entry.mean += delta / entry.count as f64;
                let delta2 = x - entry.mean;
                entry.m2 += delta * delta2;
                entry.ewma = self.alpha * x + (1.0 - self.alpha) * entry.ewma;

                self.verdict_for(metric, x, entry)
            }
        }
    }

    fn verdict_for(&self, metric: Metric, x: f64, entry: &StatsEntry) -> Verdict {
        if entry.count < MIN_SAMPLES {
            return Verdict::Normal;
        }

        let stddev = entry.stddev();
        let deviation = (x - entry.ewma).abs();

        if stddev > 0.0 && deviation > self.threshold * stddev {
            let deviation_stddevs = deviation / stddev;
            let severity = if deviation > 2.0 * self.threshold * stddev {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Verdict::Anomaly {
                severity,
                details: AnomalyDetails {
                    metric: Some(metric),
                    value: Some(x),
                    ewma: Some(entry.ewma),
                    stddev: Some(stddev),
                    deviation_stddevs: Some(deviation_stddevs),
                    extra: Default::default(),
                },
            }
        } else {
            Verdict::Normal
        }
    }

    pub fn stats(&self, skill: Skill, metric: Metric) -> Option<StatsSnapshot> {
        self.entries.get(&(skill, metric)).map(|e| StatsSnapshot {
            count: e.count,
            mean: e.mean,
            ewma: e.ewma,
            stddev: e.stddev(),
        })
    }

    pub fn reset(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_ewma_and_returns_normal() {
        let tracker = StatsTracker::new(0.3, 3.0);
        let verdict = tracker.update(Skill::Retrieval, Metric::LatencyMs, 100.0);
        assert_eq!(verdict, Verdict::Normal);
        let snap = tracker.stats(Skill::Retrieval, Metric::LatencyMs).unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.ewma, 100.0);
        assert_eq!(snap.mean, 100.0);
    }

    #[test]
    fn below_min_samples_never_anomalous() {
        let tracker = StatsTracker::new(0.3, 3.0);
        for i in 0..9 {
            let verdict = tracker.update(Skill::Retrieval, Metric::LatencyMs, 100.0 + i as f64);
            assert_eq!(verdict, Verdict::Normal);
        }
    }

    #[test]
    fn non_numeric_sample_is_ignored() {
        let tracker = StatsTracker::new(0.3, 3.0);
        let verdict = tracker.update(Skill::Retrieval, Metric::LatencyMs, f64::NAN);
        assert_eq!(verdict, Verdict::Normal);
        assert!(tracker.stats(Skill::Retrieval, Metric::LatencyMs).is_none());
    }

    #[test]
    fn welford_matches_known_dataset() {
        let tracker = StatsTracker::new(0.3, 3.0);
        for i in 1..=5 {
            tracker.update(Skill::Planning, Metric::ErrorRate, i as f64);
        }
        let snap = tracker.stats(Skill::Planning, Metric::ErrorRate).unwrap();
        assert_eq!(snap.count, 5);
        assert!((snap.mean - 3.0).abs() < 1e-9);
    }

    /// 30 near-constant samples, then a 500.0 spike.
    #[test]
    fn streaming_anomaly_detection_scenario() {
        let tracker = StatsTracker::new(0.3, 3.0);
        let noisy = [
            100.0, 100.5, 100.3, 99.7, 100.1, 99.9, 100.4, 100.2, 99.8, 100.0, 100.6, 99.5, 100.1,
            100.3, 99.9, 100.2, 100.0, 99.7, 100.4, 100.1, 99.9, 100.3, 100.0, 99.8, 100.2, 100.1,
            99.9, 100.0, 100.3, 99.8,
        ];
        assert_eq!(noisy.len(), 30);
        for v in noisy {
            tracker.update(Skill::CodeGen, Metric::LatencyMs, v);
        }

        let verdict = tracker.update(Skill::CodeGen, Metric::LatencyMs, 500.0);
        let snap = tracker.stats(Skill::CodeGen, Metric::LatencyMs).unwrap();
        assert_eq!(snap.count, 31);

        match verdict {
            Verdict::Anomaly { severity, details } => {
                assert_eq!(severity, Severity::Critical);
                assert!(details.deviation_stddevs.unwrap() > 50.0);
            }
            Verdict::Normal => panic!("expected an anomaly verdict"),
        }
    }

    #[test]
    fn reset_clears_all_metrics() {
        let tracker = StatsTracker::new(0.3, 3.0);
        tracker.update(Skill::CodeGen, Metric::LatencyMs, 1.0);
        tracker.reset();
        assert!(tracker.stats(Skill::CodeGen, Metric::LatencyMs).is_none());
    }
}
