/*!
 * Fingerprint
 * Canonical identity of a recurring anomaly: skill x metric x direction,
 * plus a family identity over (skill, metric) that ignores direction.
 *
 * Hashing is done with a fixed-seed `ahash::AHasher` (ahash is built with
 * `default-features = false`, so its seed is a compile-time constant, not
 * process-randomized) so that `hash`/`family_hash` are deterministic within
 * a process and reproducible across restarts from the same inputs, exactly
 * as required. Cross-process stability with a *different* build is not
 * required and not provided.
 */

use crate::anomaly::Anomaly;
use crate::domain::{Direction, Metric, Skill};
use crate::errors::FingerprintError;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint {
    pub skill: Skill,
    pub metric: Metric,
    pub direction: Direction,
}

impl Fingerprint {
    pub fn new(skill: Skill, metric: Metric, direction: Direction) -> Self {
        Self {
            skill,
            metric,
            direction,
        }
    }

    /// Builds a fingerprint from an anomaly event, computing direction from
    /// `sign(value - ewma)` at verdict time. Fails when the anomaly lacks
    /// the fields required to compute that direction.
    pub fn from_anomaly(anomaly: &Anomaly) -> Result<Self, FingerprintError> {
        let metric = anomaly
            .details
            .metric
            .ok_or(FingerprintError::InvalidAnomaly)?;
        let value = anomaly
            .details
            .value
            .ok_or(FingerprintError::InvalidAnomaly)?;
        let ewma = anomaly
            .details
            .ewma
            .ok_or(FingerprintError::InvalidAnomaly)?;
        let direction = Direction::of(value, ewma);
        Ok(Self::new(anomaly.skill, metric, direction))
    }

    /// Stable identity over the full triple; used as the queue's dedup key.
    pub fn hash(&self) -> u64 {
        stable_hash(&(self.skill, self.metric, self.direction))
    }

    /// Stable identity over (skill, metric) only; two directions for the
    /// same (skill, metric) share a family hash.
    pub fn family_hash(&self) -> u64 {
        stable_hash(&(self.skill, self.metric))
    }
}

fn stable_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = ahash::AHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}
