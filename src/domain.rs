/*!
 * Closed Domain Enumerations
 *
 * Skills and metrics are closed enumerations known at compile time, per the
 * "Atom/symbol identity" design note: fingerprints hash these enums
 * directly, never raw strings from untrusted input, which keeps the
 * fingerprint/family-hash keyspace bounded.
 */

use serde::{Deserialize, Serialize};

/// A unit of runtime-intelligence capability being monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skill {
    CodeGen,
    Retrieval,
    Planning,
    ToolUse,
    Summarization,
}

/// A metric tracked per-skill by the `StatsTracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    LatencyMs,
    ErrorRate,
    TokenThroughput,
    QueueDepth,
    MemoryUsageMb,
}

/// Direction of deviation from the tracked EWMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    /// `direction(value, ewma) = above if value > ewma else below`.
    #[inline]
    pub fn of(value: f64, ewma: f64) -> Self {
        if value > ewma {
            Direction::Above
        } else {
            Direction::Below
        }
    }
}

/// Severity of a detected anomaly or queued proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
    Emergency,
}
