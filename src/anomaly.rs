/*!
 * Anomaly Event
 * The wire-ish anomaly event shape consumed by the queue.
 *
 * `details` carries required fields as `Option` rather than bare values:
 * anomalies can arrive from external collectors/workers which may omit
 * `metric`/`value`/`ewma`, and `Fingerprint::from_anomaly` is the boundary
 * that turns a missing field into a typed `invalid_anomaly` error instead of
 * a panic.
 */

use crate::domain::{Metric, Severity, Skill};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyDetails {
    pub metric: Option<Metric>,
    pub value: Option<f64>,
    pub ewma: Option<f64>,
    /// Defaults to 1.0 when absent.
    pub stddev: Option<f64>,
    /// Derived (`deviation / stddev`) when absent.
    pub deviation_stddevs: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AnomalyDetails {
    pub fn stddev_or_default(&self) -> f64 {
        self.stddev.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// The queue generates an id when absent.
    pub id: Option<Uuid>,
    pub skill: Skill,
    pub severity: Severity,
    pub details: AnomalyDetails,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Anomaly {
    pub fn new(skill: Skill, severity: Severity, details: AnomalyDetails) -> Self {
        Self {
            id: None,
            skill,
            severity,
            details,
            timestamp: Utc::now(),
        }
    }
}
