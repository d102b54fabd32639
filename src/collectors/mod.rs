/*!
 * Collector contract
 * Generalizes `monitoring::collection::Collector`: dynamic dispatch over
 * collector behavior via a trait object registry, each enabled collector a
 * distinct implementing type.
 */

pub mod demo;

use crate::domain::{Metric, Severity, Skill};
use std::collections::HashMap;
use std::fmt::Debug;

/// One probe of runtime-intelligence telemetry for a single skill.
pub trait Collector: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// The skill this collector reports metrics for.
    fn skill(&self) -> Skill;

    /// Gather the current metric sample set. A failure is logged at warn by
    /// the poller and does not stop other collectors from running.
    fn collect(&self) -> Result<HashMap<Metric, f64>, String>;

    /// Collector-specific anomaly check over its own freshly collected
    /// metrics, independent of `StatsTracker`'s streaming verdicts. Most
    /// collectors have no bespoke check and simply return `None`.
    fn check(&self, metrics: &HashMap<Metric, f64>) -> Option<(Metric, Severity, String)> {
        let _ = metrics;
        None
    }
}

/// Ordered set of enabled collectors driving the poller loop.
#[derive(Debug, Default)]
pub struct CollectorRegistry {
    collectors: Vec<Box<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collector: Box<dyn Collector>) -> &mut Self {
        self.collectors.push(collector);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Collector> {
        self.collectors.iter().map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}
