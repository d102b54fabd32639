//! Self-healing anomaly pipeline: streaming anomaly detection, a dedup +
//! lease-based work queue, cascade backpressure, soak-period verification,
//! and three-strike rejection escalation, wired together as independent
//! actor tasks under one supervisor.

pub mod anomaly;
pub mod cascade;
pub mod clock;
pub mod collectors;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fingerprint;
pub mod poller;
pub mod queue;
pub mod rejection;
pub mod signals;
pub mod stats;
pub mod supervisor;
pub mod verification;

pub use anomaly::{Anomaly, AnomalyDetails};
pub use cascade::{CascadeDetector, CascadeSnapshot, CascadeStatus};
pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use collectors::{Collector, CollectorRegistry};
pub use config::Config;
pub use domain::{Direction, Metric, Severity, Skill};
pub use errors::{FingerprintError, PipelineError, QueueError, VerificationError};
pub use fingerprint::Fingerprint;
pub use poller::{MetricsEmitter, MetricsSink, Poller};
pub use queue::{AnomalyQueue, AnomalyState, CompletionOutcome, EnqueueOutcome, LeaseToken, QueueStats, QueuedAnomaly};
pub use rejection::{RejectionOutcome, RejectionTracker, Strategy};
pub use signals::{RecordingSink, SignalCategory, SignalEmitter, SignalPayload, SignalSink};
pub use stats::{StatsSnapshot, StatsTracker, Verdict};
pub use supervisor::{PipelineHandle, Supervisor};
pub use verification::{CycleResult, Verification, VerificationOutcome, VerificationStats};
