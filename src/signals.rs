/*!
 * Signal Emission
 * A thin typed interface to the external pub/sub bus, generalized from the
 * teacher's `monitoring::collection::Collector::emit` dispatch and the
 * "Optional signal bus" design note: a `None` sink is a no-op, and emission
 * failures are swallowed at debug level so an observer can never stall the
 * pipeline.
 */

use crate::anomaly::AnomalyDetails;
use crate::domain::{Severity, Skill};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Monitor,
    Healing,
    Persistence,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    AnomalyDetected {
        skill: Skill,
        severity: Severity,
        details: AnomalyDetails,
        timestamp: DateTime<Utc>,
    },
    CascadeDetected {
        rate: usize,
        threshold: usize,
        timestamp: DateTime<Utc>,
    },
    CascadeResolved {
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    HealingVerified {
        fingerprint: Fingerprint,
        fingerprint_hash: u64,
        proposal_id: String,
        soak_cycles: u32,
    },
    HealingIneffective {
        fingerprint: Fingerprint,
        fingerprint_hash: u64,
        proposal_id: String,
        cycles_completed: u32,
    },
    HealingBlocked {
        fingerprint: Fingerprint,
        family_hash: u64,
        rejection_count: u32,
        reasons: Vec<String>,
        proposal_ids: Vec<String>,
        suppression_ttl_minutes: u64,
    },
}

/// Implemented by the external pub/sub bridge. Kept separate from the
/// pipeline core so no component depends on a concrete bus implementation.
pub trait SignalSink: Send + Sync + std::fmt::Debug {
    fn emit(
        &self,
        category: SignalCategory,
        payload: SignalPayload,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub type SignalEmitter = Option<Arc<dyn SignalSink>>;

/// Best-effort emission: a missing sink is a no-op, a failing sink is logged
/// at debug and otherwise ignored.
pub fn emit(emitter: &SignalEmitter, category: SignalCategory, payload: SignalPayload) {
    let Some(sink) = emitter else {
        return;
    };
    if let Err(err) = sink.emit(category, payload) {
        debug!(error = %err, ?category, "signal emission failed; swallowing");
    }
}

/// In-process sink that records emitted signals, for tests and for the demo
/// binary when no real bus is wired up.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<(SignalCategory, SignalPayload)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self) -> Vec<(SignalCategory, SignalPayload)> {
        std::mem::take(&mut self.events.lock())
    }
}

impl SignalSink for RecordingSink {
    fn emit(
        &self,
        category: SignalCategory,
        payload: SignalPayload,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().push((category, payload));
        Ok(())
    }
}
