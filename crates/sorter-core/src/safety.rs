//! Safety stop generation.
//!
//! Three things make the machine stop itself: a disable flag turning on, a
//! fault reported by the health monitor, and arbitration rejecting a command
//! that should never have been issued in the current state. Each produces
//! exactly one `self_stop` request, which goes back through intake like any
//! other command so it is queued, arbitrated and audited the same way.
//!
//! Warnings are recorded for the audit trail and never stop anything.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::{DisableEnableEvent, FlagEventId};
use crate::intake::{IncomingCommandEvent, SelfStopRequest};
use crate::queue::QueuedCommandId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultId(u64);

impl FaultId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarningId(u64);

impl fmt::Display for WarningId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the machine stopped itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "trigger", content = "id", rename_all = "snake_case")]
pub enum StopReason {
    Fault(FaultId),
    Disabled(FlagEventId),
    InvalidCommand(QueuedCommandId),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(id) => write!(f, "fault {id}"),
            Self::Disabled(id) => write!(f, "disable event {id}"),
            Self::InvalidCommand(id) => write!(f, "rejected command {id}"),
        }
    }
}

/// Error report from a machine node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub node_type: String,
    pub node_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FaultReport {
    #[must_use]
    pub fn new(
        node_type: impl Into<String>,
        node_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            node_name: node_name.into(),
            message: message.into(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Non-fatal condition from a machine node. Same shape as a fault.
pub type WarningReport = FaultReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedFault {
    pub id: FaultId,
    pub report: FaultReport,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedWarning {
    pub id: WarningId,
    pub report: WarningReport,
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// Generator
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct SafetyStopGenerator {
    faults: Vec<RecordedFault>,
    warnings: Vec<RecordedWarning>,
    stops_issued: u64,
}

impl SafetyStopGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop request for a freshly recorded disable event, if it disables.
    pub fn on_disable_recorded(
        &mut self,
        event_id: FlagEventId,
        event: &DisableEnableEvent,
    ) -> Option<IncomingCommandEvent> {
        if !event.is_disabled {
            return None;
        }
        Some(self.issue(StopReason::Disabled(event_id)))
    }

    pub fn on_fault(
        &mut self,
        report: FaultReport,
        now: DateTime<Utc>,
    ) -> (FaultId, IncomingCommandEvent) {
        let id = FaultId(self.faults.len() as u64 + 1);
        tracing::warn!(
            fault_id = %id,
            node_type = %report.node_type,
            node_name = %report.node_name,
            message = %report.message,
            "node fault reported"
        );
        self.faults.push(RecordedFault {
            id,
            report,
            received_at: now,
        });
        (id, self.issue(StopReason::Fault(id)))
    }

    pub fn on_rejection(&mut self, rejected: QueuedCommandId) -> IncomingCommandEvent {
        self.issue(StopReason::InvalidCommand(rejected))
    }

    pub fn record_warning(&mut self, report: WarningReport, now: DateTime<Utc>) -> WarningId {
        let id = WarningId(self.warnings.len() as u64 + 1);
        tracing::info!(
            warning_id = %id,
            node_type = %report.node_type,
            node_name = %report.node_name,
            message = %report.message,
            "node warning recorded"
        );
        self.warnings.push(RecordedWarning {
            id,
            report,
            received_at: now,
        });
        id
    }

    fn issue(&mut self, reason: StopReason) -> IncomingCommandEvent {
        self.stops_issued += 1;
        tracing::warn!(reason = %reason, "safety stop issued");
        IncomingCommandEvent::SelfUrgentStop(SelfStopRequest { reason })
    }

    #[must_use]
    pub fn faults(&self) -> &[RecordedFault] {
        &self.faults
    }

    #[must_use]
    pub fn warnings(&self) -> &[RecordedWarning] {
        &self.warnings
    }

    #[must_use]
    pub const fn stops_issued(&self) -> u64 {
        self.stops_issued
    }
}
