//! Unified command queue.
//!
//! Every accepted intake event becomes one [`QueuedCommand`] that references
//! its registry definition and records where it came from. Arbitration drains
//! the queue strictly in creation order; entries are never reordered or
//! removed, so the queue doubles as the audit trail of what was considered.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::InvariantViolation;
use crate::flags::FlagEventId;
use crate::intake::IntakeEventId;
use crate::registry::{CommandDefinition, PanelClass};
use crate::safety::StopReason;

/// How far back [`CommandQueue::recent_of_kind`] scans.
pub const RECENT_SCAN_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct QueuedCommandId(u64);

impl QueuedCommandId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueuedCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Provenance
// =============================================================================

/// Which source a queued command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceKind {
    Technician,
    CallCenter,
    PanelSelection,
    SelfUrgentStop,
}

impl ProvenanceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Technician => "technician",
            Self::CallCenter => "call_center",
            Self::PanelSelection => "panel_selection",
            Self::SelfUrgentStop => "self_urgent_stop",
        }
    }

    /// Technician and call-center commands are bound to a remote session.
    #[must_use]
    pub const fn is_remote(self) -> bool {
        matches!(self, Self::Technician | Self::CallCenter)
    }
}

impl fmt::Display for ProvenanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a queued command plus the source-specific detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    Technician {
        event_id: IntakeEventId,
        session: Option<FlagEventId>,
        actor_id: String,
    },
    CallCenter {
        event_id: IntakeEventId,
        session: Option<FlagEventId>,
        actor_id: String,
    },
    PanelSelection {
        event_id: IntakeEventId,
        class: PanelClass,
    },
    SelfUrgentStop {
        event_id: IntakeEventId,
        reason: StopReason,
    },
}

impl Provenance {
    #[must_use]
    pub const fn kind(&self) -> ProvenanceKind {
        match self {
            Self::Technician { .. } => ProvenanceKind::Technician,
            Self::CallCenter { .. } => ProvenanceKind::CallCenter,
            Self::PanelSelection { .. } => ProvenanceKind::PanelSelection,
            Self::SelfUrgentStop { .. } => ProvenanceKind::SelfUrgentStop,
        }
    }

    #[must_use]
    pub const fn event_id(&self) -> IntakeEventId {
        match self {
            Self::Technician { event_id, .. }
            | Self::CallCenter { event_id, .. }
            | Self::PanelSelection { event_id, .. }
            | Self::SelfUrgentStop { event_id, .. } => *event_id,
        }
    }

    /// Remote session the sender presumed active; `None` for local sources.
    #[must_use]
    pub const fn session(&self) -> Option<FlagEventId> {
        match self {
            Self::Technician { session, .. } | Self::CallCenter { session, .. } => *session,
            Self::PanelSelection { .. } | Self::SelfUrgentStop { .. } => None,
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedCommand {
    pub id: QueuedCommandId,
    pub definition: Arc<CommandDefinition>,
    pub provenance: Provenance,
    /// Set once, by the arbitration decision that evaluated this entry.
    pub processed: bool,
    /// Set iff this entry became the current command. Never reset.
    pub activated: bool,
    pub created_at: DateTime<Utc>,
}

impl QueuedCommand {
    #[must_use]
    pub fn token(&self) -> &str {
        &self.definition.token
    }
}

/// FIFO of canonical command entries.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    entries: Vec<QueuedCommand>,
    /// Index of the oldest unprocessed entry.
    cursor: usize,
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Ids are dense and start at 1.
    pub fn enqueue(
        &mut self,
        definition: Arc<CommandDefinition>,
        provenance: Provenance,
        now: DateTime<Utc>,
    ) -> QueuedCommand {
        let entry = QueuedCommand {
            id: QueuedCommandId(self.entries.len() as u64 + 1),
            definition,
            provenance,
            processed: false,
            activated: false,
            created_at: now,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Oldest entry arbitration has not evaluated yet.
    #[must_use]
    pub fn next_pending(&self) -> Option<&QueuedCommand> {
        self.entries.get(self.cursor)
    }

    #[must_use]
    pub fn get(&self, id: QueuedCommandId) -> Option<&QueuedCommand> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.entries.get(index)
    }

    #[must_use]
    pub fn entries(&self) -> &[QueuedCommand] {
        &self.entries
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.entries.len() - self.cursor
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of `kind` created strictly after `since`, newest first.
    ///
    /// Only the last [`RECENT_SCAN_LIMIT`] entries are looked at. Timestamps
    /// are not assumed to be monotonic, so a wall clock stepping backwards
    /// does not hide older matches.
    pub fn recent_of_kind(
        &self,
        kind: ProvenanceKind,
        since: DateTime<Utc>,
    ) -> impl Iterator<Item = &QueuedCommand> {
        self.entries
            .iter()
            .rev()
            .take(RECENT_SCAN_LIMIT)
            .filter(move |entry| entry.created_at > since && entry.provenance.kind() == kind)
    }

    /// Most recently enqueued entry.
    #[must_use]
    pub fn newest(&self) -> Option<&QueuedCommand> {
        self.entries.last()
    }

    /// Record the outcome of evaluating the head entry.
    pub(crate) fn mark_evaluated(
        &mut self,
        id: QueuedCommandId,
        activated: bool,
    ) -> Result<(), InvariantViolation> {
        let index = usize::try_from(id.0)
            .ok()
            .and_then(|raw| raw.checked_sub(1))
            .filter(|index| *index < self.entries.len())
            .ok_or(InvariantViolation::MissingEntry(id))?;
        if self.entries[index].processed {
            return Err(InvariantViolation::EvaluatedTwice(id));
        }
        if index != self.cursor {
            return Err(InvariantViolation::OutOfOrder(id));
        }
        let entry = &mut self.entries[index];
        entry.processed = true;
        entry.activated = activated;
        self.cursor += 1;
        Ok(())
    }

    /// Everything before the cursor is processed and nothing after it is.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        for (index, entry) in self.entries.iter().enumerate() {
            let should_be_processed = index < self.cursor;
            if entry.processed != should_be_processed || (entry.activated && !entry.processed) {
                return Err(InvariantViolation::OutOfOrder(entry.id));
            }
        }
        Ok(())
    }
}
