//! Command intake: the single entry point for all four command sources.
//!
//! Intake turns a raw [`IncomingCommandEvent`] into a queue entry, or explains
//! why it did not. The steps run in a fixed order:
//!
//! 1. roll over an expired remote session (every source except the safety monitor);
//! 2. drop resubmissions of an already-activated remote command, repeated
//!    presses of the panel button that is already in effect, and panel
//!    selections that merely echo a recent call-center command;
//! 3. resolve the token through the registry;
//! 4. enqueue.
//!
//! Self stops bypass step 1 and 2 entirely.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvariantViolation;
use crate::flags::{ControlFlagTracker, FlagEventId, SessionRollover};
use crate::queue::{CommandQueue, Provenance, ProvenanceKind, QueuedCommand, QueuedCommandId};
use crate::registry::{CommandRegistry, PanelClass, SELF_STOP_TOKEN, panel_token};
use crate::safety::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntakeEventId(u64);

impl IntakeEventId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IntakeEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A command sent under a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub token: String,
    /// Remote session the sender believes is active.
    pub session: Option<FlagEventId>,
    pub actor_id: String,
}

impl RemoteCommand {
    #[must_use]
    pub fn new(token: impl Into<String>, session: Option<FlagEventId>, actor_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            session,
            actor_id: actor_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSelection {
    pub class: PanelClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfStopRequest {
    pub reason: StopReason,
}

/// Raw command event from one of the four sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum IncomingCommandEvent {
    Technician(RemoteCommand),
    CallCenter(RemoteCommand),
    PanelSelection(PanelSelection),
    SelfUrgentStop(SelfStopRequest),
}

impl IncomingCommandEvent {
    #[must_use]
    pub const fn kind(&self) -> ProvenanceKind {
        match self {
            Self::Technician(_) => ProvenanceKind::Technician,
            Self::CallCenter(_) => ProvenanceKind::CallCenter,
            Self::PanelSelection(_) => ProvenanceKind::PanelSelection,
            Self::SelfUrgentStop(_) => ProvenanceKind::SelfUrgentStop,
        }
    }

    /// Registry token this event resolves through.
    #[must_use]
    pub fn token(&self) -> String {
        match self {
            Self::Technician(cmd) | Self::CallCenter(cmd) => cmd.token.clone(),
            Self::PanelSelection(sel) => panel_token(sel.class),
            Self::SelfUrgentStop(_) => SELF_STOP_TOKEN.to_string(),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SuppressReason {
    /// Same token and session as the previous command of this source, which
    /// already became the current command.
    AlreadyActivated { prior: QueuedCommandId },
    /// The same panel button as the previous selection, which is active and
    /// still the newest queue entry.
    RepeatedPanelSelection { prior: QueuedCommandId },
    /// A call-center command for the same panel class was accepted moments ago.
    PanelEcho { call_center_command: QueuedCommandId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownCommand { token: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum IntakeOutcome {
    Accepted(QueuedCommand),
    Suppressed(SuppressReason),
    Rejected(RejectReason),
}

impl IntakeOutcome {
    #[must_use]
    pub const fn accepted(&self) -> Option<&QueuedCommand> {
        match self {
            Self::Accepted(entry) => Some(entry),
            Self::Suppressed(_) | Self::Rejected(_) => None,
        }
    }
}

/// Everything intake did with one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub event_id: IntakeEventId,
    pub outcome: IntakeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollover: Option<SessionRollover>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeStats {
    pub accepted: u64,
    pub suppressed: u64,
    pub rejected: u64,
    pub rollovers: u64,
}

// =============================================================================
// Intake
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeSettings {
    /// Attributed as the actor of implicit session rollovers.
    pub machine_id: String,
    /// How long a call-center command masks a matching panel selection.
    pub panel_echo_window: TimeDelta,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            machine_id: "MACHINE001".to_string(),
            panel_echo_window: TimeDelta::seconds(60),
        }
    }
}

#[derive(Debug, Clone)]
struct PriorRemote {
    token: String,
    session: Option<FlagEventId>,
    command: QueuedCommandId,
}

#[derive(Debug, Clone)]
pub struct CommandIntake {
    registry: CommandRegistry,
    settings: IntakeSettings,
    next_event_id: u64,
    last_technician: Option<PriorRemote>,
    last_call_center: Option<PriorRemote>,
    last_panel: Option<(PanelClass, QueuedCommandId)>,
    stats: IntakeStats,
}

impl CommandIntake {
    #[must_use]
    pub fn new(registry: CommandRegistry, settings: IntakeSettings) -> Self {
        Self {
            registry,
            settings,
            next_event_id: 1,
            last_technician: None,
            last_call_center: None,
            last_panel: None,
            stats: IntakeStats::default(),
        }
    }

    pub fn submit(
        &mut self,
        event: IncomingCommandEvent,
        tracker: &mut ControlFlagTracker,
        queue: &mut CommandQueue,
        now: DateTime<Utc>,
    ) -> Result<Submission, InvariantViolation> {
        let event_id = IntakeEventId(self.next_event_id);
        self.next_event_id += 1;

        let rollover = if matches!(event, IncomingCommandEvent::SelfUrgentStop(_)) {
            None
        } else {
            tracker.roll_over_expired_session(now, &self.settings.machine_id)?
        };
        if rollover.is_some() {
            self.stats.rollovers += 1;
        }

        let outcome = self.admit(event_id, event, queue, now);
        match &outcome {
            IntakeOutcome::Accepted(entry) => {
                self.stats.accepted += 1;
                tracing::debug!(
                    event_id = %event_id,
                    command_id = %entry.id,
                    token = %entry.token(),
                    provenance = %entry.provenance.kind(),
                    "command accepted"
                );
            }
            IntakeOutcome::Suppressed(reason) => {
                self.stats.suppressed += 1;
                tracing::debug!(event_id = %event_id, reason = ?reason, "command suppressed");
            }
            IntakeOutcome::Rejected(RejectReason::UnknownCommand { token }) => {
                self.stats.rejected += 1;
                tracing::warn!(event_id = %event_id, token = %token, "unknown command token");
            }
        }

        Ok(Submission {
            event_id,
            outcome,
            rollover,
        })
    }

    fn admit(
        &mut self,
        event_id: IntakeEventId,
        event: IncomingCommandEvent,
        queue: &mut CommandQueue,
        now: DateTime<Utc>,
    ) -> IntakeOutcome {
        if let Some(reason) = self.duplicate_of(&event, queue, now) {
            return IntakeOutcome::Suppressed(reason);
        }

        let token = event.token();
        let definition = match self.registry.lookup(&token) {
            Ok(def) => def,
            Err(_) => return IntakeOutcome::Rejected(RejectReason::UnknownCommand { token }),
        };

        let provenance = match event {
            IncomingCommandEvent::Technician(cmd) => Provenance::Technician {
                event_id,
                session: cmd.session,
                actor_id: cmd.actor_id,
            },
            IncomingCommandEvent::CallCenter(cmd) => Provenance::CallCenter {
                event_id,
                session: cmd.session,
                actor_id: cmd.actor_id,
            },
            IncomingCommandEvent::PanelSelection(sel) => Provenance::PanelSelection {
                event_id,
                class: sel.class,
            },
            IncomingCommandEvent::SelfUrgentStop(req) => Provenance::SelfUrgentStop {
                event_id,
                reason: req.reason,
            },
        };
        let session = provenance.session();
        let kind = provenance.kind();
        let entry = queue.enqueue(definition, provenance, now);

        let prior = PriorRemote {
            token,
            session,
            command: entry.id,
        };
        match kind {
            ProvenanceKind::Technician => self.last_technician = Some(prior),
            ProvenanceKind::CallCenter => self.last_call_center = Some(prior),
            ProvenanceKind::PanelSelection => {
                self.last_panel = Some((entry.definition.panel_class, entry.id));
            }
            ProvenanceKind::SelfUrgentStop => {}
        }
        IntakeOutcome::Accepted(entry)
    }

    fn duplicate_of(
        &self,
        event: &IncomingCommandEvent,
        queue: &CommandQueue,
        now: DateTime<Utc>,
    ) -> Option<SuppressReason> {
        match event {
            IncomingCommandEvent::Technician(cmd) => {
                Self::already_activated(self.last_technician.as_ref(), cmd, queue)
            }
            IncomingCommandEvent::CallCenter(cmd) => {
                Self::already_activated(self.last_call_center.as_ref(), cmd, queue)
            }
            IncomingCommandEvent::PanelSelection(sel) => {
                if let Some(reason) = self.repeated_panel(sel.class, queue) {
                    return Some(reason);
                }
                let since = now - self.settings.panel_echo_window;
                queue
                    .recent_of_kind(ProvenanceKind::CallCenter, since)
                    .find(|entry| entry.definition.panel_class == sel.class)
                    .map(|entry| SuppressReason::PanelEcho {
                        call_center_command: entry.id,
                    })
            }
            IncomingCommandEvent::SelfUrgentStop(_) => None,
        }
    }

    fn repeated_panel(&self, class: PanelClass, queue: &CommandQueue) -> Option<SuppressReason> {
        let (prior_class, prior) = self.last_panel?;
        if prior_class != class {
            return None;
        }
        queue
            .newest()
            .filter(|entry| entry.id == prior && entry.activated)
            .map(|entry| SuppressReason::RepeatedPanelSelection { prior: entry.id })
    }

    // A pending (not yet activated) duplicate is let through as a retry.
    fn already_activated(
        prior: Option<&PriorRemote>,
        cmd: &RemoteCommand,
        queue: &CommandQueue,
    ) -> Option<SuppressReason> {
        let prior = prior?;
        if prior.token != cmd.token || prior.session != cmd.session {
            return None;
        }
        queue
            .get(prior.command)
            .filter(|entry| entry.activated)
            .map(|entry| SuppressReason::AlreadyActivated { prior: entry.id })
    }

    #[must_use]
    pub const fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn settings(&self) -> &IntakeSettings {
        &self.settings
    }

    #[must_use]
    pub const fn stats(&self) -> IntakeStats {
        self.stats
    }
}
