//! Arbitration: deciding which queued command drives the machine.
//!
//! The decision itself is [`decide`], a pure function of the candidate, the
//! class of the current command and the flag snapshot. [`ArbitrationEngine`]
//! wraps it with the side effects: marking the entry processed (and activated
//! when accepted), replacing the current command, and asking the safety stop
//! generator for a stop when a candidate is rejected.
//!
//! # Authority rules
//!
//! A *start transition* is moving into a running grade from anything else, or
//! any move to `off`. In operational mode start transitions belong to, in
//! order of precedence:
//!
//! | registered | remote | disabled | accepted from |
//! |---|---|---|---|
//! | no  | -   | -   | nobody |
//! | yes | yes | -   | call center on the active session, self stop |
//! | yes | no  | no  | panel, self stop |
//! | yes | no  | yes | self stop |
//!
//! Anything that is not a start transition is either ignored or, if it came
//! from the party that holds authority, rejected and answered with a stop.
//! Setup mode ignores registration: the active session holder may issue setup
//! commands while the machine is not running, otherwise only the panel may.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, InvariantViolation, Result};
use crate::flags::{AggregatedControlFlags, ControlFlagTracker, FlagEventId};
use crate::intake::IncomingCommandEvent;
use crate::queue::{CommandQueue, ProvenanceKind, QueuedCommand, QueuedCommandId};
use crate::registry::{OperatingMode, PanelClass};
use crate::safety::SafetyStopGenerator;

// =============================================================================
// Verdicts
// =============================================================================

/// Why a candidate left the current command untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    /// Machine is not registered; operational starts are refused.
    Unregistered,
    /// A remote session holds authority and this candidate is not from it.
    RemoteSessionActive,
    /// Remote command naming a session other than the active one.
    SessionMismatch,
    /// No remote session; only the panel may command.
    LocalControlRequired,
    /// Machine is disabled; only a self stop may act.
    MachineDisabled,
    /// Not a start transition and not from the party holding authority.
    IgnoredMidRun,
}

/// Why a candidate was rejected outright (and answered with a stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Call center sent a non-start command while the machine runs under its session.
    RemoteMidRun,
    /// Non-call-center command while the machine runs under local control.
    LocalMidRun,
    /// Setup command from the active session while the machine is running.
    SetupWhileRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    NoOp(NoOpReason),
    Reject(RejectionReason),
}

impl Verdict {
    #[must_use]
    pub const fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }

    #[must_use]
    pub const fn is_reject(self) -> bool {
        matches!(self, Self::Reject(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::NoOp(reason) => write!(f, "no_op({reason:?})"),
            Self::Reject(reason) => write!(f, "reject({reason:?})"),
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// The parts of a queued command a decision reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub mode: OperatingMode,
    pub class: PanelClass,
    pub source: ProvenanceKind,
    pub session: Option<FlagEventId>,
}

impl From<&QueuedCommand> for Candidate {
    fn from(entry: &QueuedCommand) -> Self {
        Self {
            mode: entry.definition.mode,
            class: entry.definition.panel_class,
            source: entry.provenance.kind(),
            session: entry.provenance.session(),
        }
    }
}

/// The parts of the flag snapshot a decision reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagView {
    pub registered: bool,
    pub disabled: bool,
    /// Id of the active remote session, if any.
    pub remote_session: Option<FlagEventId>,
}

impl From<&AggregatedControlFlags> for FlagView {
    fn from(flags: &AggregatedControlFlags) -> Self {
        Self {
            registered: flags.is_registered(),
            disabled: flags.is_disabled(),
            remote_session: flags.active_session(),
        }
    }
}

/// Moving into a running grade from a non-running state, or stopping.
///
/// No current command counts as not running.
#[must_use]
pub fn is_start_transition(candidate: PanelClass, current: Option<PanelClass>) -> bool {
    let currently_running = current.is_some_and(PanelClass::is_running);
    (candidate.is_running() && !currently_running) || candidate == PanelClass::Off
}

#[must_use]
pub fn decide(candidate: Candidate, current: Option<PanelClass>, flags: FlagView) -> Verdict {
    match candidate.mode {
        OperatingMode::Operational => decide_operational(candidate, current, flags),
        OperatingMode::Setup => decide_setup(candidate, current, flags),
    }
}

fn session_matches(candidate: Candidate, active: FlagEventId) -> bool {
    candidate.session == Some(active)
}

fn decide_operational(candidate: Candidate, current: Option<PanelClass>, flags: FlagView) -> Verdict {
    use ProvenanceKind::{CallCenter, PanelSelection, SelfUrgentStop, Technician};

    if is_start_transition(candidate.class, current) {
        if !flags.registered {
            return Verdict::NoOp(NoOpReason::Unregistered);
        }
        return match (flags.remote_session, flags.disabled) {
            (Some(active), _) => match candidate.source {
                SelfUrgentStop => Verdict::Accept,
                CallCenter if session_matches(candidate, active) => Verdict::Accept,
                CallCenter => Verdict::NoOp(NoOpReason::SessionMismatch),
                Technician | PanelSelection => Verdict::NoOp(NoOpReason::RemoteSessionActive),
            },
            (None, false) => match candidate.source {
                PanelSelection | SelfUrgentStop => Verdict::Accept,
                Technician | CallCenter => Verdict::NoOp(NoOpReason::LocalControlRequired),
            },
            (None, true) => match candidate.source {
                SelfUrgentStop => Verdict::Accept,
                Technician | CallCenter | PanelSelection => {
                    Verdict::NoOp(NoOpReason::MachineDisabled)
                }
            },
        };
    }

    let remote = flags.remote_session.is_some();
    match (flags.registered, candidate.source, remote, flags.disabled) {
        (true, CallCenter, true, _) => Verdict::Reject(RejectionReason::RemoteMidRun),
        (true, Technician | PanelSelection | SelfUrgentStop, false, false) => {
            Verdict::Reject(RejectionReason::LocalMidRun)
        }
        _ => Verdict::NoOp(NoOpReason::IgnoredMidRun),
    }
}

fn decide_setup(candidate: Candidate, current: Option<PanelClass>, flags: FlagView) -> Verdict {
    use ProvenanceKind::{CallCenter, PanelSelection, SelfUrgentStop, Technician};

    let running = current.is_some_and(PanelClass::is_running);
    match flags.remote_session {
        Some(active) => match candidate.source {
            Technician | CallCenter if session_matches(candidate, active) => {
                if running {
                    Verdict::Reject(RejectionReason::SetupWhileRunning)
                } else {
                    Verdict::Accept
                }
            }
            Technician | CallCenter => Verdict::NoOp(NoOpReason::SessionMismatch),
            PanelSelection | SelfUrgentStop => Verdict::NoOp(NoOpReason::RemoteSessionActive),
        },
        None => match candidate.source {
            PanelSelection => Verdict::Accept,
            Technician | CallCenter | SelfUrgentStop => {
                Verdict::NoOp(NoOpReason::LocalControlRequired)
            }
        },
    }
}

// =============================================================================
// Current command
// =============================================================================

/// Executor-reported progress of the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    None,
    #[serde(rename = "inprogress", alias = "in_progress")]
    InProgress,
    Satisfied,
    Error,
}

impl CommandStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::InProgress => "inprogress",
            Self::Satisfied => "satisfied",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the executor may report back. `none` belongs to arbitration alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    #[serde(rename = "inprogress", alias = "in_progress")]
    InProgress,
    Satisfied,
    Error,
}

impl From<ExecutorStatus> for CommandStatus {
    fn from(status: ExecutorStatus) -> Self {
        match status {
            ExecutorStatus::InProgress => Self::InProgress,
            ExecutorStatus::Satisfied => Self::Satisfied,
            ExecutorStatus::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentCommandState {
    pub command: QueuedCommand,
    pub status: CommandStatus,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of evaluating one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub command_id: QueuedCommandId,
    pub token: String,
    pub source: ProvenanceKind,
    pub verdict: Verdict,
    /// Stop request raised for a rejection; the caller feeds it through intake.
    #[serde(skip)]
    pub stop_request: Option<IncomingCommandEvent>,
    /// Queue entry of that stop, once intake has accepted it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_stop: Option<QueuedCommandId>,
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ArbitrationEngine {
    current: Option<CurrentCommandState>,
    halted: Option<InvariantViolation>,
}

impl ArbitrationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the oldest pending entry, if any.
    pub fn evaluate_next(
        &mut self,
        tracker: &ControlFlagTracker,
        queue: &mut CommandQueue,
        safety: &mut SafetyStopGenerator,
        now: DateTime<Utc>,
    ) -> Result<Option<Evaluation>> {
        if let Some(violation) = &self.halted {
            return Err(Error::Halted(violation.clone()));
        }
        let Some(entry) = queue.next_pending().cloned() else {
            return Ok(None);
        };

        let flags = match tracker.snapshot() {
            Ok(flags) => flags,
            Err(violation) => return Err(self.halt(violation)),
        };
        let current_class = self
            .current
            .as_ref()
            .map(|state| state.command.definition.panel_class);
        let verdict = decide(Candidate::from(&entry), current_class, FlagView::from(&flags));

        if let Err(violation) = queue.mark_evaluated(entry.id, verdict.is_accept()) {
            return Err(self.halt(violation));
        }

        let source = entry.provenance.kind();
        let stop_request = match verdict {
            Verdict::Accept => {
                tracing::info!(
                    command_id = %entry.id,
                    token = %entry.token(),
                    provenance = %source,
                    actuator_command = %entry.definition.actuator_command,
                    "command activated"
                );
                let mut command = entry.clone();
                command.processed = true;
                command.activated = true;
                self.current = Some(CurrentCommandState {
                    command,
                    status: CommandStatus::None,
                    updated_at: now,
                });
                None
            }
            Verdict::NoOp(reason) => {
                tracing::debug!(
                    command_id = %entry.id,
                    token = %entry.token(),
                    provenance = %source,
                    reason = ?reason,
                    "command ignored"
                );
                None
            }
            Verdict::Reject(reason) => {
                tracing::warn!(
                    command_id = %entry.id,
                    token = %entry.token(),
                    provenance = %source,
                    reason = ?reason,
                    "command rejected"
                );
                Some(safety.on_rejection(entry.id))
            }
        };

        Ok(Some(Evaluation {
            command_id: entry.id,
            token: entry.token().to_string(),
            source,
            verdict,
            stop_request,
            safety_stop: None,
        }))
    }

    /// Persist executor feedback if `command_id` is still current.
    pub fn report_status(
        &mut self,
        command_id: QueuedCommandId,
        status: ExecutorStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let status = CommandStatus::from(status);
        match self.current.as_mut() {
            Some(state) if state.command.id == command_id => {
                tracing::debug!(command_id = %command_id, status = %status, "command status updated");
                state.status = status;
                state.updated_at = now;
                true
            }
            _ => {
                tracing::debug!(command_id = %command_id, status = %status, "stale command status ignored");
                false
            }
        }
    }

    #[must_use]
    pub const fn current(&self) -> Option<&CurrentCommandState> {
        self.current.as_ref()
    }

    /// Stop arbitrating until [`ArbitrationEngine::resume`] succeeds.
    pub fn halt(&mut self, violation: InvariantViolation) -> Error {
        tracing::error!(violation = %violation, "arbitration halted on invariant violation");
        self.halted = Some(violation.clone());
        Error::Invariant(violation)
    }

    #[must_use]
    pub const fn halted(&self) -> Option<&InvariantViolation> {
        self.halted.as_ref()
    }

    /// Re-check invariants and clear the halt if they hold again.
    pub fn resume(
        &mut self,
        tracker: &ControlFlagTracker,
        queue: &CommandQueue,
    ) -> std::result::Result<(), InvariantViolation> {
        tracker.validate()?;
        queue.validate()?;
        if let Some(previous) = self.halted.take() {
            tracing::info!(violation = %previous, "arbitration resumed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1: FlagEventId = FlagEventId::new(1);
    const S2: FlagEventId = FlagEventId::new(2);

    fn candidate(mode: OperatingMode, class: PanelClass, source: ProvenanceKind) -> Candidate {
        Candidate {
            mode,
            class,
            source,
            session: if source.is_remote() { Some(S1) } else { None },
        }
    }

    fn local(registered: bool, disabled: bool) -> FlagView {
        FlagView {
            registered,
            disabled,
            remote_session: None,
        }
    }

    fn remote(session: FlagEventId) -> FlagView {
        FlagView {
            registered: true,
            disabled: false,
            remote_session: Some(session),
        }
    }

    #[test]
    fn start_transition_table() {
        assert!(is_start_transition(PanelClass::Aa, None));
        assert!(is_start_transition(PanelClass::Aa, Some(PanelClass::Off)));
        assert!(is_start_transition(PanelClass::B, Some(PanelClass::Color)));
        assert!(!is_start_transition(PanelClass::A, Some(PanelClass::Aa)));
        assert!(is_start_transition(PanelClass::Off, Some(PanelClass::Off)));
        assert!(is_start_transition(PanelClass::Off, Some(PanelClass::Aa)));
        assert!(!is_start_transition(PanelClass::Color, None));
        assert!(!is_start_transition(PanelClass::Service, Some(PanelClass::Off)));
    }

    #[test]
    fn local_panel_start_is_accepted() {
        let c = candidate(OperatingMode::Operational, PanelClass::Aa, ProvenanceKind::PanelSelection);
        assert_eq!(decide(c, Some(PanelClass::Off), local(true, false)), Verdict::Accept);
        assert_eq!(decide(c, None, local(true, false)), Verdict::Accept);
    }

    #[test]
    fn unregistered_start_is_ignored() {
        let c = candidate(OperatingMode::Operational, PanelClass::Aa, ProvenanceKind::PanelSelection);
        assert_eq!(
            decide(c, Some(PanelClass::Off), local(false, false)),
            Verdict::NoOp(NoOpReason::Unregistered)
        );
        let stop = candidate(OperatingMode::Operational, PanelClass::Off, ProvenanceKind::SelfUrgentStop);
        assert_eq!(
            decide(stop, Some(PanelClass::Aa), local(false, false)),
            Verdict::NoOp(NoOpReason::Unregistered)
        );
    }

    #[test]
    fn remote_start_requires_matching_call_center() {
        let cc = candidate(OperatingMode::Operational, PanelClass::A, ProvenanceKind::CallCenter);
        assert_eq!(decide(cc, Some(PanelClass::Off), remote(S1)), Verdict::Accept);
        assert_eq!(
            decide(cc, Some(PanelClass::Off), remote(S2)),
            Verdict::NoOp(NoOpReason::SessionMismatch)
        );
        let tech = candidate(OperatingMode::Operational, PanelClass::A, ProvenanceKind::Technician);
        assert_eq!(
            decide(tech, Some(PanelClass::Off), remote(S1)),
            Verdict::NoOp(NoOpReason::RemoteSessionActive)
        );
        let panel = candidate(OperatingMode::Operational, PanelClass::A, ProvenanceKind::PanelSelection);
        assert_eq!(
            decide(panel, Some(PanelClass::Off), remote(S1)),
            Verdict::NoOp(NoOpReason::RemoteSessionActive)
        );
    }

    #[test]
    fn disabled_machine_only_takes_self_stop() {
        let panel_off = candidate(OperatingMode::Operational, PanelClass::Off, ProvenanceKind::PanelSelection);
        assert_eq!(
            decide(panel_off, Some(PanelClass::Aa), local(true, true)),
            Verdict::NoOp(NoOpReason::MachineDisabled)
        );
        let stop = candidate(OperatingMode::Operational, PanelClass::Off, ProvenanceKind::SelfUrgentStop);
        assert_eq!(decide(stop, Some(PanelClass::Aa), local(true, true)), Verdict::Accept);
    }

    #[test]
    fn call_center_mid_run_under_session_is_rejected() {
        let cc = candidate(OperatingMode::Operational, PanelClass::Aa, ProvenanceKind::CallCenter);
        assert_eq!(
            decide(cc, Some(PanelClass::Aa), remote(S1)),
            Verdict::Reject(RejectionReason::RemoteMidRun)
        );
    }

    #[test]
    fn local_mid_run_is_rejected() {
        let panel = candidate(OperatingMode::Operational, PanelClass::B, ProvenanceKind::PanelSelection);
        assert_eq!(
            decide(panel, Some(PanelClass::Aa), local(true, false)),
            Verdict::Reject(RejectionReason::LocalMidRun)
        );
    }

    #[test]
    fn mid_run_from_outside_authority_is_ignored() {
        let tech = candidate(OperatingMode::Operational, PanelClass::B, ProvenanceKind::Technician);
        assert_eq!(
            decide(tech, Some(PanelClass::Aa), remote(S1)),
            Verdict::NoOp(NoOpReason::IgnoredMidRun)
        );
        let panel = candidate(OperatingMode::Operational, PanelClass::B, ProvenanceKind::PanelSelection);
        assert_eq!(
            decide(panel, Some(PanelClass::Aa), local(true, true)),
            Verdict::NoOp(NoOpReason::IgnoredMidRun)
        );
        assert_eq!(
            decide(panel, Some(PanelClass::Aa), local(false, false)),
            Verdict::NoOp(NoOpReason::IgnoredMidRun)
        );
    }

    #[test]
    fn setup_under_session() {
        let tech = candidate(OperatingMode::Setup, PanelClass::Service, ProvenanceKind::Technician);
        assert_eq!(decide(tech, Some(PanelClass::Off), remote(S1)), Verdict::Accept);
        assert_eq!(decide(tech, None, remote(S1)), Verdict::Accept);
        assert_eq!(
            decide(tech, Some(PanelClass::A), remote(S1)),
            Verdict::Reject(RejectionReason::SetupWhileRunning)
        );
        assert_eq!(
            decide(tech, Some(PanelClass::Off), remote(S2)),
            Verdict::NoOp(NoOpReason::SessionMismatch)
        );
    }

    #[test]
    fn setup_without_session_belongs_to_panel() {
        let panel = candidate(OperatingMode::Setup, PanelClass::Service, ProvenanceKind::PanelSelection);
        assert_eq!(decide(panel, Some(PanelClass::Aa), local(false, true)), Verdict::Accept);
        let tech = candidate(OperatingMode::Setup, PanelClass::Service, ProvenanceKind::Technician);
        assert_eq!(
            decide(tech, Some(PanelClass::Off), local(true, false)),
            Verdict::NoOp(NoOpReason::LocalControlRequired)
        );
    }

    #[test]
    fn report_status_only_for_current() {
        let mut engine = ArbitrationEngine::new();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert!(!engine.report_status(QueuedCommandId::new(1), ExecutorStatus::InProgress, now));
    }

    #[test]
    fn verdict_serde_shape() {
        assert_eq!(
            serde_json::to_value(Verdict::Reject(RejectionReason::LocalMidRun)).unwrap(),
            serde_json::json!({"verdict": "reject", "reason": "local_mid_run"})
        );
        assert_eq!(
            serde_json::to_value(Verdict::Accept).unwrap(),
            serde_json::json!({"verdict": "accept"})
        );
    }

    #[test]
    fn command_status_strings() {
        assert_eq!(CommandStatus::InProgress.to_string(), "inprogress");
        assert_eq!(
            serde_json::to_value(CommandStatus::InProgress).unwrap(),
            serde_json::json!("inprogress")
        );
        let parsed: CommandStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, CommandStatus::InProgress);
    }

    #[test]
    fn executor_cannot_report_none() {
        let parsed: ExecutorStatus = serde_json::from_str("\"inprogress\"").unwrap();
        assert_eq!(CommandStatus::from(parsed), CommandStatus::InProgress);
        assert!(serde_json::from_str::<ExecutorStatus>("\"none\"").is_err());
        assert_eq!(CommandStatus::from(ExecutorStatus::Error), CommandStatus::Error);
    }
}
