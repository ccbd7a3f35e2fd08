//! Scripted action sequences.
//!
//! A [`Scenario`] is a JSON list of steps, each one [`Action`] against a
//! [`SorterController`]. The same action shape is accepted line by line by the
//! `sorter run` loop, so a recorded session can be replayed verbatim.
//!
//! ```json
//! {"steps": [
//!   {"action": "register"},
//!   {"action": "panel", "class": "aa"},
//!   {"action": "process"},
//!   {"action": "fault", "node_name": "camera", "message": "no frames", "advance_secs": 5},
//!   {"action": "process"}
//! ]}
//! ```

use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::arbitration::{CurrentCommandState, Evaluation, ExecutorStatus};
use crate::clock::ManualClock;
use crate::controller::{DisableOutcome, FaultOutcome, SorterController};
use crate::error::Result;
use crate::flags::{
    AggregatedControlFlags, DisableEnableEvent, FlagEventId, RegistrationEvent,
    RemoteSessionEvent, SessionRollover,
};
use crate::intake::{IncomingCommandEvent, IntakeStats, PanelSelection, RemoteCommand, Submission};
use crate::queue::{QueuedCommand, QueuedCommandId};
use crate::registry::PanelClass;
use crate::safety::{FaultReport, WarningId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Seconds to move the manual clock before applying the action.
    #[serde(default)]
    pub advance_secs: u32,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Register {
        #[serde(default = "default_true")]
        registered: bool,
        #[serde(default = "default_operator")]
        actor_id: String,
        #[serde(default)]
        factory_id: Option<String>,
        #[serde(default)]
        factory_name: Option<String>,
    },
    Disable {
        #[serde(default = "default_true")]
        disabled: bool,
        #[serde(default = "default_operator")]
        actor_id: String,
    },
    RemoteSession {
        #[serde(default = "default_true")]
        remote: bool,
        #[serde(default = "default_session_minutes")]
        duration_minutes: i64,
        #[serde(default = "default_agent")]
        actor_id: String,
    },
    /// Remote command; without `session` the latest remote session is assumed.
    Technician {
        token: String,
        #[serde(default)]
        session: Option<FlagEventId>,
        #[serde(default = "default_agent")]
        actor_id: String,
    },
    CallCenter {
        token: String,
        #[serde(default)]
        session: Option<FlagEventId>,
        #[serde(default = "default_agent")]
        actor_id: String,
    },
    Panel {
        class: PanelClass,
    },
    Fault {
        #[serde(default = "default_node_type")]
        node_type: String,
        node_name: String,
        message: String,
    },
    Warning {
        #[serde(default = "default_node_type")]
        node_type: String,
        node_name: String,
        message: String,
    },
    /// Executor feedback; without `command_id` it targets the current command.
    CommandStatus {
        #[serde(default)]
        command_id: Option<QueuedCommandId>,
        status: ExecutorStatus,
    },
    Process,
    Sweep,
}

fn default_true() -> bool {
    true
}

fn default_operator() -> String {
    "operator".to_string()
}

fn default_agent() -> String {
    "agent".to_string()
}

fn default_session_minutes() -> i64 {
    30
}

fn default_node_type() -> String {
    "node".to_string()
}

/// What one action did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepReport {
    FlagRecorded { event_id: FlagEventId },
    Disable(DisableOutcome),
    Submitted(Submission),
    Fault(FaultOutcome),
    Warning { warning_id: WarningId },
    StatusReported {
        command_id: Option<QueuedCommandId>,
        applied: bool,
    },
    Processed { evaluations: Vec<Evaluation> },
    Swept {
        #[serde(skip_serializing_if = "Option::is_none")]
        rollover: Option<SessionRollover>,
    },
}

pub fn apply(controller: &SorterController, action: Action) -> Result<StepReport> {
    let report = match action {
        Action::Register {
            registered,
            actor_id,
            factory_id,
            factory_name,
        } => {
            let mut event = RegistrationEvent::new(registered, actor_id);
            event.factory_id = factory_id;
            event.factory_name = factory_name;
            StepReport::FlagRecorded {
                event_id: controller.record_registration(event)?,
            }
        }
        Action::Disable { disabled, actor_id } => StepReport::Disable(
            controller.record_disable_enable(DisableEnableEvent::new(disabled, actor_id))?,
        ),
        Action::RemoteSession {
            remote,
            duration_minutes,
            actor_id,
        } => StepReport::FlagRecorded {
            event_id: controller.record_remote_session(RemoteSessionEvent::new(
                remote,
                duration_minutes,
                actor_id,
            ))?,
        },
        Action::Technician {
            token,
            session,
            actor_id,
        } => {
            let session = resolve_session(controller, session)?;
            StepReport::Submitted(controller.submit(IncomingCommandEvent::Technician(
                RemoteCommand::new(token, session, actor_id),
            ))?)
        }
        Action::CallCenter {
            token,
            session,
            actor_id,
        } => {
            let session = resolve_session(controller, session)?;
            StepReport::Submitted(controller.submit(IncomingCommandEvent::CallCenter(
                RemoteCommand::new(token, session, actor_id),
            ))?)
        }
        Action::Panel { class } => StepReport::Submitted(
            controller.submit(IncomingCommandEvent::PanelSelection(PanelSelection { class }))?,
        ),
        Action::Fault {
            node_type,
            node_name,
            message,
        } => StepReport::Fault(controller.report_fault(FaultReport::new(
            node_type, node_name, message,
        ))?),
        Action::Warning {
            node_type,
            node_name,
            message,
        } => StepReport::Warning {
            warning_id: controller.report_warning(FaultReport::new(node_type, node_name, message)),
        },
        Action::CommandStatus { command_id, status } => {
            let command_id =
                command_id.or_else(|| controller.current_command().map(|c| c.command.id));
            let applied = command_id
                .is_some_and(|id| controller.report_command_status(id, status));
            StepReport::StatusReported {
                command_id,
                applied,
            }
        }
        Action::Process => StepReport::Processed {
            evaluations: controller.process_pending()?,
        },
        Action::Sweep => StepReport::Swept {
            rollover: controller.sweep_expired_sessions()?,
        },
    };
    Ok(report)
}

fn resolve_session(
    controller: &SorterController,
    session: Option<FlagEventId>,
) -> Result<Option<FlagEventId>> {
    match session {
        Some(session) => Ok(Some(session)),
        None => Ok(controller.snapshot()?.latest_session()),
    }
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub step: usize,
    pub at: DateTime<Utc>,
    pub report: StepReport,
}

/// Controller state after the last step.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub steps: Vec<StepOutput>,
    pub current: Option<CurrentCommandState>,
    pub flags: AggregatedControlFlags,
    pub stats: IntakeStats,
    pub queue: Vec<QueuedCommand>,
}

/// Run every step in order, advancing `clock` as the steps ask.
///
/// Stops at the first error; a halted controller fails the replay.
pub fn replay(
    scenario: &Scenario,
    controller: &SorterController,
    clock: &ManualClock,
) -> Result<ReplaySummary> {
    use crate::clock::Clock;

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.iter().enumerate() {
        if step.advance_secs > 0 {
            clock.advance(TimeDelta::seconds(i64::from(step.advance_secs)));
        }
        let report = apply(controller, step.action.clone())?;
        steps.push(StepOutput {
            step: index + 1,
            at: clock.now(),
            report,
        });
    }
    tracing::debug!(steps = steps.len(), "scenario replayed");

    Ok(ReplaySummary {
        steps,
        current: controller.current_command(),
        flags: controller.snapshot()?,
        stats: controller.stats(),
        queue: controller.queue_entries(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::{CommandStatus, Verdict};
    use crate::intake::IntakeOutcome;
    use crate::registry::SELF_STOP_TOKEN;
    use std::sync::Arc;

    fn setup() -> (SorterController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        (SorterController::with_defaults(clock.clone()), clock)
    }

    #[test]
    fn parses_actions_with_defaults() {
        let scenario = Scenario::from_json_str(
            r#"{"steps": [
                {"action": "register"},
                {"action": "remote_session", "duration_minutes": 5},
                {"action": "call_center", "token": "start_aa", "advance_secs": 10},
                {"action": "command_status", "status": "inprogress"},
                {"action": "process"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(scenario.steps.len(), 5);
        assert_eq!(
            scenario.steps[0].action,
            Action::Register {
                registered: true,
                actor_id: "operator".to_string(),
                factory_id: None,
                factory_name: None,
            }
        );
        assert_eq!(scenario.steps[2].advance_secs, 10);
        assert!(matches!(
            &scenario.steps[2].action,
            Action::CallCenter { token, session: None, .. } if token == "start_aa"
        ));
        assert_eq!(
            scenario.steps[3].action,
            Action::CommandStatus {
                command_id: None,
                status: ExecutorStatus::InProgress,
            }
        );
    }

    #[test]
    fn unknown_action_is_a_json_error() {
        let err = Scenario::from_json_str(r#"{"steps": [{"action": "launch"}]}"#).unwrap_err();
        assert!(matches!(err, crate::Error::Json(_)));
    }

    #[test]
    fn remote_command_defaults_to_latest_session() {
        let (controller, _) = setup();
        apply(&controller, Action::Register {
            registered: true,
            actor_id: "op".to_string(),
            factory_id: None,
            factory_name: None,
        })
        .unwrap();
        let StepReport::FlagRecorded { event_id: session } = apply(
            &controller,
            Action::RemoteSession {
                remote: true,
                duration_minutes: 30,
                actor_id: "agent".to_string(),
            },
        )
        .unwrap() else {
            panic!("expected flag report");
        };

        let report = apply(
            &controller,
            Action::CallCenter {
                token: "start_b".to_string(),
                session: None,
                actor_id: "agent".to_string(),
            },
        )
        .unwrap();
        let StepReport::Submitted(submission) = report else {
            panic!("expected submission");
        };
        assert_eq!(
            submission.outcome.accepted().unwrap().provenance.session(),
            Some(session)
        );

        let StepReport::Processed { evaluations } = apply(&controller, Action::Process).unwrap()
        else {
            panic!("expected evaluations");
        };
        assert_eq!(evaluations[0].verdict, Verdict::Accept);
    }

    #[test]
    fn replay_runs_fault_scenario() {
        let (controller, clock) = setup();
        let scenario = Scenario::from_json_str(
            r#"{"steps": [
                {"action": "register"},
                {"action": "panel", "class": "aa"},
                {"action": "process"},
                {"action": "command_status", "status": "satisfied"},
                {"action": "warning", "node_name": "belt", "message": "slow"},
                {"action": "fault", "node_name": "camera", "message": "no frames", "advance_secs": 5},
                {"action": "process"}
            ]}"#,
        )
        .unwrap();

        let summary = replay(&scenario, &controller, &clock).unwrap();
        assert_eq!(summary.steps.len(), 7);
        assert_eq!(summary.steps[5].at, summary.steps[4].at + TimeDelta::seconds(5));
        assert!(matches!(
            summary.steps[3].report,
            StepReport::StatusReported { applied: true, .. }
        ));
        let current = summary.current.unwrap();
        assert_eq!(current.command.token(), SELF_STOP_TOKEN);
        assert_eq!(current.status, CommandStatus::None);
        assert!(summary.flags.is_registered());
        assert_eq!(summary.stats.accepted, 2);
        assert!(summary.queue.iter().all(|entry| entry.processed));
    }

    #[test]
    fn replay_of_disable_leaves_current_until_processed() {
        let (controller, clock) = setup();
        let scenario = Scenario::from_json_str(
            r#"{"steps": [
                {"action": "register"},
                {"action": "panel", "class": "a"},
                {"action": "process"},
                {"action": "disable"}
            ]}"#,
        )
        .unwrap();

        let summary = replay(&scenario, &controller, &clock).unwrap();
        let StepReport::Disable(outcome) = &summary.steps[3].report else {
            panic!("expected disable report");
        };
        assert!(matches!(
            outcome.stop.as_ref().map(|s| &s.outcome),
            Some(IntakeOutcome::Accepted(_))
        ));
        assert_eq!(summary.current.unwrap().command.token(), "panel_a");
        assert_eq!(controller.pending_len(), 1);
    }

    #[test]
    fn step_report_json_shape() {
        let report = StepReport::Swept { rollover: None };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            serde_json::json!({"result": "swept"})
        );
    }
}
