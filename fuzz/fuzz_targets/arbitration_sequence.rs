#![no_main]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta};
use libfuzzer_sys::fuzz_target;
use sorter_core::SorterController;
use sorter_core::arbitration::ExecutorStatus;
use sorter_core::clock::ManualClock;
use sorter_core::flags::{DisableEnableEvent, FlagEventId, RegistrationEvent, RemoteSessionEvent};
use sorter_core::intake::{IncomingCommandEvent, PanelSelection, RemoteCommand};
use sorter_core::queue::{Provenance, QueuedCommandId};
use sorter_core::registry::PanelClass;
use sorter_core::safety::{FaultReport, StopReason};

const TOKENS: [&str; 8] = [
    "start_aa",
    "start_b",
    "stop",
    "service",
    "link",
    "panel_a",
    "eject_test",
    "ünknown-🧪",
];

fn class_for(raw: u8) -> PanelClass {
    PanelClass::ALL[usize::from(raw) % PanelClass::ALL.len()]
}

fn session_for(raw: u8, latest: Option<FlagEventId>) -> Option<FlagEventId> {
    match raw % 4 {
        0 => None,
        1 => Some(FlagEventId::new(u64::from(raw))),
        _ => latest,
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 {
        return;
    }

    let clock = Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ));
    let controller = SorterController::with_defaults(clock.clone());
    let mut latest_session = None;
    let mut evaluated: HashSet<QueuedCommandId> = HashSet::new();
    let mut rejections = 0usize;

    for chunk in data.chunks(4) {
        let [op, a, b, advance] = match chunk {
            [op, a, b, advance] => [*op, *a, *b, *advance],
            _ => break,
        };
        clock.advance(TimeDelta::seconds(i64::from(advance)));

        match op % 11 {
            0 => {
                controller
                    .record_registration(RegistrationEvent::new(a % 2 == 0, "fuzz"))
                    .unwrap();
            }
            1 => {
                let outcome = controller
                    .record_disable_enable(DisableEnableEvent::new(a % 2 == 0, "fuzz"))
                    .unwrap();
                assert_eq!(outcome.stop.is_some(), a % 2 == 0);
            }
            2 => {
                let minutes = i64::from(b % 12) - 1;
                let id = controller
                    .record_remote_session(RemoteSessionEvent::new(a % 3 != 0, minutes, "fuzz"))
                    .unwrap();
                latest_session = Some(id);
            }
            3 | 4 => {
                let token = TOKENS[usize::from(a) % TOKENS.len()];
                let command = RemoteCommand::new(token, session_for(b, latest_session), "fuzz");
                let event = if op % 11 == 3 {
                    IncomingCommandEvent::Technician(command)
                } else {
                    IncomingCommandEvent::CallCenter(command)
                };
                controller.submit(event).unwrap();
            }
            5 | 6 => {
                controller
                    .submit(IncomingCommandEvent::PanelSelection(PanelSelection {
                        class: class_for(a),
                    }))
                    .unwrap();
            }
            7 => {
                controller
                    .report_fault(FaultReport::new("fuzz", "node", "fault"))
                    .unwrap();
            }
            8 => {
                if let Some(current) = controller.current_command() {
                    let status = match a % 3 {
                        0 => ExecutorStatus::InProgress,
                        1 => ExecutorStatus::Satisfied,
                        _ => ExecutorStatus::Error,
                    };
                    assert!(controller.report_command_status(current.command.id, status));
                }
            }
            9 => {
                controller.sweep_expired_sessions().unwrap();
            }
            _ => {
                for evaluation in controller.process_pending().unwrap() {
                    assert!(evaluated.insert(evaluation.command_id), "evaluated twice");
                    if evaluation.verdict.is_reject() {
                        assert!(evaluation.safety_stop.is_some());
                        rejections += 1;
                    }
                }
            }
        }

        assert!(controller.snapshot().is_ok());
        if let Some(current) = controller.current_command() {
            assert!(current.command.processed && current.command.activated);
        }
        assert!(!controller.is_halted());
    }

    for evaluation in controller.process_pending().unwrap() {
        assert!(evaluated.insert(evaluation.command_id), "evaluated twice");
        if evaluation.verdict.is_reject() {
            rejections += 1;
        }
    }

    let entries = controller.queue_entries();
    assert_eq!(entries.len(), evaluated.len());
    assert!(entries.iter().all(|entry| entry.processed));
    let invalid_stops = entries
        .iter()
        .filter(|entry| {
            matches!(
                entry.provenance,
                Provenance::SelfUrgentStop {
                    reason: StopReason::InvalidCommand(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(invalid_stops, rejections);
});
