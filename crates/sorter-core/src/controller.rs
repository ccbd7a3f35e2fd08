//! The sorter controller: one lock around the whole arbitration pipeline.
//!
//! All mutable state (flag streams, intake, queue, safety stops, current
//! command) lives in a single [`ControllerState`] behind a mutex. Every public
//! operation takes the lock once and runs to completion, so reading the flags,
//! reading the current command, replacing it and marking the entry processed
//! happen as one step per queue entry. The lock is never held across I/O.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::arbitration::{ArbitrationEngine, CurrentCommandState, Evaluation, ExecutorStatus};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, InvariantViolation, Result};
use crate::flags::{
    AggregatedControlFlags, ControlFlagTracker, CurrentFactory, DisableEnableEvent, FlagEventId,
    RegistrationEvent, RemoteSessionEvent, SessionRollover,
};
use crate::intake::{CommandIntake, IncomingCommandEvent, IntakeSettings, IntakeStats, Submission};
use crate::queue::{CommandQueue, QueuedCommand, QueuedCommandId};
use crate::registry::CommandRegistry;
use crate::safety::{FaultId, FaultReport, RecordedFault, RecordedWarning, SafetyStopGenerator, WarningId, WarningReport};

/// Result of recording a disable/enable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisableOutcome {
    pub event_id: FlagEventId,
    /// The stop submitted for a disable; `None` when enabling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Submission>,
}

/// Result of a fault report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultOutcome {
    pub fault_id: FaultId,
    pub stop: Submission,
}

#[derive(Debug)]
struct ControllerState {
    tracker: ControlFlagTracker,
    intake: CommandIntake,
    queue: CommandQueue,
    safety: SafetyStopGenerator,
    engine: ArbitrationEngine,
}

impl ControllerState {
    // Any invariant failure outside arbitration halts it too.
    fn guard<T>(&mut self, result: std::result::Result<T, InvariantViolation>) -> Result<T> {
        result.map_err(|violation| self.engine.halt(violation))
    }
}

#[derive(Debug)]
pub struct SorterController {
    state: Mutex<ControllerState>,
    clock: Arc<dyn Clock>,
}

impl SorterController {
    #[must_use]
    pub fn new(registry: CommandRegistry, settings: IntakeSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                tracker: ControlFlagTracker::new(),
                intake: CommandIntake::new(registry, settings),
                queue: CommandQueue::new(),
                safety: SafetyStopGenerator::new(),
                engine: ArbitrationEngine::new(),
            }),
            clock,
        }
    }

    /// Built-in registry and default intake settings.
    #[must_use]
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(CommandRegistry::builtin(), IntakeSettings::default(), clock)
    }

    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = config.registry()?;
        Ok(Self::new(registry, config.intake_settings(), clock))
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // =========================================================================
    // Flags
    // =========================================================================

    pub fn record_registration(&self, event: RegistrationEvent) -> Result<FlagEventId> {
        let now = self.clock.now();
        let mut state = self.lock();
        Ok(state.tracker.record_registration(event, now))
    }

    /// Record a disable/enable event; disabling submits one self stop.
    ///
    /// The stop is queued, not arbitrated: the current command is untouched
    /// until [`SorterController::process_pending`] reaches it.
    pub fn record_disable_enable(&self, event: DisableEnableEvent) -> Result<DisableOutcome> {
        let now = self.clock.now();
        let mut state = self.lock();
        let state = &mut *state;
        let event_id = state.tracker.record_disable_enable(event.clone(), now);
        let stop = match state.safety.on_disable_recorded(event_id, &event) {
            Some(stop_event) => {
                let submitted = state
                    .intake
                    .submit(stop_event, &mut state.tracker, &mut state.queue, now);
                Some(state.guard(submitted)?)
            }
            None => None,
        };
        Ok(DisableOutcome { event_id, stop })
    }

    pub fn record_remote_session(&self, event: RemoteSessionEvent) -> Result<FlagEventId> {
        let now = self.clock.now();
        let mut state = self.lock();
        Ok(state.tracker.record_remote_session(event, now))
    }

    /// Current flags, failing if a stream holds more than one latest record.
    pub fn snapshot(&self) -> Result<AggregatedControlFlags> {
        let mut state = self.lock();
        let snapshot = state.tracker.snapshot();
        state.guard(snapshot)
    }

    /// Roll over an expired remote session without waiting for intake.
    pub fn sweep_expired_sessions(&self) -> Result<Option<SessionRollover>> {
        let now = self.clock.now();
        let mut state = self.lock();
        let machine_id = state.intake.settings().machine_id.clone();
        let rollover = state.tracker.roll_over_expired_session(now, &machine_id);
        state.guard(rollover)
    }

    #[must_use]
    pub fn current_factory(&self) -> Option<CurrentFactory> {
        self.lock().tracker.current_factory().cloned()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn submit(&self, event: IncomingCommandEvent) -> Result<Submission> {
        let now = self.clock.now();
        let mut state = self.lock();
        let state = &mut *state;
        let submitted = state
            .intake
            .submit(event, &mut state.tracker, &mut state.queue, now);
        state.guard(submitted)
    }

    /// Record a node fault and submit the resulting self stop.
    pub fn report_fault(&self, report: FaultReport) -> Result<FaultOutcome> {
        let now = self.clock.now();
        let mut state = self.lock();
        let state = &mut *state;
        let (fault_id, stop_event) = state.safety.on_fault(report, now);
        let submitted = state
            .intake
            .submit(stop_event, &mut state.tracker, &mut state.queue, now);
        let stop = state.guard(submitted)?;
        Ok(FaultOutcome { fault_id, stop })
    }

    /// Record a node warning. Warnings never stop the machine.
    #[must_use]
    pub fn report_warning(&self, report: WarningReport) -> WarningId {
        let now = self.clock.now();
        self.lock().safety.record_warning(report, now)
    }

    /// Arbitrate every pending entry, including stops raised along the way.
    pub fn process_pending(&self) -> Result<Vec<Evaluation>> {
        let now = self.clock.now();
        let mut state = self.lock();
        let state = &mut *state;
        let mut evaluations = Vec::new();

        loop {
            let next = state.engine.evaluate_next(
                &state.tracker,
                &mut state.queue,
                &mut state.safety,
                now,
            )?;
            let Some(mut evaluation) = next else {
                break;
            };
            if let Some(stop_event) = evaluation.stop_request.take() {
                let submitted = state
                    .intake
                    .submit(stop_event, &mut state.tracker, &mut state.queue, now);
                let submission = state.guard(submitted)?;
                evaluation.safety_stop = submission.outcome.accepted().map(|entry| entry.id);
            }
            evaluations.push(evaluation);
        }
        Ok(evaluations)
    }

    #[must_use]
    pub fn current_command(&self) -> Option<CurrentCommandState> {
        self.lock().engine.current().cloned()
    }

    /// Executor feedback; ignored unless `command_id` is still current.
    pub fn report_command_status(&self, command_id: QueuedCommandId, status: ExecutorStatus) -> bool {
        let now = self.clock.now();
        self.lock().engine.report_status(command_id, status, now)
    }

    #[must_use]
    pub fn queue_entries(&self) -> Vec<QueuedCommand> {
        self.lock().queue.entries().to_vec()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().queue.pending_len()
    }

    #[must_use]
    pub fn stats(&self) -> IntakeStats {
        self.lock().intake.stats()
    }

    #[must_use]
    pub fn faults(&self) -> Vec<RecordedFault> {
        self.lock().safety.faults().to_vec()
    }

    #[must_use]
    pub fn warnings(&self) -> Vec<RecordedWarning> {
        self.lock().safety.warnings().to_vec()
    }

    // =========================================================================
    // Halt
    // =========================================================================

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.lock().engine.halted().is_some()
    }

    /// Clear a halt after an operator has corrected the underlying state.
    pub fn resume_after_intervention(&self) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        state
            .engine
            .resume(&state.tracker, &state.queue)
            .map_err(Error::Invariant)
    }

    #[cfg(test)]
    fn corrupt_flags(&self, kind: crate::flags::FlagKind) {
        self.lock().tracker.corrupt_latest(kind);
    }
}
