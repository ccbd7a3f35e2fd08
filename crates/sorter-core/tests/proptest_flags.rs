//! Property-based tests for the control-flag tracker.
//!
//! Verifies flag stream invariants:
//! - After any interleaving of records, each non-empty stream has exactly one
//!   latest record, and it is the most recently recorded one
//! - Event ids are unique and increasing across all three streams
//! - Session expiry is request time plus the requested duration
//! - Rollover happens at most once per session and never leaves two latest
//!   remote records
//! - Snapshot flags mirror the latest record of each stream

use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;

use sorter_core::flags::{
    ControlFlagEvent, ControlFlagTracker, DisableEnableEvent, FlagKind, FlagRecord, FlagStream,
    RegistrationEvent, RemoteSessionEvent,
};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_event() -> impl Strategy<Value = ControlFlagEvent> {
    prop_oneof![
        (any::<bool>(), "[a-z]{2,6}").prop_map(|(registered, actor)| {
            ControlFlagEvent::Registration(RegistrationEvent::new(registered, actor))
        }),
        (any::<bool>(), "[a-z]{2,6}").prop_map(|(disabled, actor)| {
            ControlFlagEvent::DisableEnable(DisableEnableEvent::new(disabled, actor))
        }),
        (any::<bool>(), -5i64..=120, "[a-z]{2,6}").prop_map(|(remote, minutes, actor)| {
            ControlFlagEvent::RemoteSession(RemoteSessionEvent::new(remote, minutes, actor))
        }),
    ]
}

/// An event plus the seconds the clock moves before it.
fn arb_timeline() -> impl Strategy<Value = Vec<(u32, ControlFlagEvent)>> {
    prop::collection::vec((0u32..=600, arb_event()), 1..40)
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn assert_single_latest<E>(stream: &FlagStream<E>) -> Result<(), TestCaseError> {
    let history: &[FlagRecord<E>] = stream.history();
    let latest: Vec<_> = history.iter().filter(|r| r.latest).collect();
    if history.is_empty() {
        prop_assert!(latest.is_empty());
    } else {
        prop_assert_eq!(latest.len(), 1, "stream {} has {} latest", stream.kind(), latest.len());
        prop_assert_eq!(latest[0].id, history[history.len() - 1].id);
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────
// Exactly one latest per kind
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_exactly_one_latest_per_kind(timeline in arb_timeline()) {
        let mut tracker = ControlFlagTracker::new();
        let mut now = t0();
        for (advance, event) in timeline {
            now += TimeDelta::seconds(i64::from(advance));
            tracker.record(event, now);

            assert_single_latest(tracker.registrations())?;
            assert_single_latest(tracker.disables())?;
            assert_single_latest(tracker.remote_sessions())?;
            prop_assert!(tracker.validate().is_ok());
        }
    }

    #[test]
    fn prop_event_ids_unique_and_increasing(timeline in arb_timeline()) {
        let mut tracker = ControlFlagTracker::new();
        let mut ids = Vec::new();
        for (_, event) in timeline {
            ids.push(tracker.record(event, t0()));
        }
        for pair in ids.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn prop_snapshot_mirrors_latest_records(timeline in arb_timeline()) {
        let mut tracker = ControlFlagTracker::new();
        let mut last_registered = None;
        let mut last_disabled = None;
        for (_, event) in timeline {
            match &event {
                ControlFlagEvent::Registration(e) => last_registered = Some(e.is_registered),
                ControlFlagEvent::DisableEnable(e) => last_disabled = Some(e.is_disabled),
                ControlFlagEvent::RemoteSession(_) => {}
            }
            tracker.record(event, t0());
        }
        let flags = tracker.snapshot().unwrap();
        prop_assert_eq!(flags.is_registered(), last_registered.unwrap_or(false));
        prop_assert_eq!(flags.is_disabled(), last_disabled.unwrap_or(false));
    }
}

// ────────────────────────────────────────────────────────────────────
// Remote sessions
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_expiry_is_start_plus_duration(minutes in 1i64..=720, offset in 0i64..=86_400) {
        let mut tracker = ControlFlagTracker::new();
        let start = t0() + TimeDelta::seconds(offset);
        tracker.record_remote_session(RemoteSessionEvent::new(true, minutes, "agent"), start);
        let remote = tracker.snapshot().unwrap().remote.unwrap();
        prop_assert_eq!(remote.event.session_expiry, Some(start + TimeDelta::minutes(minutes)));
    }

    #[test]
    fn prop_rollover_at_most_once(minutes in 1i64..=60, checks in prop::collection::vec(0u32..=900, 1..20)) {
        let mut tracker = ControlFlagTracker::new();
        let session = tracker.record_remote_session(RemoteSessionEvent::new(true, minutes, "agent"), t0());
        let expiry = t0() + TimeDelta::minutes(minutes);

        let mut now = t0();
        let mut rollovers = 0;
        for advance in checks {
            now += TimeDelta::seconds(i64::from(advance));
            if let Some(rollover) = tracker.roll_over_expired_session(now, "MACHINE001").unwrap() {
                prop_assert!(now > expiry);
                prop_assert_eq!(rollover.expired, session);
                rollovers += 1;
            }
            assert_single_latest(tracker.remote_sessions())?;
        }
        prop_assert!(rollovers <= 1);
        prop_assert_eq!(rollovers == 1, now > expiry);
        prop_assert_eq!(tracker.snapshot().unwrap().is_remote(), now <= expiry);
    }
}

#[test]
fn kinds_have_stable_names() {
    assert_eq!(FlagKind::Registration.to_string(), "registration");
    assert_eq!(FlagKind::DisableEnable.to_string(), "disable_enable");
    assert_eq!(FlagKind::RemoteSession.to_string(), "remote_session");
}
