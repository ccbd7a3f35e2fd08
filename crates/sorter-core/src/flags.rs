//! Control-flag streams: registration, disable/enable and remote session.
//!
//! Each stream is append-only history with exactly one "latest" record.
//! Recording demotes whatever was latest and promotes the new record, so the
//! current value of a flag is always the latest record of its stream. The
//! [`AggregatedControlFlags`] snapshot bundles the three latest records for a
//! single arbitration decision.
//!
//! Remote sessions with a positive duration carry an expiry. Expiry is not a
//! timer: [`ControlFlagTracker::roll_over_expired_session`] is called by intake
//! (and optionally by a sweep) and, once the expiry has passed, marks the
//! session expired and records an implicit `is_remote = false` event.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvariantViolation;

// =============================================================================
// Identifiers and enums
// =============================================================================

/// Identifier of a recorded flag event, unique across all three streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagEventId(u64);

impl FlagEventId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlagEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    Registration,
    DisableEnable,
    RemoteSession,
}

impl FlagKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::DisableEnable => "disable_enable",
            Self::RemoteSession => "remote_session",
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who originated a flag event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    /// The machine's own operator panel or controller.
    #[default]
    Local,
    Remote,
    Cloud,
    /// The machine's safety monitor.
    #[serde(rename = "self")]
    SelfMonitor,
}

impl FlagSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Cloud => "cloud",
            Self::SelfMonitor => "self",
        }
    }
}

impl fmt::Display for FlagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEvent {
    pub is_registered: bool,
    pub actor_id: String,
    #[serde(default)]
    pub source: FlagSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl RegistrationEvent {
    #[must_use]
    pub fn new(is_registered: bool, actor_id: impl Into<String>) -> Self {
        Self {
            is_registered,
            actor_id: actor_id.into(),
            source: FlagSource::Local,
            factory_id: None,
            factory_name: None,
            machine_id: None,
        }
    }

    #[must_use]
    pub fn with_factory(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.factory_id = Some(id.into());
        self.factory_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableEnableEvent {
    pub is_disabled: bool,
    pub actor_id: String,
    #[serde(default)]
    pub source: FlagSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl DisableEnableEvent {
    #[must_use]
    pub fn new(is_disabled: bool, actor_id: impl Into<String>) -> Self {
        Self {
            is_disabled,
            actor_id: actor_id.into(),
            source: FlagSource::Local,
            factory_id: None,
            machine_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSessionEvent {
    pub is_remote: bool,
    /// Session length; zero or negative means the session never expires.
    #[serde(default)]
    pub requested_duration_minutes: i64,
    pub actor_id: String,
    #[serde(default)]
    pub source: FlagSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Filled in by the tracker when the event is recorded.
    #[serde(default)]
    pub session_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_expired: bool,
}

impl RemoteSessionEvent {
    #[must_use]
    pub fn new(is_remote: bool, requested_duration_minutes: i64, actor_id: impl Into<String>) -> Self {
        Self {
            is_remote,
            requested_duration_minutes,
            actor_id: actor_id.into(),
            source: FlagSource::Remote,
            factory_id: None,
            machine_id: None,
            session_expiry: None,
            is_expired: false,
        }
    }

    #[must_use]
    pub const fn with_source(mut self, source: FlagSource) -> Self {
        self.source = source;
        self
    }
}

/// Any control-flag event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFlagEvent {
    Registration(RegistrationEvent),
    DisableEnable(DisableEnableEvent),
    RemoteSession(RemoteSessionEvent),
}

impl ControlFlagEvent {
    #[must_use]
    pub const fn kind(&self) -> FlagKind {
        match self {
            Self::Registration(_) => FlagKind::Registration,
            Self::DisableEnable(_) => FlagKind::DisableEnable,
            Self::RemoteSession(_) => FlagKind::RemoteSession,
        }
    }
}

// =============================================================================
// Streams
// =============================================================================

/// One recorded event plus its stream bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagRecord<E> {
    pub id: FlagEventId,
    pub event: E,
    pub recorded_at: DateTime<Utc>,
    pub latest: bool,
}

/// Append-only history of one flag kind.
#[derive(Debug, Clone)]
pub struct FlagStream<E> {
    kind: FlagKind,
    records: Vec<FlagRecord<E>>,
}

impl<E> FlagStream<E> {
    const fn new(kind: FlagKind) -> Self {
        Self {
            kind,
            records: Vec::new(),
        }
    }

    fn record(&mut self, id: FlagEventId, event: E, now: DateTime<Utc>) {
        for record in self.records.iter_mut().filter(|r| r.latest) {
            record.latest = false;
        }
        self.records.push(FlagRecord {
            id,
            event,
            recorded_at: now,
            latest: true,
        });
    }

    /// The single latest record, or an invariant violation if several claim it.
    pub fn latest(&self) -> Result<Option<&FlagRecord<E>>, InvariantViolation> {
        let mut latest = self.records.iter().rev().filter(|r| r.latest);
        let first = latest.next();
        let extra = latest.count();
        if extra > 0 {
            return Err(InvariantViolation::MultipleLatest {
                kind: self.kind,
                count: extra + 1,
            });
        }
        Ok(first)
    }

    fn latest_mut(&mut self) -> Result<Option<&mut FlagRecord<E>>, InvariantViolation> {
        self.latest()?;
        Ok(self.records.iter_mut().rev().find(|r| r.latest))
    }

    #[must_use]
    pub fn history(&self) -> &[FlagRecord<E>] {
        &self.records
    }

    #[must_use]
    pub const fn kind(&self) -> FlagKind {
        self.kind
    }

    #[cfg(test)]
    pub(crate) fn promote_all(&mut self) {
        for record in &mut self.records {
            record.latest = true;
        }
    }
}

/// Factory the machine is currently registered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentFactory {
    pub factory_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_name: Option<String>,
}

/// Result of a session rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionRollover {
    /// The session that was marked expired.
    pub expired: FlagEventId,
    /// The implicit `is_remote = false` event recorded in its place.
    pub replacement: FlagEventId,
}

// =============================================================================
// Tracker
// =============================================================================

/// Owner of the three flag streams.
#[derive(Debug, Clone)]
pub struct ControlFlagTracker {
    next_id: u64,
    registration: FlagStream<RegistrationEvent>,
    disable: FlagStream<DisableEnableEvent>,
    remote: FlagStream<RemoteSessionEvent>,
    factory: Option<CurrentFactory>,
}

impl Default for ControlFlagTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlFlagTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: 1,
            registration: FlagStream::new(FlagKind::Registration),
            disable: FlagStream::new(FlagKind::DisableEnable),
            remote: FlagStream::new(FlagKind::RemoteSession),
            factory: None,
        }
    }

    fn allocate_id(&mut self) -> FlagEventId {
        let id = FlagEventId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Record an event, demoting the previous latest of its kind.
    pub fn record(&mut self, event: ControlFlagEvent, now: DateTime<Utc>) -> FlagEventId {
        match event {
            ControlFlagEvent::Registration(event) => self.record_registration(event, now),
            ControlFlagEvent::DisableEnable(event) => self.record_disable_enable(event, now),
            ControlFlagEvent::RemoteSession(event) => self.record_remote_session(event, now),
        }
    }

    pub fn record_registration(&mut self, event: RegistrationEvent, now: DateTime<Utc>) -> FlagEventId {
        if let Some(factory_id) = &event.factory_id {
            self.factory = Some(CurrentFactory {
                factory_id: factory_id.clone(),
                factory_name: event.factory_name.clone(),
            });
        }
        let id = self.allocate_id();
        tracing::debug!(
            flag_kind = %FlagKind::Registration,
            event_id = %id,
            is_registered = event.is_registered,
            actor_id = %event.actor_id,
            "flag recorded"
        );
        self.registration.record(id, event, now);
        id
    }

    pub fn record_disable_enable(&mut self, event: DisableEnableEvent, now: DateTime<Utc>) -> FlagEventId {
        let id = self.allocate_id();
        tracing::debug!(
            flag_kind = %FlagKind::DisableEnable,
            event_id = %id,
            is_disabled = event.is_disabled,
            actor_id = %event.actor_id,
            "flag recorded"
        );
        self.disable.record(id, event, now);
        id
    }

    /// Record a remote-session event; the expiry is derived from `now`.
    pub fn record_remote_session(
        &mut self,
        mut event: RemoteSessionEvent,
        now: DateTime<Utc>,
    ) -> FlagEventId {
        event.session_expiry = session_expiry(now, event.requested_duration_minutes);
        event.is_expired = false;
        let id = self.allocate_id();
        tracing::debug!(
            flag_kind = %FlagKind::RemoteSession,
            event_id = %id,
            is_remote = event.is_remote,
            session_expiry = ?event.session_expiry,
            actor_id = %event.actor_id,
            "flag recorded"
        );
        self.remote.record(id, event, now);
        id
    }

    /// Expire the latest remote session if its expiry is strictly before `now`.
    ///
    /// The implicit replacement is attributed to `machine_id` with source
    /// `local`, stamped with the current factory.
    pub fn roll_over_expired_session(
        &mut self,
        now: DateTime<Utc>,
        machine_id: &str,
    ) -> Result<Option<SessionRollover>, InvariantViolation> {
        let Some(latest) = self.remote.latest_mut()? else {
            return Ok(None);
        };
        let expired = match latest.event.session_expiry {
            Some(expiry) => latest.event.is_remote && !latest.event.is_expired && expiry < now,
            None => false,
        };
        if !expired {
            return Ok(None);
        }
        latest.event.is_expired = true;
        let expired_id = latest.id;

        let mut replacement = RemoteSessionEvent::new(false, 0, machine_id)
            .with_source(FlagSource::Local);
        replacement.machine_id = Some(machine_id.to_string());
        replacement.factory_id = self.factory.as_ref().map(|f| f.factory_id.clone());
        let replacement_id = self.record_remote_session(replacement, now);

        tracing::warn!(
            flag_kind = %FlagKind::RemoteSession,
            session_id = %expired_id,
            event_id = %replacement_id,
            "remote session expired; control returned to local"
        );
        Ok(Some(SessionRollover {
            expired: expired_id,
            replacement: replacement_id,
        }))
    }

    /// Check every stream holds at most one latest record.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        self.registration.latest()?;
        self.disable.latest()?;
        self.remote.latest()?;
        Ok(())
    }

    /// Current flags as one immutable value.
    pub fn snapshot(&self) -> Result<AggregatedControlFlags, InvariantViolation> {
        Ok(AggregatedControlFlags {
            registration: self.registration.latest()?.cloned(),
            disable: self.disable.latest()?.cloned(),
            remote: self.remote.latest()?.cloned(),
        })
    }

    #[must_use]
    pub const fn current_factory(&self) -> Option<&CurrentFactory> {
        self.factory.as_ref()
    }

    #[must_use]
    pub const fn registrations(&self) -> &FlagStream<RegistrationEvent> {
        &self.registration
    }

    #[must_use]
    pub const fn disables(&self) -> &FlagStream<DisableEnableEvent> {
        &self.disable
    }

    #[must_use]
    pub const fn remote_sessions(&self) -> &FlagStream<RemoteSessionEvent> {
        &self.remote
    }

    #[cfg(test)]
    pub(crate) fn corrupt_latest(&mut self, kind: FlagKind) {
        match kind {
            FlagKind::Registration => self.registration.promote_all(),
            FlagKind::DisableEnable => self.disable.promote_all(),
            FlagKind::RemoteSession => self.remote.promote_all(),
        }
    }
}

fn session_expiry(now: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    if minutes <= 0 {
        return None;
    }
    let expiry = TimeDelta::try_minutes(minutes)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some(expiry)
}

// =============================================================================
// Snapshot
// =============================================================================

/// The latest record of each stream at one instant.
///
/// Missing streams read as the bootstrap defaults: unregistered, enabled,
/// no remote session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedControlFlags {
    pub registration: Option<FlagRecord<RegistrationEvent>>,
    pub disable: Option<FlagRecord<DisableEnableEvent>>,
    pub remote: Option<FlagRecord<RemoteSessionEvent>>,
}

impl AggregatedControlFlags {
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|r| r.event.is_registered)
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disable.as_ref().is_some_and(|r| r.event.is_disabled)
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.remote
            .as_ref()
            .is_some_and(|r| r.event.is_remote && !r.event.is_expired)
    }

    /// Id of the remote session currently holding authority.
    #[must_use]
    pub fn active_session(&self) -> Option<FlagEventId> {
        if self.is_remote() {
            self.remote.as_ref().map(|r| r.id)
        } else {
            None
        }
    }

    /// Id of the latest remote-session record, active or not.
    #[must_use]
    pub fn latest_session(&self) -> Option<FlagEventId> {
        self.remote.as_ref().map(|r| r.id)
    }
}
