//! Canonical friend presence built from noisy push notifications and periodic snapshots.
//!
//! Each identity carries `{state, pending, timer}`. Going online commits at once
//! (minus duplicate deliveries); leaving online waits out a debounce timer, then a
//! fresh snapshot confirms the change before it is committed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actors::SessionActorDirectory;
use crate::error::SnapshotError;
use crate::event::Identity;
use crate::notification::PushNotification;
use crate::runner::TaskRunner;
use crate::timer::{TimerHandle, TimerQueue, deadline, to_delta};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(110);
pub const DEFAULT_DUPLICATE_ONLINE_WINDOW: Duration = Duration::from_millis(1000);

/// Location value the API reports while a user is between instances.
pub const TRAVELING: &str = "traveling";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    #[default]
    Offline,
    Active,
    Online,
}

impl PresenceState {
    /// Maps the API's `state` string; anything unrecognised is offline.
    pub fn from_api(raw: &str) -> Self {
        match raw {
            "online" => Self::Online,
            "active" => Self::Active,
            _ => Self::Offline,
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::Active => "active",
            Self::Online => "online",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub identity: Identity,
    pub state: PresenceState,
    pub location: Option<String>,
}

/// Fetches the current state of one user. Called off the consumer thread.
pub trait SnapshotSource: Send + Sync {
    fn fetch(&self, user_id: &str) -> Result<UserSnapshot, SnapshotError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSettings {
    pub debounce: Duration,
    pub duplicate_online_window: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            duplicate_online_window: DEFAULT_DUPLICATE_ONLINE_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPhase {
    /// Debounce timer running.
    Waiting,
    /// Timer fired; a snapshot fetch tagged with `token` is in flight.
    Verifying { token: u64 },
    /// Verification failed; the next periodic snapshot decides.
    AwaitingPoll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransition {
    pub target: PresenceState,
    pub requested_at: DateTime<Utc>,
    pub timer: Option<TimerHandle>,
    pub phase: PendingPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub identity: Identity,
    pub state: PresenceState,
    pub pending: Option<PendingTransition>,
    pub online_since: Option<DateTime<Utc>>,
    pub offline_since: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub location_since: Option<DateTime<Utc>>,
    pub traveling_since: Option<DateTime<Utc>>,
    pub last_online_accepted_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            state: PresenceState::Offline,
            pending: None,
            online_since: None,
            offline_since: None,
            location: None,
            location_since: None,
            traveling_since: None,
            last_online_accepted_at: None,
        }
    }

    /// Time spent at the current location, not counting an ongoing trip away from it.
    fn time_at_location(&self, at: DateTime<Utc>) -> Option<TimeDelta> {
        let since = self.location_since?;
        let until = self.traveling_since.unwrap_or(at);
        Some((until - since).max(TimeDelta::zero()))
    }
}

/// A committed presence transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Online {
        identity: Identity,
        previous: PresenceState,
        location: Option<String>,
        offline_for: Option<TimeDelta>,
        at: DateTime<Utc>,
    },
    Active {
        identity: Identity,
        previous: PresenceState,
        online_for: Option<TimeDelta>,
        at: DateTime<Utc>,
    },
    Offline {
        identity: Identity,
        previous: PresenceState,
        location: Option<String>,
        time_at_location: Option<TimeDelta>,
        online_for: Option<TimeDelta>,
        at: DateTime<Utc>,
    },
    Gps {
        identity: Identity,
        from: Option<String>,
        to: String,
        time_at_previous: Option<TimeDelta>,
        at: DateTime<Utc>,
    },
}

impl PresenceEvent {
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Online { identity, .. }
            | Self::Active { identity, .. }
            | Self::Offline { identity, .. }
            | Self::Gps { identity, .. } => identity,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Online { at, .. }
            | Self::Active { at, .. }
            | Self::Offline { at, .. }
            | Self::Gps { at, .. } => *at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Online { .. } => "Online",
            Self::Active { .. } => "Active",
            Self::Offline { .. } => "Offline",
            Self::Gps { .. } => "GPS",
        }
    }
}

#[derive(Debug)]
struct Verification {
    user_id: String,
    token: u64,
    result: Result<UserSnapshot, SnapshotError>,
}

pub struct PresenceReconciler {
    settings: PresenceSettings,
    records: HashMap<String, PresenceRecord>,
    timers: TimerQueue<String>,
    next_token: u64,
    source: Option<Arc<dyn SnapshotSource>>,
    runner: Arc<dyn TaskRunner>,
    verifications_tx: Sender<Verification>,
    verifications_rx: Receiver<Verification>,
}

impl PresenceReconciler {
    pub fn new(settings: PresenceSettings, runner: Arc<dyn TaskRunner>) -> Self {
        let (verifications_tx, verifications_rx) = crossbeam_channel::unbounded();
        Self {
            settings,
            records: HashMap::new(),
            timers: TimerQueue::default(),
            next_token: 0,
            source: None,
            runner,
            verifications_tx,
            verifications_rx,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn settings(&self) -> PresenceSettings {
        self.settings
    }

    pub fn record(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn state(&self, user_id: &str) -> PresenceState {
        self.records
            .get(user_id)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.records.values()
    }

    pub fn pending_count(&self) -> usize {
        self.records.values().filter(|r| r.pending.is_some()).count()
    }

    pub fn next_timer_due(&self) -> Option<DateTime<Utc>> {
        self.timers.next_due()
    }

    /// Installs the starting state of a friend without emitting a transition.
    pub fn seed(&mut self, snapshot: UserSnapshot, at: DateTime<Utc>) {
        let record = self.record_mut(&snapshot.identity);
        if let Some(pending) = record.pending.take()
            && let Some(timer) = pending.timer
        {
            self.timers.cancel(timer);
        }
        let record = self.record_mut(&snapshot.identity);
        record.state = snapshot.state;
        match snapshot.state {
            PresenceState::Online => {
                record.online_since = Some(at);
                record.offline_since = None;
            }
            PresenceState::Active => record.online_since = None,
            PresenceState::Offline => {
                record.online_since = None;
                record.offline_since = Some(at);
            }
        }
        record.location = normalize_location(snapshot.location).filter(|l| l != TRAVELING);
        record.location_since = record.location.as_ref().map(|_| at);
        record.traveling_since = None;
    }

    pub fn on_notification(&mut self, notification: &PushNotification, at: DateTime<Utc>) -> Vec<PresenceEvent> {
        let Some(user_id) = notification.user_id() else {
            return Vec::new();
        };
        let identity = self.identity_for(user_id, notification.display_name());
        match notification {
            PushNotification::FriendOnline { location, .. }
            | PushNotification::FriendLocation { location, .. } => {
                self.signal(identity, PresenceState::Online, location.clone(), at)
            }
            PushNotification::FriendActive { .. } => {
                self.signal(identity, PresenceState::Active, None, at)
            }
            PushNotification::FriendOffline { .. } => {
                self.signal(identity, PresenceState::Offline, None, at)
            }
            PushNotification::FriendUpdate { user, .. } | PushNotification::UserUpdate { user, .. } => {
                let record = self.record_mut(&identity);
                if let Some(state) = user.as_ref().and_then(|u| u.state.as_deref()) {
                    debug!(user_id, state, current = %record.state, "state in profile update ignored");
                }
                Vec::new()
            }
            PushNotification::Unknown { .. } => Vec::new(),
        }
    }

    /// Feeds one periodic snapshot. Resolves a transition stuck after a failed
    /// verification; otherwise it is treated like any other signal.
    pub fn on_snapshot(&mut self, snapshot: UserSnapshot, at: DateTime<Utc>) -> Vec<PresenceEvent> {
        let user_id = snapshot.identity.user_id.clone();
        let pending_phase = self
            .records
            .get(&user_id)
            .and_then(|record| record.pending.as_ref())
            .map(|pending| pending.phase);

        match pending_phase {
            Some(PendingPhase::AwaitingPoll) => self.resolve_pending(&user_id, snapshot, at),
            Some(_) if snapshot.state == PresenceState::Online => {
                self.cancel_pending(&user_id, "snapshot still online");
                Vec::new()
            }
            Some(_) => Vec::new(),
            None => {
                let location = snapshot.location.clone();
                self.signal(snapshot.identity, snapshot.state, location, at)
            }
        }
    }

    /// Fires expired debounce timers and applies finished verifications.
    pub fn tick(&mut self, now: DateTime<Utc>, directory: &SessionActorDirectory) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        for (handle, user_id) in self.timers.expire(now) {
            events.extend(self.debounce_expired(handle, &user_id, directory));
        }
        while let Ok(verification) = self.verifications_rx.try_recv() {
            events.extend(self.apply_verification(verification, now));
        }
        events
    }

    fn signal(
        &mut self,
        identity: Identity,
        target: PresenceState,
        location: Option<String>,
        at: DateTime<Utc>,
    ) -> Vec<PresenceEvent> {
        let user_id = identity.user_id.clone();
        let location = normalize_location(location);
        let window = to_delta(self.settings.duplicate_online_window);
        let debounce = to_delta(self.settings.debounce);
        let record = self.record_mut(&identity);
        let state = record.state;

        if target == PresenceState::Online {
            if record.pending.is_some() {
                // Back before the debounce resolved, so the departure was a blip.
                self.cancel_pending(&user_id, "online again within debounce");
                return self.move_to(&user_id, location, at).into_iter().collect();
            }
            if state == PresenceState::Online {
                if record
                    .last_online_accepted_at
                    .is_some_and(|accepted| at - accepted < window)
                {
                    debug!(%user_id, "duplicate online delivery suppressed");
                    return Vec::new();
                }
                return self.move_to(&user_id, location, at).into_iter().collect();
            }
            return self
                .commit(&user_id, PresenceState::Online, location, at)
                .into_iter()
                .collect();
        }

        if state != PresenceState::Online {
            return self.commit(&user_id, target, None, at).into_iter().collect();
        }

        if let Some(pending) = record.pending.as_mut() {
            pending.target = target;
            pending.requested_at = at;
            return Vec::new();
        }
        let timer = self.timers.schedule(deadline(at, debounce), user_id.clone());
        if let Some(record) = self.records.get_mut(&user_id) {
            record.pending = Some(PendingTransition {
                target,
                requested_at: at,
                timer: Some(timer),
                phase: PendingPhase::Waiting,
            });
        }
        debug!(%user_id, %target, "leaving online; debounce started");
        Vec::new()
    }

    fn debounce_expired(
        &mut self,
        handle: TimerHandle,
        user_id: &str,
        directory: &SessionActorDirectory,
    ) -> Option<PresenceEvent> {
        let pending = self.records.get_mut(user_id)?.pending.as_mut()?;
        if pending.timer != Some(handle) || pending.phase != PendingPhase::Waiting {
            return None;
        }
        pending.timer = None;

        if directory.contains_user(user_id) {
            self.cancel_pending(user_id, "present in current session");
            return None;
        }

        let Some(source) = self.source.as_ref().map(Arc::clone) else {
            // Nothing to verify against; the debounce alone decides.
            let (target, requested_at) = (pending.target, pending.requested_at);
            if let Some(record) = self.records.get_mut(user_id) {
                record.pending = None;
            }
            return self.commit(user_id, target, None, requested_at);
        };

        self.next_token += 1;
        let token = self.next_token;
        pending.phase = PendingPhase::Verifying { token };
        let tx = self.verifications_tx.clone();
        let user_id = user_id.to_string();
        self.runner.run(Box::new(move || {
            let result = source.fetch(&user_id);
            let _ = tx.send(Verification {
                user_id,
                token,
                result,
            });
        }));
        None
    }

    fn apply_verification(&mut self, verification: Verification, now: DateTime<Utc>) -> Vec<PresenceEvent> {
        let Verification {
            user_id,
            token,
            result,
        } = verification;
        let phase = self
            .records
            .get(&user_id)
            .and_then(|record| record.pending.as_ref())
            .map(|pending| pending.phase);
        if phase != Some(PendingPhase::Verifying { token }) {
            debug!(%user_id, token, "stale verification dropped");
            return Vec::new();
        }

        match result {
            Ok(snapshot) => self.resolve_pending(&user_id, snapshot, now),
            Err(err) => {
                debug!(error = %err, %user_id, "presence verification failed; waiting for next poll");
                if let Some(pending) = self
                    .records
                    .get_mut(&user_id)
                    .and_then(|record| record.pending.as_mut())
                {
                    pending.phase = PendingPhase::AwaitingPoll;
                }
                Vec::new()
            }
        }
    }

    /// Settles a pending departure from a trusted snapshot.
    fn resolve_pending(&mut self, user_id: &str, snapshot: UserSnapshot, at: DateTime<Utc>) -> Vec<PresenceEvent> {
        if snapshot.state == PresenceState::Online {
            self.cancel_pending(user_id, "verified still online");
            return self
                .move_to(user_id, normalize_location(snapshot.location), at)
                .into_iter()
                .collect();
        }
        let Some(record) = self.records.get_mut(user_id) else {
            return Vec::new();
        };
        let Some(pending) = record.pending.take() else {
            return Vec::new();
        };
        if !snapshot.identity.display_name.is_empty() {
            record.identity.display_name = snapshot.identity.display_name;
        }
        if let Some(timer) = pending.timer {
            self.timers.cancel(timer);
        }
        // The departure happened when it was first reported, not when it was confirmed.
        self.commit(user_id, snapshot.state, None, pending.requested_at)
            .into_iter()
            .collect()
    }

    fn cancel_pending(&mut self, user_id: &str, reason: &str) {
        let Some(pending) = self
            .records
            .get_mut(user_id)
            .and_then(|record| record.pending.take())
        else {
            return;
        };
        if let Some(timer) = pending.timer {
            self.timers.cancel(timer);
        }
        debug!(user_id, target = %pending.target, reason, "pending transition cancelled");
    }

    /// Commits `target`, returning the transition when the state actually changed.
    fn commit(
        &mut self,
        user_id: &str,
        target: PresenceState,
        location: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<PresenceEvent> {
        let record = self.records.get_mut(user_id)?;
        let previous = record.state;
        if previous == target {
            return None;
        }
        let online_for = record.online_since.map(|since| at - since);
        record.state = target;

        let event = match target {
            PresenceState::Online => {
                let offline_for = match previous {
                    PresenceState::Offline => record.offline_since.map(|since| at - since),
                    _ => None,
                };
                record.online_since = Some(at);
                record.offline_since = None;
                record.last_online_accepted_at = Some(at);
                record.location = None;
                record.location_since = None;
                record.traveling_since = None;
                if let Some(location) = location {
                    arrive(record, location, at);
                }
                PresenceEvent::Online {
                    identity: record.identity.clone(),
                    previous,
                    location: record.location.clone(),
                    offline_for,
                    at,
                }
            }
            PresenceState::Active => {
                record.online_since = None;
                record.location = None;
                record.location_since = None;
                record.traveling_since = None;
                PresenceEvent::Active {
                    identity: record.identity.clone(),
                    previous,
                    online_for,
                    at,
                }
            }
            PresenceState::Offline => {
                let time_at_location = record.time_at_location(at);
                let location = record.location.take();
                record.online_since = None;
                record.offline_since = Some(at);
                record.location_since = None;
                record.traveling_since = None;
                PresenceEvent::Offline {
                    identity: record.identity.clone(),
                    previous,
                    location,
                    time_at_location,
                    online_for,
                    at,
                }
            }
        };
        debug!(user_id, %previous, %target, "presence committed");
        Some(event)
    }

    /// Location update for a user already online; arriving somewhere new emits GPS.
    fn move_to(&mut self, user_id: &str, location: Option<String>, at: DateTime<Utc>) -> Option<PresenceEvent> {
        let location = location?;
        let record = self.records.get_mut(user_id)?;
        if location == TRAVELING {
            record.traveling_since.get_or_insert(at);
            return None;
        }
        if record.location.as_deref() == Some(location.as_str()) {
            record.traveling_since = None;
            return None;
        }
        let from = record.location.clone();
        let time_at_previous = record.time_at_location(at);
        arrive(record, location.clone(), at);
        Some(PresenceEvent::Gps {
            identity: record.identity.clone(),
            from,
            to: location,
            time_at_previous,
            at,
        })
    }

    fn identity_for(&self, user_id: &str, display_name: Option<&str>) -> Identity {
        let known = self
            .records
            .get(user_id)
            .map(|record| record.identity.display_name.as_str());
        Identity::new(user_id, display_name.or(known).unwrap_or(user_id))
    }

    fn record_mut(&mut self, identity: &Identity) -> &mut PresenceRecord {
        let record = self
            .records
            .entry(identity.user_id.clone())
            .or_insert_with(|| PresenceRecord::new(identity.clone()));
        if !identity.display_name.is_empty() && record.identity.display_name != identity.display_name {
            record.identity.display_name = identity.display_name.clone();
        }
        record
    }
}

fn arrive(record: &mut PresenceRecord, location: String, at: DateTime<Utc>) {
    if location == TRAVELING {
        record.traveling_since.get_or_insert(at);
        return;
    }
    record.location = Some(location);
    record.location_since = Some(at);
    record.traveling_since = None;
}

fn normalize_location(location: Option<String>) -> Option<String> {
    location.filter(|value| !value.is_empty() && value != "offline")
}
