//! Session actor directory: ephemeral per-session actor numbers mapped to persistent identities.
//!
//! A join whose display name is not yet known gets a placeholder entry and an
//! asynchronous lookup. Actions that target a placeholder are queued on the entry and
//! replayed in order once the identity resolves, or discarded if the actor leaves first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LookupError;
use crate::event::{ActorId, Identity};
use crate::runner::TaskRunner;
use crate::timer::to_delta;

pub const DEFAULT_CHAT_DEDUP_WINDOW: Duration = Duration::from_secs(5);
/// Oldest queued actions are dropped past this many per unresolved actor.
pub const MAX_QUEUED_ACTIONS: usize = 64;

/// Resolves a display name to a persistent identity. Called off the consumer thread.
pub trait IdentityLookup: Send + Sync {
    fn lookup(&self, display_name: &str) -> Result<Identity, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModerationKind {
    Block,
    Mute,
}

/// Something that happened to an actor and needs its identity to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Moderation { kind: ModerationKind, active: bool },
    AvatarChanged { avatar_id: String },
    Chat { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed(Identity),
    Pending {
        display_name: String,
        queued: Vec<(DateTime<Utc>, SessionAction)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionActorEntry {
    pub resolution: Resolution,
    pub join_time: DateTime<Utc>,
    pub has_instantiated: bool,
    pub last_event_at: DateTime<Utc>,
    pub avatar_id: Option<String>,
    pub last_chat: Option<(String, DateTime<Utc>)>,
}

impl SessionActorEntry {
    fn new(resolution: Resolution, at: DateTime<Utc>) -> Self {
        Self {
            resolution,
            join_time: at,
            has_instantiated: false,
            last_event_at: at,
            avatar_id: None,
            last_chat: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.resolution {
            Resolution::Confirmed(identity) => Some(identity),
            Resolution::Pending { .. } => None,
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.resolution {
            Resolution::Confirmed(identity) => &identity.display_name,
            Resolution::Pending { display_name, .. } => display_name,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.resolution, Resolution::Confirmed(_))
    }
}

/// An action applied against a confirmed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAction {
    pub actor: ActorId,
    pub identity: Identity,
    pub at: DateTime<Utc>,
    pub action: SessionAction,
}

#[derive(Debug)]
struct LookupCompletion {
    actor: ActorId,
    display_name: String,
    result: Result<Identity, LookupError>,
}

pub struct SessionActorDirectory {
    entries: BTreeMap<ActorId, SessionActorEntry>,
    known: HashMap<String, Identity>,
    local_actor: Option<ActorId>,
    session_started_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
    chat_dedup_window: TimeDelta,
    lookup: Option<Arc<dyn IdentityLookup>>,
    failed_lookups: HashSet<ActorId>,
    runner: Arc<dyn TaskRunner>,
    completions_tx: Sender<LookupCompletion>,
    completions_rx: Receiver<LookupCompletion>,
}

impl SessionActorDirectory {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        Self {
            entries: BTreeMap::new(),
            known: HashMap::new(),
            local_actor: None,
            session_started_at: None,
            last_event_at: None,
            chat_dedup_window: to_delta(DEFAULT_CHAT_DEDUP_WINDOW),
            lookup: None,
            failed_lookups: HashSet::new(),
            runner,
            completions_tx,
            completions_rx,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn IdentityLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_chat_dedup_window(mut self, window: Duration) -> Self {
        self.chat_dedup_window = to_delta(window);
        self
    }

    /// Starts a new session at `at`. Actors that joined before it belong to the previous
    /// session and are dropped; joins stamped at or after it were already part of the new
    /// one and survive.
    pub fn begin_session(&mut self, at: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.join_time >= at);
        let entries = &self.entries;
        self.failed_lookups.retain(|actor| entries.contains_key(actor));
        if before > self.entries.len() {
            debug!(
                cleared = before - self.entries.len(),
                kept = self.entries.len(),
                "clearing actors from previous session"
            );
        }
        if self
            .local_actor
            .is_some_and(|actor| !self.entries.contains_key(&actor))
        {
            self.local_actor = None;
        }
        self.session_started_at = Some(at);
        self.last_event_at = self
            .entries
            .values()
            .map(|entry| entry.last_event_at)
            .chain(std::iter::once(at))
            .max();
    }

    pub fn end_session(&mut self) {
        self.entries.clear();
        self.failed_lookups.clear();
        self.local_actor = None;
        self.session_started_at = None;
        self.last_event_at = None;
    }

    /// Caches an identity so later joins under the same display name resolve immediately.
    pub fn remember(&mut self, identity: Identity) {
        self.known.insert(identity.display_name.clone(), identity);
    }

    pub fn known_identity(&self, display_name: &str) -> Option<&Identity> {
        self.known.get(display_name)
    }

    /// Records a join. Returns the identity when it is already known.
    pub fn on_join(
        &mut self,
        actor: ActorId,
        display_name: &str,
        user_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<Identity> {
        let identity = match user_id {
            Some(user_id) => {
                let identity = Identity::new(user_id, display_name);
                self.remember(identity.clone());
                Some(identity)
            }
            None => self.known.get(display_name).cloned(),
        };

        if let Some(previous) = self.entries.get(&actor) {
            debug!(
                %actor,
                previous = previous.display_name(),
                display_name,
                "actor number reused without a leave"
            );
        }

        let resolution = match &identity {
            Some(identity) => Resolution::Confirmed(identity.clone()),
            None => Resolution::Pending {
                display_name: display_name.to_string(),
                queued: Vec::new(),
            },
        };
        self.entries.insert(actor, SessionActorEntry::new(resolution, at));
        self.failed_lookups.remove(&actor);
        self.note_event(at);

        if identity.is_none() {
            self.request_lookup(actor, display_name);
        }
        identity
    }

    fn request_lookup(&self, actor: ActorId, display_name: &str) {
        let Some(lookup) = self.lookup.as_ref().map(Arc::clone) else {
            debug!(%actor, display_name, "no identity lookup configured; actor stays pending");
            return;
        };
        let tx = self.completions_tx.clone();
        let display_name = display_name.to_string();
        self.runner.run(Box::new(move || {
            let result = lookup.lookup(&display_name);
            let _ = tx.send(LookupCompletion {
                actor,
                display_name,
                result,
            });
        }));
    }

    /// Applies finished lookups whose actor is still the one that requested them.
    pub fn poll_lookups(&mut self) -> Vec<ResolvedAction> {
        let mut replayed = Vec::new();
        while let Ok(completion) = self.completions_rx.try_recv() {
            let still_pending = self.entries.get(&completion.actor).is_some_and(|entry| {
                matches!(
                    &entry.resolution,
                    Resolution::Pending { display_name, .. } if *display_name == completion.display_name
                )
            });
            if !still_pending {
                debug!(
                    actor = %completion.actor,
                    display_name = %completion.display_name,
                    "dropping stale identity lookup"
                );
                continue;
            }
            match completion.result {
                Ok(identity) => {
                    replayed.extend(self.on_identity_resolved(completion.actor, identity));
                }
                Err(err) => {
                    debug!(
                        error = %err,
                        actor = %completion.actor,
                        display_name = %completion.display_name,
                        "identity lookup failed; retrying on the actor's next activity"
                    );
                    self.failed_lookups.insert(completion.actor);
                }
            }
        }
        replayed
    }

    /// Confirms an actor's identity and replays anything queued against it, in order.
    pub fn on_identity_resolved(&mut self, actor: ActorId, identity: Identity) -> Vec<ResolvedAction> {
        let Some(entry) = self.entries.get_mut(&actor) else {
            return Vec::new();
        };
        let queued = match &mut entry.resolution {
            Resolution::Confirmed(existing) => {
                if *existing != identity {
                    debug!(%actor, existing = %existing, ignored = %identity, "actor already confirmed");
                }
                return Vec::new();
            }
            Resolution::Pending { queued, .. } => std::mem::take(queued),
        };
        entry.resolution = Resolution::Confirmed(identity.clone());
        self.remember(identity);

        queued
            .into_iter()
            .filter_map(|(at, action)| self.apply(actor, action, at))
            .collect()
    }

    /// Removes an actor along with any actions still waiting on its identity.
    pub fn on_leave(&mut self, actor: ActorId, at: DateTime<Utc>) -> Option<SessionActorEntry> {
        let entry = self.entries.remove(&actor)?;
        self.failed_lookups.remove(&actor);
        if let Resolution::Pending { display_name, queued } = &entry.resolution
            && !queued.is_empty()
        {
            debug!(%actor, %display_name, discarded = queued.len(), "actor left before resolving");
        }
        if self.local_actor == Some(actor) {
            self.local_actor = None;
        }
        self.note_event(at);
        Some(entry)
    }

    /// Records activity for an actor. A pending actor whose lookup failed gets another one.
    pub fn touch(&mut self, actor: ActorId, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(&actor)
            && at > entry.last_event_at
        {
            entry.last_event_at = at;
        }
        self.note_event(at);

        if self.failed_lookups.remove(&actor)
            && let Some(SessionActorEntry {
                resolution: Resolution::Pending { display_name, .. },
                ..
            }) = self.entries.get(&actor)
        {
            let display_name = display_name.clone();
            self.request_lookup(actor, &display_name);
        }
    }

    /// Advances the session-wide activity clock.
    pub fn note_event(&mut self, at: DateTime<Utc>) {
        if self.last_event_at.is_none_or(|last| at > last) {
            self.last_event_at = Some(at);
        }
    }

    /// Returns true when the flag flipped. Never set for the local actor.
    pub fn mark_instantiated(&mut self, actor: ActorId) -> bool {
        if self.local_actor == Some(actor) {
            return false;
        }
        match self.entries.get_mut(&actor) {
            Some(entry) if !entry.has_instantiated => {
                entry.has_instantiated = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_local_actor(&mut self, actor: ActorId) {
        self.local_actor = Some(actor);
    }

    pub fn local_actor(&self) -> Option<ActorId> {
        self.local_actor
    }

    /// Applies `action` now if the actor is confirmed, otherwise queues it on the entry.
    pub fn defer_or_apply(
        &mut self,
        actor: ActorId,
        action: SessionAction,
        at: DateTime<Utc>,
    ) -> Option<ResolvedAction> {
        let Some(entry) = self.entries.get_mut(&actor) else {
            debug!(%actor, ?action, "action for unknown actor dropped");
            return None;
        };
        if let Resolution::Pending { queued, .. } = &mut entry.resolution {
            if queued.len() >= MAX_QUEUED_ACTIONS {
                let (_, dropped) = queued.remove(0);
                debug!(%actor, ?dropped, "queue full; dropping oldest action for unresolved actor");
            }
            queued.push((at, action));
            return None;
        }
        self.apply(actor, action, at)
    }

    fn apply(&mut self, actor: ActorId, action: SessionAction, at: DateTime<Utc>) -> Option<ResolvedAction> {
        let applies = match &action {
            SessionAction::Moderation { .. } => true,
            SessionAction::AvatarChanged { avatar_id } => self.record_avatar(actor, avatar_id),
            SessionAction::Chat { message } => self.record_chat(actor, message, at),
        };
        if !applies {
            return None;
        }
        let identity = self.entries.get(&actor)?.identity()?.clone();
        Some(ResolvedAction {
            actor,
            identity,
            at,
            action,
        })
    }

    /// Returns false when the actor already wears this avatar.
    pub fn record_avatar(&mut self, actor: ActorId, avatar_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(&actor) else {
            return false;
        };
        if entry.avatar_id.as_deref() == Some(avatar_id) {
            return false;
        }
        entry.avatar_id = Some(avatar_id.to_string());
        true
    }

    /// Returns false for a repeat of the actor's last message inside the dedup window.
    pub fn record_chat(&mut self, actor: ActorId, message: &str, at: DateTime<Utc>) -> bool {
        let window = self.chat_dedup_window;
        let Some(entry) = self.entries.get_mut(&actor) else {
            return false;
        };
        if let Some((last, last_at)) = &entry.last_chat
            && last == message
            && at - *last_at < window
        {
            return false;
        }
        entry.last_chat = Some((message.to_string(), at));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, actor: ActorId) -> Option<&SessionActorEntry> {
        self.entries.get(&actor)
    }

    pub fn entries(&self) -> impl Iterator<Item = (ActorId, &SessionActorEntry)> {
        self.entries.iter().map(|(actor, entry)| (*actor, entry))
    }

    pub fn find_by_user_id(&self, user_id: &str) -> Option<ActorId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.identity().is_some_and(|id| id.user_id == user_id))
            .map(|(actor, _)| *actor)
    }

    /// True when a confirmed actor in the current session carries `user_id`.
    pub fn contains_user(&self, user_id: &str) -> bool {
        self.find_by_user_id(user_id).is_some()
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.session_started_at
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
    }

    /// Applies one record from the session event stream.
    pub fn apply_event(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Vec<ResolvedAction> {
        let at = event.at().unwrap_or(now);
        match event {
            SessionEvent::Join {
                actor,
                display_name,
                user_id,
                ..
            } => {
                self.on_join(ActorId(actor), &display_name, user_id.as_deref(), at);
                Vec::new()
            }
            SessionEvent::Leave { actor, .. } => {
                self.on_leave(ActorId(actor), at);
                Vec::new()
            }
            SessionEvent::Activity { actor, .. } => {
                self.touch(ActorId(actor), at);
                Vec::new()
            }
            SessionEvent::Instantiated { actor, .. } => {
                self.mark_instantiated(ActorId(actor));
                self.touch(ActorId(actor), at);
                Vec::new()
            }
            SessionEvent::Local { actor, .. } => {
                self.set_local_actor(ActorId(actor));
                Vec::new()
            }
            SessionEvent::Moderation {
                actor, kind, active, ..
            } => self.action_event(actor, SessionAction::Moderation { kind, active }, at),
            SessionEvent::Avatar {
                actor, avatar_id, ..
            } => self.action_event(actor, SessionAction::AvatarChanged { avatar_id }, at),
            SessionEvent::Chat { actor, message, .. } => {
                self.action_event(actor, SessionAction::Chat { message }, at)
            }
        }
    }

    fn action_event(&mut self, actor: u32, action: SessionAction, at: DateTime<Utc>) -> Vec<ResolvedAction> {
        let actor = ActorId(actor);
        self.touch(actor, at);
        self.defer_or_apply(actor, action, at).into_iter().collect()
    }
}

/// One line of the session event stream produced by the network bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Join {
        actor: u32,
        display_name: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Leave {
        actor: u32,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Activity {
        actor: u32,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Instantiated {
        actor: u32,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Local {
        actor: u32,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Moderation {
        actor: u32,
        kind: ModerationKind,
        active: bool,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Avatar {
        actor: u32,
        avatar_id: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Chat {
        actor: u32,
        message: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

impl SessionEvent {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Join { at, .. }
            | Self::Leave { at, .. }
            | Self::Activity { at, .. }
            | Self::Instantiated { at, .. }
            | Self::Local { at, .. }
            | Self::Moderation { at, .. }
            | Self::Avatar { at, .. }
            | Self::Chat { at, .. } => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::InlineRunner;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("ts")
    }

    fn directory() -> SessionActorDirectory {
        SessionActorDirectory::new(Arc::new(InlineRunner))
    }

    /// Lookup whose answers are held back until the test releases them.
    #[derive(Default)]
    struct ScriptedLookup {
        answers: Mutex<HashMap<String, Result<Identity, LookupError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl IdentityLookup for ScriptedLookup {
        fn lookup(&self, display_name: &str) -> Result<Identity, LookupError> {
            self.calls.lock().push(display_name.to_string());
            self.answers
                .lock()
                .get(display_name)
                .cloned()
                .unwrap_or(Err(LookupError::Failed("unknown user".to_string())))
        }
    }

    fn mute() -> SessionAction {
        SessionAction::Moderation {
            kind: ModerationKind::Mute,
            active: true,
        }
    }

    #[test]
    fn known_display_name_resolves_immediately() {
        let mut dir = directory();
        dir.remember(Identity::new("usr_a", "Alice"));
        let identity = dir.on_join(ActorId(3), "Alice", None, t(0));
        assert_eq!(identity, Some(Identity::new("usr_a", "Alice")));
        assert!(dir.get(ActorId(3)).expect("entry").is_confirmed());
        assert!(dir.contains_user("usr_a"));
    }

    #[test]
    fn moderation_on_unresolved_actor_replays_after_resolution() {
        let mut dir = directory();
        assert_eq!(dir.on_join(ActorId(5), "Bob", None, t(0)), None);

        assert_eq!(dir.defer_or_apply(ActorId(5), mute(), t(1)), None);
        let entry = dir.get(ActorId(5)).expect("entry");
        assert!(!entry.is_confirmed());
        assert_eq!(entry.display_name(), "Bob");

        let replayed = dir.on_identity_resolved(ActorId(5), Identity::new("usr_b", "Bob"));
        assert_eq!(
            replayed,
            vec![ResolvedAction {
                actor: ActorId(5),
                identity: Identity::new("usr_b", "Bob"),
                at: t(1),
                action: mute(),
            }]
        );
        assert_eq!(dir.known_identity("Bob"), Some(&Identity::new("usr_b", "Bob")));
    }

    #[test]
    fn queued_actions_are_dropped_when_actor_leaves_first() {
        let mut dir = directory();
        dir.on_join(ActorId(5), "Bob", None, t(0));
        dir.defer_or_apply(ActorId(5), mute(), t(1));
        let left = dir.on_leave(ActorId(5), t(2)).expect("entry");
        assert!(matches!(left.resolution, Resolution::Pending { ref queued, .. } if queued.len() == 1));

        assert!(
            dir.on_identity_resolved(ActorId(5), Identity::new("usr_b", "Bob"))
                .is_empty()
        );
        assert!(dir.is_empty());
    }

    #[test]
    fn confirmed_identity_is_never_replaced() {
        let mut dir = directory();
        dir.on_join(ActorId(1), "Alice", Some("usr_a"), t(0));
        assert!(
            dir.on_identity_resolved(ActorId(1), Identity::new("usr_other", "Alice"))
                .is_empty()
        );
        assert_eq!(
            dir.get(ActorId(1)).and_then(SessionActorEntry::identity),
            Some(&Identity::new("usr_a", "Alice"))
        );
    }

    #[test]
    fn lookup_completion_resolves_through_runner() {
        let lookup = Arc::new(ScriptedLookup::default());
        lookup
            .answers
            .lock()
            .insert("Carol".to_string(), Ok(Identity::new("usr_c", "Carol")));
        let mut dir = directory().with_lookup(lookup.clone());

        dir.on_join(ActorId(7), "Carol", None, t(0));
        dir.defer_or_apply(
            ActorId(7),
            SessionAction::AvatarChanged {
                avatar_id: "avtr_1".to_string(),
            },
            t(1),
        );
        assert_eq!(lookup.calls.lock().as_slice(), ["Carol".to_string()]);

        let replayed = dir.poll_lookups();
        assert_eq!(replayed.len(), 1);
        let entry = dir.get(ActorId(7)).expect("entry");
        assert!(entry.is_confirmed());
        assert_eq!(entry.avatar_id.as_deref(), Some("avtr_1"));
    }

    #[test]
    fn stale_lookup_for_departed_actor_is_ignored() {
        let lookup = Arc::new(ScriptedLookup::default());
        lookup
            .answers
            .lock()
            .insert("Carol".to_string(), Ok(Identity::new("usr_c", "Carol")));
        let mut dir = directory().with_lookup(lookup);

        dir.on_join(ActorId(7), "Carol", None, t(0));
        dir.on_leave(ActorId(7), t(1));
        dir.on_join(ActorId(7), "Dave", Some("usr_d"), t(2));

        assert!(dir.poll_lookups().is_empty());
        assert_eq!(
            dir.get(ActorId(7)).and_then(SessionActorEntry::identity),
            Some(&Identity::new("usr_d", "Dave"))
        );
    }

    #[test]
    fn failed_lookup_leaves_actor_pending() {
        let lookup = Arc::new(ScriptedLookup::default());
        let mut dir = directory().with_lookup(lookup);
        dir.on_join(ActorId(2), "Nobody", None, t(0));
        assert!(dir.poll_lookups().is_empty());
        assert!(!dir.get(ActorId(2)).expect("entry").is_confirmed());
    }

    #[test]
    fn failed_lookup_is_retried_on_next_activity() {
        let lookup = Arc::new(ScriptedLookup::default());
        let mut dir = directory().with_lookup(lookup.clone());
        dir.on_join(ActorId(2), "Frank", None, t(0));
        assert!(dir.poll_lookups().is_empty());
        dir.defer_or_apply(ActorId(2), mute(), t(1));

        lookup
            .answers
            .lock()
            .insert("Frank".to_string(), Ok(Identity::new("usr_f", "Frank")));
        dir.touch(ActorId(2), t(2));
        let replayed = dir.poll_lookups();

        assert_eq!(lookup.calls.lock().len(), 2);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].identity, Identity::new("usr_f", "Frank"));
        assert!(dir.get(ActorId(2)).expect("entry").is_confirmed());

        dir.touch(ActorId(2), t(3));
        assert_eq!(lookup.calls.lock().len(), 2);
    }

    #[test]
    fn queued_actions_are_capped_oldest_first() {
        let mut dir = directory();
        dir.on_join(ActorId(6), "Gina", None, t(0));
        for i in 0..MAX_QUEUED_ACTIONS + 3 {
            let chat = SessionAction::Chat {
                message: format!("m{i}"),
            };
            assert!(dir.defer_or_apply(ActorId(6), chat, t(1)).is_none());
        }

        let replayed = dir.on_identity_resolved(ActorId(6), Identity::new("usr_g", "Gina"));
        assert_eq!(replayed.len(), MAX_QUEUED_ACTIONS);
        assert_eq!(
            replayed[0].action,
            SessionAction::Chat {
                message: "m3".to_string()
            }
        );
    }

    #[test]
    fn local_actor_is_never_marked_instantiated() {
        let mut dir = directory();
        dir.on_join(ActorId(1), "Me", Some("usr_me"), t(0));
        dir.on_join(ActorId(2), "Alice", Some("usr_a"), t(0));
        dir.set_local_actor(ActorId(1));

        assert!(!dir.mark_instantiated(ActorId(1)));
        assert!(dir.mark_instantiated(ActorId(2)));
        assert!(!dir.mark_instantiated(ActorId(2)));
        assert!(!dir.get(ActorId(1)).expect("self").has_instantiated);
    }

    #[test]
    fn repeated_chat_within_window_is_suppressed() {
        let mut dir = directory().with_chat_dedup_window(Duration::from_secs(5));
        dir.on_join(ActorId(4), "Alice", Some("usr_a"), t(0));
        let chat = || SessionAction::Chat {
            message: "hi".to_string(),
        };
        assert!(dir.defer_or_apply(ActorId(4), chat(), t(1)).is_some());
        assert!(dir.defer_or_apply(ActorId(4), chat(), t(3)).is_none());
        assert!(dir.defer_or_apply(ActorId(4), chat(), t(10)).is_some());
    }

    #[test]
    fn begin_session_clears_previous_actors() {
        let mut dir = directory();
        dir.on_join(ActorId(1), "Alice", Some("usr_a"), t(0));
        dir.set_local_actor(ActorId(1));
        dir.begin_session(t(100));
        assert!(dir.is_empty());
        assert_eq!(dir.local_actor(), None);
        assert_eq!(dir.session_started_at(), Some(t(100)));
        assert_eq!(dir.known_identity("Alice").map(|i| i.user_id.as_str()), Some("usr_a"));
    }

    #[test]
    fn begin_session_keeps_joins_stamped_after_it() {
        let mut dir = directory();
        dir.on_join(ActorId(9), "Old", Some("usr_old"), t(0));
        dir.on_join(ActorId(1), "Me", Some("usr_me"), t(3));
        dir.set_local_actor(ActorId(1));
        dir.on_join(ActorId(2), "Alice", Some("usr_a"), t(4));

        dir.begin_session(t(2));

        assert_eq!(dir.len(), 2);
        assert!(dir.get(ActorId(9)).is_none());
        assert_eq!(dir.local_actor(), Some(ActorId(1)));
        assert!(dir.contains_user("usr_a"));
        assert_eq!(dir.session_started_at(), Some(t(2)));
        assert_eq!(dir.last_event_at(), Some(t(4)));
    }

    #[test]
    fn session_events_parse_and_apply() {
        let mut dir = directory();
        let lines = [
            r#"{"type":"join","actor":1,"display_name":"Me","user_id":"usr_me","at":"2023-11-14T22:13:20Z"}"#,
            r#"{"type":"local","actor":1}"#,
            r#"{"type":"join","actor":2,"display_name":"Eve"}"#,
            r#"{"type":"moderation","actor":2,"kind":"block","active":true}"#,
            r#"{"type":"activity","actor":1,"at":"2023-11-14T22:13:30Z"}"#,
        ];
        for line in lines {
            let event: SessionEvent = serde_json::from_str(line).expect("parse");
            assert!(dir.apply_event(event, t(5)).is_empty());
        }
        assert_eq!(dir.local_actor(), Some(ActorId(1)));
        assert_eq!(dir.get(ActorId(1)).expect("self").last_event_at, t(10));
        assert_eq!(dir.last_event_at(), Some(t(10)));

        let replayed = dir.on_identity_resolved(ActorId(2), Identity::new("usr_e", "Eve"));
        assert_eq!(replayed.len(), 1);
        assert_eq!(
            replayed[0].action,
            SessionAction::Moderation {
                kind: ModerationKind::Block,
                active: true
            }
        );
    }
}
