use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::actors::SessionActorDirectory;
use crate::event::ActorId;
use crate::timer::{RepeatingTimer, to_delta};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(3000);
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(120);
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(20);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub threshold: Duration,
    pub join_grace: Duration,
    pub warmup: Duration,
    pub tick_interval: Duration,
    /// When non-empty, only these user ids are reported.
    pub watch_list: HashSet<String>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            join_grace: DEFAULT_JOIN_GRACE,
            warmup: DEFAULT_WARMUP,
            tick_interval: DEFAULT_TICK_INTERVAL,
            watch_list: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOutActor {
    pub actor: ActorId,
    pub display_name: String,
    pub user_id: Option<String>,
    pub elapsed: TimeDelta,
    pub has_instantiated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutReport {
    pub at: DateTime<Utc>,
    /// Longest silence first.
    pub actors: Vec<TimedOutActor>,
}

/// Flags session actors that stopped producing events while the rest of the session did not.
#[derive(Debug)]
pub struct TimeoutWatcher {
    settings: TimeoutSettings,
    timer: RepeatingTimer,
}

impl TimeoutWatcher {
    pub fn new(settings: TimeoutSettings) -> Self {
        let timer = RepeatingTimer::new(settings.tick_interval);
        Self { settings, timer }
    }

    pub fn settings(&self) -> &TimeoutSettings {
        &self.settings
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_running()
    }

    pub fn arm(&mut self, now: DateTime<Utc>) {
        self.timer.start(now);
    }

    pub fn disarm(&mut self) {
        self.timer.stop();
    }

    /// Runs one check if the tick interval elapsed. `None` when nothing was checked.
    pub fn tick(&mut self, now: DateTime<Utc>, directory: &SessionActorDirectory) -> Option<TimeoutReport> {
        if !self.timer.poll(now) {
            return None;
        }
        if directory.len() <= 1 {
            debug!(members = directory.len(), "session too small; timeout watcher disarmed");
            self.timer.stop();
            return None;
        }
        let warmup = to_delta(self.settings.warmup);
        let started = directory.session_started_at()?;
        if now - started < warmup {
            return None;
        }
        // A quiet session means our own stream stalled, not everyone else's.
        let last_event = directory.last_event_at()?;
        if now - last_event > warmup {
            return None;
        }
        Some(self.check(now, directory))
    }

    /// Collects every eligible actor silent for longer than the threshold.
    pub fn check(&self, now: DateTime<Utc>, directory: &SessionActorDirectory) -> TimeoutReport {
        let threshold = to_delta(self.settings.threshold);
        let grace = to_delta(self.settings.join_grace);
        let local = directory.local_actor();

        let mut actors: Vec<TimedOutActor> = directory
            .entries()
            .filter(|(actor, _)| Some(*actor) != local)
            .filter(|(_, entry)| now - entry.join_time >= grace)
            .filter_map(|(actor, entry)| {
                let elapsed = now - entry.last_event_at;
                if elapsed <= threshold {
                    return None;
                }
                let user_id = entry.identity().map(|identity| identity.user_id.clone());
                if !self.settings.watch_list.is_empty()
                    && !user_id
                        .as_ref()
                        .is_some_and(|id| self.settings.watch_list.contains(id))
                {
                    return None;
                }
                Some(TimedOutActor {
                    actor,
                    display_name: entry.display_name().to_string(),
                    user_id,
                    elapsed,
                    has_instantiated: entry.has_instantiated,
                })
            })
            .collect();
        actors.sort_by(|a, b| b.elapsed.cmp(&a.elapsed).then_with(|| a.actor.cmp(&b.actor)));
        TimeoutReport { at: now, actors }
    }
}
