use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::actors::SessionActorDirectory;
use crate::event::{Identity, LogEvent, LogEventKind, format_iso};
use crate::queue::Drained;

/// History row produced from the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry {
    Location {
        location: String,
        world_name: String,
        at: DateTime<Utc>,
        /// Time spent in the previous instance, when there was one.
        previous_stay: Option<TimeDelta>,
    },
    PlayerJoined {
        display_name: String,
        user_id: Option<String>,
        at: DateTime<Utc>,
    },
    PlayerLeft {
        display_name: String,
        user_id: Option<String>,
        at: DateTime<Utc>,
        stayed: Option<TimeDelta>,
    },
    /// Any other event, passed through for the history layer.
    Log(LogEvent),
}

impl FeedEntry {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Location { at, .. } | Self::PlayerJoined { at, .. } | Self::PlayerLeft { at, .. } => *at,
            Self::Log(event) => event.timestamp,
        }
    }
}

#[derive(Debug, Default)]
pub struct FeedBatch {
    pub entries: Vec<FeedEntry>,
    /// False for historical replay, which must not raise live notifications.
    pub notify: bool,
}

/// Where the local player currently is, as seen from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurrentInstance {
    pub location: String,
    pub world_name: String,
    pub since: Option<String>,
    pub players: usize,
}

/// Log consumer: turns drained batches into history rows and keeps the directory's session in step.
#[derive(Debug, Default)]
pub struct SessionFeed {
    location: Option<(String, String, DateTime<Utc>)>,
    roster: HashMap<String, DateTime<Utc>>,
    processed: u64,
}

impl SessionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn current_instance(&self) -> Option<CurrentInstance> {
        let (location, world_name, since) = self.location.as_ref()?;
        Some(CurrentInstance {
            location: location.clone(),
            world_name: world_name.clone(),
            since: Some(format_iso(*since)),
            players: self.roster.len(),
        })
    }

    /// Forgets everything; used when the tailer replays from scratch.
    pub fn reset(&mut self) {
        self.location = None;
        self.roster.clear();
    }

    pub fn consume(&mut self, drained: Drained, directory: &mut SessionActorDirectory) -> FeedBatch {
        let notify = !drained.backlog;
        let entries = drained
            .events
            .into_iter()
            .filter_map(|event| self.apply(event, directory))
            .collect();
        FeedBatch { entries, notify }
    }

    fn apply(&mut self, event: LogEvent, directory: &mut SessionActorDirectory) -> Option<FeedEntry> {
        self.processed += 1;
        let at = event.timestamp;
        match event.kind {
            LogEventKind::Location {
                location,
                world_name,
            } => {
                let previous_stay = self.location.as_ref().map(|(_, _, since)| at - *since);
                self.location = Some((location.clone(), world_name.clone(), at));
                self.roster.clear();
                directory.begin_session(at);
                Some(FeedEntry::Location {
                    location,
                    world_name,
                    at,
                    previous_stay,
                })
            }
            LogEventKind::PlayerJoined {
                display_name,
                user_id,
            } => {
                self.roster.insert(display_name.clone(), at);
                if let Some(user_id) = &user_id {
                    directory.remember(Identity::new(user_id.clone(), display_name.clone()));
                }
                directory.note_event(at);
                Some(FeedEntry::PlayerJoined {
                    display_name,
                    user_id,
                    at,
                })
            }
            LogEventKind::PlayerLeft {
                display_name,
                user_id,
            } => {
                let stayed = self.roster.remove(&display_name).map(|joined| at - joined);
                directory.note_event(at);
                Some(FeedEntry::PlayerLeft {
                    display_name,
                    user_id,
                    at,
                    stayed,
                })
            }
            LogEventKind::VrcQuit => {
                self.reset();
                directory.end_session();
                Some(FeedEntry::Log(LogEvent::new(event.source_file, at, LogEventKind::VrcQuit)))
            }
            // Raw requests are too chatty for the history layer.
            LogEventKind::ApiRequest { .. } => None,
            kind => Some(FeedEntry::Log(LogEvent::new(event.source_file, at, kind))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActorId;
    use crate::runner::InlineRunner;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + s, 0).single().expect("ts")
    }

    fn ev(s: i64, kind: LogEventKind) -> LogEvent {
        LogEvent::new("output_log_a.txt", t(s), kind)
    }

    fn joined(name: &str, user_id: Option<&str>) -> LogEventKind {
        LogEventKind::PlayerJoined {
            display_name: name.to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    #[test]
    fn backlog_batches_do_not_notify() {
        let mut feed = SessionFeed::new();
        let mut dir = SessionActorDirectory::new(Arc::new(InlineRunner));
        let batch = feed.consume(
            Drained {
                events: vec![ev(0, joined("Alice", None))],
                backlog: true,
            },
            &mut dir,
        );
        assert!(!batch.notify);
        assert_eq!(batch.entries.len(), 1);
    }

    #[test]
    fn location_starts_session_and_leave_reports_stay() {
        let mut feed = SessionFeed::new();
        let mut dir = SessionActorDirectory::new(Arc::new(InlineRunner));
        let batch = feed.consume(
            Drained {
                events: vec![
                    ev(
                        10,
                        LogEventKind::Location {
                            location: "wrld_X:1~public".to_string(),
                            world_name: "MyWorld".to_string(),
                        },
                    ),
                    ev(11, joined("Alice", Some("usr_a"))),
                    ev(
                        71,
                        LogEventKind::PlayerLeft {
                            display_name: "Alice".to_string(),
                            user_id: None,
                        },
                    ),
                    ev(
                        72,
                        LogEventKind::ApiRequest {
                            url: "https://api.example/".to_string(),
                        },
                    ),
                ],
                backlog: false,
            },
            &mut dir,
        );

        assert!(batch.notify);
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(dir.session_started_at(), Some(t(10)));
        assert_eq!(dir.last_event_at(), Some(t(71)));
        assert_eq!(dir.known_identity("Alice").map(|i| i.user_id.as_str()), Some("usr_a"));
        assert!(matches!(
            &batch.entries[2],
            FeedEntry::PlayerLeft { stayed: Some(d), .. } if *d == TimeDelta::seconds(60)
        ));
        assert_eq!(feed.roster_len(), 0);
        assert_eq!(feed.processed(), 4);
    }

    #[test]
    fn late_drained_location_keeps_actors_that_joined_after_it() {
        let mut feed = SessionFeed::new();
        let mut dir = SessionActorDirectory::new(Arc::new(InlineRunner));
        dir.on_join(ActorId(1), "Me", Some("usr_me"), t(3));
        dir.set_local_actor(ActorId(1));
        dir.on_join(ActorId(2), "Alice", Some("usr_a"), t(3));

        feed.consume(
            Drained {
                events: vec![ev(
                    2,
                    LogEventKind::Location {
                        location: "wrld_X:1".to_string(),
                        world_name: "W".to_string(),
                    },
                )],
                backlog: false,
            },
            &mut dir,
        );

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.local_actor(), Some(ActorId(1)));
        assert!(dir.contains_user("usr_a"));
        assert_eq!(dir.session_started_at(), Some(t(2)));
    }

    #[test]
    fn quit_ends_session() {
        let mut feed = SessionFeed::new();
        let mut dir = SessionActorDirectory::new(Arc::new(InlineRunner));
        feed.consume(
            Drained {
                events: vec![
                    ev(
                        0,
                        LogEventKind::Location {
                            location: "wrld_X:1".to_string(),
                            world_name: "W".to_string(),
                        },
                    ),
                    ev(5, joined("Bob", None)),
                    ev(9, LogEventKind::VrcQuit),
                ],
                backlog: false,
            },
            &mut dir,
        );
        assert_eq!(feed.current_instance(), None);
        assert_eq!(dir.session_started_at(), None);
    }
}
