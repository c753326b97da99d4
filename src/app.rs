use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::actors::{IdentityLookup, ResolvedAction, SessionAction, SessionActorDirectory, SessionEvent};
use crate::classifier::{LineClassifier, LogClock};
use crate::config::{self, RuntimeSettings, TrackerConfig};
use crate::error::{LookupError, SnapshotError};
use crate::event::{ActorId, Identity, format_iso};
use crate::feed::{FeedBatch, FeedEntry, SessionFeed};
use crate::notification::PushNotification;
use crate::presence::{
    PendingPhase, PresenceEvent, PresenceReconciler, PresenceState, SnapshotSource, UserSnapshot,
};
use crate::queue::Drained;
use crate::runner::{InlineRunner, ThreadRunner};
use crate::tailer::{LineFollower, LogTailer, discover_log_files, read_log_file};
use crate::timeout::{TimeoutReport, TimeoutWatcher};
use crate::timer::to_delta;
use crate::util::{human_delta, now_local, optional_delta, truncate};

const LOOP_INTERVAL: Duration = Duration::from_millis(250);
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const MAX_LINE_WIDTH: usize = 160;

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub notifications: Option<PathBuf>,
    pub session_events: Option<PathBuf>,
    pub since: Option<DateTime<Utc>>,
    pub json: bool,
}

/// Latest state per friend as reported by the notification stream.
///
/// Stands in for the REST client: verification reads back what the stream last said,
/// and display-name lookups resolve against users the stream has mentioned.
#[derive(Default)]
pub struct LastKnownSnapshots {
    users: RwLock<HashMap<String, UserSnapshot>>,
}

impl LastKnownSnapshots {
    pub fn observe(&self, notification: &PushNotification) {
        let Some(user_id) = notification.user_id() else {
            return;
        };
        let mut users = self.users.write();
        let entry = users.entry(user_id.to_string()).or_insert_with(|| UserSnapshot {
            identity: Identity::new(user_id, user_id),
            state: PresenceState::Offline,
            location: None,
        });
        if let Some(name) = notification.display_name() {
            entry.identity.display_name = name.to_string();
        }
        match notification {
            PushNotification::FriendOnline { location, .. }
            | PushNotification::FriendLocation { location, .. } => {
                entry.state = PresenceState::Online;
                entry.location = location.clone();
            }
            PushNotification::FriendActive { .. } => {
                entry.state = PresenceState::Active;
                entry.location = None;
            }
            PushNotification::FriendOffline { .. } => {
                entry.state = PresenceState::Offline;
                entry.location = None;
            }
            PushNotification::FriendUpdate { user, .. } | PushNotification::UserUpdate { user, .. } => {
                if let Some(state) = user.as_ref().and_then(|user| user.state.as_deref()) {
                    entry.state = PresenceState::from_api(state);
                }
            }
            PushNotification::Unknown { .. } => {}
        }
    }
}

impl SnapshotSource for LastKnownSnapshots {
    fn fetch(&self, user_id: &str) -> Result<UserSnapshot, SnapshotError> {
        self.users
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(user_id.to_string()))
    }
}

impl IdentityLookup for LastKnownSnapshots {
    fn lookup(&self, display_name: &str) -> Result<Identity, LookupError> {
        self.users
            .read()
            .values()
            .find(|snapshot| snapshot.identity.display_name == display_name)
            .map(|snapshot| snapshot.identity.clone())
            .ok_or_else(|| LookupError::Failed(format!("no user named {display_name} seen yet")))
    }
}

pub fn watch(config: TrackerConfig, options: WatchOptions, runtime: RuntimeSettings) -> Result<()> {
    let stop = install_stop_signal()?;
    let log_dir = config.effective_log_dir();
    let snapshots = Arc::new(LastKnownSnapshots::default());

    let mut tailer = LogTailer::new(&log_dir, runtime.poll_interval, LogClock::Local);
    tailer.set_cutoff_date(options.since);
    tailer.start()?;

    let mut feed = SessionFeed::new();
    let mut directory = SessionActorDirectory::new(Arc::new(ThreadRunner::new("identity-lookup")))
        .with_lookup(snapshots.clone());
    let mut presence = PresenceReconciler::new(
        config.presence_settings(),
        Arc::new(ThreadRunner::new("presence-verify")),
    )
    .with_source(snapshots.clone());
    let mut watcher = TimeoutWatcher::new(config.timeout_settings());
    let mut notifications = options.notifications.as_deref().map(LineFollower::from_end);
    let mut session_events = options.session_events.as_deref().map(LineFollower::from_end);
    let mut next_snapshot_poll = Utc::now() + to_delta(SNAPSHOT_POLL_INTERVAL);
    let mut replayed = 0usize;
    let mut announced_live = false;

    println!("Watching {}", log_dir.display());
    if let Some(follower) = &notifications {
        println!("Notifications: {}", follower.path().display());
    }
    if let Some(follower) = &session_events {
        println!("Session events: {}", follower.path().display());
    }
    println!("Press Ctrl+C to stop.");

    while !stop.load(Ordering::Relaxed) {
        let now = Utc::now();

        let drained = tailer.drain(runtime.drain_max);
        if options.json {
            print_json_events(&drained);
        }
        let batch = feed.consume(drained, &mut directory);
        if batch.notify {
            if !announced_live {
                println!("Replayed {replayed} history entries; now live.");
                announced_live = true;
            }
            if !options.json {
                print_feed(&batch);
            }
        } else {
            replayed += batch.entries.len();
        }

        if let Some(follower) = notifications.as_mut() {
            for line in follower.poll() {
                match PushNotification::parse(&line) {
                    Ok(notification) => {
                        snapshots.observe(&notification);
                        print_presence(&presence.on_notification(&notification, now));
                    }
                    Err(err) => debug!(error = %err, "skipping notification line"),
                }
            }
        }

        if let Some(follower) = session_events.as_mut() {
            for line in follower.poll() {
                match serde_json::from_str::<SessionEvent>(&line) {
                    Ok(event) => {
                        mark_local_user(&config, &event, &mut directory);
                        print_actions(&directory.apply_event(event, now));
                    }
                    Err(err) => debug!(error = %err, "skipping session event line"),
                }
            }
        }
        print_actions(&directory.poll_lookups());

        if now >= next_snapshot_poll {
            next_snapshot_poll = now + to_delta(SNAPSHOT_POLL_INTERVAL);
            poll_stuck_transitions(&mut presence, snapshots.as_ref(), now);
        }
        print_presence(&presence.tick(now, &directory));

        if config.timeouts.enabled {
            if !watcher.is_armed() && directory.len() > 1 {
                watcher.arm(now);
            }
            if let Some(report) = watcher.tick(now, &directory) {
                print_timeouts(&report);
            }
        }

        thread::sleep(LOOP_INTERVAL);
    }

    tailer.stop();
    info!(events = feed.processed(), "watch stopped");
    Ok(())
}

/// Stands in for the periodic REST poll: only transitions whose verification failed need it.
fn poll_stuck_transitions(presence: &mut PresenceReconciler, source: &dyn SnapshotSource, now: DateTime<Utc>) {
    let stuck: Vec<String> = presence
        .records()
        .filter(|record| {
            record
                .pending
                .as_ref()
                .is_some_and(|pending| pending.phase == PendingPhase::AwaitingPoll)
        })
        .map(|record| record.identity.user_id.clone())
        .collect();
    for user_id in stuck {
        match source.fetch(&user_id) {
            Ok(snapshot) => print_presence(&presence.on_snapshot(snapshot, now)),
            Err(err) => debug!(error = %err, %user_id, "snapshot poll failed"),
        }
    }
}

fn mark_local_user(config: &TrackerConfig, event: &SessionEvent, directory: &mut SessionActorDirectory) {
    if let (Some(local), SessionEvent::Join { actor, display_name, .. }) = (&config.local_user, event)
        && local == display_name
    {
        directory.set_local_actor(ActorId(*actor));
    }
}

pub fn replay(file: &Path, json: bool) -> Result<()> {
    let events = read_log_file(file, &LineClassifier::default())?;
    for event in &events {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", truncate(&event.to_string(), MAX_LINE_WIDTH));
        }
    }
    if !json {
        println!("{} event(s) from {}", events.len(), file.display());
    }
    Ok(())
}

pub fn print_status(config: &TrackerConfig) -> Result<()> {
    let runtime = config::runtime_settings();
    let log_dir = config.effective_log_dir();
    let files = discover_log_files(&log_dir);

    println!("vrc-log-presence status ({})", now_local());
    println!("config: {}", config::config_path().display());
    println!("log_dir: {}", log_dir.display());
    println!("poll_interval: {}ms", runtime.poll_interval.as_millis());
    println!("drain_max: {}", runtime.drain_max);
    println!("log_files: {}", files.len());

    let Some(latest) = files.last() else {
        return Ok(());
    };
    println!("latest_log: {} ({} bytes)", latest.path.display(), latest.len);

    let events = read_log_file(&latest.path, &LineClassifier::default())?;
    let mut feed = SessionFeed::new();
    let mut directory = SessionActorDirectory::new(Arc::new(InlineRunner));
    feed.consume(
        Drained {
            events,
            backlog: true,
        },
        &mut directory,
    );
    match feed.current_instance() {
        Some(instance) => {
            println!("current_instance:");
            println!("  world: {}", instance.world_name);
            println!("  location: {}", instance.location);
            println!("  since: {}", instance.since.as_deref().unwrap_or("n/a"));
            println!("  players_seen: {}", instance.players);
        }
        None => println!("current_instance: none"),
    }
    Ok(())
}

pub fn doctor(config: &TrackerConfig) -> Result<u8> {
    let mut issues = 0u8;
    let log_dir = config.effective_log_dir();

    println!("vrc-log-presence doctor");
    println!("config_path: {}", config::config_path().display());
    println!("log_dir_candidates:");
    for candidate in config::log_dir_candidates() {
        println!("  - {}", candidate.display());
    }

    if log_dir.is_dir() {
        println!("[OK] Log directory accessible: {}", log_dir.display());
    } else {
        issues += 1;
        println!("[WARN] Log directory not found: {}", log_dir.display());
    }

    let files = discover_log_files(&log_dir);
    match files.last() {
        Some(latest) => {
            println!("[OK] Found {} log file(s).", files.len());
            match File::open(&latest.path)
                .with_context(|| format!("failed to open {}", latest.path.display()))
            {
                Ok(_) => println!("[OK] Latest log readable."),
                Err(err) => {
                    issues += 1;
                    println!("[WARN] {err:#}");
                }
            }
        }
        None => {
            issues += 1;
            println!("[WARN] No output_log_*.txt files found.");
        }
    }

    if config.local_user.is_some() {
        println!("[OK] Local user configured.");
    } else {
        println!("[INFO] local_user not set; self is only known from session events.");
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn print_json_events(drained: &Drained) {
    for event in &drained.events {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => debug!(error = %err, "failed to serialize event"),
        }
    }
}

fn print_feed(batch: &FeedBatch) {
    for entry in &batch.entries {
        let line = match entry {
            FeedEntry::Location {
                location,
                world_name,
                previous_stay,
                ..
            } => match previous_stay {
                Some(stay) => format!("Location {world_name} ({location}), left previous after {}", human_delta(*stay)),
                None => format!("Location {world_name} ({location})"),
            },
            FeedEntry::PlayerJoined { display_name, .. } => format!("+ {display_name}"),
            FeedEntry::PlayerLeft {
                display_name, stayed, ..
            } => format!("- {display_name} (stayed {})", optional_delta(*stayed)),
            FeedEntry::Log(event) => event.kind.to_string(),
        };
        println!("[{}] {}", format_iso(entry.at()), truncate(&line, MAX_LINE_WIDTH));
    }
}

fn print_presence(events: &[PresenceEvent]) {
    for event in events {
        let who = &event.identity().display_name;
        let line = match event {
            PresenceEvent::Online {
                location,
                offline_for,
                ..
            } => format!(
                "{who} is online at {} (offline {})",
                location.as_deref().unwrap_or("private"),
                optional_delta(*offline_for)
            ),
            PresenceEvent::Active { online_for, .. } => {
                format!("{who} is active (was online {})", optional_delta(*online_for))
            }
            PresenceEvent::Offline {
                location,
                time_at_location,
                ..
            } => format!(
                "{who} went offline from {} after {}",
                location.as_deref().unwrap_or("n/a"),
                optional_delta(*time_at_location)
            ),
            PresenceEvent::Gps {
                from,
                to,
                time_at_previous,
                ..
            } => format!(
                "{who} moved {} -> {to} (stayed {})",
                from.as_deref().unwrap_or("?"),
                optional_delta(*time_at_previous)
            ),
        };
        println!("[{}] {}: {line}", format_iso(event.at()), event.kind());
    }
}

fn print_actions(actions: &[ResolvedAction]) {
    for resolved in actions {
        let who = &resolved.identity;
        let line = match &resolved.action {
            SessionAction::Moderation { kind, active } => {
                format!("{who} {} {kind:?}", if *active { "applied" } else { "lifted" })
            }
            SessionAction::AvatarChanged { avatar_id } => format!("{who} changed avatar to {avatar_id}"),
            SessionAction::Chat { message } => format!("{who}: {}", truncate(message, MAX_LINE_WIDTH)),
        };
        println!("[{}] {} {line}", format_iso(resolved.at), resolved.actor);
    }
}

fn print_timeouts(report: &TimeoutReport) {
    if report.actors.is_empty() {
        return;
    }
    let names: Vec<String> = report
        .actors
        .iter()
        .map(|actor| format!("{} {} ({})", actor.actor, actor.display_name, human_delta(actor.elapsed)))
        .collect();
    println!(
        "[{}] Timing out: {}",
        format_iso(report.at),
        truncate(&names.join(", "), MAX_LINE_WIDTH)
    );
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> PushNotification {
        PushNotification::parse(raw).expect("parse")
    }

    #[test]
    fn last_known_snapshots_follow_the_stream() {
        let snapshots = LastKnownSnapshots::default();
        snapshots.observe(&parse(
            r#"{"type":"friend-online","content":{"userId":"usr_a","location":"wrld_1:1","user":{"displayName":"Alice"}}}"#,
        ));
        let online = snapshots.fetch("usr_a").expect("snapshot");
        assert_eq!(online.state, PresenceState::Online);
        assert_eq!(online.location.as_deref(), Some("wrld_1:1"));
        assert_eq!(
            snapshots.lookup("Alice").expect("identity"),
            Identity::new("usr_a", "Alice")
        );

        snapshots.observe(&parse(r#"{"type":"friend-offline","content":{"userId":"usr_a"}}"#));
        assert_eq!(
            snapshots.fetch("usr_a").expect("snapshot").state,
            PresenceState::Offline
        );
        assert!(matches!(snapshots.fetch("usr_x"), Err(SnapshotError::NotFound(_))));
        assert!(snapshots.lookup("Nobody").is_err());
    }

    #[test]
    fn local_user_is_marked_from_join() {
        let config = TrackerConfig {
            local_user: Some("Me".to_string()),
            ..TrackerConfig::default()
        };
        let mut directory = SessionActorDirectory::new(Arc::new(InlineRunner));
        let join = SessionEvent::Join {
            actor: 9,
            display_name: "Me".to_string(),
            user_id: None,
            at: None,
        };
        mark_local_user(&config, &join, &mut directory);
        assert_eq!(directory.local_actor(), Some(ActorId(9)));
    }
}
