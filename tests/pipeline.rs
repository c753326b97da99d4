use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tempfile::TempDir;

use vrc_log_presence::actors::SessionActorDirectory;
use vrc_log_presence::classifier::{LineClassifier, LogClock};
use vrc_log_presence::feed::{FeedEntry, SessionFeed};
use vrc_log_presence::queue::{DEFAULT_DRAIN_MAX, EventQueue};
use vrc_log_presence::runner::InlineRunner;
use vrc_log_presence::tailer::LogScanner;

const SESSION: &str = "2024.03.09 18:00:01 Log        -  [Behaviour] Entering Room: MyWorld
2024.03.09 18:00:02 Log        -  [Behaviour] Joining wrld_X:1~public
2024.03.09 18:00:03 Log        -  [Behaviour] OnPlayerJoined Alice
2024.03.09 18:00:04 Log        -  [Behaviour] OnPlayerLeft Alice
";

fn scanner(dir: &Path) -> LogScanner {
    let utc = FixedOffset::east_opt(0).expect("utc");
    LogScanner::new(dir, LineClassifier::new(LogClock::Fixed(utc)))
}

fn append(path: &Path, content: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open append");
    file.write_all(content.as_bytes()).expect("append");
}

fn at(s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 9, 18, 0, s).single().expect("ts")
}

#[test]
fn log_lines_become_feed_rows_in_order() {
    let tmp = TempDir::new().expect("temp dir");
    append(&tmp.path().join("output_log_2024-03-09_18-00-00.txt"), SESSION);

    let queue = EventQueue::default();
    let mut scanner = scanner(tmp.path());
    assert!(queue.publish(queue.generation(), scanner.update()));

    let mut directory = SessionActorDirectory::new(Arc::new(InlineRunner));
    let mut feed = SessionFeed::new();
    let batch = feed.consume(queue.drain(DEFAULT_DRAIN_MAX), &mut directory);

    assert!(!batch.notify);
    assert_eq!(batch.entries.len(), 3);
    match &batch.entries[0] {
        FeedEntry::Location {
            location,
            world_name,
            at: when,
            previous_stay,
        } => {
            assert_eq!(location, "wrld_X:1~public");
            assert_eq!(world_name, "MyWorld");
            assert_eq!(*when, at(2));
            assert!(previous_stay.is_none());
        }
        other => panic!("expected location, got {other:?}"),
    }
    assert!(matches!(
        &batch.entries[1],
        FeedEntry::PlayerJoined { display_name, .. } if display_name == "Alice"
    ));
    assert_eq!(batch.entries[1].at(), at(3));
    match &batch.entries[2] {
        FeedEntry::PlayerLeft {
            display_name, stayed, ..
        } => {
            assert_eq!(display_name, "Alice");
            assert_eq!(stayed.map(|d| d.num_seconds()), Some(1));
        }
        other => panic!("expected player left, got {other:?}"),
    }

    assert_eq!(directory.session_started_at(), Some(at(2)));
    let instance = feed.current_instance().expect("current instance");
    assert_eq!(instance.world_name, "MyWorld");
    assert_eq!(instance.players, 0);
}

#[test]
fn appended_lines_arrive_as_live_batches() {
    let tmp = TempDir::new().expect("temp dir");
    let path = tmp.path().join("output_log_a.txt");
    append(&path, SESSION);

    let queue = EventQueue::default();
    let generation = queue.generation();
    let mut scanner = scanner(tmp.path());
    queue.publish(generation, scanner.update());

    let mut directory = SessionActorDirectory::new(Arc::new(InlineRunner));
    let mut feed = SessionFeed::new();
    feed.consume(queue.drain(DEFAULT_DRAIN_MAX), &mut directory);

    assert!(scanner.update().is_empty());
    let len = std::fs::metadata(&path).expect("metadata").len();
    assert_eq!(scanner.context("output_log_a.txt").expect("context").cursor, len);

    append(&path, "2024.03.09 18:00:09 Log        -  [Behaviour] OnPlayerJoined Bob\n");
    for event in scanner.update() {
        assert!(queue.append(generation, event));
    }
    let batch = feed.consume(queue.drain(DEFAULT_DRAIN_MAX), &mut directory);
    assert!(batch.notify);
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].at(), at(9));
    assert_eq!(feed.roster_len(), 1);
}

#[test]
fn reset_discards_queue_and_replays_from_start() {
    let tmp = TempDir::new().expect("temp dir");
    append(&tmp.path().join("output_log_a.txt"), SESSION);

    let queue = EventQueue::default();
    let mut scanner = scanner(tmp.path());
    let stale = queue.generation();
    queue.publish(stale, scanner.update());

    let generation = queue.reset();
    scanner.reset();
    assert!(queue.drain(DEFAULT_DRAIN_MAX).events.is_empty());
    assert_eq!(scanner.file_count(), 0);
    assert!(!queue.append(stale, scanner.update().remove(0)));

    scanner.reset();
    assert!(queue.publish(generation, scanner.update()));
    let drained = queue.drain(DEFAULT_DRAIN_MAX);
    assert!(drained.backlog);
    assert_eq!(drained.events.len(), 3);
}
