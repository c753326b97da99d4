use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::event::LogEvent;

pub const DEFAULT_DRAIN_MAX: usize = 1000;
pub const DEFAULT_CAPACITY: usize = 200_000;

/// Where the queue is relative to the tailer's first full pass after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    /// First pass still running; nothing is handed out yet.
    Replaying,
    /// First pass finished; its events are historical replay until drained.
    Backlog,
    Live,
}

#[derive(Debug, Default)]
pub struct Drained {
    pub events: Vec<LogEvent>,
    /// Historical replay that must not raise live notifications.
    pub backlog: bool,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<LogEvent>,
    generation: u64,
    phase: QueuePhase,
    /// Queued events, counted from the front, that belong to the first pass.
    backlog_remaining: usize,
    dropped: u64,
}

/// Buffer between the tailer thread (the only producer) and the consumer (the only drainer).
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                generation: 0,
                phase: QueuePhase::Replaying,
                backlog_remaining: 0,
                dropped: 0,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn phase(&self) -> QueuePhase {
        self.state.lock().phase
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Appends one event produced under `generation`. Returns false when a reset
    /// happened since the producer read the generation.
    pub fn append(&self, generation: u64, event: LogEvent) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        self.push_locked(&mut state, event);
        true
    }

    /// Appends the output of one complete scan pass and closes the replay phase.
    pub fn publish(&self, generation: u64, events: Vec<LogEvent>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        for event in events {
            self.push_locked(&mut state, event);
        }
        if state.phase == QueuePhase::Replaying {
            state.backlog_remaining = state.events.len();
            state.phase = if state.backlog_remaining == 0 {
                QueuePhase::Live
            } else {
                QueuePhase::Backlog
            };
        }
        true
    }

    /// Removes and returns up to `max_count` of the oldest events. A batch never mixes
    /// first-pass events with events published after that pass.
    pub fn drain(&self, max_count: usize) -> Drained {
        let mut state = self.state.lock();
        match state.phase {
            QueuePhase::Replaying => Drained {
                events: Vec::new(),
                backlog: true,
            },
            QueuePhase::Backlog => {
                let take = max_count.min(state.backlog_remaining);
                let events: Vec<LogEvent> = state.events.drain(..take).collect();
                state.backlog_remaining -= take;
                if state.backlog_remaining == 0 {
                    state.phase = QueuePhase::Live;
                }
                Drained {
                    events,
                    backlog: true,
                }
            }
            QueuePhase::Live => {
                let take = max_count.min(state.events.len());
                Drained {
                    events: state.events.drain(..take).collect(),
                    backlog: false,
                }
            }
        }
    }

    /// Discards everything queued and starts a new generation in replay phase.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.events.clear();
        state.generation = state.generation.wrapping_add(1);
        state.phase = QueuePhase::Replaying;
        state.backlog_remaining = 0;
        state.generation
    }

    fn push_locked(&self, state: &mut QueueState, event: LogEvent) {
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            state.backlog_remaining = state.backlog_remaining.saturating_sub(1);
            state.dropped += 1;
            if state.dropped.is_power_of_two() {
                warn!(
                    dropped = state.dropped,
                    capacity = self.capacity,
                    "event queue full; dropping oldest events"
                );
            }
        }
        state.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEventKind;
    use chrono::Utc;

    fn event(n: usize) -> LogEvent {
        LogEvent::new(
            "output_log_test.txt",
            Utc::now(),
            LogEventKind::ApiRequest {
                url: format!("https://api.example/{n}"),
            },
        )
    }

    #[test]
    fn first_pass_is_backlog_then_live() {
        let queue = EventQueue::default();
        let generation = queue.generation();

        let drained = queue.drain(DEFAULT_DRAIN_MAX);
        assert!(drained.events.is_empty());
        assert!(drained.backlog);

        assert!(queue.publish(generation, vec![event(1), event(2), event(3)]));
        let first = queue.drain(2);
        assert_eq!(first.events.len(), 2);
        assert!(first.backlog);
        let second = queue.drain(2);
        assert_eq!(second.events.len(), 1);
        assert!(second.backlog);

        assert!(queue.append(generation, event(4)));
        let live = queue.drain(DEFAULT_DRAIN_MAX);
        assert_eq!(live.events.len(), 1);
        assert!(!live.backlog);
    }

    #[test]
    fn later_passes_stay_live_while_backlog_drains() {
        let queue = EventQueue::default();
        let generation = queue.generation();
        assert!(queue.publish(generation, vec![event(1), event(2), event(3)]));
        assert!(queue.publish(generation, vec![event(4), event(5)]));

        let first = queue.drain(2);
        assert_eq!(first.events.len(), 2);
        assert!(first.backlog);
        let second = queue.drain(DEFAULT_DRAIN_MAX);
        assert_eq!(second.events.len(), 1);
        assert!(second.backlog);
        assert_eq!(queue.phase(), QueuePhase::Live);

        let live = queue.drain(DEFAULT_DRAIN_MAX);
        assert_eq!(live.events.len(), 2);
        assert!(!live.backlog);
    }

    #[test]
    fn empty_first_pass_goes_straight_to_live() {
        let queue = EventQueue::default();
        let generation = queue.generation();
        assert!(queue.publish(generation, Vec::new()));
        assert_eq!(queue.phase(), QueuePhase::Live);
        assert!(queue.append(generation, event(1)));
        assert!(!queue.drain(DEFAULT_DRAIN_MAX).backlog);
    }

    #[test]
    fn reset_then_drain_is_empty() {
        let queue = EventQueue::default();
        let generation = queue.generation();
        queue.publish(generation, vec![event(1), event(2)]);

        queue.reset();
        let drained = queue.drain(DEFAULT_DRAIN_MAX);
        assert!(drained.events.is_empty());
        assert!(drained.backlog);
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_generation_is_rejected() {
        let queue = EventQueue::default();
        let stale = queue.generation();
        queue.reset();
        assert!(!queue.append(stale, event(1)));
        assert!(!queue.publish(stale, vec![event(2)]));
        assert!(queue.is_empty());
        assert_eq!(queue.phase(), QueuePhase::Replaying);
    }

    #[test]
    fn drain_returns_oldest_first() {
        let queue = EventQueue::default();
        let generation = queue.generation();
        queue.publish(generation, (0..5).map(event).collect());
        let drained = queue.drain(3);
        let urls: Vec<_> = drained
            .events
            .iter()
            .map(|e| match &e.kind {
                LogEventKind::ApiRequest { url } => url.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://api.example/0",
                "https://api.example/1",
                "https://api.example/2"
            ]
        );
    }

    #[test]
    fn capacity_drops_oldest() {
        let queue = EventQueue::with_capacity(2);
        let generation = queue.generation();
        queue.publish(generation, (0..4).map(event).collect());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 2);
    }
}
