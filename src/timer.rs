//! Single-shot and repeating timers driven by the consumer's own loop.
//!
//! Nothing here sleeps or spawns; callers pass `now` and collect what expired,
//! which keeps the state machines that use these timers deterministic under test.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug)]
pub struct TimerQueue<K> {
    next_id: u64,
    pending: BTreeMap<(DateTime<Utc>, u64), K>,
    due_by_id: HashMap<u64, DateTime<Utc>>,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            next_id: 0,
            pending: BTreeMap::new(),
            due_by_id: HashMap::new(),
        }
    }
}

impl<K> TimerQueue<K> {
    pub fn schedule(&mut self, due: DateTime<Utc>, key: K) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert((due, id), key);
        self.due_by_id.insert(id, due);
        TimerHandle(id)
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> Option<K> {
        let due = self.due_by_id.remove(&handle.0)?;
        self.pending.remove(&(due, handle.0))
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.due_by_id.contains_key(&handle.0)
    }

    /// Removes and returns every timer due at or before `now`, earliest first.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<(TimerHandle, K)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            let (due, id) = *entry.key();
            if due > now {
                break;
            }
            let key = entry.remove();
            self.due_by_id.remove(&id);
            fired.push((TimerHandle(id), key));
        }
        fired
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RepeatingTimer {
    interval: TimeDelta,
    next: Option<DateTime<Utc>>,
}

impl RepeatingTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: to_delta(interval),
            next: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.next.is_none() {
            self.next = Some(deadline(now, self.interval));
        }
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn is_running(&self) -> bool {
        self.next.is_some()
    }

    /// True when the interval elapsed. Missed ticks collapse into one.
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.next {
            Some(next) if next <= now => {
                self.next = Some(deadline(now, self.interval));
                true
            }
            _ => false,
        }
    }
}

pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// `now + delay`, pinned to the end of representable time instead of overflowing.
pub fn deadline(now: DateTime<Utc>, delay: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("ts")
    }

    #[test]
    fn expires_in_due_order() {
        let mut timers = TimerQueue::default();
        timers.schedule(t(300), "c");
        timers.schedule(t(100), "a");
        timers.schedule(t(200), "b");

        let fired: Vec<_> = timers.expire(t(250)).into_iter().map(|(_, k)| k).collect();
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_due(), Some(t(300)));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimerQueue::default();
        let handle = timers.schedule(t(100), 7u32);
        assert!(timers.is_scheduled(handle));
        assert_eq!(timers.cancel(handle), Some(7));
        assert!(!timers.is_scheduled(handle));
        assert_eq!(timers.cancel(handle), None);
        assert!(timers.expire(t(1_000)).is_empty());
    }

    #[test]
    fn repeating_timer_collapses_missed_ticks() {
        let mut timer = RepeatingTimer::new(Duration::from_millis(500));
        assert!(!timer.poll(t(0)));
        timer.start(t(0));
        assert!(!timer.poll(t(499)));
        assert!(timer.poll(t(2_000)));
        assert!(!timer.poll(t(2_100)));
        assert!(timer.poll(t(2_500)));
        timer.stop();
        assert!(!timer.poll(t(9_000)));
    }

    #[test]
    fn oversized_interval_never_fires() {
        let mut timer = RepeatingTimer::new(Duration::from_secs(u64::MAX / 2));
        timer.start(t(0));
        assert!(timer.is_running());
        assert!(!timer.poll(t(1_000_000_000_000_000)));

        assert_eq!(deadline(t(0), TimeDelta::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(deadline(t(0), TimeDelta::milliseconds(5)), t(5));
    }
}
