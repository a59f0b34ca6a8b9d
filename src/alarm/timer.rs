use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::clock::Clock;

/// Upper bound on a single park so wall-clock jumps are noticed.
pub const MAX_PARK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

struct TimerQueue<T> {
    next_handle: u64,
    pending: HashMap<TimerHandle, T>,
    deadlines: BinaryHeap<Reverse<(DateTime<Utc>, TimerHandle)>>,
}

impl<T> TimerQueue<T> {
    fn new() -> Self {
        Self {
            next_handle: 1,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, handle))) = self.deadlines.peek().copied() {
            if self.pending.contains_key(&handle) {
                return Some(at);
            }
            self.deadlines.pop();
        }
        None
    }
}

/// Absolute-instant timers keyed by handle. A cancelled handle never comes
/// back out of [`TimerEngine::take_due`].
pub struct TimerEngine<T> {
    queue: Mutex<TimerQueue<T>>,
    changed: Notify,
}

impl<T> Default for TimerEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerEngine<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(TimerQueue::new()),
            changed: Notify::new(),
        }
    }

    pub fn schedule(&self, at: DateTime<Utc>, payload: T) -> TimerHandle {
        let handle = {
            let mut queue = self.lock();
            let handle = TimerHandle(queue.next_handle);
            queue.next_handle += 1;
            queue.pending.insert(handle, payload);
            queue.deadlines.push(Reverse((at, handle)));
            handle
        };
        self.changed.notify_one();
        handle
    }

    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.lock().pending.remove(&handle).is_some()
    }

    pub fn cancel_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        let mut queue = self.lock();
        let before = queue.pending.len();
        queue.pending.retain(|_, payload| !predicate(&*payload));
        before - queue.pending.len()
    }

    pub fn count_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        self.lock()
            .pending
            .values()
            .filter(|payload| predicate(*payload))
            .count()
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.lock().pending.contains_key(&handle)
    }

    #[cfg(test)]
    pub fn deadline_of(&self, handle: TimerHandle) -> Option<DateTime<Utc>> {
        let queue = self.lock();
        if !queue.pending.contains_key(&handle) {
            return None;
        }
        queue
            .deadlines
            .iter()
            .find(|Reverse((_, pending))| *pending == handle)
            .map(|Reverse((at, _))| *at)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().next_deadline()
    }

    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<(TimerHandle, T)> {
        let mut queue = self.lock();
        let mut due = Vec::new();
        while let Some(Reverse((at, handle))) = queue.deadlines.peek().copied() {
            if at > now {
                break;
            }
            queue.deadlines.pop();
            if let Some(payload) = queue.pending.remove(&handle) {
                due.push((handle, payload));
            }
        }
        due
    }

    pub async fn park(&self, clock: &dyn Clock) {
        let wait = park_duration(self.next_deadline(), clock.now());
        if wait.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.changed.notified() => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn park_duration(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match deadline {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_PARK),
        None => MAX_PARK,
    }
}
