//! Binary-heap timer queue
//!
//! Min-heap by deadline with lazy cancellation: cancelled ids live in a
//! HashSet and their entries are discarded when they surface at the top. The
//! set is cleared whenever the heap drains, bounding its growth.
//!
//! Complexity: insert O(log n), cancel O(1), tick O(k log n) for k expired.

use super::entry::{TimerEntry, TimerId};
use super::{TimerCallback, TimerCondition};

use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Heap wrapper ordering entries earliest-deadline-first, id as tie-break.
struct HeapSlot(TimerEntry);

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap.
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.id.cmp(&self.0.id),
            ord => ord,
        }
    }
}

struct Inner {
    heap: BinaryHeap<HeapSlot>,
    cancelled: HashSet<TimerId>,
}

/// Thread-safe timer queue shared by all workers of a scheduler.
pub struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                cancelled: HashSet::new(),
            }),
        }
    }

    /// Queue a one-shot timer. Returns the cancellation id and whether the
    /// new entry became the earliest deadline (callers use that to re-arm a
    /// sleeping poller).
    pub fn add(&self, delay: Duration, callback: TimerCallback) -> (TimerId, bool) {
        self.push(TimerEntry::new(delay, callback))
    }

    /// Queue a condition timer; the callback is dropped unfired if the weak
    /// reference is dead at expiry.
    pub fn add_condition(
        &self,
        delay: Duration,
        callback: TimerCallback,
        condition: TimerCondition,
    ) -> (TimerId, bool) {
        self.push(TimerEntry::with_condition(delay, callback, condition))
    }

    fn push(&self, entry: TimerEntry) -> (TimerId, bool) {
        let id = entry.id();
        let deadline = entry.deadline();
        let mut inner = self.inner.lock().unwrap();
        let at_front = match inner.heap.peek() {
            Some(head) => deadline < head.0.deadline,
            None => true,
        };
        inner.heap.push(HeapSlot(entry));
        (id, at_front)
    }

    /// Cancel a queued timer. Idempotent: the first call on a still-queued
    /// timer returns true, any later call returns false.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.insert(id)
    }

    /// Earliest queued deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.heap.peek().map(|s| s.0.deadline)
    }

    /// Pop every entry expired at `now` and return the callbacks to run.
    ///
    /// Cancelled entries are discarded; condition entries whose weak guard no
    /// longer upgrades are discarded silently. Callbacks run outside the
    /// queue lock, on the calling thread.
    pub fn tick(&self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        while let Some(head) = inner.heap.peek() {
            if head.0.deadline > now {
                break;
            }
            let entry = inner.heap.pop().unwrap().0;

            if inner.cancelled.remove(&entry.id) {
                continue;
            }
            if let Some(cond) = &entry.condition {
                if cond.upgrade().is_none() {
                    continue;
                }
            }
            due.push(entry.callback);
        }

        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }
        due
    }

    /// Queued entries, including not-yet-reaped cancelled ones.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.len().saturating_sub(inner.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_add_and_tick() {
        let q = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let (_, front) = q.add(Duration::ZERO, counter_cb(&fired));
        assert!(front);
        assert_eq!(q.len(), 1);

        for cb in q.tick(Instant::now() + Duration::from_millis(1)) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_tick_in_deadline_order() {
        let q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (delay, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let order = order.clone();
            q.add(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(tag)),
            );
        }

        for cb in q.tick(now + Duration::from_millis(50)) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_at_front_flag() {
        let q = TimerQueue::new();
        let (_, f1) = q.add(Duration::from_millis(100), Box::new(|| {}));
        assert!(f1);
        let (_, f2) = q.add(Duration::from_millis(200), Box::new(|| {}));
        assert!(!f2);
        let (_, f3) = q.add(Duration::from_millis(10), Box::new(|| {}));
        assert!(f3);
    }

    #[test]
    fn test_cancel() {
        let q = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let (id, _) = q.add(Duration::ZERO, counter_cb(&fired));
        assert!(q.cancel(id));
        assert_eq!(q.len(), 0);

        let cbs = q.tick(Instant::now() + Duration::from_millis(1));
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_idempotent() {
        let q = TimerQueue::new();
        let (id, _) = q.add(Duration::from_secs(10), Box::new(|| {}));
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
    }

    #[test]
    fn test_condition_alive_fires() {
        let q = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let guard: Arc<dyn Any + Send + Sync> = Arc::new(0u8);

        q.add_condition(Duration::ZERO, counter_cb(&fired), Arc::downgrade(&guard));
        for cb in q.tick(Instant::now() + Duration::from_millis(1)) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(guard);
    }

    #[test]
    fn test_condition_dead_is_silent() {
        let q = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let guard: Arc<dyn Any + Send + Sync> = Arc::new(0u8);
            q.add_condition(Duration::ZERO, counter_cb(&fired), Arc::downgrade(&guard));
            // guard drops here
        }

        let cbs = q.tick(Instant::now() + Duration::from_millis(1));
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_next_deadline() {
        let q = TimerQueue::new();
        assert!(q.next_deadline().is_none());

        let now = Instant::now();
        q.add(Duration::from_millis(100), Box::new(|| {}));
        let d = q.next_deadline().unwrap();
        assert!(d > now && d <= now + Duration::from_millis(150));
    }

    #[test]
    fn test_cancelled_set_cleared_on_drain() {
        let q = TimerQueue::new();
        for _ in 0..8 {
            let (id, _) = q.add(Duration::ZERO, Box::new(|| {}));
            q.cancel(id);
        }
        let _ = q.tick(Instant::now() + Duration::from_millis(1));
        let inner = q.inner.lock().unwrap();
        assert!(inner.cancelled.is_empty());
        assert!(inner.heap.is_empty());
    }
}
