//! Deduplicating, delay-capable work queue with per-key exponential backoff
//!
//! A key handed out by [`WorkQueue::get`] is "in flight" until [`WorkQueue::done`]
//! is called for it. While a key is queued or in flight, further enqueues of
//! the same key collapse into one pending entry; an enqueue that lands while
//! the key is in flight is remembered and the key is queued again on `done`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Exponential per-key backoff: `base * 2^failures`, capped at `max`
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay for an item that has already failed `failures` times
    pub fn delay(&self, failures: u32) -> Duration {
        // 2^31 * base already overflows any sane cap
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BinaryHeap<Reverse<(Instant, u64, K)>>,
    ready_at: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash + Ord> State<K> {
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move every delayed item whose deadline passed into the ready queue.
    /// Returns the next pending deadline, if any.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        while let Some(Reverse((at, _, key))) = self.waiting.peek().cloned() {
            // Superseded by an earlier deadline for the same key
            if self.ready_at.get(&key) != Some(&at) {
                self.waiting.pop();
                continue;
            }
            if at > now {
                return Some(at);
            }
            self.waiting.pop();
            self.ready_at.remove(&key);
            self.add(key);
        }
        None
    }
}

/// Work queue shared between the event adapter, the resync loop and the workers
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl<K: Clone + Eq + Hash + Ord + Send> WorkQueue<K> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                ready_at: HashMap::new(),
                failures: HashMap::new(),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` for processing now
    pub fn enqueue(&self, key: K) {
        let added = self.lock().add(key);
        if added {
            self.notify.notify_waiters();
        }
    }

    /// Queue `key` once `delay` has elapsed. An earlier pending deadline for
    /// the same key wins.
    pub fn enqueue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if matches!(state.ready_at.get(&key), Some(existing) if *existing <= at) {
                return;
            }
            state.seq += 1;
            let seq = state.seq;
            state.ready_at.insert(key.clone(), at);
            state.waiting.push(Reverse((at, seq, key)));
        }
        // Sleeping getters recompute their deadline
        self.notify.notify_waiters();
    }

    /// Queue `key` after its next backoff delay and record one more failure
    pub fn enqueue_rate_limited(&self, key: K) -> Duration {
        let delay = self.next_backoff(&key);
        self.enqueue_after(key, delay);
        delay
    }

    /// Backoff delay for the next retry of `key`; increments its failure count
    pub fn next_backoff(&self, key: &K) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Clear the backoff history of `key`
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Mark `key` as finished. If it was enqueued while in flight it becomes
    /// ready again immediately.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the next ready key. Returns `None` once the queue is shut
    /// down and every ready key has been handed out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                let next_deadline = state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                next_deadline
            };

            match next_deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop accepting new work. Delayed items are dropped; ready items are
    /// still handed out so workers can drain.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.ready_at.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready for processing
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting for a delay to elapse
    pub fn delayed_len(&self) -> usize {
        self.lock().ready_at.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(ExponentialBackoff::default())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(20));
        assert_eq!(backoff.delay(2), Duration::from_millis(40));
        assert_eq!(backoff.delay(3), Duration::from_millis(50));
        assert_eq!(backoff.delay(200), Duration::from_millis(50));
    }

    #[test]
    fn forget_resets_backoff() {
        let q = queue();
        let key = "default/web".to_string();
        assert_eq!(q.next_backoff(&key), Duration::from_millis(5));
        assert_eq!(q.next_backoff(&key), Duration::from_millis(10));
        assert_eq!(q.num_requeues(&key), 2);
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        assert_eq!(q.next_backoff(&key), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn duplicate_enqueues_collapse() {
        let q = queue();
        for _ in 0..5 {
            q.enqueue("a".to_string());
        }
        q.enqueue("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn enqueue_while_in_flight_is_deferred_until_done() {
        let q = queue();
        q.enqueue("a".to_string());
        let key = q.get().await.unwrap();

        q.enqueue("a".to_string());
        q.enqueue("a".to_string());
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_reenqueue_does_not_requeue() {
        let q = queue();
        q.enqueue("a".to_string());
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn delayed_items_become_ready() {
        let q = queue();
        q.enqueue_after("a".to_string(), Duration::from_millis(20));
        assert!(q.is_empty());
        assert_eq!(q.delayed_len(), 1);

        let started = Instant::now();
        let key = tokio::time::timeout(Duration::from_secs(2), q.get())
            .await
            .expect("delayed item never became ready");
        assert_eq!(key.as_deref(), Some("a"));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn earlier_deadline_wins() {
        let q = queue();
        q.enqueue_after("a".to_string(), Duration::from_secs(60));
        q.enqueue_after("a".to_string(), Duration::from_millis(10));
        q.enqueue_after("a".to_string(), Duration::from_secs(30));
        assert_eq!(q.delayed_len(), 1);

        let key = tokio::time::timeout(Duration::from_secs(2), q.get())
            .await
            .expect("earliest deadline was not honoured");
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn get_wakes_on_enqueue() {
        let q = std::sync::Arc::new(queue());
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue("a".to_string());

        let key = tokio::time::timeout(Duration::from_secs(2), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_drains_ready_items_then_returns_none() {
        let q = queue();
        q.enqueue("a".to_string());
        q.enqueue_after("b".to_string(), Duration::from_secs(60));
        q.shut_down();
        q.enqueue("c".to_string());

        assert!(q.is_shutting_down());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = std::sync::Arc::new(queue());
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();

        let key = tokio::time::timeout(Duration::from_secs(2), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, None);
    }
}
