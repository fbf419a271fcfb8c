//! Expiration tracking for outstanding requests.
//!
//! [`ExpirationIndex`] is the core data structure: a hash map from key to
//! entry backed by a time-ordered queue, giving O(log n) add/remove and
//! O(1) earliest-deadline peek. It owns no timer; the session engine
//! embeds one and folds its deadline into the engine's own select loop,
//! so per-session use needs no synchronization.
//!
//! [`Expirator`] wraps the same index behind a mutex and drives it with a
//! timer task, firing a callback for each expired entry. Use it when
//! producers on several threads share one tracker.
//!
//! Both use the monotonic clock. Callbacks fire at or after the stored
//! expiry, exactly once per entry, in non-decreasing expiry order within
//! a wake-up.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

struct Entry<I> {
    expiry: Instant,
    tiebreak: u64,
    info: I,
}

/// Time-ordered index of keyed entries with opaque payloads.
pub struct ExpirationIndex<K, I> {
    entries: HashMap<K, Entry<I>>,
    queue: BTreeMap<(Instant, u64), K>,
    next_tiebreak: u64,
}

impl<K, I> ExpirationIndex<K, I>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            queue: BTreeMap::new(),
            next_tiebreak: 0,
        }
    }

    /// Insert a new entry expiring `after` from now.
    ///
    /// Rejects duplicate keys; returns true iff inserted.
    pub fn add(&mut self, key: K, after: Duration, info: I) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }

        let expiry = Instant::now() + after;
        let tiebreak = self.next_tiebreak;
        self.next_tiebreak += 1;

        self.queue.insert((expiry, tiebreak), key.clone());
        self.entries.insert(
            key,
            Entry {
                expiry,
                tiebreak,
                info,
            },
        );
        true
    }

    /// Remove an entry without firing anything. Returns true iff present.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.queue.remove(&(entry.expiry, entry.tiebreak));
                true
            }
            None => false,
        }
    }

    /// Reset an entry's expiry to `now + after`. Returns true iff present.
    pub fn update_expiry(&mut self, key: &K, after: Duration) -> bool {
        self.reschedule(key, |_| Instant::now() + after)
    }

    /// Extend an entry's expiry by `extension` past its current expiry.
    /// Returns true iff present.
    pub fn refresh(&mut self, key: &K, extension: Duration) -> bool {
        self.reschedule(key, |current| current + extension)
    }

    fn reschedule(&mut self, key: &K, new_expiry: impl FnOnce(Instant) -> Instant) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };

        self.queue.remove(&(entry.expiry, entry.tiebreak));

        entry.expiry = new_expiry(entry.expiry);
        entry.tiebreak = self.next_tiebreak;
        self.next_tiebreak += 1;

        self.queue.insert((entry.expiry, entry.tiebreak), key.clone());
        true
    }

    /// Borrow the payload of a live entry.
    pub fn get_info(&self, key: &K) -> Option<&I> {
        self.entries.get(key).map(|e| &e.info)
    }

    /// Time left until an entry expires; zero once due.
    pub fn get_remaining_time(&self, key: &K) -> Option<Duration> {
        self.entries.get(key).map(|e| {
            let now = Instant::now();
            if e.expiry > now {
                e.expiry - now
            } else {
                Duration::ZERO
            }
        })
    }

    /// Whether an entry is live for this key.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest expiry among live entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(expiry, _)| *expiry)
    }

    /// Remove and return every entry due at `now`, in non-decreasing
    /// expiry order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(K, I)> {
        let mut fired = Vec::new();

        while let Some((&(expiry, tiebreak), _)) = self.queue.iter().next() {
            if expiry > now {
                break;
            }
            let key = self
                .queue
                .remove(&(expiry, tiebreak))
                .expect("queue entry vanished");
            if let Some(entry) = self.entries.remove(&key) {
                fired.push((key, entry.info));
            }
        }

        fired
    }

    /// Remove and return every live entry in expiry order.
    pub fn drain(&mut self) -> Vec<(K, I)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        let queue = std::mem::take(&mut self.queue);
        for (_, key) in queue {
            if let Some(entry) = self.entries.remove(&key) {
                drained.push((key, entry.info));
            }
        }
        self.entries.clear();
        drained
    }

    /// Drop all entries without firing callbacks.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queue.clear();
    }
}

impl<K, I> Default for ExpirationIndex<K, I>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

type SharedIndex<K, I> = Arc<Mutex<ExpirationIndex<K, I>>>;
type SharedCallback<K, I> = Arc<Mutex<Box<dyn FnMut(K, I) + Send>>>;

/// Thread-safe, timer-driven expiration tracker.
///
/// Producers on any thread add and remove entries; a background task
/// sleeps until the earliest deadline and fires the expiry callback for
/// each due entry. Dropping the expirator stops the task.
pub struct Expirator<K, I> {
    index: SharedIndex<K, I>,
    callback: SharedCallback<K, I>,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl<K, I> Expirator<K, I>
where
    K: Eq + Hash + Clone + Send + 'static,
    I: Send + 'static,
{
    /// Spawn the timer task. Must be called within a tokio runtime.
    pub fn spawn(callback: impl FnMut(K, I) + Send + 'static) -> Self {
        let index: SharedIndex<K, I> = Arc::new(Mutex::new(ExpirationIndex::new()));
        let callback: SharedCallback<K, I> = Arc::new(Mutex::new(Box::new(callback)));
        let notify = Arc::new(Notify::new());

        let task = tokio::spawn(Self::timer_loop(
            index.clone(),
            callback.clone(),
            notify.clone(),
        ));

        Self {
            index,
            callback,
            notify,
            task,
        }
    }

    async fn timer_loop(
        index: SharedIndex<K, I>,
        callback: SharedCallback<K, I>,
        notify: Arc<Notify>,
    ) {
        loop {
            let deadline = index.lock().expect("expirator lock").next_deadline();

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            let expired = index
                                .lock()
                                .expect("expirator lock")
                                .pop_expired(Instant::now());
                            if !expired.is_empty() {
                                let mut cb = callback.lock().expect("expirator callback lock");
                                for (key, info) in expired {
                                    cb(key, info);
                                }
                            }
                        }
                        _ = notify.notified() => {}
                    }
                }
                None => notify.notified().await,
            }
        }
    }

    /// Insert a new entry; see [`ExpirationIndex::add`].
    pub fn add(&self, key: K, after: Duration, info: I) -> bool {
        let inserted = self.index.lock().expect("expirator lock").add(key, after, info);
        if inserted {
            self.notify.notify_one();
        }
        inserted
    }

    /// Remove an entry; its callback will not fire.
    pub fn remove(&self, key: &K) -> bool {
        self.index.lock().expect("expirator lock").remove(key)
    }

    /// Reset an entry's expiry to `now + after`.
    pub fn update_expiry(&self, key: &K, after: Duration) -> bool {
        let updated = self
            .index
            .lock()
            .expect("expirator lock")
            .update_expiry(key, after);
        if updated {
            self.notify.notify_one();
        }
        updated
    }

    /// Extend an entry's expiry past its current expiry.
    pub fn refresh(&self, key: &K, extension: Duration) -> bool {
        let refreshed = self
            .index
            .lock()
            .expect("expirator lock")
            .refresh(key, extension);
        if refreshed {
            self.notify.notify_one();
        }
        refreshed
    }

    /// Clone out the payload of a live entry.
    pub fn get_info(&self, key: &K) -> Option<I>
    where
        I: Clone,
    {
        self.index
            .lock()
            .expect("expirator lock")
            .get_info(key)
            .cloned()
    }

    /// Time left until an entry expires.
    pub fn get_remaining_time(&self, key: &K) -> Option<Duration> {
        self.index
            .lock()
            .expect("expirator lock")
            .get_remaining_time(key)
    }

    /// Whether an entry is live for this key.
    pub fn contains(&self, key: &K) -> bool {
        self.index.lock().expect("expirator lock").contains(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.lock().expect("expirator lock").len()
    }

    /// Whether no entries are live.
    pub fn is_empty(&self) -> bool {
        self.index.lock().expect("expirator lock").is_empty()
    }

    /// Fire the callback for every live entry, then clear.
    pub fn expire_all(&self) {
        let drained = self.index.lock().expect("expirator lock").drain();
        if !drained.is_empty() {
            let mut cb = self.callback.lock().expect("expirator callback lock");
            for (key, info) in drained {
                cb(key, info);
            }
        }
        self.notify.notify_one();
    }

    /// Drop all entries without firing callbacks.
    pub fn clear(&self) {
        self.index.lock().expect("expirator lock").clear();
        self.notify.notify_one();
    }

    /// Stop the timer task. Entries already due but not fired are lost.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl<K, I> Drop for Expirator<K, I> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_add_rejects_duplicates() {
        let mut index = ExpirationIndex::new();
        assert!(index.add(1u32, 10 * MS, "a"));
        assert!(!index.add(1u32, 10 * MS, "b"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get_info(&1), Some(&"a"));
    }

    #[test]
    fn test_remove() {
        let mut index = ExpirationIndex::new();
        index.add(1u32, 10 * MS, ());
        assert!(index.remove(&1));
        assert!(!index.remove(&1));
        assert!(index.is_empty());
        assert_eq!(index.next_deadline(), None);
    }

    #[test]
    fn test_contains_and_queries() {
        let mut index = ExpirationIndex::new();
        index.add(7u32, Duration::from_secs(60), "payload");

        assert!(index.contains(&7));
        assert!(!index.contains(&8));
        let remaining = index.get_remaining_time(&7).unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
        assert_eq!(index.get_remaining_time(&8), None);
    }

    #[test]
    fn test_pop_expired_fires_in_expiry_order() {
        let mut index = ExpirationIndex::new();
        index.add(3u32, 30 * MS, "c");
        index.add(1u32, 10 * MS, "a");
        index.add(2u32, 20 * MS, "b");

        let fired = index.pop_expired(Instant::now() + 25 * MS);
        assert_eq!(fired, vec![(1, "a"), (2, "b")]);
        assert!(index.contains(&3));

        let fired = index.pop_expired(Instant::now() + 35 * MS);
        assert_eq!(fired, vec![(3, "c")]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_pop_expired_before_deadline_is_empty() {
        let mut index = ExpirationIndex::new();
        index.add(1u32, Duration::from_secs(60), ());
        assert!(index.pop_expired(Instant::now()).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_update_expiry_reschedules() {
        let mut index = ExpirationIndex::new();
        index.add(1u32, 10 * MS, ());
        assert!(index.update_expiry(&1, Duration::from_secs(60)));
        assert!(index.pop_expired(Instant::now() + 20 * MS).is_empty());
        assert!(!index.update_expiry(&2, MS));
    }

    #[test]
    fn test_refresh_extends_from_current_expiry() {
        let mut index = ExpirationIndex::new();
        index.add(1u32, 10 * MS, ());
        let before = index.get_remaining_time(&1).unwrap();
        assert!(index.refresh(&1, 40 * MS));
        let after = index.get_remaining_time(&1).unwrap();
        assert!(after >= before + 35 * MS);
        assert!(!index.refresh(&2, MS));
    }

    #[test]
    fn test_equal_expiries_keep_distinct_entries() {
        let mut index = ExpirationIndex::new();
        index.add(1u32, 10 * MS, "a");
        index.add(2u32, 10 * MS, "b");
        assert_eq!(index.len(), 2);

        let fired = index.pop_expired(Instant::now() + 20 * MS);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_drain_returns_everything_in_order() {
        let mut index = ExpirationIndex::new();
        index.add(2u32, 20 * MS, "b");
        index.add(1u32, 10 * MS, "a");

        let drained = index.drain();
        assert_eq!(drained, vec![(1, "a"), (2, "b")]);
        assert!(index.is_empty());
        assert_eq!(index.next_deadline(), None);
    }

    #[test]
    fn test_clear_drops_silently() {
        let mut index = ExpirationIndex::new();
        index.add(1u32, 10 * MS, ());
        index.clear();
        assert!(index.is_empty());
        assert!(index.pop_expired(Instant::now() + 20 * MS).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expirator_fires_once_per_entry() {
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired_clone = fired.clone();

        let expirator = Expirator::spawn(move |key: u32, info: &'static str| {
            fired_clone.lock().unwrap().push((key, info));
        });

        expirator.add(1, 50 * MS, "a");
        expirator.add(2, 100 * MS, "b");

        tokio::time::sleep(200 * MS).await;

        let fired = fired.lock().unwrap().clone();
        assert_eq!(fired, vec![(1, "a"), (2, "b")]);
        assert!(expirator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expirator_remove_suppresses_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let expirator = Expirator::spawn(move |_key: u32, _info: ()| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        expirator.add(1, 50 * MS, ());
        assert!(expirator.remove(&1));

        tokio::time::sleep(200 * MS).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expirator_earlier_insert_reschedules_timer() {
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired_clone = fired.clone();

        let expirator = Expirator::spawn(move |key: u32, _info: ()| {
            fired_clone.lock().unwrap().push(key);
        });

        expirator.add(1, Duration::from_secs(60), ());
        expirator.add(2, 10 * MS, ());

        tokio::time::sleep(50 * MS).await;
        assert_eq!(fired.lock().unwrap().clone(), vec![2]);
        assert!(expirator.contains(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expirator_expire_all() {
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired_clone = fired.clone();

        let expirator = Expirator::spawn(move |key: u32, _info: ()| {
            fired_clone.lock().unwrap().push(key);
        });

        expirator.add(1, Duration::from_secs(60), ());
        expirator.add(2, Duration::from_secs(120), ());

        expirator.expire_all();

        assert_eq!(fired.lock().unwrap().clone(), vec![1, 2]);
        assert!(expirator.is_empty());

        // Nothing further fires later.
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(fired.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expirator_get_info_and_remaining() {
        let expirator = Expirator::spawn(|_key: u32, _info: String| {});

        expirator.add(9, Duration::from_secs(30), "ctx".to_string());
        assert_eq!(expirator.get_info(&9), Some("ctx".to_string()));
        let remaining = expirator.get_remaining_time(&9).unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert_eq!(expirator.len(), 1);
    }
}
