//! Registry of live sessions with aggregate metrics and bulk lifecycle.
//!
//! The map is guarded by a mutex held only for the map operation itself;
//! no user callback ever runs under it. Entry removal on session close is
//! driven by a small watcher task per session awaiting the session's close
//! signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::session::Session;

/// Sums of per-session counters plus session counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateMetrics {
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_errors: u64,
    /// Entries currently in the registry.
    pub active_sessions: usize,
    /// Registered sessions still open.
    pub open_sessions: usize,
    /// Registered sessions already closed.
    pub closed_sessions: usize,
}

struct Inner {
    sessions: Mutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
}

/// Thread-safe session registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a session under a fresh id.
    ///
    /// The entry removes itself when the session closes. Must be called
    /// within a tokio runtime.
    pub fn add(&self, session: Session) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, session.clone());

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.sessions.lock().expect("session registry lock").remove(&id);
            }
        });

        id
    }

    /// Remove and return an entry.
    pub fn remove(&self, id: u64) -> Option<Session> {
        self.lock().remove(&id)
    }

    /// Look up a session by id.
    pub fn get(&self, id: u64) -> Option<Session> {
        self.lock().get(&id).cloned()
    }

    /// Ids of every registered session.
    pub fn all_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Apply `f` to a snapshot of the registry, outside the lock.
    pub fn for_each(&self, mut f: impl FnMut(u64, &Session)) {
        let snapshot: Vec<(u64, Session)> = self
            .lock()
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();
        for (id, session) in &snapshot {
            f(*id, session);
        }
    }

    /// Gracefully unbind every registered session.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            session.unbind();
        }
    }

    /// Force-close every registered session.
    pub fn close_all_immediate(&self) {
        for session in self.snapshot() {
            session.close("manager shutdown");
        }
    }

    /// Sum every session's counters into an aggregate.
    pub fn get_metrics(&self) -> AggregateMetrics {
        let snapshot = self.snapshot();

        let mut agg = AggregateMetrics {
            active_sessions: snapshot.len(),
            ..AggregateMetrics::default()
        };

        for session in &snapshot {
            let m = session.metrics().snapshot();
            agg.total_bytes_sent += m.bytes_sent;
            agg.total_bytes_received += m.bytes_received;
            agg.total_messages_sent += m.messages_sent;
            agg.total_messages_received += m.messages_received;
            agg.total_errors += m.errors;

            if session.is_open() {
                agg.open_sessions += 1;
            }
            if m.is_closed {
                agg.closed_sessions += 1;
            }
        }

        agg
    }

    /// Evict entries whose session is already closed. Returns how many
    /// were removed.
    pub fn cleanup_closed(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.metrics().is_closed.load(Ordering::Relaxed));
        before - sessions.len()
    }

    fn snapshot(&self) -> Vec<Session> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Session>> {
        self.inner.sessions.lock().expect("session registry lock")
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
