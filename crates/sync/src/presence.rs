/// Ephemeral cursor presence: per-user positions with last-write-wins
/// merging, TTL expiry, and a throttled publisher on the producing side
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};

use crate::UserId;

/// Entries older than this are dropped by the sweep.
pub const PRESENCE_TTL_MS: i64 = 5000;

/// How often the background sweeper runs.
pub const PRESENCE_SWEEP_INTERVAL_MS: u64 = 5000;

/// At most one cursor publish per window.
pub const CURSOR_THROTTLE_MS: u64 = 50;

/// Minimum movement, in percentage points on either axis, before a sample
/// is worth publishing.
pub const CURSOR_MOVE_THRESHOLD: f64 = 1.0;

/// One user's cursor state. Coordinates are percentages of the editor
/// container (0 to 100). Doubles as the cursor wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub username: String,
    pub x: f64,
    pub y: f64,
    pub last_update: i64,
}

impl PresenceEntry {
    pub fn new(user_id: UserId, username: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            user_id,
            username: username.into(),
            x,
            y,
            last_update: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Tracks the cursors of everyone else in the document. Not self-locking;
/// share it behind a mutex (see `spawn_sweeper`).
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Merge an entry, last-write-wins by timestamp: accepted only if its
    /// `last_update` is strictly newer than the stored one. Returns whether
    /// the entry was taken.
    pub fn update(&mut self, entry: PresenceEntry) -> bool {
        match self.entries.get(&entry.user_id) {
            Some(existing) if entry.last_update <= existing.last_update => false,
            _ => {
                self.entries.insert(entry.user_id, entry);
                true
            }
        }
    }

    /// Merge a remote entry, ignoring our own echoes.
    pub fn apply_remote(&mut self, own_id: UserId, entry: PresenceEntry) -> bool {
        if entry.user_id == own_id {
            return false;
        }
        self.update(entry)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn cursors(&self) -> Vec<&PresenceEntry> {
        self.entries.values().collect()
    }

    pub fn remove(&mut self, user_id: &UserId) {
        self.entries.remove(user_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry not refreshed within the TTL, judged against the
    /// supplied clock value.
    pub fn sweep_at(&mut self, now_ms: i64) {
        self.entries
            .retain(|_, entry| now_ms - entry.last_update <= PRESENCE_TTL_MS);
    }

    pub fn sweep(&mut self) {
        self.sweep_at(chrono::Utc::now().timestamp_millis());
    }

    /// Periodic sweep task; abort the handle to stop it.
    pub fn spawn_sweeper(tracker: Arc<Mutex<PresenceTracker>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(PRESENCE_SWEEP_INTERVAL_MS));
            loop {
                ticker.tick().await;
                tracker.lock().sweep();
            }
        })
    }
}

/// Producing side of cursor presence: drops samples that barely moved and
/// publishes at most once per throttle window, always with the latest
/// sample seen inside the window.
pub struct CursorPublisher {
    throttle: Duration,
    last_published: Mutex<Option<(f64, f64)>>,
    latest: Mutex<Option<PresenceEntry>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    publish: Box<dyn Fn(PresenceEntry) + Send + Sync>,
}

impl CursorPublisher {
    pub fn new(publish: impl Fn(PresenceEntry) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            throttle: Duration::from_millis(CURSOR_THROTTLE_MS),
            last_published: Mutex::new(None),
            latest: Mutex::new(None),
            timer: Mutex::new(None),
            publish: Box::new(publish),
        })
    }

    /// Feed one pointer sample. Samples within the movement threshold of
    /// the last published position are ignored; otherwise the sample is
    /// held as the window's latest and a publish is scheduled if none is.
    pub fn record(self: &Arc<Self>, entry: PresenceEntry) {
        let qualifies = match *self.last_published.lock() {
            Some((x, y)) => {
                (entry.x - x).abs() > CURSOR_MOVE_THRESHOLD
                    || (entry.y - y).abs() > CURSOR_MOVE_THRESHOLD
            }
            None => true,
        };
        if !qualifies {
            return;
        }

        *self.latest.lock() = Some(entry);

        let mut timer = self.timer.lock();
        if timer.as_ref().map_or(true, |t| t.is_finished()) {
            let this = Arc::clone(self);
            *timer = Some(tokio::spawn(async move {
                sleep(this.throttle).await;
                this.fire();
            }));
        }
    }

    fn fire(&self) {
        let entry = self.latest.lock().take();
        if let Some(entry) = entry {
            *self.last_published.lock() = Some((entry.x, entry.y));
            (self.publish)(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user_id: UserId, x: f64, y: f64, last_update: i64) -> PresenceEntry {
        PresenceEntry {
            user_id,
            username: "alice".into(),
            x,
            y,
            last_update,
        }
    }

    #[test]
    fn update_accepts_only_strictly_newer() {
        let user = UserId::new();
        let mut tracker = PresenceTracker::new();
        assert!(tracker.update(entry(user, 10.0, 10.0, 100)));
        assert!(!tracker.update(entry(user, 20.0, 20.0, 100)));
        assert!(!tracker.update(entry(user, 20.0, 20.0, 50)));
        assert!(tracker.update(entry(user, 20.0, 20.0, 101)));
        assert_eq!(tracker.get(&user).unwrap().x, 20.0);
    }

    #[test]
    fn apply_remote_skips_own_entries() {
        let own = UserId::new();
        let other = UserId::new();
        let mut tracker = PresenceTracker::new();
        assert!(!tracker.apply_remote(own, entry(own, 1.0, 1.0, 10)));
        assert!(tracker.apply_remote(own, entry(other, 1.0, 1.0, 10)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn sweep_expiry_boundary() {
        let user = UserId::new();
        let mut tracker = PresenceTracker::new();
        tracker.update(entry(user, 0.0, 0.0, 0));

        tracker.sweep_at(PRESENCE_TTL_MS);
        assert!(tracker.get(&user).is_some());

        tracker.sweep_at(PRESENCE_TTL_MS + 1);
        assert!(tracker.get(&user).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_drops_stale_entries() {
        let user = UserId::new();
        let tracker = Arc::new(Mutex::new(PresenceTracker::new()));
        tracker.lock().update(entry(user, 0.0, 0.0, 0));

        let handle = PresenceTracker::spawn_sweeper(Arc::clone(&tracker));
        sleep(Duration::from_millis(10)).await;

        assert!(tracker.lock().is_empty());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_latest_sample_once_per_window() {
        let sent: Arc<Mutex<Vec<PresenceEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let publisher = CursorPublisher::new(move |e| sink.lock().push(e));
        let user = UserId::new();

        publisher.record(entry(user, 10.0, 10.0, 1));
        sleep(Duration::from_millis(10)).await;
        publisher.record(entry(user, 40.0, 40.0, 2));
        sleep(Duration::from_millis(CURSOR_THROTTLE_MS)).await;

        let published = sent.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].x, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn small_movement_is_not_published() {
        let sent: Arc<Mutex<Vec<PresenceEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let publisher = CursorPublisher::new(move |e| sink.lock().push(e));
        let user = UserId::new();

        publisher.record(entry(user, 10.0, 10.0, 1));
        sleep(Duration::from_millis(CURSOR_THROTTLE_MS + 5)).await;
        assert_eq!(sent.lock().len(), 1);

        publisher.record(entry(user, 10.5, 10.9, 2));
        sleep(Duration::from_millis(CURSOR_THROTTLE_MS + 5)).await;
        assert_eq!(sent.lock().len(), 1);

        publisher.record(entry(user, 12.0, 10.0, 3));
        sleep(Duration::from_millis(CURSOR_THROTTLE_MS + 5)).await;
        assert_eq!(sent.lock().len(), 2);
    }
}
