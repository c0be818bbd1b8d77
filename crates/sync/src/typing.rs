/// Typing indicator broadcasting: throttled start events per chat pair,
/// with an activity timeout that emits the stop event
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::{TypingEnvelope, UserId};

/// Minimum spacing between emitted start events for one pair.
pub const THROTTLE_INTERVAL_MS: u64 = 1000;

/// Silence after the last typing signal before a stop event goes out.
pub const TYPING_TIMEOUT_MS: u64 = 3000;

#[derive(Default)]
struct TypingState {
    /// Whether a start event has actually been emitted for this pair.
    is_typing: bool,
    last_emit: Option<Instant>,
    deferred: Option<JoinHandle<()>>,
    stop_timer: Option<JoinHandle<()>>,
}

/// Tracks one state machine per `(user, friend)` pair. Start events are
/// emitted immediately when the throttle window has elapsed, otherwise one
/// deferred emission is scheduled for the end of the window; repeated
/// signals inside the window never stack further deferrals. Every signal
/// re-arms the stop timer.
pub struct TypingBroadcaster {
    throttle: Duration,
    timeout: Duration,
    states: Mutex<HashMap<(UserId, UserId), TypingState>>,
    emit: Box<dyn Fn(TypingEnvelope) + Send + Sync>,
}

impl TypingBroadcaster {
    pub fn new(emit: impl Fn(TypingEnvelope) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            throttle: Duration::from_millis(THROTTLE_INTERVAL_MS),
            timeout: Duration::from_millis(TYPING_TIMEOUT_MS),
            states: Mutex::new(HashMap::new()),
            emit: Box::new(emit),
        })
    }

    /// The user is typing to this friend right now.
    pub fn signal_typing(self: &Arc<Self>, user_id: UserId, friend_id: UserId) {
        let emit_now = {
            let mut states = self.states.lock();
            let state = states.entry((user_id, friend_id)).or_default();

            if let Some(old) = state.stop_timer.take() {
                old.abort();
            }
            let this = Arc::clone(self);
            state.stop_timer = Some(tokio::spawn(async move {
                sleep(this.timeout).await;
                this.timeout_fired(user_id, friend_id);
            }));

            let now = Instant::now();
            match state.last_emit.map(|at| now.duration_since(at)) {
                Some(elapsed) if elapsed < self.throttle => {
                    if state.deferred.as_ref().map_or(true, |d| d.is_finished()) {
                        let remaining = self.throttle - elapsed;
                        let this = Arc::clone(self);
                        state.deferred = Some(tokio::spawn(async move {
                            sleep(remaining).await;
                            this.deferred_fired(user_id, friend_id);
                        }));
                    }
                    false
                }
                _ => {
                    state.is_typing = true;
                    state.last_emit = Some(now);
                    true
                }
            }
        };
        if emit_now {
            self.send(user_id, friend_id, true);
        }
    }

    /// The user explicitly stopped (blur, send). Cancels any deferred start
    /// and emits a stop only if a start actually went out.
    pub fn signal_stopped(&self, user_id: UserId, friend_id: UserId) {
        let emit_stop = {
            let mut states = self.states.lock();
            match states.remove(&(user_id, friend_id)) {
                Some(state) => {
                    if let Some(deferred) = state.deferred {
                        deferred.abort();
                    }
                    if let Some(stop_timer) = state.stop_timer {
                        stop_timer.abort();
                    }
                    state.is_typing
                }
                None => false,
            }
        };
        if emit_stop {
            self.send(user_id, friend_id, false);
        }
    }

    fn deferred_fired(&self, user_id: UserId, friend_id: UserId) {
        let emit = {
            let mut states = self.states.lock();
            match states.get_mut(&(user_id, friend_id)) {
                Some(state) => {
                    state.is_typing = true;
                    state.last_emit = Some(Instant::now());
                    state.deferred = None;
                    true
                }
                None => false,
            }
        };
        if emit {
            self.send(user_id, friend_id, true);
        }
    }

    fn timeout_fired(&self, user_id: UserId, friend_id: UserId) {
        let emit = {
            let mut states = self.states.lock();
            match states.remove(&(user_id, friend_id)) {
                Some(state) => {
                    if let Some(deferred) = state.deferred {
                        deferred.abort();
                    }
                    true
                }
                None => false,
            }
        };
        if emit {
            self.send(user_id, friend_id, false);
        }
    }

    fn send(&self, user_id: UserId, friend_id: UserId, is_typing: bool) {
        (self.emit)(TypingEnvelope {
            user_id,
            friend_id,
            is_typing,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster() -> (Arc<TypingBroadcaster>, Arc<Mutex<Vec<(bool, u128)>>>) {
        let events: Arc<Mutex<Vec<(bool, u128)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let started = Instant::now();
        let broadcaster = TypingBroadcaster::new(move |envelope| {
            sink.lock()
                .push((envelope.is_typing, started.elapsed().as_millis()));
        });
        (broadcaster, events)
    }

    #[tokio::test(start_paused = true)]
    async fn second_signal_inside_window_defers_once() {
        let (broadcaster, events) = broadcaster();
        let (user, friend) = (UserId::new(), UserId::new());

        broadcaster.signal_typing(user, friend);
        sleep(Duration::from_millis(300)).await;
        broadcaster.signal_typing(user, friend);
        broadcaster.signal_typing(user, friend);

        assert_eq!(events.lock().as_slice(), &[(true, 0)]);

        sleep(Duration::from_millis(800)).await;
        assert_eq!(
            events.lock().as_slice(),
            &[(true, 0), (true, THROTTLE_INTERVAL_MS as u128)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_emits_stop_and_clears_state() {
        let (broadcaster, events) = broadcaster();
        let (user, friend) = (UserId::new(), UserId::new());

        broadcaster.signal_typing(user, friend);
        sleep(Duration::from_millis(TYPING_TIMEOUT_MS + 10)).await;
        assert_eq!(
            events.lock().as_slice(),
            &[(true, 0), (false, TYPING_TIMEOUT_MS as u128)]
        );

        // State was deleted, so the next signal emits immediately again.
        broadcaster.signal_typing(user, friend);
        assert_eq!(events.lock().len(), 3);
        broadcaster.signal_stopped(user, friend);
    }

    #[tokio::test(start_paused = true)]
    async fn every_signal_refreshes_stop_timer() {
        let (broadcaster, events) = broadcaster();
        let (user, friend) = (UserId::new(), UserId::new());

        broadcaster.signal_typing(user, friend);
        sleep(Duration::from_millis(2500)).await;
        broadcaster.signal_typing(user, friend);
        sleep(Duration::from_millis(TYPING_TIMEOUT_MS - 100)).await;
        assert_eq!(events.lock().len(), 2);

        sleep(Duration::from_millis(200)).await;
        let recorded = events.lock().clone();
        assert_eq!(recorded.len(), 3);
        assert!(!recorded[2].0);
        assert_eq!(recorded[2].1, 2500 + TYPING_TIMEOUT_MS as u128);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_deferred_emission() {
        let (broadcaster, events) = broadcaster();
        let (user, friend) = (UserId::new(), UserId::new());

        broadcaster.signal_typing(user, friend);
        sleep(Duration::from_millis(100)).await;
        broadcaster.signal_typing(user, friend);
        sleep(Duration::from_millis(100)).await;
        broadcaster.signal_stopped(user, friend);

        sleep(Duration::from_millis(2 * THROTTLE_INTERVAL_MS)).await;
        let recorded = events.lock().clone();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].0);
        assert!(!recorded[1].0);
    }

    #[tokio::test(start_paused = true)]
    async fn pairs_are_independent() {
        let (broadcaster, events) = broadcaster();
        let user = UserId::new();
        let (friend_a, friend_b) = (UserId::new(), UserId::new());

        broadcaster.signal_typing(user, friend_a);
        broadcaster.signal_typing(user, friend_b);
        assert_eq!(events.lock().len(), 2);

        broadcaster.signal_stopped(user, friend_a);
        broadcaster.signal_stopped(user, friend_b);
        assert_eq!(events.lock().len(), 4);
    }
}
