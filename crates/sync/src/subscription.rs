/// Resilient per-channel subscriptions over one shared pub/sub connection:
/// bounded ready-waits, reconnection with backoff, idempotent cleanup, and
/// a registry caching one live instance per (subscriber, channel)
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::{ConnectionEvent, ConnectionStatus, PubSubConnection, Result, SyncError, UserId};

/// Bound on waiting for the shared connection to report ready.
pub const CONNECTION_READY_TIMEOUT_MS: u64 = 5000;

/// Delay before the first reconnect attempt; doubles per attempt.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Reconnect attempts before a subscription is parked as failed.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Subscribing,
    Subscribed,
    Reconnecting,
    Failed,
    Cleaning,
    Cleaned,
}

/// Completion of an in-flight cleanup; clones all await the same teardown.
pub type CleanupFuture = Shared<BoxFuture<'static, ()>>;

type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// One resilient channel subscription. Exactly one message handler may be
/// registered; raw payloads on this instance's channel are decoded and
/// passed to it. Lives in a `SubscriptionRegistry` keyed by
/// (subscriber, channel).
pub struct Subscription {
    subscriber: UserId,
    channel: String,
    connection: Arc<dyn PubSubConnection>,
    state: Mutex<SubscriptionState>,
    handler: Mutex<Option<MessageHandler>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    cleanup_future: Mutex<Option<CleanupFuture>>,
}

impl Subscription {
    pub fn new(
        subscriber: UserId,
        channel: impl Into<String>,
        connection: Arc<dyn PubSubConnection>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            subscriber,
            channel: channel.into(),
            connection,
            state: Mutex::new(SubscriptionState::Created),
            handler: Mutex::new(None),
            pump: Mutex::new(None),
            shutdown,
            cleanup_future: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscriber(&self) -> UserId {
        self.subscriber
    }

    /// Registers the message handler, decoding payloads into `T`. Payloads
    /// that fail to decode are logged and dropped, never delivered. Setting
    /// a new handler replaces the previous one.
    pub fn set_handler<T, F>(&self, handler: F)
    where
        T: serde::de::DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let channel = self.channel.clone();
        let wrapped = move |payload: &str| match serde_json::from_str::<T>(payload) {
            Ok(message) => handler(message),
            Err(e) => warn!("dropping undecodable message on {}: {}", channel, e),
        };
        *self.handler.lock() = Some(Arc::new(wrapped));
    }

    /// Waits for the shared connection to report ready (bounded), issues
    /// the channel subscribe, and starts the pump task delivering this
    /// channel's messages. Repeated calls while live are no-ops.
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SubscriptionState::Created => *state = SubscriptionState::Subscribing,
                SubscriptionState::Subscribing
                | SubscriptionState::Subscribed
                | SubscriptionState::Reconnecting => return Ok(()),
                other => {
                    return Err(SyncError::SubscriptionError(format!(
                        "cannot subscribe a {:?} subscription",
                        other
                    )))
                }
            }
        }

        // Grab the event stream before subscribing so no message slips
        // between the subscribe call and the pump starting.
        let events = self.connection.events();

        if let Err(e) = self.establish().await {
            *self.state.lock() = SubscriptionState::Failed;
            error!(
                "subscribe failed for {}:{}: {}",
                self.subscriber, self.channel, e
            );
            return Err(e);
        }

        *self.state.lock() = SubscriptionState::Subscribed;
        info!("subscribed {} to {}", self.subscriber, self.channel);
        self.spawn_pump(events);
        Ok(())
    }

    async fn establish(&self) -> Result<()> {
        wait_for_connection(
            self.connection.as_ref(),
            Duration::from_millis(CONNECTION_READY_TIMEOUT_MS),
        )
        .await?;
        self.connection.subscribe(&self.channel).await
    }

    fn spawn_pump(self: &Arc<Self>, events: broadcast::Receiver<ConnectionEvent>) {
        let this = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            this.pump(events, shutdown).await;
        });
        if let Some(old) = self.pump.lock().replace(handle) {
            old.abort();
        }
    }

    async fn pump(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Message { channel, payload }) if channel == self.channel => {
                        let handler = self.handler.lock().clone();
                        if let Some(handler) = handler {
                            handler(&payload);
                        }
                    }
                    Ok(ConnectionEvent::Error(reason)) => {
                        if !self.reconnect_with_backoff(&reason).await {
                            break;
                        }
                    }
                    Ok(ConnectionEvent::Closed) => {
                        if !self.reconnect_with_backoff("connection closed").await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "subscription {}:{} lagged, {} events dropped",
                            self.subscriber, self.channel, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if !self.reconnect_with_backoff("event stream ended").await {
                            break;
                        }
                    }
                }
            }
        }
        debug!("pump exited for {}:{}", self.subscriber, self.channel);
    }

    /// Bounded exponential backoff after the connection dropped. Returns
    /// true once resubscribed; false when the attempts are exhausted (the
    /// instance is parked as failed and only a fresh registry instance can
    /// subscribe again) or when a cleanup raced this recovery.
    async fn reconnect_with_backoff(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                SubscriptionState::Subscribed | SubscriptionState::Subscribing => {
                    *state = SubscriptionState::Reconnecting
                }
                _ => return false,
            }
        }
        warn!(
            "connection lost on {}:{} ({}), reconnecting",
            self.subscriber, self.channel, reason
        );

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = Duration::from_millis(RECONNECT_BASE_DELAY_MS * 2u64.pow(attempt - 1));
            sleep(delay).await;

            if self.state() != SubscriptionState::Reconnecting {
                return false;
            }

            match self.establish().await {
                Ok(()) => {
                    *self.state.lock() = SubscriptionState::Subscribed;
                    info!(
                        "resubscribed {}:{} on attempt {}",
                        self.subscriber, self.channel, attempt
                    );
                    return true;
                }
                Err(e) => warn!(
                    "reconnect attempt {}/{} for {}:{} failed: {}",
                    attempt, MAX_RECONNECT_ATTEMPTS, self.subscriber, self.channel, e
                ),
            }
        }

        *self.state.lock() = SubscriptionState::Failed;
        error!(
            "giving up on {}:{} after {} attempts, subscription permanently failed",
            self.subscriber, self.channel, MAX_RECONNECT_ATTEMPTS
        );
        false
    }

    /// Idempotent teardown: concurrent and repeated calls all receive the
    /// same in-flight completion. The teardown runs exactly once, eagerly.
    pub fn cleanup(self: &Arc<Self>) -> CleanupFuture {
        let mut slot = self.cleanup_future.lock();
        if let Some(existing) = &*slot {
            return existing.clone();
        }
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.do_cleanup().await });
        let fut = async move {
            let _ = task.await;
        }
        .boxed()
        .shared();
        *slot = Some(fut.clone());
        fut
    }

    /// Unsubscribes while the connection is still active, then quits it;
    /// a failed graceful path falls back to a forced disconnect. Ends in
    /// Cleaned either way.
    async fn do_cleanup(&self) {
        let was_active = {
            let mut state = self.state.lock();
            let was = matches!(
                *state,
                SubscriptionState::Subscribing
                    | SubscriptionState::Subscribed
                    | SubscriptionState::Reconnecting
            );
            *state = SubscriptionState::Cleaning;
            was
        };

        let _ = self.shutdown.send(true);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        *self.handler.lock() = None;

        if was_active && self.connection.status() == ConnectionStatus::Ready {
            if let Err(e) = self.connection.unsubscribe(&self.channel).await {
                warn!(
                    "graceful unsubscribe failed for {}:{}: {}",
                    self.subscriber, self.channel, e
                );
                self.connection.force_disconnect();
                *self.state.lock() = SubscriptionState::Cleaned;
                return;
            }
        }

        if let Err(e) = self.connection.quit().await {
            warn!(
                "graceful quit failed for {}:{}: {}",
                self.subscriber, self.channel, e
            );
            self.connection.force_disconnect();
        }

        *self.state.lock() = SubscriptionState::Cleaned;
        info!("cleaned up subscription {}:{}", self.subscriber, self.channel);
    }
}

/// Resolves once the connection reports ready, bounded by `limit`. Starts
/// a connect when the transport is idle or closed.
pub async fn wait_for_connection(
    connection: &dyn PubSubConnection,
    limit: Duration,
) -> Result<()> {
    let mut events = connection.events();

    if connection.status() == ConnectionStatus::Ready {
        return Ok(());
    }
    if matches!(
        connection.status(),
        ConnectionStatus::Disconnected | ConnectionStatus::Closed
    ) {
        connection.connect().await?;
        if connection.status() == ConnectionStatus::Ready {
            return Ok(());
        }
    }

    let limit_ms = limit.as_millis() as u64;
    timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Ready) => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if connection.status() == ConnectionStatus::Ready {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SyncError::ConnectionError("event stream closed".into()))
                }
            }
        }
    })
    .await
    .map_err(|_| SyncError::ConnectionTimeout(limit_ms))?
}

/// Cache of live subscriptions, one per (subscriber, channel). Constructed
/// with its connection at process start and torn down with `cleanup_all`
/// at shutdown; nothing here is global.
pub struct SubscriptionRegistry {
    connection: Arc<dyn PubSubConnection>,
    instances: Mutex<HashMap<(UserId, String), Arc<Subscription>>>,
    cleaning_all: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(connection: Arc<dyn PubSubConnection>) -> Self {
        Self {
            connection,
            instances: Mutex::new(HashMap::new()),
            cleaning_all: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<dyn PubSubConnection> {
        &self.connection
    }

    /// Returns the cached instance for this key while it is live. A cleaned
    /// or permanently failed instance is replaced with a fresh one.
    pub fn get_instance(&self, subscriber: UserId, channel: &str) -> Arc<Subscription> {
        let mut instances = self.instances.lock();
        let key = (subscriber, channel.to_string());
        match instances.get(&key) {
            Some(existing)
                if !matches!(
                    existing.state(),
                    SubscriptionState::Cleaned | SubscriptionState::Failed
                ) =>
            {
                Arc::clone(existing)
            }
            _ => {
                debug!("creating subscription {}:{}", subscriber, channel);
                let fresh = Subscription::new(subscriber, channel, Arc::clone(&self.connection));
                instances.insert(key, Arc::clone(&fresh));
                fresh
            }
        }
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Tears down every instance one subscriber holds.
    pub async fn cleanup_user(&self, subscriber: UserId) {
        let targets: Vec<Arc<Subscription>> = {
            let mut instances = self.instances.lock();
            let keys: Vec<_> = instances
                .keys()
                .filter(|(user, _)| *user == subscriber)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| instances.remove(&key))
                .collect()
        };
        futures::future::join_all(targets.iter().map(|s| s.cleanup())).await;
        info!(
            "cleaned up {} subscription(s) for {}",
            targets.len(),
            subscriber
        );
    }

    /// Tears down every instance. Concurrent calls coalesce: while one run
    /// is in progress, further calls return immediately.
    pub async fn cleanup_all(&self) {
        if self.cleaning_all.swap(true, Ordering::SeqCst) {
            return;
        }
        let targets: Vec<Arc<Subscription>> = {
            let mut instances = self.instances.lock();
            instances.drain().map(|(_, sub)| sub).collect()
        };
        futures::future::join_all(targets.iter().map(|s| s.cleanup())).await;
        self.cleaning_all.store(false, Ordering::SeqCst);
        info!("cleaned up all {} subscription(s)", targets.len());
    }
}
