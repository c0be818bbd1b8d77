/// Unbounded FIFO handoff between push-style delivery callbacks and
/// pull-style async consumer loops
use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Hands the item straight to the oldest live waiter, or buffers it.
    pub fn enqueue(&self, item: T) {
        let mut inner = self.inner.lock();
        let mut item = item;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                // That consumer stopped waiting; pass to the next one.
                Err(returned) => item = returned,
            }
        }
        inner.items.push_back(item);
    }

    /// Returns the oldest buffered item immediately, otherwise suspends
    /// until the next `enqueue`. Resolves to `None` if the queue is cleared
    /// while waiting.
    pub async fn dequeue(&self) -> Option<T> {
        let receiver = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        receiver.await.ok()
    }

    /// Drops all buffered items and abandons every waiting consumer; their
    /// `dequeue()` calls resolve to `None`, which consumer loops treat as
    /// the signal to exit.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
