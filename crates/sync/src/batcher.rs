/// Operation batcher: absorbs keystroke-level edit bursts and applies them
/// in one atomic pass per debounce window
use std::sync::Arc;

use document::Document;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::error;

use crate::{apply_all, Operation};

/// Debounce window for accumulating operations before one atomic apply.
pub const BATCH_WINDOW_MS: u64 = 32;

type CompletionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Pending state for one flush cycle. Text operations are bucketed by path,
/// buckets kept in first-insertion order; node operations keep arrival order.
#[derive(Default)]
struct PendingOps {
    text_buckets: Vec<(String, Vec<Operation>)>,
    node_ops: Vec<Operation>,
}

impl PendingOps {
    fn is_empty(&self) -> bool {
        self.text_buckets.is_empty() && self.node_ops.is_empty()
    }
}

pub struct OperationBatcher {
    document: Arc<Mutex<Document>>,
    pending: Mutex<PendingOps>,
    timer: Mutex<Option<JoinHandle<()>>>,
    window: Duration,
    on_complete: CompletionCallback,
}

impl OperationBatcher {
    pub fn new(
        document: Arc<Mutex<Document>>,
        window: Duration,
        on_complete: impl Fn(bool) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            document,
            pending: Mutex::new(PendingOps::default()),
            timer: Mutex::new(None),
            window,
            on_complete: Box::new(on_complete),
        })
    }

    /// Queues operations for the next flush and re-arms the flush timer.
    /// The timer resets on every call (trailing-edge debounce).
    pub fn add_operations(self: &Arc<Self>, ops: Vec<Operation>) {
        {
            let mut pending = self.pending.lock();
            for op in ops {
                if op.is_text_op() {
                    let key = op.path().to_string();
                    match pending.text_buckets.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, bucket)) => bucket.push(op),
                        None => pending.text_buckets.push((key, vec![op])),
                    }
                } else {
                    pending.node_ops.push(op);
                }
            }
        }
        self.arm_timer();
    }

    fn arm_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(this.window).await;
            this.flush();
        });
        if let Some(old) = self.timer.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Applies everything pending in one pass: node operations first in
    /// arrival order, then each path bucket's merged text operations. The
    /// document is cloned, the script applied to the clone, and the result
    /// swapped in, so readers never observe a half-applied tree.
    ///
    /// Synchronous on purpose: there is no await inside, so once a flush has
    /// started nothing can interrupt it. Apply errors are caught and reported
    /// through the completion callback; this never panics or propagates.
    pub fn flush(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }

        let mut script = pending.node_ops;
        for (_, bucket) in pending.text_buckets {
            script.extend(merge_text_operations(bucket));
        }

        let failures = {
            let mut doc = self.document.lock();
            let mut next = doc.clone();
            let failures = apply_all(&mut next, &script);
            *doc = next;
            failures
        };

        if failures > 0 {
            error!("batch flush finished with {} failed operations", failures);
        }
        (self.on_complete)(failures == 0);
    }
}

/// Collapses adjacent compatible text operations on one path: two inserts
/// merge when the second starts exactly where the first ended, two removes
/// merge when they share an offset. Anything else stays distinct, in order.
/// Callers pass operations that already share a single path.
pub fn merge_text_operations(ops: Vec<Operation>) -> Vec<Operation> {
    let mut merged: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        let absorbed = match (merged.last_mut(), &op) {
            (
                Some(Operation::InsertText { offset, text, .. }),
                Operation::InsertText {
                    offset: next_offset,
                    text: next_text,
                    ..
                },
            ) if *next_offset == *offset + text.chars().count() => {
                text.push_str(next_text);
                true
            }
            (
                Some(Operation::RemoveText { offset, text, .. }),
                Operation::RemoveText {
                    offset: next_offset,
                    text: next_text,
                    ..
                },
            ) if *next_offset == *offset => {
                text.push_str(next_text);
                true
            }
            _ => false,
        };
        if !absorbed {
            merged.push(op);
        }
    }
    merged
}
