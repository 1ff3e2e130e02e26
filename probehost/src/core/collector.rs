//! # Collector
//!
//! Collection of the trace records emitted by attached handlers. Handlers run
//! in kernel-driven contexts, concurrently with everything else; the loader
//! surfaces their invocations through an `Emitter`, which feeds a bounded
//! queue. The consumer side drains the queue either by polling or through a
//! subscription callback running on a dedicated delivery thread.
//!
//! Emission never blocks: when the queue is full records are counted and
//! dropped, and the consumer is notified once with the drop count when room
//! is available again.

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use log::debug;

use crate::helpers::time::monotonic_timestamp;
use events::{HookKind, TraceRecord};

/// Default maximum number of records buffered between the emitting contexts
/// and the consumer.
pub(crate) const RECORD_QUEUE_CAPACITY: usize = 4096;
/// Default timeout when polling for new records.
pub(crate) const RECORDS_POLL_TIMEOUT_MS: u64 = 200;

/// The outcome of polling the collector.
#[derive(Debug)]
pub(crate) enum CollectResult {
    /// A record was delivered.
    Record(TraceRecord),
    /// `count` records were dropped because the consumer could not keep up.
    Dropped(u64),
    /// The collector was stopped. No record will follow.
    Closed,
    /// The timeout went off but a new attempt might succeed.
    Timeout,
}

enum QueueItem {
    Record(TraceRecord),
    Dropped(u64),
}

/// Bounded queue between the emitting contexts and the consumer.
struct Queue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

struct QueueInner {
    items: VecDeque<QueueItem>,
    capacity: usize,
    /// Records dropped since the last overflow notification was queued.
    pending_dropped: u64,
    closed: bool,
}

impl Queue {
    fn new(capacity: usize) -> Queue {
        Queue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                pending_dropped: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Push one record. Never blocks: on a full queue the record is counted
    /// as dropped instead, and the notification is enqueued ahead of the next
    /// record making it through.
    fn push(&self, record: TraceRecord) {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return;
        }
        if inner.items.len() >= inner.capacity {
            inner.pending_dropped += 1;
            return;
        }

        if inner.pending_dropped > 0 {
            let count = mem::take(&mut inner.pending_dropped);
            inner.items.push_back(QueueItem::Dropped(count));
        }
        inner.items.push_back(QueueItem::Record(record));

        self.cond.notify_all();
    }

    /// Pop one item, waiting up to `timeout` for one to show up. Once the
    /// queue is closed, buffered items are still returned until only the
    /// end-of-stream marker is left.
    fn pop(&self, timeout: Duration) -> CollectResult {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(item) = inner.items.pop_front() {
                return match item {
                    QueueItem::Record(record) => CollectResult::Record(record),
                    QueueItem::Dropped(count) => CollectResult::Dropped(count),
                };
            }
            if inner.closed {
                return CollectResult::Closed;
            }

            let now = Instant::now();
            if now >= deadline {
                return CollectResult::Timeout;
            }
            (inner, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
        }
    }

    /// Wait up to `timeout` for an item to be available (or for the queue to
    /// be closed), without popping it. Returns false on expiry.
    fn wait(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;

        loop {
            if !inner.items.is_empty() || inner.closed {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            (inner, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();

        // Overflows with no record making it through afterwards would go
        // unreported: flush the count as a final item, before the
        // end-of-stream marker.
        if inner.pending_dropped > 0 {
            let count = mem::take(&mut inner.pending_dropped);
            inner.items.push_back(QueueItem::Dropped(count));
        }
        inner.closed = true;

        self.cond.notify_all();
    }

    /// Remove the queued records belonging to `handler`, preserving the
    /// order of everything else.
    fn drain_handler(&self, handler: &str) -> Vec<TraceRecord> {
        let mut inner = self.inner.lock().unwrap();
        let mut kept = VecDeque::with_capacity(inner.items.len());
        let mut drained = Vec::new();

        for item in inner.items.drain(..) {
            match item {
                QueueItem::Record(record) if record.handler == handler => drained.push(record),
                item => kept.push_back(item),
            }
        }
        inner.items = kept;

        drained
    }
}

/// Per-handler emission state.
struct HandlerSlot {
    kind: HookKind,
    /// Pre-rendered record message. The configuration slots cannot change
    /// once a handler is attached, making the message constant.
    message: String,
    seq: u64,
    /// A sealed handler cannot emit anymore. Set on detach.
    sealed: bool,
}

/// Producer-side handle given to the loader, turning handler invocations into
/// trace records. Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub(crate) struct Emitter {
    queue: Arc<Queue>,
    handlers: Arc<Mutex<HashMap<String, HandlerSlot>>>,
}

impl Emitter {
    fn new(queue: Arc<Queue>) -> Emitter {
        Emitter {
            queue,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a handler ahead of its attachment. Re-registering a handler
    /// unseals it and keeps its sequence counter, so records of successive
    /// attachments never go backwards.
    pub(crate) fn register(&self, handler: &str, kind: HookKind, message: String) {
        let mut handlers = self.handlers.lock().unwrap();

        let slot = handlers.entry(handler.to_string()).or_insert(HandlerSlot {
            kind,
            message: String::new(),
            seq: 0,
            sealed: false,
        });
        slot.kind = kind;
        slot.message = message;
        slot.sealed = false;
    }

    /// Emit one record for a handler invocation. Returns false if the handler
    /// is unknown or sealed. Never blocks.
    pub(crate) fn fire(&self, handler: &str) -> bool {
        let mut handlers = self.handlers.lock().unwrap();

        let slot = match handlers.get_mut(handler) {
            Some(slot) if !slot.sealed => slot,
            _ => return false,
        };

        let record = TraceRecord {
            handler: handler.to_string(),
            kind: slot.kind,
            seq: slot.seq,
            timestamp: monotonic_timestamp().unwrap_or(0),
            message: slot.message.clone(),
        };
        slot.seq += 1;

        self.queue.push(record);
        true
    }

    /// Seal a handler: once this returns no new record for it can enter the
    /// queue. An in-flight emission holds the registry lock and completes
    /// first.
    pub(crate) fn seal(&self, handler: &str) {
        if let Some(slot) = self.handlers.lock().unwrap().get_mut(handler) {
            slot.sealed = true;
        }
    }
}

type RecordCallback = Box<dyn FnMut(CollectResult) + Send>;

/// Consumer side of the record flow.
pub(crate) struct EventCollector {
    queue: Arc<Queue>,
    emitter: Emitter,
    callback: Arc<Mutex<Option<RecordCallback>>>,
    poll_timeout: Duration,
    /// Delivery thread handle, in push mode.
    handle: Option<thread::JoinHandle<()>>,
}

impl EventCollector {
    pub(crate) fn new() -> EventCollector {
        Self::with_capacity(RECORD_QUEUE_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> EventCollector {
        let queue = Arc::new(Queue::new(capacity));

        EventCollector {
            emitter: Emitter::new(Arc::clone(&queue)),
            queue,
            callback: Arc::new(Mutex::new(None)),
            poll_timeout: Duration::from_millis(RECORDS_POLL_TIMEOUT_MS),
            handle: None,
        }
    }

    /// Set the internal poll timeout, used by the delivery thread to check
    /// for termination.
    pub(crate) fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub(crate) fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    /// Blocking pull: wait up to `timeout` and return everything buffered by
    /// then. An expired timeout yields an empty vector, never an error.
    pub(crate) fn poll(&self, timeout: Duration) -> Vec<CollectResult> {
        let mut results = Vec::new();

        match self.queue.pop(timeout) {
            CollectResult::Timeout => return results,
            CollectResult::Closed => {
                results.push(CollectResult::Closed);
                return results;
            }
            item => results.push(item),
        }

        // Drain whatever else is already buffered, without waiting again.
        loop {
            match self.queue.pop(Duration::ZERO) {
                CollectResult::Timeout => break,
                CollectResult::Closed => {
                    results.push(CollectResult::Closed);
                    break;
                }
                item => results.push(item),
            }
        }

        results
    }

    /// Push-mode registration: spawn a delivery thread invoking `callback`
    /// for every item, ending with `Closed` once the collector is stopped.
    pub(crate) fn subscribe<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(CollectResult) + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("Collector already has a subscriber");
        }
        *self.callback.lock().unwrap() = Some(Box::new(callback));

        let queue = Arc::clone(&self.queue);
        let cb = Arc::clone(&self.callback);
        let timeout = self.poll_timeout;

        self.handle = Some(
            thread::Builder::new()
                .name("probehost-records".into())
                .spawn(move || loop {
                    // Wait outside the callback lock, then pop and deliver
                    // under it: a record must never be in a popped-but-not-
                    // delivered limbo where a concurrent detach can't see it.
                    if !queue.wait(timeout) {
                        continue;
                    }

                    let mut guard = cb.lock().unwrap();
                    match queue.pop(Duration::ZERO) {
                        // The item was flushed by a detach in the meantime.
                        CollectResult::Timeout => continue,
                        CollectResult::Closed => {
                            if let Some(cb) = guard.as_mut() {
                                cb(CollectResult::Closed);
                            }
                            break;
                        }
                        item => {
                            if let Some(cb) = guard.as_mut() {
                                cb(item);
                            }
                        }
                    }
                })?,
        );

        Ok(())
    }

    /// Flush a detached handler: stop further emission and hand its queued
    /// records to the subscriber, if any. Once this returns no record of the
    /// handler can be delivered anymore; without a subscriber the queued
    /// records are discarded, as nothing guarantees a poll before teardown.
    pub(crate) fn drain_detached(&self, handler: &str) {
        self.emitter.seal(handler);

        let records = self.queue.drain_handler(handler);
        if records.is_empty() {
            return;
        }

        // Taking the callback lock also waits for an in-flight delivery of
        // this handler to complete.
        match self.callback.lock().unwrap().as_mut() {
            Some(cb) => records
                .into_iter()
                .for_each(|r| cb(CollectResult::Record(r))),
            None => debug!(
                "Discarded {} queued record(s) from detached handler {handler}",
                records.len()
            ),
        }
    }

    /// Cooperative shutdown: close the queue, wake pending polls (they return
    /// what is buffered plus the end-of-stream marker) and join the delivery
    /// thread, if any.
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.queue.close();

        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("Record delivery thread panicked"))?;
        }
        Ok(())
    }
}
