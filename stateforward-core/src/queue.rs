use crate::error::RuntimeError;
use crate::types::{DispatchOutcome, Event, EventId, EventKind, VertexId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{oneshot, Notify};

/// Reply channel for a dispatched event: the caller of `send` awaits the
/// outcome of the step that consumed its event. Interpreter-generated events
/// (completions, timer wakes, nested dispatch) carry no reply.
pub(crate) type StepReply = oneshot::Sender<Result<DispatchOutcome, RuntimeError>>;

#[derive(Debug)]
pub(crate) struct QueuedEvent {
    pub event: Event,
    pub reply: Option<StepReply>,
}

struct Inner {
    main: VecDeque<QueuedEvent>,
    /// Deferred pool: (owning state, event), in original enqueue order.
    deferred: Vec<(VertexId, QueuedEvent)>,
    closed: bool,
}

/// Multi-producer, single-consumer FIFO with a deferred side pool.
///
/// Producers are `Machine::send`, the timer service, do-activity completion
/// watchers, and nested dispatch from behaviors; the only consumer is the
/// interpreter driver. Completion events always precede external events
/// within a settle pass.
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    seq: AtomicU64,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                main: VecDeque::new(),
                deferred: Vec::new(),
                closed: false,
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(1),
        }
    }

    fn stamp(&self, mut event: Event) -> Event {
        event.id = EventId(self.seq.fetch_add(1, Ordering::Relaxed));
        event
    }

    /// Append to the tail of the main FIFO. Returns the stamped sequence id.
    pub(crate) fn enqueue(
        &self,
        event: Event,
        reply: Option<StepReply>,
    ) -> Result<EventId, RuntimeError> {
        let event = self.stamp(event);
        let id = event.id;
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if inner.closed {
                return Err(RuntimeError::QueueClosed);
            }
            inner.main.push_back(QueuedEvent { event, reply });
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Insert a completion event after any completion events already at the
    /// head of the queue but ahead of every external event.
    pub(crate) fn enqueue_completion(&self, state: VertexId) -> Result<EventId, RuntimeError> {
        let event = self.stamp(Event::completion(state));
        let id = event.id;
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if inner.closed {
                return Err(RuntimeError::QueueClosed);
            }
            let at = inner
                .main
                .iter()
                .take_while(|q| matches!(q.event.kind, EventKind::Completion { .. }))
                .count();
            inner.main.insert(at, QueuedEvent { event, reply: None });
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Move an already-dequeued event into the deferred pool of `owner`.
    pub(crate) fn defer(&self, owner: VertexId, queued: QueuedEvent) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.deferred.push((owner, queued));
    }

    /// Release deferred events owned by any of the exited states.
    ///
    /// `exited` arrives inner-to-outer; the released batch is flattened back
    /// into original enqueue order (sequence ids are monotonic) and inserted
    /// at the head of the queue, behind any pending completion events.
    pub(crate) fn release_deferred(&self, exited: &[VertexId]) -> usize {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let mut released: Vec<QueuedEvent> = Vec::new();
        let mut kept: Vec<(VertexId, QueuedEvent)> = Vec::new();
        for (owner, queued) in inner.deferred.drain(..) {
            if exited.contains(&owner) {
                released.push(queued);
            } else {
                kept.push((owner, queued));
            }
        }
        inner.deferred = kept;
        if released.is_empty() {
            return 0;
        }
        released.sort_by_key(|q| q.event.id);
        let n = released.len();
        let at = inner
            .main
            .iter()
            .take_while(|q| matches!(q.event.kind, EventKind::Completion { .. }))
            .count();
        for queued in released.into_iter().rev() {
            inner.main.insert(at, queued);
        }
        drop(inner);
        self.notify.notify_one();
        n
    }

    /// Next event, or `None` when the queue is drained.
    pub(crate) fn pop(&self) -> Option<QueuedEvent> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.main.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("queue poisoned");
        inner.main.is_empty()
    }

    /// Close the queue and discard everything pending, replying
    /// `QueueClosed` to any callers still awaiting an outcome. Deferred
    /// events are discarded with the same reply.
    pub(crate) fn close(&self) {
        let drained: Vec<QueuedEvent> = {
            let mut inner = self.inner.lock().expect("queue poisoned");
            inner.closed = true;
            let mut drained: Vec<QueuedEvent> = inner.main.drain(..).collect();
            drained.extend(inner.deferred.drain(..).map(|(_, q)| q));
            drained
        };
        for queued in drained {
            if let Some(reply) = queued.reply {
                let _ = reply.send(Err(RuntimeError::QueueClosed));
            }
        }
        self.notify.notify_one();
    }

    /// Await a producer. Returns immediately if a notification is pending.
    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}
