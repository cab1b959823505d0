use crate::model::Model;
use crate::queue::EventQueue;
use crate::types::{Event, EventId, EventKind, Trigger, VertexId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct ArmedState {
    arming: u64,
    handles: Vec<JoinHandle<()>>,
}

/// Schedules time-elapsed events for `after(Δ)` transitions.
///
/// On entry to a state with timed edges, one wake task is spawned per
/// distinct Δ, anchored to the monotonic entry instant. The wake carries the
/// state identity only; which edge fires is the selector's decision
/// (smallest Δ first, ties by declaration order). Exiting the state cancels
/// its wakes, and a wake that raced the cancel is discarded by the arming
/// nonce check.
pub(crate) struct TimerService {
    queue: Arc<EventQueue>,
    armed: HashMap<VertexId, ArmedState>,
    arming_seq: u64,
}

impl TimerService {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            armed: HashMap::new(),
            arming_seq: 0,
        }
    }

    /// Arm the `after(Δ)` wakes of a freshly entered state.
    pub fn schedule_for(&mut self, model: &Model, state: VertexId) {
        let mut delays: Vec<u64> = model
            .transitions_out(state)
            .iter()
            .filter_map(|&t| match &model.transition(t).trigger {
                Some(Trigger::After(d)) => Some(d.as_millis() as u64),
                _ => None,
            })
            .collect();
        delays.sort_unstable();
        delays.dedup();
        if delays.is_empty() {
            return;
        }

        self.arming_seq += 1;
        let arming = self.arming_seq;
        let entered = Instant::now();
        let mut handles = Vec::with_capacity(delays.len());
        for after_ms in delays {
            let queue = self.queue.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep_until(entered + Duration::from_millis(after_ms)).await;
                // QueueClosed just means the machine stopped under us.
                let _ = queue.enqueue(
                    Event {
                        id: EventId(0),
                        kind: EventKind::TimeElapsed {
                            source: state,
                            after_ms,
                            arming,
                        },
                        payload: serde_json::Value::Null,
                    },
                    None,
                );
            }));
        }
        if let Some(old) = self.armed.insert(state, ArmedState { arming, handles }) {
            for handle in old.handles {
                handle.abort();
            }
        }
    }

    /// Cancel every wake tied to `state`. Called when the state (or any of
    /// its ancestors) is exited.
    pub fn cancel_for(&mut self, state: VertexId) {
        if let Some(armed) = self.armed.remove(&state) {
            for handle in armed.handles {
                handle.abort();
            }
        }
    }

    /// Check a fired wake. False for stale wakes: the state's timers were
    /// cancelled or re-armed after this event was enqueued.
    pub fn is_live(&self, state: VertexId, arming: u64) -> bool {
        matches!(self.armed.get(&state), Some(armed) if armed.arming == arming)
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            for handle in armed.handles {
                handle.abort();
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
