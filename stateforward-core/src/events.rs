use crate::types::{Event, EventId, EventKind, TransitionId, VertexId};
use serde::{Deserialize, Serialize};

/// Serializable description of the dispatched event for the step trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventDesc {
    /// The implicit entry pass performed by `start()`.
    Start,
    Signal {
        id: EventId,
        name: String,
    },
    Completion {
        id: EventId,
        state: VertexId,
    },
    TimeElapsed {
        id: EventId,
        source: VertexId,
        after_ms: u64,
    },
    Change {
        id: EventId,
        name: String,
    },
}

impl From<&Event> for EventDesc {
    fn from(e: &Event) -> Self {
        match &e.kind {
            EventKind::Signal(name) => EventDesc::Signal {
                id: e.id,
                name: name.clone(),
            },
            EventKind::Completion { state } => EventDesc::Completion {
                id: e.id,
                state: *state,
            },
            EventKind::TimeElapsed {
                source, after_ms, ..
            } => EventDesc::TimeElapsed {
                id: e.id,
                source: *source,
                after_ms: *after_ms,
            },
            EventKind::Change(name) => EventDesc::Change {
                id: e.id,
                name: name.clone(),
            },
        }
    }
}

/// One record per run-to-completion step — the stable diagnostics format
/// consumed by visualization and debugging collaborators. Also delivered to
/// `Machine::observe` callbacks after every step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepTrace {
    /// Step number, starting at 0 for the `start()` entry pass.
    pub seq: u64,
    pub event: EventDesc,
    /// Exited states, inner-to-outer.
    pub exited: Vec<VertexId>,
    /// Executed transition effects, in selection order (continuation
    /// segments included).
    pub effects: Vec<TransitionId>,
    /// Entered states, outer-to-inner.
    pub entered: Vec<VertexId>,
    /// Composite states whose completion event was emitted this step,
    /// innermost first.
    pub completions: Vec<VertexId>,
    /// Set when the event was consumed without effect.
    pub dropped: Option<EventId>,
    /// Set when the event was moved to a state's deferred pool.
    pub deferred: Option<EventId>,
    /// Active-leaf snapshot after the step.
    pub active: Vec<VertexId>,
}

impl StepTrace {
    pub(crate) fn new(seq: u64, event: EventDesc) -> Self {
        Self {
            seq,
            event,
            exited: Vec::new(),
            effects: Vec::new(),
            entered: Vec::new(),
            completions: Vec::new(),
            dropped: None,
            deferred: None,
            active: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_desc_round_trips_through_json() {
        let e = Event::signal("On").with_payload(serde_json::json!({"x": 1}));
        let desc = EventDesc::from(&e);
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("Signal"));
        assert!(json.contains("On"));
    }

    #[test]
    fn trace_serializes_dropped_marker() {
        let mut trace = StepTrace::new(4, EventDesc::Start);
        trace.dropped = Some(EventId(9));
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["dropped"], serde_json::json!(9));
        assert_eq!(json["seq"], serde_json::json!(4));
    }
}
