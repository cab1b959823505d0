use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ─── Scalar ids ───────────────────────────────────────────────

/// Arena index of a model vertex (state, region, or pseudostate).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u32);

/// Arena index of a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransitionId(pub u32);

/// Monotonically increasing per-machine event sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ─── Events ───────────────────────────────────────────────────

/// Event discriminant. Transitions match on kind equality; payloads are
/// opaque to the runtime and only inspected by user guards and behaviors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Named external signal.
    Signal(String),
    /// Interpreter-generated completion of `state`. Never produced by user code.
    Completion { state: VertexId },
    /// Timer wake carrying the identity of the state whose `after(Δ)` edges
    /// were armed on entry. Which edge fires is decided at selection time.
    /// `arming` discriminates stale wakes from timers that were re-armed since.
    TimeElapsed {
        source: VertexId,
        after_ms: u64,
        arming: u64,
    },
    /// Named change notification (condition re-evaluation requested by user code).
    Change(String),
}

/// A dispatchable event. The sequence number is stamped by the machine when
/// the event is enqueued; events are consumed exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            id: EventId(0),
            kind: EventKind::Signal(name.into()),
            payload: serde_json::Value::Null,
        }
    }

    pub fn change(name: impl Into<String>) -> Self {
        Self {
            id: EventId(0),
            kind: EventKind::Change(name.into()),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn completion(state: VertexId) -> Self {
        Self {
            id: EventId(0),
            kind: EventKind::Completion { state },
            payload: serde_json::Value::Null,
        }
    }
}

// ─── Triggers ─────────────────────────────────────────────────

/// What arms a transition. Triggerless transitions (`Transition::trigger ==
/// None`) fire on the completion event of their source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Signal(String),
    After(#[serde(with = "duration_ms")] Duration),
    Change(String),
}

impl Trigger {
    pub fn signal(name: impl Into<String>) -> Self {
        Trigger::Signal(name.into())
    }

    pub fn change(name: impl Into<String>) -> Self {
        Trigger::Change(name.into())
    }

    pub fn after(d: Duration) -> Self {
        Trigger::After(d)
    }

    /// Non-timer trigger match against an event kind. `After` triggers are
    /// matched separately because they also compare the arming nonce.
    pub(crate) fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (Trigger::Signal(a), EventKind::Signal(b)) => a == b,
            (Trigger::Change(a), EventKind::Change(b)) => a == b,
            _ => false,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ─── Vertices ─────────────────────────────────────────────────

/// Model vertex kind. States with an empty region list are leaves; one
/// region makes a plain composite, more than one makes it orthogonal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VertexKind {
    State { regions: Vec<VertexId> },
    Region,
    Initial,
    Choice,
    Junction,
    Fork,
    Join,
    Terminate,
    ShallowHistory,
    DeepHistory,
    Final,
}

impl VertexKind {
    /// Pseudostates are transient: they are traversed during a step and are
    /// never part of a stable configuration.
    pub fn is_pseudostate(&self) -> bool {
        matches!(
            self,
            VertexKind::Initial
                | VertexKind::Choice
                | VertexKind::Junction
                | VertexKind::Fork
                | VertexKind::Join
                | VertexKind::Terminate
                | VertexKind::ShallowHistory
                | VertexKind::DeepHistory
        )
    }

    pub fn is_state(&self) -> bool {
        matches!(self, VertexKind::State { .. })
    }
}

/// One model vertex. Parent is stored as an id to break the parent ↔ child
/// cycle; the arena owns all vertices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    pub name: String,
    pub kind: VertexKind,
    pub parent: Option<VertexId>,
    /// Ordered: declaration order is load-bearing for tie-breaking.
    pub children: Vec<VertexId>,
    /// Event patterns this state holds in the deferred pool while active.
    pub deferrals: Vec<Trigger>,
    /// Distance from the root (root = 0). Precomputed at freeze.
    pub depth: u16,
}

// ─── Transitions ──────────────────────────────────────────────

/// External transitions exit their source and re-enter their target.
/// Internal transitions cause no exit or entry at all. Local transitions
/// stay within the composite that contains both endpoints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    #[default]
    External,
    Internal,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub source: VertexId,
    pub target: VertexId,
    /// `None` means completion-triggered (or a continuation segment out of a
    /// pseudostate).
    pub trigger: Option<Trigger>,
    pub kind: TransitionKind,
}

// ─── Machine lifecycle ────────────────────────────────────────

/// Lifecycle of the interpreter itself (not of any model state).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachinePhase {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl MachinePhase {
    /// Returns true once the machine can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachinePhase::Stopped)
    }
}

/// What happened to a single dispatched event, reported to the caller of
/// `Machine::send`.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one transition fired.
    Transitioned,
    /// No transition was enabled and no active state defers the event.
    Dropped,
    /// Moved to the deferred pool of an active state.
    Deferred,
    /// The event drove the machine into a terminate pseudostate.
    Terminated,
}
