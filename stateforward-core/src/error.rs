use crate::types::{MachinePhase, TransitionId, VertexId};
use thiserror::Error;

/// Opaque user-behavior failure, boxed at the executor boundary.
/// `anyhow::Error` converts into this losslessly.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while constructing or freezing a model. All of these are
/// fatal: a machine cannot start on a model that failed verification.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model is frozen and can no longer be mutated")]
    ModelFrozen,

    #[error("unknown vertex {0}")]
    UnknownVertex(VertexId),

    #[error("{child_kind} cannot be added under {parent} ({parent_kind})")]
    InvalidParent {
        parent: VertexId,
        parent_kind: &'static str,
        child_kind: &'static str,
    },

    #[error("region '{name}' ({region}) has no initial pseudostate")]
    MissingInitial { region: VertexId, name: String },

    #[error("region '{name}' ({region}) has more than one initial pseudostate")]
    DuplicateInitial { region: VertexId, name: String },

    #[error("choice '{name}' ({choice}) has no unguarded else branch declared last")]
    IncompleteChoice { choice: VertexId, name: String },

    #[error("vertex '{name}' ({vertex}) is not reachable from the initial configuration")]
    UnreachableState { vertex: VertexId, name: String },

    #[error("transitions {first} and {second} from '{source_name}' share a trigger and neither is guarded")]
    AmbiguousTransition {
        first: TransitionId,
        second: TransitionId,
        source_name: String,
    },

    #[error("transition {transition} is invalid: {reason}")]
    InvalidTransition {
        transition: TransitionId,
        reason: String,
    },

    #[error("vertex '{name}' ({vertex}) is invalid: {reason}")]
    InvalidVertex {
        vertex: VertexId,
        name: String,
        reason: String,
    },
}

/// Where a failing user behavior was attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BehaviorSite {
    Entry(VertexId),
    Exit(VertexId),
    DoActivity(VertexId),
    Effect(TransitionId),
}

impl std::fmt::Display for BehaviorSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BehaviorSite::Entry(v) => write!(f, "entry of {v}"),
            BehaviorSite::Exit(v) => write!(f, "exit of {v}"),
            BehaviorSite::DoActivity(v) => write!(f, "do-activity of {v}"),
            BehaviorSite::Effect(t) => write!(f, "effect of {t}"),
        }
    }
}

/// Errors raised while a machine is running. Behavior failures carry the
/// opaque user error; unhandled events are never errors (they are recorded
/// in the step trace instead).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{op} is not legal while the machine is {phase:?}")]
    IllegalState {
        op: &'static str,
        phase: MachinePhase,
    },

    #[error("event queue is closed")]
    QueueClosed,

    #[error("guard on transition {transition} attempted to suspend")]
    GuardImpure { transition: TransitionId },

    #[error("behavior failed in {site}")]
    BehaviorFailed {
        site: BehaviorSite,
        #[source]
        source: BoxError,
    },

    #[error("step aborted: {site} failed during exit processing")]
    StepAborted {
        site: BehaviorSite,
        #[source]
        source: BoxError,
    },

    #[error("timer service fault")]
    TimerFault(#[source] BoxError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behavior_site_display() {
        assert_eq!(BehaviorSite::Entry(VertexId(3)).to_string(), "entry of v3");
        assert_eq!(
            BehaviorSite::Effect(TransitionId(7)).to_string(),
            "effect of t7"
        );
    }

    #[test]
    fn runtime_error_carries_source() {
        let err = RuntimeError::BehaviorFailed {
            site: BehaviorSite::Exit(VertexId(1)),
            source: anyhow::anyhow!("boom").into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("exit of v1"));
    }
}
