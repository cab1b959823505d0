use crate::model::Model;
use crate::types::{VertexId, VertexKind};
use std::collections::{BTreeSet, HashMap};

/// The set of currently active vertices (leaves plus their materialized
/// ancestor chain, regions included), region-completion bookkeeping, and the
/// history snapshots recorded for history pseudostates.
///
/// Owned exclusively by the interpreter; mutated only between suspension
/// points of a step.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    active: BTreeSet<VertexId>,
    completed_regions: BTreeSet<VertexId>,
    /// States whose completion event has been emitted for the current
    /// activation. Cleared on exit so re-entry completes again.
    completion_emitted: BTreeSet<VertexId>,
    /// History vertex → configuration recorded when its region was last
    /// exited. Shallow history records one direct child; deep history
    /// records the leaf set underneath.
    history: HashMap<VertexId, Vec<VertexId>>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, v: VertexId) -> bool {
        self.active.contains(&v)
    }

    /// All active vertices in id order (states, regions, and the root).
    pub fn active_set(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.active.iter().copied()
    }

    /// Active leaves: leaf states and final states, in id order.
    pub fn active_leaves(&self, model: &Model) -> Vec<VertexId> {
        self.active
            .iter()
            .copied()
            .filter(|&v| match &model.vertex(v).kind {
                VertexKind::State { regions } => regions.is_empty(),
                VertexKind::Final => true,
                _ => false,
            })
            .collect()
    }

    pub(crate) fn enter(&mut self, v: VertexId, model: &Model) {
        self.active.insert(v);
        if model.vertex(v).kind == VertexKind::Final {
            if let Some(region) = model.parent(v) {
                self.completed_regions.insert(region);
            }
        }
    }

    pub(crate) fn exit(&mut self, v: VertexId, model: &Model) {
        self.active.remove(&v);
        self.completion_emitted.remove(&v);
        match model.vertex(v).kind {
            VertexKind::Final => {
                if let Some(region) = model.parent(v) {
                    self.completed_regions.remove(&region);
                }
            }
            VertexKind::Region => {
                self.completed_regions.remove(&v);
            }
            _ => {}
        }
    }

    pub fn region_completed(&self, region: VertexId) -> bool {
        self.completed_regions.contains(&region)
    }

    /// A composite is completed when every one of its regions holds its
    /// final state.
    pub fn composite_completed(&self, model: &Model, v: VertexId) -> bool {
        let regions = model.regions(v);
        !regions.is_empty() && regions.iter().all(|&r| self.region_completed(r))
    }

    /// Returns true the first time a completion is claimed for this
    /// activation of `v`.
    pub(crate) fn claim_completion(&mut self, v: VertexId) -> bool {
        self.completion_emitted.insert(v)
    }

    pub(crate) fn record_history(&mut self, history_vertex: VertexId, states: Vec<VertexId>) {
        self.history.insert(history_vertex, states);
    }

    pub(crate) fn recorded_history(&self, history_vertex: VertexId) -> Option<&[VertexId]> {
        self.history.get(&history_vertex).map(|v| v.as_slice())
    }

    /// Forget a history snapshot. A region exited while resting in its final
    /// state restores through the default path on the next history entry.
    pub(crate) fn clear_history(&mut self, history_vertex: VertexId) {
        self.history.remove(&history_vertex);
    }

    pub(crate) fn clear(&mut self) {
        self.active.clear();
        self.completed_regions.clear();
        self.completion_emitted.clear();
        self.history.clear();
    }

    /// Check the stable-configuration invariants. Used by tests
    /// after every settled step.
    pub fn validate(&self, model: &Model) -> Result<(), String> {
        for &v in &self.active {
            if model.vertex(v).kind.is_pseudostate() {
                return Err(format!("pseudostate {v} is active between steps"));
            }
            if let Some(p) = model.parent(v) {
                if !self.active.contains(&p) {
                    return Err(format!("{v} is active but its parent {p} is not"));
                }
            }
        }
        for &v in &self.active {
            for &region in model.regions(v) {
                if !self.active.contains(&region) {
                    return Err(format!("active composite {v} has inactive region {region}"));
                }
                let active_children = model
                    .children(region)
                    .iter()
                    .filter(|&&c| self.active.contains(&c))
                    .count();
                if active_children != 1 {
                    return Err(format!(
                        "region {region} of active composite {v} has {active_children} active states"
                    ));
                }
            }
        }
        Ok(())
    }
}
