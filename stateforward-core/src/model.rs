use crate::behavior::{Behavior, Guard};
use crate::error::ModelError;
use crate::types::{Transition, TransitionId, TransitionKind, Trigger, Vertex, VertexId, VertexKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Which lifecycle slot a state behavior occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Entry,
    Exit,
    DoActivity,
}

/// The frozen model graph: an arena of vertices addressed by stable index,
/// transitions referencing source and target by id, and the behavior table
/// `(vertex, slot) → handle`. Immutable after `ModelBuilder::build` and
/// shared read-only by every component of the interpreter.
pub struct Model {
    name: String,
    root: VertexId,
    vertices: Vec<Vertex>,
    transitions: Vec<Transition>,
    /// Outgoing transition ids per vertex, in declaration order.
    outgoing: Vec<Vec<TransitionId>>,
    /// Incoming transition ids per vertex (join barriers read these).
    incoming: Vec<Vec<TransitionId>>,
    behaviors: HashMap<(VertexId, Slot), Arc<dyn Behavior>>,
    effects: HashMap<TransitionId, Arc<dyn Behavior>>,
    guards: HashMap<TransitionId, Arc<dyn Guard>>,
    /// SHA-256 over the canonical structural serialization — version key
    /// for trace correlation.
    digest: [u8; 32],
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> VertexId {
        self.root
    }

    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }

    pub fn vertex(&self, v: VertexId) -> &Vertex {
        &self.vertices[v.0 as usize]
    }

    pub fn transition(&self, t: TransitionId) -> &Transition {
        &self.transitions[t.0 as usize]
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn parent(&self, v: VertexId) -> Option<VertexId> {
        self.vertex(v).parent
    }

    pub fn children(&self, v: VertexId) -> &[VertexId] {
        &self.vertex(v).children
    }

    /// Regions of a composite state, empty for leaves and non-states.
    pub fn regions(&self, v: VertexId) -> &[VertexId] {
        match &self.vertex(v).kind {
            VertexKind::State { regions } => regions,
            _ => &[],
        }
    }

    pub fn is_leaf_state(&self, v: VertexId) -> bool {
        matches!(&self.vertex(v).kind, VertexKind::State { regions } if regions.is_empty())
    }

    pub fn depth(&self, v: VertexId) -> u16 {
        self.vertex(v).depth
    }

    /// Ancestor chain of `v`, root-first, excluding `v` itself.
    pub fn ancestors(&self, v: VertexId) -> Vec<VertexId> {
        let mut chain = Vec::with_capacity(self.depth(v) as usize);
        let mut cur = self.parent(v);
        while let Some(p) = cur {
            chain.push(p);
            cur = self.parent(p);
        }
        chain.reverse();
        chain
    }

    /// True when `a` is a strict descendant of `b`.
    pub fn is_descendant(&self, a: VertexId, b: VertexId) -> bool {
        let mut cur = self.parent(a);
        while let Some(p) = cur {
            if p == b {
                return true;
            }
            cur = self.parent(p);
        }
        false
    }

    /// Lowest common ancestor. Walks the deeper chain up first, O(depth).
    pub fn lca(&self, a: VertexId, b: VertexId) -> VertexId {
        let (mut x, mut y) = (a, b);
        while self.depth(x) > self.depth(y) {
            x = self.parent(x).expect("depth > 0 implies parent");
        }
        while self.depth(y) > self.depth(x) {
            y = self.parent(y).expect("depth > 0 implies parent");
        }
        while x != y {
            x = self.parent(x).expect("lca walk hit root");
            y = self.parent(y).expect("lca walk hit root");
        }
        x
    }

    pub fn transitions_out(&self, v: VertexId) -> &[TransitionId] {
        &self.outgoing[v.0 as usize]
    }

    pub fn transitions_in(&self, v: VertexId) -> &[TransitionId] {
        &self.incoming[v.0 as usize]
    }

    pub fn behavior(&self, v: VertexId, slot: Slot) -> Option<&Arc<dyn Behavior>> {
        self.behaviors.get(&(v, slot))
    }

    pub fn effect(&self, t: TransitionId) -> Option<&Arc<dyn Behavior>> {
        self.effects.get(&t)
    }

    pub fn guard(&self, t: TransitionId) -> Option<&Arc<dyn Guard>> {
        self.guards.get(&t)
    }

    pub fn has_guard(&self, t: TransitionId) -> bool {
        self.guards.contains_key(&t)
    }

    /// The single initial pseudostate of a region.
    pub fn initial_of(&self, region: VertexId) -> Option<VertexId> {
        self.children(region)
            .iter()
            .copied()
            .find(|&c| self.vertex(c).kind == VertexKind::Initial)
    }

    /// The history vertex of a region, if it declares one.
    pub fn history_of(&self, region: VertexId) -> Option<VertexId> {
        self.children(region).iter().copied().find(|&c| {
            matches!(
                self.vertex(c).kind,
                VertexKind::ShallowHistory | VertexKind::DeepHistory
            )
        })
    }

    pub fn name_of(&self, v: VertexId) -> &str {
        &self.vertex(v).name
    }

    /// Dotted path below the root, e.g. `power.on.light.off`.
    pub fn path(&self, v: VertexId) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut cur = Some(v);
        while let Some(x) = cur {
            if x == self.root {
                break;
            }
            parts.push(self.name_of(x));
            cur = self.parent(x);
        }
        parts.reverse();
        parts.join(".")
    }

    /// Resolve a dotted path produced by `path`.
    pub fn find(&self, path: &str) -> Option<VertexId> {
        let mut cur = self.root;
        for part in path.split('.') {
            cur = self
                .children(cur)
                .iter()
                .copied()
                .find(|&c| self.name_of(c) == part)?;
        }
        Some(cur)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Programmatic model construction. `build` verifies the structure, freezes
/// it, and returns the shared model; every mutation after that fails with
/// `ModelFrozen`.
pub struct ModelBuilder {
    name: String,
    root: VertexId,
    vertices: Vec<Vertex>,
    transitions: Vec<Transition>,
    outgoing: Vec<Vec<TransitionId>>,
    incoming: Vec<Vec<TransitionId>>,
    behaviors: HashMap<(VertexId, Slot), Arc<dyn Behavior>>,
    effects: HashMap<TransitionId, Arc<dyn Behavior>>,
    guards: HashMap<TransitionId, Arc<dyn Guard>>,
    frozen: bool,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Vertex {
            id: VertexId(0),
            name: name.clone(),
            kind: VertexKind::State { regions: vec![] },
            parent: None,
            children: vec![],
            deferrals: vec![],
            depth: 0,
        };
        Self {
            name,
            root: VertexId(0),
            vertices: vec![root],
            transitions: Vec::new(),
            outgoing: vec![Vec::new()],
            incoming: vec![Vec::new()],
            behaviors: HashMap::new(),
            effects: HashMap::new(),
            guards: HashMap::new(),
            frozen: false,
        }
    }

    pub fn root(&self) -> VertexId {
        self.root
    }

    fn check_open(&self) -> Result<(), ModelError> {
        if self.frozen {
            Err(ModelError::ModelFrozen)
        } else {
            Ok(())
        }
    }

    fn check_vertex(&self, v: VertexId) -> Result<(), ModelError> {
        if (v.0 as usize) < self.vertices.len() {
            Ok(())
        } else {
            Err(ModelError::UnknownVertex(v))
        }
    }

    fn kind_name(kind: &VertexKind) -> &'static str {
        match kind {
            VertexKind::State { .. } => "state",
            VertexKind::Region => "region",
            VertexKind::Initial => "initial",
            VertexKind::Choice => "choice",
            VertexKind::Junction => "junction",
            VertexKind::Fork => "fork",
            VertexKind::Join => "join",
            VertexKind::Terminate => "terminate",
            VertexKind::ShallowHistory => "shallow-history",
            VertexKind::DeepHistory => "deep-history",
            VertexKind::Final => "final",
        }
    }

    fn add_vertex(
        &mut self,
        parent: VertexId,
        name: String,
        kind: VertexKind,
    ) -> Result<VertexId, ModelError> {
        self.check_open()?;
        self.check_vertex(parent)?;

        let parent_kind = &self.vertices[parent.0 as usize].kind;
        let parent_is_state = parent_kind.is_state();
        let child_is_region = kind == VertexKind::Region;
        // Regions attach to states; everything else attaches to regions.
        if child_is_region != parent_is_state {
            return Err(ModelError::InvalidParent {
                parent,
                parent_kind: Self::kind_name(parent_kind),
                child_kind: Self::kind_name(&kind),
            });
        }

        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(Vertex {
            id,
            name,
            kind: kind.clone(),
            parent: Some(parent),
            children: vec![],
            deferrals: vec![],
            depth: 0,
        });
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.vertices[parent.0 as usize].children.push(id);
        if child_is_region {
            if let VertexKind::State { regions } = &mut self.vertices[parent.0 as usize].kind {
                regions.push(id);
            }
        }
        Ok(id)
    }

    pub fn region(&mut self, state: VertexId, name: impl Into<String>) -> Result<VertexId, ModelError> {
        self.add_vertex(state, name.into(), VertexKind::Region)
    }

    pub fn state(&mut self, region: VertexId, name: impl Into<String>) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::State { regions: vec![] })
    }

    pub fn final_state(
        &mut self,
        region: VertexId,
        name: impl Into<String>,
    ) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::Final)
    }

    pub fn initial(&mut self, region: VertexId) -> Result<VertexId, ModelError> {
        self.add_vertex(region, "initial".into(), VertexKind::Initial)
    }

    pub fn choice(&mut self, region: VertexId, name: impl Into<String>) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::Choice)
    }

    pub fn junction(
        &mut self,
        region: VertexId,
        name: impl Into<String>,
    ) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::Junction)
    }

    pub fn fork(&mut self, region: VertexId, name: impl Into<String>) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::Fork)
    }

    pub fn join(&mut self, region: VertexId, name: impl Into<String>) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::Join)
    }

    pub fn terminate(
        &mut self,
        region: VertexId,
        name: impl Into<String>,
    ) -> Result<VertexId, ModelError> {
        self.add_vertex(region, name.into(), VertexKind::Terminate)
    }

    pub fn shallow_history(&mut self, region: VertexId) -> Result<VertexId, ModelError> {
        self.add_vertex(region, "history".into(), VertexKind::ShallowHistory)
    }

    pub fn deep_history(&mut self, region: VertexId) -> Result<VertexId, ModelError> {
        self.add_vertex(region, "history*".into(), VertexKind::DeepHistory)
    }

    fn add_transition(
        &mut self,
        source: VertexId,
        target: VertexId,
        trigger: Option<Trigger>,
        kind: TransitionKind,
    ) -> Result<TransitionId, ModelError> {
        self.check_open()?;
        self.check_vertex(source)?;
        self.check_vertex(target)?;
        let id = TransitionId(self.transitions.len() as u32);
        self.transitions.push(Transition {
            id,
            source,
            target,
            trigger,
            kind,
        });
        self.outgoing[source.0 as usize].push(id);
        self.incoming[target.0 as usize].push(id);
        Ok(id)
    }

    /// Triggerless transition: fires on the completion event of its source
    /// (or serves as a continuation segment out of a pseudostate).
    pub fn transition(
        &mut self,
        source: VertexId,
        target: VertexId,
    ) -> Result<TransitionId, ModelError> {
        self.add_transition(source, target, None, TransitionKind::External)
    }

    pub fn transition_on(
        &mut self,
        source: VertexId,
        target: VertexId,
        trigger: Trigger,
    ) -> Result<TransitionId, ModelError> {
        self.add_transition(source, target, Some(trigger), TransitionKind::External)
    }

    /// Internal transition: effect only, no exit or entry.
    pub fn internal(
        &mut self,
        state: VertexId,
        trigger: Trigger,
    ) -> Result<TransitionId, ModelError> {
        self.add_transition(state, state, Some(trigger), TransitionKind::Internal)
    }

    pub fn set_kind(&mut self, t: TransitionId, kind: TransitionKind) -> Result<(), ModelError> {
        self.check_open()?;
        let tr = self
            .transitions
            .get_mut(t.0 as usize)
            .ok_or(ModelError::InvalidTransition {
                transition: t,
                reason: "unknown transition".into(),
            })?;
        tr.kind = kind;
        Ok(())
    }

    pub fn guard(&mut self, t: TransitionId, guard: Arc<dyn Guard>) -> Result<(), ModelError> {
        self.check_open()?;
        self.guards.insert(t, guard);
        Ok(())
    }

    pub fn effect(&mut self, t: TransitionId, effect: Arc<dyn Behavior>) -> Result<(), ModelError> {
        self.check_open()?;
        self.effects.insert(t, effect);
        Ok(())
    }

    pub fn on_entry(&mut self, v: VertexId, b: Arc<dyn Behavior>) -> Result<(), ModelError> {
        self.set_behavior(v, Slot::Entry, b)
    }

    pub fn on_exit(&mut self, v: VertexId, b: Arc<dyn Behavior>) -> Result<(), ModelError> {
        self.set_behavior(v, Slot::Exit, b)
    }

    pub fn do_activity(&mut self, v: VertexId, b: Arc<dyn Behavior>) -> Result<(), ModelError> {
        self.set_behavior(v, Slot::DoActivity, b)
    }

    fn set_behavior(
        &mut self,
        v: VertexId,
        slot: Slot,
        b: Arc<dyn Behavior>,
    ) -> Result<(), ModelError> {
        self.check_open()?;
        self.check_vertex(v)?;
        if !self.vertices[v.0 as usize].kind.is_state() {
            return Err(ModelError::InvalidVertex {
                vertex: v,
                name: self.vertices[v.0 as usize].name.clone(),
                reason: "behaviors can only be attached to states".into(),
            });
        }
        self.behaviors.insert((v, slot), b);
        Ok(())
    }

    /// Declare that `state` holds events matching `pattern` in the deferred
    /// pool while it is active.
    pub fn defer(&mut self, state: VertexId, pattern: Trigger) -> Result<(), ModelError> {
        self.check_open()?;
        self.check_vertex(state)?;
        self.vertices[state.0 as usize].deferrals.push(pattern);
        Ok(())
    }

    /// Verify, freeze, and hand over the model.
    pub fn build(&mut self) -> Result<Arc<Model>, ModelError> {
        self.check_open()?;
        let mut errors = self.verify();
        if let Some(first) = errors.drain(..).next() {
            return Err(first);
        }
        self.frozen = true;

        // Depth pass, root-down.
        let mut stack = vec![self.root];
        while let Some(v) = stack.pop() {
            let depth = self.vertices[v.0 as usize].depth;
            let children = self.vertices[v.0 as usize].children.clone();
            for c in children {
                self.vertices[c.0 as usize].depth = depth + 1;
                stack.push(c);
            }
        }

        let digest = self.compute_digest();
        Ok(Arc::new(Model {
            name: self.name.clone(),
            root: self.root,
            vertices: self.vertices.clone(),
            transitions: self.transitions.clone(),
            outgoing: self.outgoing.clone(),
            incoming: self.incoming.clone(),
            behaviors: self.behaviors.clone(),
            effects: self.effects.clone(),
            guards: self.guards.clone(),
            digest,
        }))
    }

    /// Structural verification. Returns every violation found; an empty list
    /// means the model is valid.
    pub fn verify(&self) -> Vec<ModelError> {
        let mut errors = Vec::new();

        // Root must be composite.
        if let VertexKind::State { regions } = &self.vertices[self.root.0 as usize].kind {
            if regions.is_empty() {
                errors.push(ModelError::InvalidVertex {
                    vertex: self.root,
                    name: self.name.clone(),
                    reason: "root must contain at least one region".into(),
                });
            }
        }

        for v in &self.vertices {
            match &v.kind {
                VertexKind::Region => {
                    let initials: Vec<VertexId> = v
                        .children
                        .iter()
                        .copied()
                        .filter(|&c| self.vertices[c.0 as usize].kind == VertexKind::Initial)
                        .collect();
                    if initials.is_empty() {
                        errors.push(ModelError::MissingInitial {
                            region: v.id,
                            name: v.name.clone(),
                        });
                    } else if initials.len() > 1 {
                        errors.push(ModelError::DuplicateInitial {
                            region: v.id,
                            name: v.name.clone(),
                        });
                    }
                    let histories = v
                        .children
                        .iter()
                        .filter(|&&c| {
                            matches!(
                                self.vertices[c.0 as usize].kind,
                                VertexKind::ShallowHistory | VertexKind::DeepHistory
                            )
                        })
                        .count();
                    if histories > 1 {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "a region may declare at most one history vertex".into(),
                        });
                    }
                }
                VertexKind::Initial => {
                    let out = &self.outgoing[v.id.0 as usize];
                    let ok = out.len() == 1
                        && self.transitions[out[0].0 as usize].trigger.is_none()
                        && !self.guards.contains_key(&out[0]);
                    if !ok {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason:
                                "initial pseudostate needs exactly one unguarded triggerless transition"
                                    .into(),
                        });
                    }
                }
                VertexKind::Choice => {
                    let out = &self.outgoing[v.id.0 as usize];
                    let complete = match out.split_last() {
                        Some((last, rest)) => {
                            !self.guards.contains_key(last)
                                && rest.iter().all(|t| self.guards.contains_key(t))
                        }
                        None => false,
                    };
                    if !complete {
                        errors.push(ModelError::IncompleteChoice {
                            choice: v.id,
                            name: v.name.clone(),
                        });
                    }
                }
                VertexKind::Junction => {
                    if self.outgoing[v.id.0 as usize].is_empty() {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "junction needs at least one outgoing transition".into(),
                        });
                    }
                }
                VertexKind::Fork => {
                    let out = &self.outgoing[v.id.0 as usize];
                    if out.len() < 2 || out.iter().any(|t| self.guards.contains_key(t)) {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "fork needs at least two unguarded outgoing transitions".into(),
                        });
                    }
                }
                VertexKind::Join => {
                    if self.incoming[v.id.0 as usize].len() < 2
                        || self.outgoing[v.id.0 as usize].len() != 1
                    {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "join needs at least two incoming transitions and exactly one outgoing"
                                .into(),
                        });
                    }
                }
                VertexKind::Terminate => {
                    if !self.outgoing[v.id.0 as usize].is_empty() {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "terminate pseudostate cannot have outgoing transitions".into(),
                        });
                    }
                }
                VertexKind::ShallowHistory | VertexKind::DeepHistory => {
                    if self.outgoing[v.id.0 as usize].len() > 1 {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "history may declare at most one default transition".into(),
                        });
                    }
                }
                VertexKind::Final => {
                    if !self.outgoing[v.id.0 as usize].is_empty() {
                        errors.push(ModelError::InvalidVertex {
                            vertex: v.id,
                            name: v.name.clone(),
                            reason: "final states cannot have outgoing transitions".into(),
                        });
                    }
                }
                VertexKind::State { .. } => {}
            }
        }

        for t in &self.transitions {
            let source = &self.vertices[t.source.0 as usize];
            let target = &self.vertices[t.target.0 as usize];
            if source.kind == VertexKind::Region || target.kind == VertexKind::Region {
                errors.push(ModelError::InvalidTransition {
                    transition: t.id,
                    reason: "transitions cannot start or end on a region".into(),
                });
            }
            if t.source == self.root || t.target == self.root {
                errors.push(ModelError::InvalidTransition {
                    transition: t.id,
                    reason: "transitions cannot start or end at the root".into(),
                });
            }
            if source.kind.is_pseudostate() && t.trigger.is_some() {
                errors.push(ModelError::InvalidTransition {
                    transition: t.id,
                    reason: "transitions out of pseudostates must be triggerless".into(),
                });
            }
        }

        // Ambiguity: two unguarded transitions from the same state sharing a
        // trigger would make selection order-dependent for no reason.
        for v in &self.vertices {
            if !v.kind.is_state() {
                continue;
            }
            let out = &self.outgoing[v.id.0 as usize];
            for (i, &a) in out.iter().enumerate() {
                for &b in &out[i + 1..] {
                    let ta = &self.transitions[a.0 as usize];
                    let tb = &self.transitions[b.0 as usize];
                    // Timed edges are never ambiguous: selection resolves
                    // them smallest-Δ-first, then by declaration order.
                    if matches!(ta.trigger, Some(Trigger::After(_))) {
                        continue;
                    }
                    if ta.trigger == tb.trigger
                        && !self.guards.contains_key(&a)
                        && !self.guards.contains_key(&b)
                    {
                        errors.push(ModelError::AmbiguousTransition {
                            first: a,
                            second: b,
                            source_name: v.name.clone(),
                        });
                    }
                }
            }
        }

        self.verify_reachability(&mut errors);
        errors
    }

    /// Every vertex must be enterable: reachable from the root through
    /// containment into regions, each region's initial, and transitions.
    fn verify_reachability(&self, errors: &mut Vec<ModelError>) {
        let mut graph: DiGraph<VertexId, ()> = DiGraph::new();
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(self.vertices.len());
        for v in &self.vertices {
            nodes.push(graph.add_node(v.id));
        }
        for v in &self.vertices {
            match &v.kind {
                VertexKind::State { regions } => {
                    for &r in regions {
                        graph.add_edge(nodes[v.id.0 as usize], nodes[r.0 as usize], ());
                    }
                }
                VertexKind::Region => {
                    for &c in &v.children {
                        if self.vertices[c.0 as usize].kind == VertexKind::Initial {
                            graph.add_edge(nodes[v.id.0 as usize], nodes[c.0 as usize], ());
                        }
                    }
                }
                _ => {}
            }
        }
        for t in &self.transitions {
            graph.add_edge(nodes[t.source.0 as usize], nodes[t.target.0 as usize], ());
        }

        let mut reachable = vec![false; self.vertices.len()];
        let mut dfs = Dfs::new(&graph, nodes[self.root.0 as usize]);
        while let Some(nx) = dfs.next(&graph) {
            reachable[graph[nx].0 as usize] = true;
        }
        for v in &self.vertices {
            if !reachable[v.id.0 as usize] {
                errors.push(ModelError::UnreachableState {
                    vertex: v.id,
                    name: v.name.clone(),
                });
            }
        }
    }

    fn compute_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for v in &self.vertices {
            hasher.update(format!(
                "v:{}:{}:{:?}:{:?}\n",
                v.id, v.name, v.kind, v.parent
            ));
        }
        for t in &self.transitions {
            hasher.update(format!(
                "t:{}:{}:{}:{:?}:{:?}:{}\n",
                t.id,
                t.source,
                t.target,
                t.trigger,
                t.kind,
                self.guards.contains_key(&t.id)
            ));
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::guard_fn;

    /// Minimal two-state switch used across the module tests.
    fn switch() -> ModelBuilder {
        let mut b = ModelBuilder::new("switch");
        let main = b.region(b.root(), "main").unwrap();
        let init = b.initial(main).unwrap();
        let off = b.state(main, "off").unwrap();
        let on = b.state(main, "on").unwrap();
        b.transition(init, off).unwrap();
        b.transition_on(off, on, Trigger::signal("on")).unwrap();
        b.transition_on(on, off, Trigger::signal("off")).unwrap();
        b
    }

    #[test]
    fn builder_produces_query_consistent_arena() {
        let mut b = switch();
        let model = b.build().unwrap();
        let off = model.find("main.off").unwrap();
        let on = model.find("main.on").unwrap();
        let main = model.find("main").unwrap();

        assert_eq!(model.parent(off), Some(main));
        assert_eq!(model.depth(off), 2);
        assert_eq!(model.ancestors(off), vec![model.root(), main]);
        assert_eq!(model.lca(off, on), main);
        assert!(model.is_descendant(off, model.root()));
        assert!(!model.is_descendant(model.root(), off));
        assert_eq!(model.path(off), "main.off");
        assert_eq!(model.transitions_out(off).len(), 1);
    }

    #[test]
    fn frozen_builder_rejects_mutation() {
        let mut b = switch();
        let main = b.root();
        let _model = b.build().unwrap();
        assert!(matches!(
            b.region(main, "late"),
            Err(ModelError::ModelFrozen)
        ));
        assert!(matches!(b.build(), Err(ModelError::ModelFrozen)));
    }

    #[test]
    fn region_without_initial_is_rejected() {
        let mut b = ModelBuilder::new("m");
        let r = b.region(b.root(), "r").unwrap();
        let _s = b.state(r, "s").unwrap();
        assert!(matches!(b.build(), Err(ModelError::MissingInitial { .. })));
    }

    #[test]
    fn choice_without_trailing_else_is_rejected() {
        let mut b = ModelBuilder::new("m");
        let r = b.region(b.root(), "r").unwrap();
        let init = b.initial(r).unwrap();
        let a = b.state(r, "a").unwrap();
        let c = b.choice(r, "pick").unwrap();
        let x = b.state(r, "x").unwrap();
        let y = b.state(r, "y").unwrap();
        b.transition(init, a).unwrap();
        b.transition_on(a, c, Trigger::signal("go")).unwrap();
        let t1 = b.transition(c, x).unwrap();
        b.guard(t1, guard_fn(|_| true)).unwrap();
        // Second branch also guarded — no else.
        let t2 = b.transition(c, y).unwrap();
        b.guard(t2, guard_fn(|_| false)).unwrap();
        assert!(matches!(
            b.build(),
            Err(ModelError::IncompleteChoice { .. })
        ));
    }

    #[test]
    fn unreachable_state_is_rejected() {
        let mut b = switch();
        let main = b.root();
        let r = b.region(main, "main2");
        // A fresh region whose initial exists but whose extra state is only
        // reachable by nothing.
        let r = r.unwrap();
        let init = b.initial(r).unwrap();
        let a = b.state(r, "a").unwrap();
        b.transition(init, a).unwrap();
        let _orphan = b.state(r, "orphan").unwrap();
        assert!(matches!(
            b.build(),
            Err(ModelError::UnreachableState { .. })
        ));
    }

    #[test]
    fn ambiguous_unguarded_transitions_are_rejected() {
        let mut b = switch();
        let off = b.vertices.iter().find(|v| v.name == "off").unwrap().id;
        let on = b.vertices.iter().find(|v| v.name == "on").unwrap().id;
        b.transition_on(off, on, Trigger::signal("on")).unwrap();
        assert!(matches!(
            b.build(),
            Err(ModelError::AmbiguousTransition { .. })
        ));
    }

    #[test]
    fn regions_only_attach_to_states() {
        let mut b = ModelBuilder::new("m");
        let r = b.region(b.root(), "r").unwrap();
        assert!(matches!(
            b.region(r, "nested"),
            Err(ModelError::InvalidParent { .. })
        ));
        assert!(matches!(
            b.state(b.root(), "direct"),
            Err(ModelError::InvalidParent { .. })
        ));
    }

    #[test]
    fn digest_is_stable_and_structure_sensitive() {
        let d1 = switch().build().unwrap().digest();
        let d2 = switch().build().unwrap().digest();
        assert_eq!(d1, d2);

        let mut b = switch();
        let main = b.vertices.iter().find(|v| v.name == "main").unwrap().id;
        let extra = b.state(main, "extra").unwrap();
        let off = b.vertices.iter().find(|v| v.name == "off").unwrap().id;
        b.transition_on(off, extra, Trigger::signal("x")).unwrap();
        let d3 = b.build().unwrap().digest();
        assert_ne!(d1, d3);
    }
}
