use crate::config::Configuration;
use crate::error::RuntimeError;
use crate::model::Model;
use crate::types::{
    Event, EventKind, Transition, TransitionId, TransitionKind, Trigger, VertexId, VertexKind,
};
use std::collections::BTreeSet;

/// Guard evaluation callback. The interpreter maps missing guards to `true`
/// and performs the single-poll purity check.
pub(crate) type GuardEval<'a> = dyn FnMut(TransitionId) -> Result<bool, RuntimeError> + 'a;

/// A selected transition after pseudostate expansion: the full set of
/// exited sources (join partners included), the resolved real-state targets
/// (several for forks, a history vertex until entry resolves it), and every
/// traversed segment in effect order.
#[derive(Clone, Debug)]
pub(crate) struct Compound {
    pub primary: TransitionId,
    pub kind: TransitionKind,
    /// Effect execution order: primary, join partners, continuations.
    pub segments: Vec<TransitionId>,
    pub sources: Vec<VertexId>,
    pub targets: Vec<VertexId>,
    /// Transition domain: entry and exit happen strictly below this vertex.
    /// `None` for internal transitions.
    pub domain: Option<VertexId>,
    /// Exited vertices, inner-to-outer (regions included).
    pub exit_set: Vec<VertexId>,
    /// Set when the chain reached a terminate pseudostate.
    pub terminate: bool,
}

/// One step of the entry sequence: enter a vertex, or run the effect of a
/// continuation segment (initial or history-default transition) at its
/// position in the cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryOp {
    Enter(VertexId),
    Effect(TransitionId),
}

// ─── Selection ────────────────────────────────────────────────

fn trigger_matches(tr: &Transition, event: &Event) -> bool {
    match (&tr.trigger, &event.kind) {
        (None, EventKind::Completion { state }) => *state == tr.source,
        (
            Some(Trigger::After(d)),
            EventKind::TimeElapsed {
                source, after_ms, ..
            },
        ) => tr.source == *source && d.as_millis() as u64 == *after_ms,
        (Some(trig), kind) => trig.matches(kind),
        (None, _) => false,
    }
}

/// Ranking key for timed edges: a wake enables every `after(Δ)` edge whose
/// deadline it represents, and the smallest Δ wins before declaration order
/// breaks the remaining ties.
fn after_delay(tr: &Transition) -> u64 {
    match &tr.trigger {
        Some(Trigger::After(d)) => d.as_millis() as u64,
        _ => 0,
    }
}

/// Compute the maximal consistent transition set for `event` against the
/// current configuration.
///
/// Candidates are ranked inner-first (deeper source wins a conflict), ties
/// broken by declaration order. Two transitions conflict when their exit
/// sets intersect; transitions in different orthogonal regions never
/// conflict and all fire in the same step. An empty result means no
/// transition is enabled — the interpreter then checks deferral.
pub(crate) fn select(
    model: &Model,
    config: &Configuration,
    event: &Event,
    eval: &mut GuardEval<'_>,
) -> Result<Vec<Compound>, RuntimeError> {
    let mut candidates: Vec<TransitionId> = Vec::new();
    for v in config.active_set() {
        if !model.vertex(v).kind.is_state() {
            continue;
        }
        for &t in model.transitions_out(v) {
            if trigger_matches(model.transition(t), event) {
                candidates.push(t);
            }
        }
    }
    candidates.sort_by(|&a, &b| {
        let ta = model.transition(a);
        let tb = model.transition(b);
        model
            .depth(tb.source)
            .cmp(&model.depth(ta.source))
            .then(after_delay(ta).cmp(&after_delay(tb)))
            .then(a.cmp(&b))
    });

    let mut compounds: Vec<Compound> = Vec::new();
    let mut claimed: BTreeSet<VertexId> = BTreeSet::new();

    for t in candidates {
        let tr = model.transition(t);
        if claimed.contains(&tr.source) {
            continue;
        }
        if !eval(t)? {
            continue;
        }
        let Some(exp) = expand(model, config, event, eval, t)? else {
            continue;
        };
        let domain = domain_of(model, tr.kind, &exp);
        let exit_set = match domain {
            Some(d) => exit_set_below(model, config, d),
            None => Vec::new(),
        };
        // Internal transitions exit nothing but still occupy their source
        // for conflict purposes.
        let conflict: Vec<VertexId> = if tr.kind == TransitionKind::Internal {
            vec![tr.source]
        } else {
            exit_set.clone()
        };
        if conflict.iter().any(|v| claimed.contains(v)) {
            continue;
        }
        claimed.extend(conflict);
        compounds.push(Compound {
            primary: t,
            kind: tr.kind,
            segments: exp.segments,
            sources: exp.sources,
            targets: exp.targets,
            domain,
            exit_set,
            terminate: exp.terminate,
        });
    }
    Ok(compounds)
}

struct Expansion {
    segments: Vec<TransitionId>,
    sources: Vec<VertexId>,
    targets: Vec<VertexId>,
    terminate: bool,
}

fn expand(
    model: &Model,
    config: &Configuration,
    event: &Event,
    eval: &mut GuardEval<'_>,
    primary: TransitionId,
) -> Result<Option<Expansion>, RuntimeError> {
    let tr = model.transition(primary);
    let mut exp = Expansion {
        segments: vec![primary],
        sources: vec![tr.source],
        targets: Vec::new(),
        terminate: false,
    };
    if tr.kind == TransitionKind::Internal {
        return Ok(Some(exp));
    }
    if follow(model, config, event, eval, primary, tr.target, &mut exp)? {
        Ok(Some(exp))
    } else {
        Ok(None)
    }
}

/// Continue a chosen transition through pseudostates until real states are
/// reached. Choice and junction branches are picked by the first passing
/// guard in declaration order; history resolution is deferred to entry time
/// so it observes the configuration recorded by this step's exits.
fn follow(
    model: &Model,
    config: &Configuration,
    event: &Event,
    eval: &mut GuardEval<'_>,
    via: TransitionId,
    vertex: VertexId,
    exp: &mut Expansion,
) -> Result<bool, RuntimeError> {
    match &model.vertex(vertex).kind {
        VertexKind::State { .. }
        | VertexKind::Final
        | VertexKind::ShallowHistory
        | VertexKind::DeepHistory => {
            exp.targets.push(vertex);
            Ok(true)
        }
        VertexKind::Terminate => {
            exp.terminate = true;
            Ok(true)
        }
        VertexKind::Choice | VertexKind::Junction | VertexKind::Initial => {
            for &t in model.transitions_out(vertex) {
                if eval(t)? {
                    exp.segments.push(t);
                    return follow(model, config, event, eval, t, model.transition(t).target, exp);
                }
            }
            // A choice always has an else branch; a junction with no passing
            // guard disables the whole compound.
            Ok(false)
        }
        VertexKind::Fork => {
            for &t in model.transitions_out(vertex) {
                exp.segments.push(t);
                if !follow(model, config, event, eval, t, model.transition(t).target, exp)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        VertexKind::Join => {
            for &u in model.transitions_in(vertex) {
                if u == via {
                    continue;
                }
                let ut = model.transition(u);
                if !config.is_active(ut.source) {
                    return Ok(false);
                }
                if let Some(trig) = &ut.trigger {
                    if !trig.matches(&event.kind) {
                        return Ok(false);
                    }
                }
                if !eval(u)? {
                    return Ok(false);
                }
                exp.segments.push(u);
                exp.sources.push(ut.source);
            }
            let out = model.transitions_out(vertex)[0];
            if !eval(out)? {
                return Ok(false);
            }
            exp.segments.push(out);
            follow(model, config, event, eval, out, model.transition(out).target, exp)
        }
        VertexKind::Region => Ok(false),
    }
}

// ─── Exit/entry set computation ───────────────────────────────

/// Lowest common proper ancestor of the whole endpoint set.
fn lcpa(model: &Model, set: &[VertexId]) -> Option<VertexId> {
    let first = *set.first()?;
    let mut chain = model.ancestors(first);
    chain.retain(|&a| {
        set.iter()
            .all(|&v| a != v && (v == first || model.is_descendant(v, a)))
    });
    chain.last().copied()
}

/// The transition domain: exit and entry happen strictly below it. External
/// transitions use the lowest common proper ancestor of source and targets;
/// local transitions use the composite that contains both endpoints.
fn domain_of(model: &Model, kind: TransitionKind, exp: &Expansion) -> Option<VertexId> {
    if kind == TransitionKind::Internal {
        return None;
    }
    let mut endpoints: Vec<VertexId> = exp.sources.clone();
    endpoints.extend(exp.targets.iter().copied());

    if kind == TransitionKind::Local && exp.sources.len() == 1 {
        let s = exp.sources[0];
        if model.vertex(s).kind.is_state()
            && !exp.targets.is_empty()
            && exp.targets.iter().all(|&t| model.is_descendant(t, s))
        {
            return Some(s);
        }
        if let [t] = exp.targets.as_slice() {
            if model.vertex(*t).kind.is_state() && model.is_descendant(s, *t) {
                return Some(*t);
            }
        }
    }
    lcpa(model, &endpoints)
}

/// Active vertices strictly below `domain`, ordered inner-to-outer.
fn exit_set_below(model: &Model, config: &Configuration, domain: VertexId) -> Vec<VertexId> {
    let mut xs: Vec<VertexId> = config
        .active_set()
        .filter(|&v| model.is_descendant(v, domain))
        .collect();
    xs.sort_by(|&a, &b| model.depth(b).cmp(&model.depth(a)).then(a.cmp(&b)));
    xs
}

/// Union of per-compound exit sets, deduplicated, inner-to-outer.
pub(crate) fn exit_union(model: &Model, compounds: &[Compound]) -> Vec<VertexId> {
    let mut seen: BTreeSet<VertexId> = BTreeSet::new();
    let mut xs: Vec<VertexId> = Vec::new();
    for c in compounds {
        for &v in &c.exit_set {
            if seen.insert(v) {
                xs.push(v);
            }
        }
    }
    xs.sort_by(|&a, &b| model.depth(b).cmp(&model.depth(a)).then(a.cmp(&b)));
    xs
}

/// Compute the entry sequence for one compound, outer-to-inner. Composites
/// entered without an explicit target in one of their regions cascade
/// through the region's initial pseudostate; history targets restore the
/// recorded configuration or fall back to their default transition.
pub(crate) fn entry_ops(model: &Model, config: &Configuration, compound: &Compound) -> Vec<EntryOp> {
    let mut ops = Vec::new();
    if compound.kind == TransitionKind::Internal || compound.terminate {
        return ops;
    }
    let Some(domain) = compound.domain else {
        return ops;
    };
    match &model.vertex(domain).kind {
        VertexKind::Region => {
            enter_region(model, config, domain, &compound.targets, &mut ops);
        }
        VertexKind::State { regions } => {
            for &r in regions.clone().iter() {
                ops.push(EntryOp::Enter(r));
                let sub: Vec<VertexId> = compound
                    .targets
                    .iter()
                    .copied()
                    .filter(|&t| model.is_descendant(t, r))
                    .collect();
                enter_region(model, config, r, &sub, &mut ops);
            }
        }
        _ => {}
    }
    ops
}

/// Entry into a region whose `Enter` op (if it was exited) has already been
/// recorded by the caller.
fn enter_region(
    model: &Model,
    config: &Configuration,
    region: VertexId,
    targets: &[VertexId],
    ops: &mut Vec<EntryOp>,
) {
    if targets.is_empty() {
        let init = model
            .initial_of(region)
            .expect("frozen model: region without initial");
        let t0 = model.transitions_out(init)[0];
        ops.push(EntryOp::Effect(t0));
        descend_toward(model, config, region, &[model.transition(t0).target], ops);
        return;
    }

    // A history target owned by this region restores the recorded
    // configuration, falling back to its default transition, then to the
    // region's initial.
    if let [h] = targets {
        let kind = &model.vertex(*h).kind;
        if matches!(kind, VertexKind::ShallowHistory | VertexKind::DeepHistory)
            && model.parent(*h) == Some(region)
        {
            match config.recorded_history(*h) {
                Some(recorded) if !recorded.is_empty() => {
                    let recorded = recorded.to_vec();
                    descend_toward(model, config, region, &recorded, ops);
                }
                _ => match model.transitions_out(*h).first() {
                    Some(&t0) => {
                        ops.push(EntryOp::Effect(t0));
                        descend_toward(model, config, region, &[model.transition(t0).target], ops);
                    }
                    None => enter_region(model, config, region, &[], ops),
                },
            }
            return;
        }
    }

    descend_toward(model, config, region, targets, ops);
}

fn descend_toward(
    model: &Model,
    config: &Configuration,
    region: VertexId,
    targets: &[VertexId],
    ops: &mut Vec<EntryOp>,
) {
    let child = model
        .children(region)
        .iter()
        .copied()
        .find(|&c| {
            targets
                .iter()
                .all(|&t| t == c || model.is_descendant(t, c))
        })
        .expect("frozen model: entry target outside its region");
    descend(model, config, child, targets, ops);
}

fn descend(
    model: &Model,
    config: &Configuration,
    v: VertexId,
    targets: &[VertexId],
    ops: &mut Vec<EntryOp>,
) {
    ops.push(EntryOp::Enter(v));
    let below: Vec<VertexId> = targets
        .iter()
        .copied()
        .filter(|&t| model.is_descendant(t, v))
        .collect();
    let regions = model.regions(v).to_vec();
    for r in regions {
        ops.push(EntryOp::Enter(r));
        let sub: Vec<VertexId> = below
            .iter()
            .copied()
            .filter(|&t| model.is_descendant(t, r))
            .collect();
        enter_region(model, config, r, &sub, ops);
    }
}
