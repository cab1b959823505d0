use crate::behavior::{eval_guard, ActionContext, BehaviorExecutor};
use crate::config::Configuration;
use crate::error::{BehaviorSite, RuntimeError};
use crate::events::{EventDesc, StepTrace};
use crate::model::{Model, Slot};
use crate::queue::{EventQueue, QueuedEvent, StepReply};
use crate::selector::{self, Compound, EntryOp};
use crate::timer::TimerService;
use crate::types::{
    DispatchOutcome, Event, EventKind, MachinePhase, TransitionId, VertexId, VertexKind,
};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Cloneable handle for nested dispatch: behaviors receive one in their
/// `ActionContext` and may enqueue further events without blocking the
/// current step. Events land behind whatever the settle pass still has
/// queued, preserving run-to-completion order.
#[derive(Clone)]
pub struct MachineHandle {
    queue: Arc<EventQueue>,
}

impl MachineHandle {
    /// Enqueue an event. Does not wait for the dispatching step; the step
    /// outcome is observable through the machine's trace.
    pub fn send(&self, event: Event) -> Result<(), RuntimeError> {
        self.queue.enqueue(event, None).map(|_| ())
    }

    pub(crate) fn detached(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }
}

type ObserverFn = Box<dyn Fn(&StepTrace) + Send + 'static>;

enum Ctrl {
    Stop { reply: oneshot::Sender<()> },
    Observe(ObserverFn),
}

/// Pieces handed to the driver task exactly once, at `start()`.
struct DriverSeed {
    ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    settled_tx: watch::Sender<bool>,
    snapshot_tx: watch::Sender<Vec<VertexId>>,
}

/// The state-machine interpreter facade.
///
/// One machine owns one configuration, one event queue, and one driver task;
/// several machines may run in the same process and share a frozen model.
/// All mutation happens on the driver task — the public methods only talk to
/// it through the queue and control channel, which is what serializes steps.
pub struct Machine {
    model: Arc<Model>,
    machine_id: Uuid,
    queue: Arc<EventQueue>,
    phase_tx: Arc<watch::Sender<MachinePhase>>,
    phase_rx: watch::Receiver<MachinePhase>,
    settled_rx: watch::Receiver<bool>,
    snapshot_rx: watch::Receiver<Vec<VertexId>>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    traces: Arc<StdMutex<Vec<StepTrace>>>,
    seed: StdMutex<Option<DriverSeed>>,
}

impl Machine {
    pub fn new(model: Arc<Model>) -> Self {
        let queue = Arc::new(EventQueue::new());
        let (phase_tx, phase_rx) = watch::channel(MachinePhase::Unstarted);
        let (settled_tx, settled_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        Self {
            model,
            machine_id: Uuid::now_v7(),
            queue,
            phase_tx: Arc::new(phase_tx),
            phase_rx,
            settled_rx,
            snapshot_rx,
            ctrl_tx,
            traces: Arc::new(StdMutex::new(Vec::new())),
            seed: StdMutex::new(Some(DriverSeed {
                ctrl_rx,
                settled_tx,
                snapshot_tx,
            })),
        }
    }

    pub fn machine_id(&self) -> Uuid {
        self.machine_id
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Fingerprint of the frozen model this machine interprets, for trace
    /// correlation.
    pub fn model_digest(&self) -> [u8; 32] {
        self.model.digest()
    }

    pub fn phase(&self) -> MachinePhase {
        *self.phase_rx.borrow()
    }

    /// Enter the root's initial configuration and settle. Legal only once,
    /// from `Unstarted`.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let seed = {
            let mut guard = self.seed.lock().expect("seed lock poisoned");
            match guard.take() {
                Some(seed) => seed,
                None => {
                    return Err(RuntimeError::IllegalState {
                        op: "start",
                        phase: self.phase(),
                    })
                }
            }
        };
        self.phase_tx.send_replace(MachinePhase::Starting);
        tracing::info!(machine_id = %self.machine_id, model = %self.model.name(), "starting");

        let (ready_tx, ready_rx) = oneshot::channel();
        let core = Core {
            model: self.model.clone(),
            machine_id: self.machine_id,
            config: Configuration::new(),
            queue: self.queue.clone(),
            timers: TimerService::new(self.queue.clone()),
            executor: BehaviorExecutor::new(),
            phase_tx: self.phase_tx.clone(),
            settled_tx: seed.settled_tx,
            snapshot_tx: seed.snapshot_tx,
            traces: self.traces.clone(),
            observers: Vec::new(),
            handle: MachineHandle {
                queue: self.queue.clone(),
            },
            step_seq: 0,
        };
        tokio::spawn(core.run(seed.ctrl_rx, ready_tx));
        ready_rx.await.map_err(|_| RuntimeError::QueueClosed)?
    }

    /// Enqueue an event and await the outcome of the step that consumes it.
    /// Behavior failures in that step surface here.
    pub async fn send(&self, event: Event) -> Result<DispatchOutcome, RuntimeError> {
        let phase = self.phase();
        if !matches!(phase, MachinePhase::Starting | MachinePhase::Running) {
            return Err(RuntimeError::IllegalState { op: "send", phase });
        }
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(event, Some(tx))?;
        rx.await.map_err(|_| RuntimeError::QueueClosed)?
    }

    /// Cancel in-flight behaviors, discard the queue, and unwind the active
    /// configuration outer-to-inner.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let phase = self.phase();
        if !matches!(phase, MachinePhase::Starting | MachinePhase::Running) {
            return Err(RuntimeError::IllegalState { op: "stop", phase });
        }
        let (tx, rx) = oneshot::channel();
        self.ctrl_tx
            .send(Ctrl::Stop { reply: tx })
            .map_err(|_| RuntimeError::QueueClosed)?;
        rx.await.map_err(|_| RuntimeError::QueueClosed)
    }

    /// Resolves when the queue is empty and no step is in flight. Idempotent:
    /// a second call without an intervening `send` observes no extra step.
    pub async fn await_settled(&self) -> Result<(), RuntimeError> {
        let phase = self.phase();
        if phase == MachinePhase::Unstarted {
            return Err(RuntimeError::IllegalState {
                op: "await_settled",
                phase,
            });
        }
        let mut rx = self.settled_rx.clone();
        let queue = self.queue.clone();
        // An event enqueued between steps makes the machine unsettled even
        // before the driver wakes up to run it.
        rx.wait_for(|settled| *settled && queue.is_empty())
            .await
            .map_err(|_| RuntimeError::QueueClosed)?;
        Ok(())
    }

    /// Snapshot of the active leaves after the most recent step.
    pub fn state(&self) -> Vec<VertexId> {
        self.snapshot_rx.borrow().clone()
    }

    /// Active leaves as dotted model paths, for diagnostics.
    pub fn state_paths(&self) -> Vec<String> {
        self.state()
            .into_iter()
            .map(|v| self.model.path(v))
            .collect()
    }

    /// Subscribe to step-completion notifications. The callback runs on the
    /// driver task after each step with the step's trace record.
    pub fn observe(
        &self,
        callback: impl Fn(&StepTrace) + Send + 'static,
    ) -> Result<(), RuntimeError> {
        self.ctrl_tx
            .send(Ctrl::Observe(Box::new(callback)))
            .map_err(|_| RuntimeError::QueueClosed)
    }

    /// All step traces recorded so far.
    pub fn trace(&self) -> Vec<StepTrace> {
        self.traces.lock().expect("trace lock poisoned").clone()
    }
}

// ─── Driver ───────────────────────────────────────────────────

enum StepFlow {
    Continue,
    Terminated,
}

#[derive(Default)]
struct StepJournal {
    started_activities: Vec<VertexId>,
    timers_armed: Vec<VertexId>,
    timers_cancelled: Vec<VertexId>,
}

struct Core {
    model: Arc<Model>,
    machine_id: Uuid,
    config: Configuration,
    queue: Arc<EventQueue>,
    timers: TimerService,
    executor: BehaviorExecutor,
    phase_tx: Arc<watch::Sender<MachinePhase>>,
    settled_tx: watch::Sender<bool>,
    snapshot_tx: watch::Sender<Vec<VertexId>>,
    traces: Arc<StdMutex<Vec<StepTrace>>>,
    observers: Vec<ObserverFn>,
    handle: MachineHandle,
    step_seq: u64,
}

impl Core {
    async fn run(
        mut self,
        mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
        ready_tx: oneshot::Sender<Result<(), RuntimeError>>,
    ) {
        match self.start_sequence().await {
            Ok(StepFlow::Continue) => {
                self.phase_tx.send_replace(MachinePhase::Running);
                self.settled_tx.send_replace(true);
                let _ = ready_tx.send(Ok(()));
            }
            Ok(StepFlow::Terminated) => {
                self.finish_terminated().await;
                let _ = ready_tx.send(Ok(()));
                return;
            }
            Err(err) => {
                self.teardown().await;
                self.phase_tx.send_replace(MachinePhase::Stopped);
                self.settled_tx.send_replace(true);
                let _ = ready_tx.send(Err(err));
                return;
            }
        }

        loop {
            if let StepFlow::Terminated = self.drain().await {
                self.finish_terminated().await;
                return;
            }
            // Handle buffered control messages before reporting settled so
            // observers registered between steps never miss the next one.
            loop {
                match ctrl_rx.try_recv() {
                    Ok(Ctrl::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Ok(Ctrl::Observe(f)) => self.observers.push(f),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    // Machine handle dropped: unwind as if stopped.
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.shutdown().await;
                        return;
                    }
                }
            }
            self.settled_tx.send_replace(true);
            tokio::select! {
                _ = self.queue.notified() => {
                    self.settled_tx.send_replace(false);
                }
                ctrl = ctrl_rx.recv() => match ctrl {
                    Some(Ctrl::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(Ctrl::Observe(f)) => {
                        self.observers.push(f);
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    /// Enter the root configuration and settle all cascaded completions.
    async fn start_sequence(&mut self) -> Result<StepFlow, RuntimeError> {
        let mut trace = StepTrace::new(self.step_seq, EventDesc::Start);
        self.step_seq += 1;
        let event = Arc::new(Event::signal("@start"));
        let mut journal = StepJournal::default();

        let root = self.model.root();
        self.config.enter(root, &self.model);
        if let Some(b) = self.model.behavior(root, Slot::Entry) {
            let b = b.clone();
            self.executor
                .run(BehaviorSite::Entry(root), &b, self.ctx(&event))
                .await?;
        }
        let compound = Compound {
            primary: TransitionId(0),
            kind: crate::types::TransitionKind::External,
            segments: Vec::new(),
            sources: Vec::new(),
            targets: Vec::new(),
            domain: Some(root),
            exit_set: Vec::new(),
            terminate: false,
        };
        let ops = selector::entry_ops(&self.model, &self.config, &compound);
        let entered = self
            .apply_entry_ops(&ops, &event, &mut trace, &mut journal)
            .await?;
        self.emit_completions(&entered, &mut trace);
        self.finish_trace(trace);
        Ok(self.drain().await)
    }

    async fn drain(&mut self) -> StepFlow {
        while let Some(queued) = self.queue.pop() {
            if let StepFlow::Terminated = self.run_step(queued).await {
                return StepFlow::Terminated;
            }
        }
        StepFlow::Continue
    }

    fn ctx(&self, event: &Arc<Event>) -> ActionContext {
        ActionContext {
            event: event.clone(),
            machine: self.handle.clone(),
        }
    }

    fn reply(reply: &mut Option<StepReply>, outcome: Result<DispatchOutcome, RuntimeError>) {
        if let Some(tx) = reply.take() {
            let _ = tx.send(outcome);
        }
    }

    /// One run-to-completion step: select, exit, effect, enter, complete.
    async fn run_step(&mut self, queued: QueuedEvent) -> StepFlow {
        let QueuedEvent { event, mut reply } = queued;
        let event = Arc::new(event);
        let mut trace = StepTrace::new(self.step_seq, EventDesc::from(&*event));
        self.step_seq += 1;

        // Stale timer wakes are discarded before selection.
        if let EventKind::TimeElapsed { source, arming, .. } = event.kind {
            if !self.timers.is_live(source, arming) {
                trace.dropped = Some(event.id);
                self.finish_trace(trace);
                Self::reply(&mut reply, Ok(DispatchOutcome::Dropped));
                return StepFlow::Continue;
            }
        }

        let plan = {
            let model = self.model.clone();
            let ev = event.clone();
            let mut eval = move |t: TransitionId| match model.guard(t) {
                Some(g) => eval_guard(t, g.as_ref(), &ev),
                None => Ok(true),
            };
            match selector::select(&self.model, &self.config, &event, &mut eval) {
                Ok(plan) => plan,
                Err(err) => {
                    trace.dropped = Some(event.id);
                    self.finish_trace(trace);
                    Self::reply(&mut reply, Err(err));
                    return StepFlow::Continue;
                }
            }
        };

        if plan.is_empty() {
            let outcome = if let Some(owner) = self.deferral_owner(&event) {
                trace.deferred = Some(event.id);
                self.queue.defer(
                    owner,
                    QueuedEvent {
                        event: (*event).clone(),
                        reply: None,
                    },
                );
                DispatchOutcome::Deferred
            } else {
                trace.dropped = Some(event.id);
                DispatchOutcome::Dropped
            };
            self.finish_trace(trace);
            Self::reply(&mut reply, Ok(outcome));
            return StepFlow::Continue;
        }

        // A terminate pseudostate halts the machine: effects of the chain
        // are committed, no exit or entry behaviors run.
        if let Some(compound) = plan.iter().find(|c| c.terminate) {
            for &seg in &compound.segments {
                if let Some(effect) = self.model.effect(seg) {
                    let effect = effect.clone();
                    if let Err(err) = self
                        .executor
                        .run(BehaviorSite::Effect(seg), &effect, self.ctx(&event))
                        .await
                    {
                        self.finish_trace(trace);
                        Self::reply(&mut reply, Err(err));
                        return StepFlow::Continue;
                    }
                }
                trace.effects.push(seg);
            }
            self.finish_trace(trace);
            Self::reply(&mut reply, Ok(DispatchOutcome::Terminated));
            return StepFlow::Terminated;
        }

        let outcome = self
            .execute_plan(&plan, &event, &mut trace)
            .await
            .map(|()| DispatchOutcome::Transitioned);
        self.finish_trace(trace);
        Self::reply(&mut reply, outcome);
        StepFlow::Continue
    }

    /// Steps 3–10 of the run-to-completion algorithm. On a behavior failure
    /// the pre-step configuration is restored and the error is returned.
    async fn execute_plan(
        &mut self,
        plan: &[Compound],
        event: &Arc<Event>,
        trace: &mut StepTrace,
    ) -> Result<(), RuntimeError> {
        let snapshot = self.config.clone();
        let mut journal = StepJournal::default();
        let exit_set = selector::exit_union(&self.model, plan);

        self.record_histories(&exit_set);

        // Cancel do-activities of everything leaving, awaiting each
        // acknowledgement, before any exit behavior runs.
        for &v in &exit_set {
            self.executor.cancel_activity(v).await;
        }

        // Exits, inner-to-outer.
        for &v in &exit_set {
            let kind = self.model.vertex(v).kind.clone();
            if kind.is_state() {
                if let Some(b) = self.model.behavior(v, Slot::Exit) {
                    let b = b.clone();
                    if let Err(err) = self
                        .executor
                        .run(BehaviorSite::Exit(v), &b, self.ctx(event))
                        .await
                    {
                        self.abort_step(snapshot, &journal).await;
                        return Err(err);
                    }
                }
                self.timers.cancel_for(v);
                journal.timers_cancelled.push(v);
            }
            self.config.exit(v, &self.model);
            if matches!(kind, VertexKind::State { .. } | VertexKind::Final) {
                trace.exited.push(v);
            }
        }

        // Effects, in selection order.
        for compound in plan {
            for &seg in &compound.segments {
                if let Some(effect) = self.model.effect(seg) {
                    let effect = effect.clone();
                    if let Err(err) = self
                        .executor
                        .run(BehaviorSite::Effect(seg), &effect, self.ctx(event))
                        .await
                    {
                        self.abort_step(snapshot, &journal).await;
                        return Err(err);
                    }
                }
                trace.effects.push(seg);
            }
        }

        // Entries, outer-to-inner per compound.
        let mut entered: Vec<VertexId> = Vec::new();
        for compound in plan {
            let ops = selector::entry_ops(&self.model, &self.config, compound);
            match self.apply_entry_ops(&ops, event, trace, &mut journal).await {
                Ok(newly) => entered.extend(newly),
                Err(err) => {
                    self.abort_step(snapshot, &journal).await;
                    return Err(err);
                }
            }
        }

        // Deferred events owned by exited states go back to the queue head.
        self.queue.release_deferred(&exit_set);

        self.emit_completions(&entered, trace);
        Ok(())
    }

    /// Execute an entry sequence: enter vertices outer-to-inner, run entry
    /// behaviors, start do-activities, arm timers. Returns entered states.
    async fn apply_entry_ops(
        &mut self,
        ops: &[EntryOp],
        event: &Arc<Event>,
        trace: &mut StepTrace,
        journal: &mut StepJournal,
    ) -> Result<Vec<VertexId>, RuntimeError> {
        let mut entered = Vec::new();
        for op in ops {
            match *op {
                EntryOp::Effect(t) => {
                    if let Some(effect) = self.model.effect(t) {
                        let effect = effect.clone();
                        self.executor
                            .run(BehaviorSite::Effect(t), &effect, self.ctx(event))
                            .await?;
                    }
                    trace.effects.push(t);
                }
                EntryOp::Enter(v) => {
                    self.config.enter(v, &self.model);
                    let kind = self.model.vertex(v).kind.clone();
                    match kind {
                        VertexKind::State { .. } => {
                            if let Some(b) = self.model.behavior(v, Slot::Entry) {
                                let b = b.clone();
                                self.executor
                                    .run(BehaviorSite::Entry(v), &b, self.ctx(event))
                                    .await?;
                            }
                            if let Some(activity) = self.model.behavior(v, Slot::DoActivity) {
                                self.executor.start_activity(
                                    v,
                                    activity.clone(),
                                    self.ctx(event),
                                    self.queue.clone(),
                                );
                                journal.started_activities.push(v);
                            }
                            let model = self.model.clone();
                            self.timers.schedule_for(&model, v);
                            journal.timers_armed.push(v);
                            trace.entered.push(v);
                            entered.push(v);
                        }
                        VertexKind::Final => {
                            trace.entered.push(v);
                            entered.push(v);
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(entered)
    }

    /// Restore the pre-step configuration after a failed behavior. Work done
    /// by already-completed behaviors stays committed; activities and timers
    /// started by this step are cancelled, and timers of states that remain
    /// active are re-armed.
    async fn abort_step(&mut self, snapshot: Configuration, journal: &StepJournal) {
        for &v in &journal.started_activities {
            self.executor.cancel_activity(v).await;
        }
        for &v in &journal.timers_armed {
            self.timers.cancel_for(v);
        }
        self.config = snapshot;
        let model = self.model.clone();
        for &v in &journal.timers_cancelled {
            if self.config.is_active(v) {
                self.timers.schedule_for(&model, v);
            }
        }
    }

    /// Record history snapshots for every region about to lose its active
    /// child. A region resting in its final state clears its history so the
    /// next history entry falls back to the default.
    fn record_histories(&mut self, exit_set: &[VertexId]) {
        for idx in 0..self.model.vertex_count() {
            let h = VertexId(idx as u32);
            let kind = &self.model.vertex(h).kind;
            let deep = match kind {
                VertexKind::ShallowHistory => false,
                VertexKind::DeepHistory => true,
                _ => continue,
            };
            let Some(region) = self.model.parent(h) else {
                continue;
            };
            let Some(child) = self
                .model
                .children(region)
                .iter()
                .copied()
                .find(|&c| self.config.is_active(c))
            else {
                continue;
            };
            if !exit_set.contains(&child) {
                continue;
            }
            if self.model.vertex(child).kind == VertexKind::Final {
                self.config.clear_history(h);
            } else if deep {
                let leaves: Vec<VertexId> = self
                    .config
                    .active_leaves(&self.model)
                    .into_iter()
                    .filter(|&l| l == child || self.model.is_descendant(l, child))
                    .collect();
                self.config.record_history(h, leaves);
            } else {
                self.config.record_history(h, vec![child]);
            }
        }
    }

    /// Innermost active state whose deferral patterns match the event.
    fn deferral_owner(&self, event: &Event) -> Option<VertexId> {
        let mut candidates: Vec<VertexId> = self
            .config
            .active_set()
            .filter(|&v| {
                self.model
                    .vertex(v)
                    .deferrals
                    .iter()
                    .any(|p| p.matches(&event.kind))
            })
            .collect();
        candidates.sort_by_key(|&v| std::cmp::Reverse(self.model.depth(v)));
        candidates.first().copied()
    }

    /// Step 10: completion events for entered leaves that finished their
    /// work immediately, then for composites whose regions are all final,
    /// innermost first.
    fn emit_completions(&mut self, entered: &[VertexId], trace: &mut StepTrace) {
        for &v in entered {
            if self.model.is_leaf_state(v)
                && !self.executor.has_activity(v)
                && self
                    .model
                    .transitions_out(v)
                    .iter()
                    .any(|&t| self.model.transition(t).trigger.is_none())
                && self.config.claim_completion(v)
            {
                let _ = self.queue.enqueue_completion(v);
            }
        }

        let mut composites: Vec<VertexId> = self
            .config
            .active_set()
            .filter(|&v| !self.model.regions(v).is_empty())
            .collect();
        composites.sort_by_key(|&v| std::cmp::Reverse(self.model.depth(v)));
        for v in composites {
            if self.config.composite_completed(&self.model, v) && self.config.claim_completion(v) {
                let _ = self.queue.enqueue_completion(v);
                trace.completions.push(v);
            }
        }
    }

    fn finish_trace(&mut self, mut trace: StepTrace) {
        self.executor.reap_finished();
        trace.active = self.config.active_leaves(&self.model);
        self.snapshot_tx.send_replace(trace.active.clone());
        tracing::debug!(
            machine_id = %self.machine_id,
            seq = trace.seq,
            exited = trace.exited.len(),
            entered = trace.entered.len(),
            completions = trace.completions.len(),
            dropped = trace.dropped.is_some(),
            "step"
        );
        for observer in &self.observers {
            observer(&trace);
        }
        self.traces
            .lock()
            .expect("trace lock poisoned")
            .push(trace);
    }

    async fn teardown(&mut self) {
        self.executor.cancel_all().await;
        self.timers.cancel_all();
        self.queue.close();
    }

    /// Terminate pseudostate: the machine halts without running exit
    /// behaviors.
    async fn finish_terminated(&mut self) {
        tracing::info!(machine_id = %self.machine_id, "terminated");
        self.phase_tx.send_replace(MachinePhase::Stopping);
        self.teardown().await;
        self.config.clear();
        self.snapshot_tx.send_replace(Vec::new());
        self.phase_tx.send_replace(MachinePhase::Stopped);
        self.settled_tx.send_replace(true);
    }

    /// `stop()`: cancel behaviors, discard the queue, then unwind the active
    /// states outer-to-inner running their exit behaviors.
    async fn shutdown(&mut self) {
        tracing::info!(machine_id = %self.machine_id, "stopping");
        self.phase_tx.send_replace(MachinePhase::Stopping);
        self.teardown().await;

        let mut active: Vec<VertexId> = self
            .config
            .active_set()
            .filter(|&v| self.model.vertex(v).kind.is_state())
            .collect();
        active.sort_by(|&a, &b| {
            self.model
                .depth(a)
                .cmp(&self.model.depth(b))
                .then(a.cmp(&b))
        });
        let event = Arc::new(Event::signal("@stop"));
        for v in active {
            if let Some(b) = self.model.behavior(v, Slot::Exit) {
                let b = b.clone();
                if let Err(err) = self
                    .executor
                    .run(BehaviorSite::Exit(v), &b, self.ctx(&event))
                    .await
                {
                    tracing::warn!(machine_id = %self.machine_id, state = %v, error = %err, "exit behavior failed during stop");
                }
            }
        }
        self.config.clear();
        self.snapshot_tx.send_replace(Vec::new());
        self.phase_tx.send_replace(MachinePhase::Stopped);
        self.settled_tx.send_replace(true);
    }
}
