use crate::error::{BehaviorSite, RuntimeError};
use crate::interpreter::MachineHandle;
use crate::queue::EventQueue;
use crate::types::{Event, TransitionId, VertexId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// Context handed to every user behavior: the triggering event and a handle
/// to the owning machine for nested dispatch.
#[derive(Clone)]
pub struct ActionContext {
    pub event: Arc<Event>,
    pub machine: MachineHandle,
}

/// An opaque user behavior: entry, exit, transition effect, or do-activity.
///
/// Behaviors run as cooperative tasks. They may suspend at await points;
/// between suspensions the interpreter does not preempt them. A cancelled
/// do-activity is aborted at its next suspension point; side effects up to
/// that point are committed, and scoped resources are released by drop.
#[async_trait]
pub trait Behavior: Send + Sync {
    async fn call(&self, ctx: ActionContext) -> anyhow::Result<()>;
}

/// A transition guard. Guards must be pure and synchronous: the selector
/// polls the guard exactly once, and a guard that suspends is rejected with
/// `GuardImpure`.
#[async_trait]
pub trait Guard: Send + Sync {
    async fn test(&self, event: &Event) -> bool;
}

// ─── Closure adapters ─────────────────────────────────────────

struct FnBehavior<F>(F);

#[async_trait]
impl<F, Fut> Behavior for FnBehavior<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn call(&self, ctx: ActionContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a behavior handle.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Behavior>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnBehavior(f))
}

struct FnGuard<F>(F);

#[async_trait]
impl<F> Guard for FnGuard<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    async fn test(&self, event: &Event) -> bool {
        (self.0)(event)
    }
}

/// Wrap a synchronous predicate as a guard handle.
pub fn guard_fn<F>(f: F) -> Arc<dyn Guard>
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Arc::new(FnGuard(f))
}

// ─── Guard evaluation ─────────────────────────────────────────

/// Evaluate a guard by polling its future exactly once with a noop waker.
/// `Poll::Pending` means the guard tried to suspend.
pub(crate) fn eval_guard(
    transition: TransitionId,
    guard: &dyn Guard,
    event: &Event,
) -> Result<bool, RuntimeError> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fut = guard.test(event);
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(v) => Ok(v),
        Poll::Pending => Err(RuntimeError::GuardImpure { transition }),
    }
}

// ─── Executor ─────────────────────────────────────────────────

/// Runs entry/exit/effect behaviors inline within the step and owns spawned
/// do-activity tasks for the duration of their execution.
pub(crate) struct BehaviorExecutor {
    running: HashMap<VertexId, JoinHandle<()>>,
}

impl BehaviorExecutor {
    pub fn new() -> Self {
        Self {
            running: HashMap::new(),
        }
    }

    /// Run a short behavior (entry, exit, or effect) to completion within
    /// the current step. Failures are mapped by the caller's `site`.
    pub async fn run(
        &self,
        site: BehaviorSite,
        behavior: &Arc<dyn Behavior>,
        ctx: ActionContext,
    ) -> Result<(), RuntimeError> {
        behavior.call(ctx).await.map_err(|err| {
            let source = err.into();
            match site {
                BehaviorSite::Exit(_) => RuntimeError::StepAborted { site, source },
                _ => RuntimeError::BehaviorFailed { site, source },
            }
        })
    }

    /// Spawn a do-activity alongside the stable configuration. When the
    /// activity runs to completion on its own, the state's completion event
    /// is enqueued; a failure is logged and completes nothing.
    pub fn start_activity(
        &mut self,
        state: VertexId,
        behavior: Arc<dyn Behavior>,
        ctx: ActionContext,
        queue: Arc<EventQueue>,
    ) {
        let handle = tokio::spawn(async move {
            match behavior.call(ctx).await {
                Ok(()) => {
                    // QueueClosed here means the machine is already stopping.
                    let _ = queue.enqueue_completion(state);
                }
                Err(err) => {
                    tracing::warn!(state = %state, error = %err, "do-activity failed");
                }
            }
        });
        if let Some(old) = self.running.insert(state, handle) {
            old.abort();
        }
    }

    pub fn has_activity(&self, state: VertexId) -> bool {
        self.running.contains_key(&state)
    }

    /// Cancel the do-activity of `state`, if any, and await its
    /// acknowledgement before returning.
    pub async fn cancel_activity(&mut self, state: VertexId) {
        if let Some(handle) = self.running.remove(&state) {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Cancel everything in flight. Used by `stop()` and terminate handling.
    pub async fn cancel_all(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Drop the bookkeeping for activities that finished on their own.
    pub fn reap_finished(&mut self) {
        self.running.retain(|_, handle| !handle.is_finished());
    }
}
