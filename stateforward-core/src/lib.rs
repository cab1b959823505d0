//! StateForward — a runtime for hierarchical, concurrent state machines in
//! the style of UML state charts.
//!
//! A frozen [`model::Model`] (built with [`model::ModelBuilder`]) is
//! interpreted by a [`interpreter::Machine`]: events are dispatched through a
//! run-to-completion scheduler that selects the maximal consistent transition
//! set, executes exit/effect/entry behaviors in order, emits completion
//! events, and settles until no further progress is possible.
//!
//! ```no_run
//! use stateforward_core::{Event, Machine, ModelBuilder, Trigger};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut b = ModelBuilder::new("light");
//! let main = b.region(b.root(), "main")?;
//! let init = b.initial(main)?;
//! let off = b.state(main, "off")?;
//! let on = b.state(main, "on")?;
//! b.transition(init, off)?;
//! b.transition_on(off, on, Trigger::signal("toggle"))?;
//! b.transition_on(on, off, Trigger::signal("toggle"))?;
//! let model = b.build()?;
//!
//! let machine = Machine::new(model);
//! machine.start().await?;
//! machine.send(Event::signal("toggle")).await?;
//! assert_eq!(machine.state_paths(), vec!["main.on".to_string()]);
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod config;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod model;
mod queue;
mod selector;
mod timer;
pub mod types;

pub use behavior::{from_fn, guard_fn, ActionContext, Behavior, Guard};
pub use config::Configuration;
pub use error::{BehaviorSite, BoxError, ModelError, RuntimeError};
pub use events::{EventDesc, StepTrace};
pub use interpreter::{Machine, MachineHandle};
pub use model::{Model, ModelBuilder, Slot};
pub use types::{
    DispatchOutcome, Event, EventId, EventKind, MachinePhase, Transition, TransitionId,
    TransitionKind, Trigger, Vertex, VertexId, VertexKind,
};
