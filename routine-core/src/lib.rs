//! Routine execution core: process-model navigation, intermediate
//! event semantics, and the run orchestration loop.
//!
//! A routine is a parsed [`model::ProcessModel`] (sequential step list
//! or BPMN-style flow graph). The [`navigator`] walks it, the
//! [`intermediate`] handler owns throw/catch event nodes (timers,
//! signals, messages, errors, links, conditionals), and the
//! [`executor`] drives the loop: it runs actionable steps through an
//! external [`executor::StepExecutor`] under per-step resource
//! allocation, persists state through a [`store::ContextStore`], and
//! appends every transition to the run's event log.
//!
//! ```rust
//! use routine_core::model::{Element, ElementKind, Flow, ModelDialect, ProcessModel};
//!
//! let model = ProcessModel::new(
//!     "hello",
//!     ModelDialect::Bpmn,
//!     vec![
//!         Element::new("start", ElementKind::StartEvent),
//!         Element::new("greet", ElementKind::Task),
//!         Element::new("end", ElementKind::EndEvent),
//!     ],
//!     vec![
//!         Flow::new("f1", "start", "greet"),
//!         Flow::new("f2", "greet", "end"),
//!     ],
//! )?;
//! assert_eq!(model.start_element().unwrap().id, "start");
//! # Ok::<(), routine_core::types::EngineError>(())
//! ```

// Shared scalar and record types, error taxonomy
pub mod types;

// Parsed process models and load-time validation
pub mod model;

// Run-scoped mutable state: variables, event log, inboxes
pub mod context;

// Durable audit trail entries
pub mod events;

// Intermediate event dispatch (throw/catch semantics)
pub mod intermediate;

// Model walking, one navigator per dialect
pub mod navigator;

// Persistence trait and the in-memory backend
pub mod store;

// The orchestration loop
pub mod executor;

pub use context::ExecutionContext;
pub use events::RuntimeEvent;
pub use executor::{ExecutorConfig, RoutineExecutor, RunResult};
pub use intermediate::{
    complete_intermediate_event, handle_intermediate_event, pending_intermediate_events,
    EventResult,
};
pub use model::ProcessModel;
pub use navigator::{navigator_for, Navigator};
pub use store::{ContextStore, MemoryStore};
pub use types::{
    EngineError, EventInstance, EventKind, Location, LocationKind, Role, RunRecord, RunStatus,
};
