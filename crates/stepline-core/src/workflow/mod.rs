//! Workflow subsystem: graph validation, condition evaluation, step
//! execution, the instance engine, and trigger dispatch.
//!
//! # Module layout
//!
//! - `graph` - publish-time invariant validation over the step graph
//! - `expression` - the restricted guard/filter expression language
//! - `store` - versioned definition storage (publish / get / archive)
//! - `step` - step executors and the outbound intent sink
//! - `engine` - the per-instance execution engine
//! - `trigger` - dispatches manual, scheduled, event, and condition triggers

pub mod engine;
pub mod expression;
pub mod graph;
pub mod step;
pub mod store;
pub mod trigger;

pub use engine::{EngineError, ExecutionEngine};
pub use expression::{EvalContext, EvalError};
pub use graph::Violation;
pub use step::{ExecutorOutcome, Intent, IntentSink, StepRunner, TracingIntentSink};
pub use store::{DefinitionStore, StoreError, load_draft, parse_draft, validate_draft};
pub use trigger::{TriggerDispatcher, TriggerError};
