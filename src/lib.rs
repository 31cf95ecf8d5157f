//! # PipeFlow
//!
//! A lightweight orchestration engine for directed-graph workflows whose
//! nodes are small ETL units (prepare → transform → post).
//!
//! PipeFlow models a workflow as a **Graph + Shared Store**:
//! - **Node**: a retryable three-phase execution unit (sync or async)
//! - **Flow**: walks the graph along **action**-labelled edges
//! - **Store**: typed, observable shared state passed through the graph
//! - **WorkflowDB**: durable runs, events and per-step checkpoints in
//!   embedded SQLite, readable by external monitors while a run is active
//!
//! The engine carries no LLM- or HTTP-specific content; nodes call whatever
//! they like inside `exec`, and the engine supplies routing, retries,
//! lifecycle hooks, checkpoints, background execution and resume.
//!
//! ## Quick start
//!
//! ```rust
//! use pipeflow::prelude::*;
//! use serde_json::{Value, json};
//!
//! let greet = Node::new(FunctionNode::new(
//!     "Greet",
//!     |store: &Store| Ok(store.get("who")?),
//!     |who: Value| Ok(json!(format!("hello, {}", who.as_str().unwrap_or("world")))),
//!     |store: &mut Store, _prep: &Value, out: Value| {
//!         store.set("greeting", out)?;
//!         Ok(Action::default())
//!     },
//! ));
//!
//! let flow = Flow::builder(greet).flow_name("greeter").build().unwrap();
//!
//! let mut store = Store::new("demo");
//! store.set("who", json!("pipeflow")).unwrap();
//! let store = flow.run(store).unwrap();
//! assert_eq!(store.get("greeting").unwrap(), json!("hello, pipeflow"));
//! ```
//!
//! ## Execution model
//!
//! A run is single-threaded and cooperative: the scheduler executes one node
//! at a time, resolves the returned action against the node's outbound edges
//! (exact match first, then the `"*"` wildcard), checkpoints the store, and
//! advances. Background runs get one dedicated worker thread and a
//! [`RunHandle`] with live status, a blocking `wait`, and cooperative
//! cancellation checked between nodes. Async nodes may fan out internally;
//! the scheduler awaits them at a blocking boundary before moving on.

pub mod action;
pub mod builtin;
pub mod db;
pub mod flow;
pub mod node;
pub mod runner;
pub mod store;

pub use action::Action;
pub use db::{CheckpointRecord, EventRecord, RunRecord, RunStatus, WorkflowDB};
pub use flow::{Flow, FlowBuilder, Hook, HookEvent, Resume};
pub use node::{AsyncNodeBackend, FunctionNode, Node, NodeBackend, WILDCARD_ACTION};
pub use runner::RunHandle;
pub use store::{ObserverId, Store, TypeTag};

/// Boxed error type returned by user-provided node code and observers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for PipeFlow operations.
pub type PipeFlowResult<T> = Result<T, PipeFlowError>;

/// Error taxonomy for the engine.
///
/// Phase-scoped variants (`PrepFailed`, `ExecFailed`, `PostFailed`) carry the
/// node name and the original user error as their source; `ExecFailed`
/// additionally records how many attempts were made.
#[derive(Debug, thiserror::Error)]
pub enum PipeFlowError {
    /// API misuse: unknown hook name, zero `max_retries`, and similar.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A read of a key that is not present in the store.
    #[error("key not found in store: {0}")]
    MissingKey(String),

    /// A write whose value does not match the schema type for its key.
    #[error("type mismatch for key '{key}': expected {expected}, got {actual}")]
    TypeKind {
        key: String,
        expected: TypeTag,
        actual: &'static str,
    },

    /// The prep phase of a node returned an error.
    #[error("prep failed in node '{node}': {source}")]
    PrepFailed {
        node: String,
        #[source]
        source: BoxError,
    },

    /// The exec phase failed on every attempt and no fallback recovered.
    #[error("exec failed in node '{node}' after {attempts} attempt(s): {source}")]
    ExecFailed {
        node: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// The post phase of a node returned an error.
    #[error("post failed in node '{node}': {source}")]
    PostFailed {
        node: String,
        #[source]
        source: BoxError,
    },

    /// The infinite-loop guard tripped. The payload is the configured cap.
    #[error("max_steps exceeded")]
    MaxStepsExceeded(u64),

    /// Filesystem failure during snapshot, checkpoint or runtime setup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the durable run/event/checkpoint store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A snapshot or checkpoint document that does not decode.
    #[error("malformed document: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for PipeFlowError {
    fn from(err: serde_json::Error) -> Self {
        PipeFlowError::Malformed(err.to_string())
    }
}

/// Convenient re-exports for common types and traits.
pub mod prelude {
    pub use crate::action::Action;
    pub use crate::builtin::{ConditionalNode, DelayNode, LogNode, SetValueNode};
    pub use crate::db::{RunStatus, WorkflowDB};
    pub use crate::flow::{Flow, FlowBuilder, HookEvent, Resume};
    pub use crate::node::{AsyncNodeBackend, FunctionNode, Node, NodeBackend, WILDCARD_ACTION};
    pub use crate::runner::RunHandle;
    pub use crate::store::{Store, TypeTag};
    pub use crate::{BoxError, PipeFlowError, PipeFlowResult};
}
