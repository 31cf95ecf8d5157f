//! # Node System
//!
//! Nodes are the computation units of a flow. Every node runs three phases:
//!
//! 1. **prep**: read and validate input from the [`Store`]; no mutation.
//! 2. **exec**: the transform. Pure with respect to the store: it receives
//!    the prep value and returns a value for `post`. This is the only phase
//!    the retry policy applies to.
//! 3. **post**: write results back to the store and return the [`Action`]
//!    selecting the outbound edge (`"default"` when omitted). The sole
//!    sanctioned mutation point.
//!
//! A node's logic lives behind one of two capability traits:
//! [`NodeBackend`] for synchronous transforms or [`AsyncNodeBackend`] when
//! `exec` needs to await (fan-out sub-tasks, timers, network). The graph
//! vertex itself is the [`Node`] handle, which owns the backend, the retry
//! policy, and the outbound edge table, and is cheap to clone; clones share
//! the same backend and edges, which is how cycles are wired.
//!
//! ## Retry policy
//!
//! `exec` runs up to `max_retries` times. While attempts remain, a failure
//! first consults `exec_fallback`; a recovered value becomes the exec result
//! and retrying stops. Otherwise the node sleeps `retry_delay` and tries
//! again. When the final attempt fails the error surfaces as
//! [`PipeFlowError::ExecFailed`] with the node name and attempt count.
//! `prep` and `post` are never retried.

use crate::action::Action;
use crate::store::Store;
use crate::{BoxError, PipeFlowError, PipeFlowResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Reserved edge key matched when no exact action match exists.
pub const WILDCARD_ACTION: &str = "*";

/// Capability trait for synchronous nodes.
///
/// Backends take `&self`: nodes are shared across clones of their [`Node`]
/// handle and reusable across runs, so any private mutable state belongs
/// behind the backend's own lock.
pub trait NodeBackend: Send + Sync {
    /// Read and prepare input from the store. Defaults to no input.
    fn prep(&self, _store: &Store) -> Result<Value, BoxError> {
        Ok(Value::Null)
    }

    /// The transform. Must not touch the store.
    fn exec(&self, prep_value: Value) -> Result<Value, BoxError>;

    /// Write results and pick the outbound action. Defaults to `"default"`.
    fn post(
        &self,
        _store: &mut Store,
        _prep_value: &Value,
        exec_value: Value,
    ) -> Result<Action, BoxError> {
        let _ = exec_value;
        Ok(Action::default())
    }

    /// Recovery hook consulted between failed attempts. Defaults to
    /// re-raising, which lets the retry loop continue.
    fn exec_fallback(&self, _prep_value: &Value, error: BoxError) -> Result<Value, BoxError> {
        Err(error)
    }

    /// Display name. Defaults to the implementing type's name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Capability trait for nodes whose transform awaits.
///
/// Only `exec_async` (and its fallback) may suspend; `prep` and `post` stay
/// synchronous so the scheduler's transitions never do.
#[async_trait]
pub trait AsyncNodeBackend: Send + Sync {
    /// Read and prepare input from the store. Defaults to no input.
    fn prep(&self, _store: &Store) -> Result<Value, BoxError> {
        Ok(Value::Null)
    }

    /// The transform. May fan out sub-tasks; the scheduler awaits the whole
    /// call at a blocking boundary before advancing.
    async fn exec_async(&self, prep_value: Value) -> Result<Value, BoxError>;

    /// Write results and pick the outbound action. Defaults to `"default"`.
    fn post(
        &self,
        _store: &mut Store,
        _prep_value: &Value,
        exec_value: Value,
    ) -> Result<Action, BoxError> {
        let _ = exec_value;
        Ok(Action::default())
    }

    /// Recovery hook consulted between failed attempts.
    async fn exec_fallback(&self, _prep_value: &Value, error: BoxError) -> Result<Value, BoxError> {
        Err(error)
    }

    /// Display name. Defaults to the implementing type's name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

enum Backend {
    Sync(Box<dyn NodeBackend>),
    Async(Box<dyn AsyncNodeBackend>),
}

impl Backend {
    fn name(&self) -> &str {
        match self {
            Backend::Sync(b) => b.name(),
            Backend::Async(b) => b.name(),
        }
    }
}

/// Strip the module path off a type name.
fn short_type_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

/// A graph vertex: a backend plus retry policy and outbound edges.
///
/// `Node` is a cheap handle; clones share the backend and the edge table.
/// Wire edges with [`Node::then`], which returns a handle so registrations
/// chain:
///
/// ```rust
/// # use pipeflow::prelude::*;
/// # use serde_json::Value;
/// # fn backend() -> FunctionNode {
/// #     FunctionNode::new("N", |_: &Store| Ok(Value::Null), Ok, |_: &mut Store, _: &Value, _| Ok(Action::default()))
/// # }
/// let review = Node::new(backend()).with_name("review");
/// let publish = Node::new(backend()).with_name("publish");
/// let escalate = Node::new(backend()).with_name("escalate");
///
/// review.then("approved", &publish).then("*", &escalate);
/// ```
#[derive(Clone)]
pub struct Node {
    name: Arc<str>,
    max_retries: u32,
    retry_delay: Duration,
    backend: Arc<Backend>,
    edges: Arc<RwLock<HashMap<String, Node>>>,
}

impl Node {
    /// Wrap a synchronous backend. The node's name defaults to the backend's
    /// short type name.
    pub fn new(backend: impl NodeBackend + 'static) -> Self {
        let name = short_type_name(backend.name()).to_string();
        Node::from_parts(name, Backend::Sync(Box::new(backend)))
    }

    /// Wrap an async backend.
    pub fn new_async(backend: impl AsyncNodeBackend + 'static) -> Self {
        let name = short_type_name(backend.name()).to_string();
        Node::from_parts(name, Backend::Async(Box::new(backend)))
    }

    fn from_parts(name: String, backend: Backend) -> Self {
        Node {
            name: Arc::from(name.as_str()),
            max_retries: 1,
            retry_delay: Duration::ZERO,
            backend: Arc::new(backend),
            edges: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the display name (used in events, hooks and checkpoints).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into().as_str());
        self
    }

    /// Set how many times `exec` may run. Must be at least 1; a zero value
    /// is rejected with `InvalidArg` when the node first executes.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the sleep between failed `exec` attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The node's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register (or replace) the outbound edge for `action` and return a
    /// handle for chaining. `"*"` registers the wildcard edge.
    pub fn then(&self, action: impl Into<String>, next: &Node) -> Node {
        let mut edges = self
            .edges
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        edges.insert(action.into(), next.clone());
        drop(edges);
        self.clone()
    }

    /// Resolve the successor for `action`: exact match first, wildcard
    /// second, `None` when neither exists.
    pub fn next(&self, action: &str) -> Option<Node> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        edges
            .get(action)
            .cloned()
            .or_else(|| edges.get(WILDCARD_ACTION).cloned())
    }

    /// Run the three phases once, with exec retries, on the scheduler's
    /// thread. Async backends are awaited to completion on `runtime`.
    pub(crate) fn run(
        &self,
        store: &mut Store,
        runtime: &tokio::runtime::Runtime,
    ) -> PipeFlowResult<Action> {
        if self.max_retries == 0 {
            return Err(PipeFlowError::InvalidArg(format!(
                "node '{}': max_retries must be at least 1",
                self.name
            )));
        }
        match &*self.backend {
            Backend::Sync(backend) => self.run_sync(backend.as_ref(), store),
            Backend::Async(backend) => {
                runtime.block_on(self.run_async(backend.as_ref(), store))
            }
        }
    }

    fn run_sync(&self, backend: &dyn NodeBackend, store: &mut Store) -> PipeFlowResult<Action> {
        let prep_value = backend.prep(store).map_err(|source| PipeFlowError::PrepFailed {
            node: self.name.to_string(),
            source,
        })?;

        let mut attempt = 1u32;
        let exec_value = loop {
            match backend.exec(prep_value.clone()) {
                Ok(value) => break value,
                Err(error) if attempt < self.max_retries => {
                    match backend.exec_fallback(&prep_value, error) {
                        Ok(recovered) => break recovered,
                        Err(_) => {
                            debug!(node = %self.name, attempt, "exec failed; retrying");
                            if self.retry_delay > Duration::ZERO {
                                std::thread::sleep(self.retry_delay);
                            }
                            attempt += 1;
                        }
                    }
                }
                Err(source) => {
                    return Err(PipeFlowError::ExecFailed {
                        node: self.name.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        };

        backend
            .post(store, &prep_value, exec_value)
            .map_err(|source| PipeFlowError::PostFailed {
                node: self.name.to_string(),
                source,
            })
    }

    async fn run_async(
        &self,
        backend: &dyn AsyncNodeBackend,
        store: &mut Store,
    ) -> PipeFlowResult<Action> {
        let prep_value = backend.prep(store).map_err(|source| PipeFlowError::PrepFailed {
            node: self.name.to_string(),
            source,
        })?;

        let mut attempt = 1u32;
        let exec_value = loop {
            match backend.exec_async(prep_value.clone()).await {
                Ok(value) => break value,
                Err(error) if attempt < self.max_retries => {
                    match backend.exec_fallback(&prep_value, error).await {
                        Ok(recovered) => break recovered,
                        Err(_) => {
                            debug!(node = %self.name, attempt, "exec failed; retrying");
                            if self.retry_delay > Duration::ZERO {
                                tokio::time::sleep(self.retry_delay).await;
                            }
                            attempt += 1;
                        }
                    }
                }
                Err(source) => {
                    return Err(PipeFlowError::ExecFailed {
                        node: self.name.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        };

        backend
            .post(store, &prep_value, exec_value)
            .map_err(|source| PipeFlowError::PostFailed {
                node: self.name.to_string(),
                source,
            })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        let mut actions: Vec<&String> = edges.keys().collect();
        actions.sort();
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("edges", &actions)
            .finish()
    }
}

// Type aliases for the closures a FunctionNode is assembled from.
type PrepFn = Box<dyn Fn(&Store) -> Result<Value, BoxError> + Send + Sync>;
type ExecFn = Box<dyn Fn(Value) -> Result<Value, BoxError> + Send + Sync>;
type PostFn = Box<dyn Fn(&mut Store, &Value, Value) -> Result<Action, BoxError> + Send + Sync>;

/// A closure-backed synchronous node, for quick prototyping and tests.
///
/// ```rust
/// # use pipeflow::prelude::*;
/// # use serde_json::{Value, json};
/// let double = FunctionNode::new(
///     "double",
///     |store: &Store| Ok(store.get("n")?),
///     |n: Value| Ok(json!(n.as_i64().unwrap_or(0) * 2)),
///     |store: &mut Store, _prep: &Value, out: Value| {
///         store.set("n", out)?;
///         Ok(Action::default())
///     },
/// );
/// ```
pub struct FunctionNode {
    name: String,
    prep_fn: PrepFn,
    exec_fn: ExecFn,
    post_fn: PostFn,
}

impl FunctionNode {
    /// Assemble a node from its three phases.
    pub fn new<P, E, T>(name: impl Into<String>, prep: P, exec: E, post: T) -> Self
    where
        P: Fn(&Store) -> Result<Value, BoxError> + Send + Sync + 'static,
        E: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
        T: Fn(&mut Store, &Value, Value) -> Result<Action, BoxError> + Send + Sync + 'static,
    {
        FunctionNode {
            name: name.into(),
            prep_fn: Box::new(prep),
            exec_fn: Box::new(exec),
            post_fn: Box::new(post),
        }
    }
}

impl NodeBackend for FunctionNode {
    fn prep(&self, store: &Store) -> Result<Value, BoxError> {
        (self.prep_fn)(store)
    }

    fn exec(&self, prep_value: Value) -> Result<Value, BoxError> {
        (self.exec_fn)(prep_value)
    }

    fn post(
        &self,
        store: &mut Store,
        prep_value: &Value,
        exec_value: Value,
    ) -> Result<Action, BoxError> {
        (self.post_fn)(store, prep_value, exec_value)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
