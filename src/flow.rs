//! # Flow Orchestration
//!
//! A [`Flow`] composes [`Node`]s into a directed graph and walks it: run the
//! current node's three phases, resolve the returned action against the
//! node's edges (exact match, then the `"*"` wildcard), persist a
//! checkpoint, advance. The walk ends when no successor exists, when the
//! `max_steps` guard trips, or when a background run is cancelled.
//!
//! Every run is identified by `"<flow_name>-<8-hex-random>"` and leaves a
//! durable trail in [`WorkflowDB`] when a `db_path` is configured: a
//! `pf_runs` row, a `pf_events` log bracketed by `flow_start` and one of
//! `flow_end`/`flow_error`/`flow_cancel`, and one checkpoint per completed
//! step. With a `checkpoint_dir` each step also writes a JSON snapshot named
//! `step_{step:03}_{NodeName}.json`.
//!
//! ## Hooks
//!
//! Five lifecycle events can carry caller callbacks, registered by name with
//! [`Flow::on`]: `flow_start`, `node_start`, `node_end`, `node_error`,
//! `flow_end`. Unknown names are rejected with `InvalidArg`. Hooks run
//! synchronously on the run's thread, in registration order.
//!
//! ## Foreground and background
//!
//! [`Flow::run`] executes on the calling thread and returns the final store.
//! [`Flow::run_background`] starts one dedicated worker thread and returns a
//! [`RunHandle`] with live status, a blocking `wait`, and cooperative
//! cancellation (checked between nodes; an executing node finishes first).

use crate::action::Action;
use crate::db::{unix_now, RunStatus, WorkflowDB};
use crate::node::Node;
use crate::runner::RunHandle;
use crate::store::Store;
use crate::{PipeFlowError, PipeFlowResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default cap on steps per run, the sole guard against graph cycles.
pub const DEFAULT_MAX_STEPS: u64 = 1000;

/// A registered lifecycle callback.
pub type Hook = Arc<dyn Fn(&HookEvent<'_>) + Send + Sync>;

/// Payload handed to lifecycle hooks.
#[derive(Debug)]
pub enum HookEvent<'a> {
    /// The run is about to execute its first node.
    FlowStart { flow_name: &'a str, store: &'a Store },
    /// A node is about to run.
    NodeStart { name: &'a str, store: &'a Store },
    /// A node completed; its checkpoint is already durable.
    NodeEnd {
        name: &'a str,
        action: &'a Action,
        elapsed: Duration,
        store: &'a Store,
    },
    /// A node failed; the run is about to be marked failed.
    NodeError {
        name: &'a str,
        error: &'a PipeFlowError,
        store: &'a Store,
    },
    /// The run terminated naturally.
    FlowEnd { total_steps: u64, store: &'a Store },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    FlowStart,
    NodeStart,
    NodeEnd,
    NodeError,
    FlowEnd,
}

impl HookKind {
    fn parse(name: &str) -> PipeFlowResult<Self> {
        match name {
            "flow_start" => Ok(HookKind::FlowStart),
            "node_start" => Ok(HookKind::NodeStart),
            "node_end" => Ok(HookKind::NodeEnd),
            "node_error" => Ok(HookKind::NodeError),
            "flow_end" => Ok(HookKind::FlowEnd),
            other => Err(PipeFlowError::InvalidArg(format!(
                "unknown hook event '{other}'"
            ))),
        }
    }

    fn of(event: &HookEvent<'_>) -> Self {
        match event {
            HookEvent::FlowStart { .. } => HookKind::FlowStart,
            HookEvent::NodeStart { .. } => HookKind::NodeStart,
            HookEvent::NodeEnd { .. } => HookKind::NodeEnd,
            HookEvent::NodeError { .. } => HookKind::NodeError,
            HookEvent::FlowEnd { .. } => HookKind::FlowEnd,
        }
    }
}

#[derive(Default)]
struct HookRegistry {
    flow_start: Vec<Hook>,
    node_start: Vec<Hook>,
    node_end: Vec<Hook>,
    node_error: Vec<Hook>,
    flow_end: Vec<Hook>,
}

impl HookRegistry {
    fn list(&self, kind: HookKind) -> &Vec<Hook> {
        match kind {
            HookKind::FlowStart => &self.flow_start,
            HookKind::NodeStart => &self.node_start,
            HookKind::NodeEnd => &self.node_end,
            HookKind::NodeError => &self.node_error,
            HookKind::FlowEnd => &self.flow_end,
        }
    }

    fn list_mut(&mut self, kind: HookKind) -> &mut Vec<Hook> {
        match kind {
            HookKind::FlowStart => &mut self.flow_start,
            HookKind::NodeStart => &mut self.node_start,
            HookKind::NodeEnd => &mut self.node_end,
            HookKind::NodeError => &mut self.node_error,
            HookKind::FlowEnd => &mut self.flow_end,
        }
    }
}

/// Where a resumed run begins: the node to execute next and the checkpoint
/// index its first step is recorded under.
#[derive(Clone, Debug)]
pub struct Resume {
    pub node: Node,
    pub step: u64,
}

impl Resume {
    /// Resume at `node`, numbering checkpoints from 0.
    pub fn new(node: Node) -> Self {
        Resume { node, step: 0 }
    }

    /// Resume at `node`, numbering checkpoints from `step`, typically one
    /// past the checkpoint the store was loaded from.
    pub fn at_step(node: Node, step: u64) -> Self {
        Resume { node, step }
    }
}

pub(crate) struct FlowInner {
    pub(crate) start: Node,
    pub(crate) name: String,
    pub(crate) db: Option<WorkflowDB>,
    checkpoint_dir: Option<PathBuf>,
    max_steps: u64,
    hooks: RwLock<HookRegistry>,
    runtime: tokio::runtime::Runtime,
}

/// Builder for [`Flow`].
pub struct FlowBuilder {
    start: Node,
    name: Option<String>,
    db_path: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
    max_steps: u64,
}

impl FlowBuilder {
    /// Name the flow (also the `run_id` prefix). Defaults to the start
    /// node's name.
    pub fn flow_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Persist runs, events and checkpoints to the database at `path`.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Additionally write one JSON snapshot file per completed step.
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Cap the number of steps per run (default 1000).
    pub fn max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Open the database (if configured), build the runtime and freeze the
    /// flow.
    pub fn build(self) -> PipeFlowResult<Flow> {
        let db = match &self.db_path {
            Some(path) => Some(WorkflowDB::open(path)?),
            None => None,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("pipeflow-node")
            .build()?;
        let name = self
            .name
            .unwrap_or_else(|| self.start.name().to_string());
        Ok(Flow {
            inner: Arc::new(FlowInner {
                start: self.start,
                name,
                db,
                checkpoint_dir: self.checkpoint_dir,
                max_steps: self.max_steps,
                hooks: RwLock::new(HookRegistry::default()),
                runtime,
            }),
        })
    }
}

/// The directed-graph scheduler.
///
/// A `Flow` is reusable serially: each call to [`Flow::run`] (or each
/// background handle) is an independent run with its own `run_id`.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

impl Flow {
    /// Start building a flow from its entry node.
    pub fn builder(start: Node) -> FlowBuilder {
        FlowBuilder {
            start,
            name: None,
            db_path: None,
            checkpoint_dir: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Build a flow with defaults: no persistence, `max_steps` 1000.
    pub fn new(start: Node) -> PipeFlowResult<Flow> {
        Flow::builder(start).build()
    }

    /// The flow's name (the `run_id` prefix).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The database handle, when `db_path` was configured.
    pub fn db(&self) -> Option<&WorkflowDB> {
        self.inner.db.as_ref()
    }

    /// Register a lifecycle hook. Valid names: `flow_start`, `node_start`,
    /// `node_end`, `node_error`, `flow_end`; anything else is `InvalidArg`.
    pub fn on<F>(&self, event: &str, hook: F) -> PipeFlowResult<&Self>
    where
        F: Fn(&HookEvent<'_>) + Send + Sync + 'static,
    {
        let kind = HookKind::parse(event)?;
        let mut hooks = self
            .inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        hooks.list_mut(kind).push(Arc::new(hook));
        Ok(self)
    }

    /// Run to completion on the calling thread and return the final store.
    pub fn run(&self, store: Store) -> PipeFlowResult<Store> {
        self.run_from(store, None)
    }

    /// Run on the calling thread, optionally resuming from a node instead of
    /// the configured start.
    pub fn run_from(&self, mut store: Store, resume: Option<Resume>) -> PipeFlowResult<Store> {
        let run_id = new_run_id(&self.inner.name);
        let cancel = AtomicBool::new(false);
        drive(&self.inner, &run_id, &mut store, resume, &cancel)?;
        Ok(store)
    }

    /// Start a background run and return its supervisor handle immediately.
    pub fn run_background(&self, store: Store) -> PipeFlowResult<RunHandle> {
        self.run_background_from(store, None)
    }

    /// Background variant of [`Flow::run_from`].
    pub fn run_background_from(
        &self,
        store: Store,
        resume: Option<Resume>,
    ) -> PipeFlowResult<RunHandle> {
        RunHandle::spawn(Arc::clone(&self.inner), store, resume)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.inner.name)
            .field("start", &self.inner.start.name())
            .field("max_steps", &self.inner.max_steps)
            .field("persistent", &self.inner.db.is_some())
            .finish()
    }
}

/// `"<flow_name>-<8-hex-random>"`, globally unique per run.
pub(crate) fn new_run_id(flow_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", flow_name, &suffix[..8])
}

fn emit(inner: &FlowInner, event: HookEvent<'_>) {
    let hooks: Vec<Hook> = {
        let registry = inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        registry.list(HookKind::of(&event)).clone()
    };
    for hook in hooks {
        hook(&event);
    }
}

fn checkpoint_file_name(step: u64, node_name: &str) -> String {
    format!("step_{step:03}_{node_name}.json")
}

/// How a run ended without raising.
pub(crate) enum Outcome {
    Completed { steps: u64 },
    Cancelled { steps: u64 },
}

enum Termination {
    Finished,
    Cancelled,
    CapHit,
}

/// The scheduler loop. Single-threaded per run; `cancel` is consulted only
/// between nodes.
pub(crate) fn drive(
    inner: &FlowInner,
    run_id: &str,
    store: &mut Store,
    resume: Option<Resume>,
    cancel: &AtomicBool,
) -> PipeFlowResult<Outcome> {
    if let Some(db) = &inner.db {
        db.create_run(run_id, &inner.name, unix_now())?;
        db.insert_event(run_id, "flow_start", None, None, None, None)?;
    }
    emit(inner, HookEvent::FlowStart {
        flow_name: &inner.name,
        store: &*store,
    });
    debug!(run_id, flow = %inner.name, "flow started");

    let (mut current, mut step) = match resume {
        Some(resume) => (Some(resume.node), resume.step),
        None => (Some(inner.start.clone()), 0),
    };
    let first_step = step;
    let mut last_action: Option<Action> = None;

    let termination = loop {
        if cancel.load(Ordering::SeqCst) {
            break Termination::Cancelled;
        }
        let Some(node) = current.clone() else {
            break Termination::Finished;
        };
        if step >= inner.max_steps {
            break Termination::CapHit;
        }

        if let Some(db) = &inner.db {
            db.insert_event(run_id, "node_start", Some(node.name()), None, None, None)?;
        }
        emit(inner, HookEvent::NodeStart {
            name: node.name(),
            store: &*store,
        });
        let started = Instant::now();

        match node.run(store, &inner.runtime) {
            Err(error) => {
                emit(inner, HookEvent::NodeError {
                    name: node.name(),
                    error: &error,
                    store: &*store,
                });
                if let Some(db) = &inner.db {
                    let cause = error.to_string();
                    db.insert_event(
                        run_id,
                        "flow_error",
                        Some(node.name()),
                        None,
                        None,
                        Some(&cause),
                    )?;
                    db.update_run_status(
                        run_id,
                        RunStatus::Failed,
                        Some(unix_now()),
                        step,
                        Some(&cause),
                    )?;
                }
                debug!(run_id, node = node.name(), %error, "flow failed");
                return Err(error);
            }
            Ok(action) => {
                let elapsed = started.elapsed();

                // The checkpoint row and the node_end event land in one
                // transaction; a reader that sees the event sees the step.
                if let Some(db) = &inner.db {
                    let store_json = store.to_json()?;
                    db.record_step(
                        run_id,
                        step,
                        node.name(),
                        &store_json,
                        action.as_str(),
                        elapsed.as_secs_f64() * 1000.0,
                    )?;
                }
                if let Some(dir) = &inner.checkpoint_dir {
                    store.snapshot(dir.join(checkpoint_file_name(step, node.name())))?;
                }

                emit(inner, HookEvent::NodeEnd {
                    name: node.name(),
                    action: &action,
                    elapsed,
                    store: &*store,
                });
                debug!(run_id, node = node.name(), action = %action, step, "node completed");

                current = node.next(action.as_str());
                last_action = Some(action);
                step += 1;
            }
        }
    };

    match termination {
        Termination::Cancelled => {
            if let Some(db) = &inner.db {
                db.insert_event(run_id, "flow_cancel", None, None, None, None)?;
                db.update_run_status(run_id, RunStatus::Cancelled, Some(unix_now()), step, None)?;
            }
            debug!(run_id, steps = step, "flow cancelled");
            Ok(Outcome::Cancelled { steps: step })
        }
        Termination::CapHit if step > first_step => {
            let error = PipeFlowError::MaxStepsExceeded(inner.max_steps);
            if let Some(db) = &inner.db {
                let cause = error.to_string();
                db.insert_event(run_id, "flow_error", None, None, None, Some(&cause))?;
                db.update_run_status(
                    run_id,
                    RunStatus::Failed,
                    Some(unix_now()),
                    step,
                    Some(&cause),
                )?;
            }
            debug!(run_id, steps = step, "max_steps exceeded");
            Err(error)
        }
        // Natural end, or the degenerate cap that executed nothing
        // (max_steps = 0, or resuming at an index already past the cap).
        Termination::Finished | Termination::CapHit => {
            if let Some(db) = &inner.db {
                db.insert_event(
                    run_id,
                    "flow_end",
                    None,
                    last_action.as_ref().map(Action::as_str),
                    None,
                    None,
                )?;
                db.update_run_status(run_id, RunStatus::Completed, Some(unix_now()), step, None)?;
            }
            emit(inner, HookEvent::FlowEnd {
                total_steps: step,
                store: &*store,
            });
            debug!(run_id, steps = step, "flow completed");
            Ok(Outcome::Completed { steps: step })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FunctionNode;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn append_node(name: &str, suffix: &str, action: &str) -> Node {
        let suffix = suffix.to_string();
        let action = action.to_string();
        Node::new(FunctionNode::new(
            name,
            |store: &Store| Ok(store.get("text").unwrap_or(json!(""))),
            move |text: Value| {
                Ok(json!(format!(
                    "{}{}",
                    text.as_str().unwrap_or_default(),
                    suffix
                )))
            },
            move |store: &mut Store, _prep: &Value, out: Value| {
                store.set("text", out)?;
                Ok(Action::new(action.clone()))
            },
        ))
    }

    #[test]
    fn test_unknown_hook_name_is_invalid_arg() {
        let flow = Flow::new(append_node("A", "!", "done")).unwrap();
        assert!(matches!(
            flow.on("node_done", |_| {}),
            Err(PipeFlowError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_hooks_fire_in_registration_order() {
        let a = append_node("A", "!", "done");
        let flow = Flow::new(a).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            flow.on("node_start", move |_| {
                order.lock().unwrap().push(tag);
            })
            .unwrap();
        }

        flow.run(Store::new("s")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_flow_name_defaults_to_start_node() {
        let flow = Flow::new(append_node("Entry", "!", "done")).unwrap();
        assert_eq!(flow.name(), "Entry");
    }

    #[test]
    fn test_empty_action_routes_like_default() {
        let a = append_node("A", "x", "");
        let b = append_node("B", "y", "done");
        a.then("default", &b);

        let flow = Flow::new(a).unwrap();
        let store = flow.run(Store::new("s")).unwrap();
        assert_eq!(store.get("text").unwrap(), json!("xy"));
    }

    #[test]
    fn test_run_id_shape() {
        let run_id = new_run_id("myflow");
        let suffix = run_id.strip_prefix("myflow-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checkpoint_file_name_padding() {
        assert_eq!(checkpoint_file_name(7, "Fetch"), "step_007_Fetch.json");
        assert_eq!(checkpoint_file_name(1234, "Fetch"), "step_1234_Fetch.json");
    }

    #[test]
    fn test_flow_is_reusable_serially() {
        let flow = Flow::new(append_node("A", "!", "done")).unwrap();
        let first = flow.run(Store::new("s")).unwrap();
        let second = flow.run(Store::new("s")).unwrap();
        assert_eq!(first.get("text").unwrap(), second.get("text").unwrap());
    }
}
