//! # Background Runs
//!
//! [`RunHandle`] supervises exactly one background execution of a flow. The
//! run happens on a dedicated worker thread; the handle stays with the
//! caller and exposes:
//!
//! - `status()`: a live read of `pf_runs.status` when the flow persists to
//!   a database, so an external monitor and the caller see the same thing;
//! - `wait(timeout)`: block until the run finishes, returning the final
//!   store (`None` on timeout or failure);
//! - `cancel()`: flip the cooperative cancellation flag. The scheduler
//!   checks it between nodes; a node already executing runs to completion;
//! - `error()`: the captured failure once the status is `failed`.
//!
//! The worker shares nothing with the caller beyond the handle's
//! synchronised completion slot and the final store. The thread is detached:
//! process exit does not wait for it.

use crate::db::{RunStatus, WorkflowDB};
use crate::flow::{drive, new_run_id, FlowInner, Outcome, Resume};
use crate::store::Store;
use crate::{PipeFlowError, PipeFlowResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct HandleState {
    finished: bool,
    status: RunStatus,
    store: Option<Store>,
    error: Option<Arc<PipeFlowError>>,
}

struct HandleShared {
    state: Mutex<HandleState>,
    done: Condvar,
}

impl HandleShared {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervisor for one background run.
pub struct RunHandle {
    run_id: String,
    db: Option<WorkflowDB>,
    cancel: Arc<AtomicBool>,
    shared: Arc<HandleShared>,
}

impl RunHandle {
    pub(crate) fn spawn(
        inner: Arc<FlowInner>,
        mut store: Store,
        resume: Option<Resume>,
    ) -> PipeFlowResult<RunHandle> {
        let run_id = new_run_id(&inner.name);
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(HandleShared {
            state: Mutex::new(HandleState::default()),
            done: Condvar::new(),
        });

        let handle = RunHandle {
            run_id: run_id.clone(),
            db: inner.db.clone(),
            cancel: Arc::clone(&cancel),
            shared: Arc::clone(&shared),
        };

        std::thread::Builder::new()
            .name(format!("pipeflow-{run_id}"))
            .spawn(move || {
                let result = drive(&inner, &run_id, &mut store, resume, &cancel);
                let mut state = shared.lock();
                match result {
                    Ok(Outcome::Completed { steps }) => {
                        debug!(run_id, steps, "background run completed");
                        state.status = RunStatus::Completed;
                        state.store = Some(store);
                    }
                    Ok(Outcome::Cancelled { steps }) => {
                        debug!(run_id, steps, "background run cancelled");
                        state.status = RunStatus::Cancelled;
                        state.store = Some(store);
                    }
                    Err(error) => {
                        debug!(run_id, %error, "background run failed");
                        state.status = RunStatus::Failed;
                        state.error = Some(Arc::new(error));
                    }
                }
                state.finished = true;
                drop(state);
                shared.done.notify_all();
            })?;

        Ok(handle)
    }

    /// This run's identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current run status. Reads `pf_runs` live when the flow persists to a
    /// database; before the worker has written its row (or without a
    /// database) the handle's own state answers.
    pub fn status(&self) -> RunStatus {
        if let Some(db) = &self.db {
            if let Ok(Some(run)) = db.get_run(&self.run_id) {
                return run.status;
            }
        }
        self.shared.lock().status
    }

    /// Whether the worker has finished (in any terminal state).
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// Block until the run finishes or `timeout` elapses.
    ///
    /// Returns the final store on completion or cancellation (the store as
    /// of the last completed step); `None` on timeout or failure. A
    /// failure is retrievable via [`RunHandle::error`].
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Store> {
        let guard = self.shared.lock();
        let state = match timeout {
            None => self
                .shared
                .done
                .wait_while(guard, |state| !state.finished)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (state, _timed_out) = self
                    .shared
                    .done
                    .wait_timeout_while(guard, timeout, |state| !state.finished)
                    .unwrap_or_else(PoisonError::into_inner);
                state
            }
        };
        if state.finished {
            state.store.clone()
        } else {
            None
        }
    }

    /// Request cooperative cancellation. Safe to call repeatedly; the
    /// scheduler honours it between nodes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// The captured failure, once the run has failed.
    pub fn error(&self) -> Option<Arc<PipeFlowError>> {
        self.shared.lock().error.clone()
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("finished", &state.finished)
            .field("status", &state.status)
            .finish()
    }
}
