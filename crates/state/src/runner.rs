//! Execution task runners
//!
//! A runner accepts or rejects a task immediately and never blocks the
//! caller. The result is handed to the completion callback, which is expected
//! to post it back into the caller's event queue rather than touch any
//! consensus state itself.

use crate::error::{RunnerError, StateError};
use crate::processor::{run_task, VmResult, VmTask};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Completion callback of an execution task
pub type TaskCallback = Box<dyn FnOnce(Result<VmResult, StateError>) + Send + 'static>;

/// Runs execution tasks asynchronously
pub trait TaskRunner: Send + Sync {
    fn submit(&self, task: VmTask, on_finish: TaskCallback) -> Result<(), RunnerError>;
}

/// Runs tasks on tokio's blocking pool, bounded by a number of permits
pub struct BlockingRunner {
    permits: Arc<Semaphore>,
    max_tasks: usize,
    handle: tokio::runtime::Handle,
}

impl BlockingRunner {
    /// Create a runner bound to the current tokio runtime
    pub fn new(max_tasks: usize) -> Result<Self, RunnerError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| RunnerError::NoRuntime)?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_tasks)),
            max_tasks,
            handle,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskRunner for BlockingRunner {
    fn submit(&self, task: VmTask, on_finish: TaskCallback) -> Result<(), RunnerError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| RunnerError::Busy(self.max_tasks))?;

        tracing::trace!(
            state_index = task.state_index(),
            requests = task.requests.len(),
            "Execution task submitted"
        );
        self.handle.spawn_blocking(move || {
            let _permit = permit;
            on_finish(run_task(&task));
        });
        Ok(())
    }
}

/// Runs tasks synchronously on the submitting thread
///
/// Deterministic; used by simulations and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineRunner;

impl TaskRunner for InlineRunner {
    fn submit(&self, task: VmTask, on_finish: TaskCallback) -> Result<(), RunnerError> {
        on_finish(run_task(&task));
        Ok(())
    }
}
