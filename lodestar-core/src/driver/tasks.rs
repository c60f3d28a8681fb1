//! Cooperative task scheduler.
//!
//! Tasks are `!Send` futures on a [`LocalPool`] that only the driver polls.
//! They suspend on call replies and timer sleeps and are resumed by the tick
//! that delivers the event. Cancelling a task aborts it; its future, and
//! everything it owns, is dropped on the next run.
use std::{cell::RefCell, collections::HashMap, fmt, future::Future, rc::Rc};

use futures::{
    executor::{LocalPool, LocalSpawner},
    future::{AbortHandle, Abortable},
    task::LocalSpawnExt,
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::metrics;

/// Key of a spawned task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Errors returned by the scheduler
#[derive(Debug, Error)]
pub enum TaskError {
    /// the executor refused the task
    #[error("failed to spawn task: {0}")]
    Spawn(#[from] futures::task::SpawnError),
}

/// Shorthand result alias for scheduler operations.
pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Default)]
struct TaskSlots {
    next_id: u64,
    live: HashMap<TaskId, AbortHandle>,
    /// tasks that ran to completion or were aborted
    finished: usize,
}

/// Cloneable handle for spawning and cancelling tasks, usable from inside
/// tasks and processors.
#[derive(Clone)]
pub struct TaskSpawner {
    spawner: LocalSpawner,
    slots: Rc<RefCell<TaskSlots>>,
}

impl fmt::Debug for TaskSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpawner")
            .field("size", &self.size())
            .finish()
    }
}

impl TaskSpawner {
    /// Spawn `routine`; it first runs on the next scheduler run.
    pub fn spawn(&self, routine: impl Future<Output = ()> + 'static) -> TaskResult<TaskId> {
        let (abort, registration) = AbortHandle::new_pair();
        let id = {
            let mut slots = self.slots.borrow_mut();
            slots.next_id += 1;
            let id = TaskId(slots.next_id);
            slots.live.insert(id, abort);
            id
        };
        let slots = self.slots.clone();
        let task = Abortable::new(routine, registration);
        let spawned = self.spawner.spawn_local(async move {
            let outcome = task.await;
            let mut slots = slots.borrow_mut();
            slots.live.remove(&id);
            slots.finished += 1;
            trace!(?id, aborted = outcome.is_err(), "task finished");
        });
        if let Err(err) = spawned {
            self.slots.borrow_mut().live.remove(&id);
            return Err(err.into());
        }
        metrics::TASKS.inc();
        Ok(id)
    }

    /// Abort a task. Returns false if it already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.slots.borrow_mut().live.remove(&id) {
            Some(abort) => {
                debug!(?id, "task cancelled");
                abort.abort();
                true
            }
            None => false,
        }
    }

    /// count of live tasks
    pub fn size(&self) -> usize {
        self.slots.borrow().live.len()
    }

    /// Returns true if `id` is still live.
    pub fn is_live(&self, id: TaskId) -> bool {
        self.slots.borrow().live.contains_key(&id)
    }
}

/// Owns the pool; only the driver runs it.
pub struct TaskScheduler {
    pool: LocalPool,
    spawner: TaskSpawner,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("size", &self.size())
            .finish()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    /// Make an empty scheduler
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = TaskSpawner {
            spawner: pool.spawner(),
            slots: Rc::new(RefCell::new(TaskSlots::default())),
        };
        Self { pool, spawner }
    }

    /// handle for spawning
    pub fn spawner(&self) -> &TaskSpawner {
        &self.spawner
    }

    /// see [`TaskSpawner::spawn`]
    pub fn spawn(&self, routine: impl Future<Output = ()> + 'static) -> TaskResult<TaskId> {
        self.spawner.spawn(routine)
    }

    /// see [`TaskSpawner::cancel`]
    pub fn cancel(&self, id: TaskId) -> bool {
        self.spawner.cancel(id)
    }

    /// count of live tasks
    pub fn size(&self) -> usize {
        self.spawner.size()
    }

    /// Poll every ready task until none can make progress. Returns how many
    /// tasks finished in this run.
    pub fn run(&mut self) -> usize {
        let before = self.spawner.slots.borrow().finished;
        self.pool.run_until_stalled();
        let finished = self.spawner.slots.borrow().finished - before;
        if finished > 0 {
            metrics::TASKS.sub(finished as i64);
        }
        finished
    }
}
