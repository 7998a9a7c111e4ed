//! Bounded pool of tokio tasks used for the container fan-out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Raised when the pool does not drain before its deadline.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("worker pool did not drain within {}s", deadline.as_secs())]
pub struct PoolDeadlineElapsed {
    /// Deadline that elapsed.
    pub deadline: Duration,
}

/// A set of tasks executing in parallel, at most `parallelism` at a time.
///
/// Each task owns its inputs; the pool shares nothing mutable between them.
#[derive(Debug)]
pub struct WorkerPool<T> {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool running up to `parallelism` tasks concurrently. A zero
    /// size is raised to one.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Spawns `task`; it starts once a slot is free.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.tasks.spawn(async move {
            // The semaphore is never closed, so the permit is always granted.
            let _permit = semaphore.acquire_owned().await;
            task.await
        });
    }

    /// Number of tasks not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` when every task has been joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every task, in completion order, for at most `deadline`.
    ///
    /// A task that panicked is reported as `Err` with the panic message. When
    /// the deadline expires, outstanding tasks are detached: they keep
    /// running, but their output is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PoolDeadlineElapsed`] when the deadline expires first.
    pub async fn join_within(
        mut self,
        deadline: Duration,
    ) -> Result<Vec<Result<T, String>>, PoolDeadlineElapsed> {
        let drained = timeout(deadline, drain(&mut self.tasks)).await;
        drained.map_err(|_| {
            self.tasks.detach_all();
            PoolDeadlineElapsed { deadline }
        })
    }
}

async fn drain<T: 'static>(tasks: &mut JoinSet<T>) -> Vec<Result<T, String>> {
    let mut outputs = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        outputs.push(joined.map_err(|err| err.to_string()));
    }
    outputs
}
