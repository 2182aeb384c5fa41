use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tracing::error;

/// Outputs of one batch run through a [`WorkPool`], in completion order.
#[derive(Debug)]
pub struct WorkResults<T> {
    pub outputs: Vec<T>,
    /// Tasks that panicked. Their output is lost, the others are unaffected.
    pub panicked: usize,
}

impl<T> WorkResults<T> {
    fn record(&mut self, name: &'static str, joined: Result<T, JoinError>) {
        match joined {
            Ok(output) => self.outputs.push(output),
            Err(err) => {
                error!(pool = name, "task failed to complete: {err}");
                self.panicked += 1;
            }
        }
    }
}

/// Fixed-size pool for per-key work. At most `workers` tasks of a batch are
/// spawned at once and [`WorkPool::run`] returns once every task is done.
#[derive(Debug, Clone, Copy)]
pub struct WorkPool {
    workers: usize,
}

impl WorkPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Futures are pulled from `tasks` only as slots free up, so a large
    /// batch never holds more than `workers` spawned tasks.
    pub async fn run<T, Fut, I>(&self, name: &'static str, tasks: I) -> WorkResults<T>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut results = WorkResults {
            outputs: Vec::new(),
            panicked: 0,
        };
        let mut running = JoinSet::new();
        for task in tasks {
            if running.len() >= self.workers {
                if let Some(joined) = running.join_next().await {
                    results.record(name, joined);
                }
            }
            running.spawn(task);
        }
        while let Some(joined) = running.join_next().await {
            results.record(name, joined);
        }
        results
    }
}

impl Default for WorkPool {
    fn default() -> Self {
        Self::new(20)
    }
}
