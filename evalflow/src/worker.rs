//! Queue consumer running pipeline runs concurrently.
//!
//! Requests arrive on a `tokio::sync::mpsc` channel. Each request becomes
//! one orchestrated run on its own task, with at most `concurrency` runs in
//! flight. A failed run is counted and logged; it is not retried as a whole.

use crate::config::WorkerConfig;
use crate::pipeline::PipelineOrchestrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

/// A request to run the pipeline once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest<T> {
    /// The run identifier, also the key of the status record.
    pub run_id: String,
    /// The first stage's input.
    pub input: T,
}

impl<T> RunRequest<T> {
    /// Creates a request with a caller-chosen run id.
    pub fn new(run_id: impl Into<String>, input: T) -> Self {
        Self {
            run_id: run_id.into(),
            input,
        }
    }

    /// Creates a request with a freshly generated run id.
    pub fn generated(input: T) -> Self {
        Self::new(Uuid::new_v4().to_string(), input)
    }
}

/// Tally of settled runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Runs that completed, with or without fallback.
    pub completed: usize,
    /// Runs that completed only thanks to a fallback value.
    pub fell_back: usize,
    /// Runs that failed or panicked.
    pub failed: usize,
}

impl WorkerStats {
    /// Total runs settled.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

type Settled = (String, Result<bool, String>);

/// Runs queued requests through a shared orchestrator.
pub struct WorkerPool<T: Send + 'static> {
    orchestrator: Arc<PipelineOrchestrator<T>>,
    concurrency: usize,
    queue_name: String,
    channel_capacity: usize,
}

impl<T> WorkerPool<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a pool; a concurrency or channel capacity of zero is raised
    /// to one.
    #[must_use]
    pub fn new(orchestrator: Arc<PipelineOrchestrator<T>>, config: &WorkerConfig) -> Self {
        Self {
            orchestrator,
            concurrency: config.concurrency.max(1),
            queue_name: config.queue_name.clone(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    /// Returns the maximum number of concurrent runs.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the name of the consumed queue.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Returns the capacity of the request channel opened by [`spawn`](Self::spawn).
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Starts consuming on a background task.
    ///
    /// The request channel holds `channel_capacity` pending requests. The
    /// pool stops once every sender is dropped and the in-flight runs
    /// settle; the join handle yields the final tally.
    #[must_use]
    pub fn spawn(self) -> (mpsc::Sender<RunRequest<T>>, JoinHandle<WorkerStats>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Consumes requests until the channel closes and all runs settle.
    pub async fn run(self, mut requests: mpsc::Receiver<RunRequest<T>>) -> WorkerStats {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut runs: JoinSet<Settled> = JoinSet::new();
        let mut stats = WorkerStats::default();

        info!(
            queue = %self.queue_name,
            concurrency = self.concurrency,
            "Worker started"
        );

        while let Some(request) = requests.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                warn!(run_id = %request.run_id, "Worker semaphore closed; dropping request");
                break;
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            runs.spawn(async move {
                let _permit = permit;
                let RunRequest { run_id, input } = request;
                let result = orchestrator
                    .run(run_id.clone(), input)
                    .await
                    .map(|output| output.used_fallback())
                    .map_err(|err| err.to_string());
                (run_id, result)
            });

            while let Some(settled) = runs.try_join_next() {
                tally(&mut stats, settled);
            }
        }

        while let Some(settled) = runs.join_next().await {
            tally(&mut stats, settled);
        }

        info!(
            queue = %self.queue_name,
            completed = stats.completed,
            fell_back = stats.fell_back,
            failed = stats.failed,
            "Worker drained"
        );
        stats
    }
}

fn tally(stats: &mut WorkerStats, settled: Result<Settled, JoinError>) {
    match settled {
        Ok((run_id, Ok(fell_back))) => {
            stats.completed += 1;
            if fell_back {
                stats.fell_back += 1;
            }
            info!(run_id = %run_id, fell_back, "Run completed");
        }
        Ok((run_id, Err(err))) => {
            stats.failed += 1;
            error!(run_id = %run_id, error = %err, "Run failed");
        }
        Err(err) => {
            stats.failed += 1;
            error!(error = %err, "Run task panicked");
        }
    }
}
