//! Concurrent worker pool.
//!
//! Work items are independent, so the pool runs up to `max_concurrent`
//! pipeline executions at once, each on a blocking thread. Ordering between
//! items for the same boot id is handled inside the pipeline by its keyed
//! locks, not by the pool.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::{Outcome, Pipeline};
use crate::work::WorkItem;

/// Tally of outcomes for one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    /// Completed items whose post-processing reported at least one failure.
    pub completed_with_failures: usize,
    pub aborted: usize,
    pub quarantined: usize,
    /// Items left in the queue when cancellation was requested.
    pub skipped: usize,
}

impl PoolReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed { post_failures, .. } => {
                self.completed += 1;
                if !post_failures.is_empty() {
                    self.completed_with_failures += 1;
                }
            }
            Outcome::Aborted { .. } => self.aborted += 1,
            Outcome::Quarantined { .. } => self.quarantined += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.aborted + self.quarantined + self.skipped
    }
}

/// Drives a [`Pipeline`] over a stream of work items.
pub struct IngestPool {
    pipeline: Pipeline,
    permits: Arc<Semaphore>,
}

impl IngestPool {
    pub fn new(pipeline: Pipeline, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process items until the channel closes or `cancel` fires.
    ///
    /// On cancellation, queued items are drained and counted as skipped and
    /// in-flight transfers stop at their next buffer boundary.
    pub async fn process(
        &self,
        mut items: mpsc::Receiver<WorkItem>,
        cancel: CancellationToken,
    ) -> PoolReport {
        let mut report = PoolReport::default();
        let mut tasks = JoinSet::new();

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = items.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.skipped += 1;
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Reap finished executions so the join set does not grow unbounded
            while let Some(joined) = tasks.try_join_next() {
                Self::record_joined(&mut report, joined);
            }

            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                debug!(staging = %item.staging_path.display(), "Processing work item");
                pipeline.run(item, &cancel)
            });
        }

        if cancel.is_cancelled() {
            items.close();
            while items.try_recv().is_ok() {
                report.skipped += 1;
            }
            if report.skipped > 0 {
                warn!(skipped = report.skipped, "Cancelled with queued work items");
            }
        }

        while let Some(joined) = tasks.join_next().await {
            Self::record_joined(&mut report, joined);
        }

        info!(
            completed = report.completed,
            aborted = report.aborted,
            quarantined = report.quarantined,
            skipped = report.skipped,
            "Work queue drained"
        );
        report
    }

    fn record_joined(report: &mut PoolReport, joined: Result<Outcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => report.record(&outcome),
            Err(e) => {
                error!(error = %e, "Pipeline execution panicked");
                report.aborted += 1;
            }
        }
    }
}
