// ── Bounded concurrency job runner ──
//
// Runs queued blocking jobs on tokio's blocking pool, optionally capped
// by a semaphore, and blocks the caller until every job has finished.
// Failures and panics are collected per batch and returned together.

use std::any::Any;
use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::sync::lock;

type Work = Box<dyn FnOnce() -> Result<(), CoreError> + Send + 'static>;

struct Job {
    label: String,
    work: Work,
}

/// Queue of blocking jobs, run as one batch by [`run_and_wait`](Self::run_and_wait).
///
/// Safe to drop from inside an async context: the private runtime is shut
/// down in the background instead of blocking.
pub struct JobRunner {
    /// Always `Some` until dropped.
    runtime: Option<Runtime>,
    queue: Mutex<Vec<Job>>,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new() -> Result<Self, CoreError> {
        let runtime = Builder::new_current_thread()
            .thread_name("unifold-job")
            .build()
            .map_err(|e| CoreError::Runtime(e.to_string()))?;
        Ok(Self {
            runtime: Some(runtime),
            queue: Mutex::new(Vec::new()),
        })
    }

    /// Queue a job for the next batch.
    pub fn submit<F>(&self, label: impl Into<String>, work: F)
    where
        F: FnOnce() -> Result<(), CoreError> + Send + 'static,
    {
        lock(&self.queue).push(Job {
            label: label.into(),
            work: Box::new(work),
        });
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Run every queued job and block until all have finished.
    ///
    /// With `max_concurrency` set, at most that many jobs run at once (a
    /// cap of zero is treated as one). Every failure of this batch is
    /// returned once; the next batch starts clean.
    ///
    /// Blocks the calling thread, so it must not be called from inside an
    /// async runtime.
    pub fn run_and_wait(&self, max_concurrency: Option<usize>) -> Result<(), CoreError> {
        let jobs = std::mem::take(&mut *lock(&self.queue));
        if jobs.is_empty() {
            return Ok(());
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(CoreError::Runtime("job runtime already shut down".into()));
        };
        let total = jobs.len();
        info!(jobs = total, max_concurrency = ?max_concurrency, "running job batch");

        let failures = runtime.block_on(async move {
            let limit = max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
            let mut set = JoinSet::new();

            for job in jobs {
                let limit = limit.clone();
                set.spawn(async move {
                    let _permit = match limit {
                        Some(semaphore) => Some(
                            semaphore
                                .acquire_owned()
                                .await
                                .map_err(|e| CoreError::Runtime(e.to_string()))?,
                        ),
                        None => None,
                    };
                    debug!(job = %job.label, "job started");
                    match tokio::task::spawn_blocking(job.work).await {
                        Ok(result) => result,
                        Err(e) => Err(CoreError::JobPanicked {
                            job: job.label,
                            message: join_message(e),
                        }),
                    }
                });
            }

            let mut failures = Vec::new();
            while let Some(joined) = set.join_next().await {
                let outcome = joined.unwrap_or_else(|e| {
                    Err(CoreError::JobPanicked {
                        job: "<task>".into(),
                        message: join_message(e),
                    })
                });
                if let Err(e) = outcome {
                    warn!(error = %e, "job failed");
                    failures.push(e);
                }
            }
            failures
        });

        info!(jobs = total, failed = failures.len(), "job batch finished");
        CoreError::from_failures(failures)
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn join_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => panic_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
