//! Bounded parallel executor for scout and builder subagents.
//!
//! Jobs run as tokio tasks gated by a semaphore. They are independent by
//! contract: each receives its own subcontext and a cancellation token, and
//! never shares mutable state with its siblings. The pool always returns a
//! result for every job - errors are captured in the result, never raised -
//! and the enclosing phase applies its `minimum_success` rule to the
//! aggregate. Concurrency of 1 degrades to sequential execution.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub text: String,
    pub tokens: u64,
}

/// Terminal status of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ok,
    Error { message: String },
    Cancelled,
}

/// Result record for one job. The pool reports every job, failed or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    pub tokens: u64,
    pub elapsed_ms: u64,
}

impl JobResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, JobStatus::Ok)
    }

    fn cancelled(job_id: String, elapsed_ms: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Cancelled,
            output: None,
            tokens: 0,
            elapsed_ms,
        }
    }
}

type JobFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<JobOutput, String>> + Send>;

/// One unit of work for the pool.
pub struct Job {
    pub id: String,
    run: JobFn,
}

impl Job {
    /// Create a job from an async closure. The closure receives the pool's
    /// cancellation token and should stop cooperatively when it fires.
    pub fn new<F>(id: &str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<JobOutput, String>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            run: Box::new(run),
        }
    }
}

/// Bounded parallel executor.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// Pool bounded to the given concurrency (minimum 1).
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run all jobs, bounded by the pool's concurrency, under the given
    /// cancellation token and optional deadline.
    ///
    /// Returns one result per job, in input order. Cancellation and the
    /// deadline are cooperative: running jobs are asked to stop and
    /// recorded as cancelled; queued jobs never start.
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Vec<JobResult> {
        let run_cancel = cancel.child_token();
        if let Some(deadline) = deadline {
            let deadline_cancel = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                deadline_cancel.cancel();
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, JobResult)> = JoinSet::new();

        let job_count = jobs.len();
        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let token = run_cancel.clone();
            join_set.spawn(async move {
                let started = Instant::now();
                let job_id = job.id.clone();

                // Queued jobs never start once cancellation fires.
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit,
                    _ = token.cancelled() => {
                        return (index, JobResult::cancelled(job_id, 0));
                    }
                };
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => return (index, JobResult::cancelled(job_id, 0)),
                };
                if token.is_cancelled() {
                    return (index, JobResult::cancelled(job_id, 0));
                }

                debug!(job = %job_id, "Worker started");
                let future = (job.run)(token.clone());
                let outcome = tokio::select! {
                    outcome = future => Some(outcome),
                    _ = token.cancelled() => None,
                };
                let elapsed_ms = started.elapsed().as_millis() as u64;

                let result = match outcome {
                    Some(Ok(output)) => JobResult {
                        job_id,
                        status: JobStatus::Ok,
                        tokens: output.tokens,
                        output: Some(output),
                        elapsed_ms,
                    },
                    Some(Err(message)) => {
                        warn!(job = %job_id, error = %message, "Worker failed");
                        JobResult {
                            job_id,
                            status: JobStatus::Error { message },
                            output: None,
                            tokens: 0,
                            elapsed_ms,
                        }
                    }
                    None => JobResult::cancelled(job_id, elapsed_ms),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<JobResult>> = (0..job_count).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => warn!(error = %err, "Worker task panicked"),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| JobResult::cancelled(format!("job-{i}"), 0))
            })
            .collect()
    }
}

/// Whether the success fraction of `results` meets the minimum.
pub fn meets_minimum_success(results: &[JobResult], minimum: f64) -> bool {
    if results.is_empty() {
        return true;
    }
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    (succeeded as f64 / results.len() as f64) >= minimum
}
