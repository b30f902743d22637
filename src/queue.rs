//! Single-consumer job queue in front of the [`Acquirer`].
//!
//! Requests are accepted immediately and processed strictly one at a time by
//! a worker task; the blocking pipeline runs on tokio's blocking pool.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AcquireError, AcquireResult};
use crate::orchestrator::{AcquireRequest, Acquirer, Acquisition, Notifier};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobState {
    pub id: String,
    pub url: String,
    pub user_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("the job queue shut down before this job ran")]
    ShutDown,
    #[error(transparent)]
    Acquire(#[from] AcquireError),
}

/// Handle returned by [`JobQueue::submit`].
pub struct JobTicket {
    pub id: String,
    outcome: oneshot::Receiver<AcquireResult<Acquisition>>,
}

impl JobTicket {
    pub async fn wait(self) -> Result<Acquisition, JobError> {
        match self.outcome.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(JobError::ShutDown),
        }
    }
}

struct QueuedJob {
    id: String,
    request: AcquireRequest,
    reply: oneshot::Sender<AcquireResult<Acquisition>>,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    jobs: Mutex<HashMap<String, JobState>>,
    counter: AtomicUsize,
    sender: mpsc::UnboundedSender<QueuedJob>,
    shutdown: CancellationToken,
}

impl JobQueue {
    /// Spawns the worker on the current runtime. The returned handle
    /// finishes once [`JobQueue::shutdown`] has been called and the job in
    /// flight, if any, is done.
    pub fn start(acquirer: Arc<Acquirer>, notifier: Arc<dyn Notifier>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(QueueInner {
            jobs: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(1),
            sender,
            shutdown: CancellationToken::new(),
        });
        let worker = tokio::spawn(run_worker(inner.clone(), receiver, acquirer, notifier));
        (Self { inner }, worker)
    }

    pub fn submit(&self, request: AcquireRequest) -> Result<JobTicket, JobError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::ShutDown);
        }
        let id = format!("job-{}", self.inner.counter.fetch_add(1, Ordering::Relaxed));
        let (reply, outcome) = oneshot::channel();

        self.inner.jobs.lock().insert(
            id.clone(),
            JobState {
                id: id.clone(),
                url: request.url.clone(),
                user_id: request.user_id.clone(),
                status: JobStatus::Queued,
                message: "Queued".to_string(),
            },
        );
        info!(job = %id, url = %request.url, user = %request.user_id, "job queued");

        let job = QueuedJob {
            id: id.clone(),
            request,
            reply,
        };
        if self.inner.sender.send(job).is_err() {
            update_job_status(&self.inner, &id, JobStatus::Failed, "Queue closed");
            return Err(JobError::ShutDown);
        }
        Ok(JobTicket { id, outcome })
    }

    pub fn status(&self, id: &str) -> Option<JobState> {
        self.inner.jobs.lock().get(id).cloned()
    }

    /// Stops taking jobs. Whatever is still queued fails with
    /// [`JobError::ShutDown`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_worker(
    inner: Arc<QueueInner>,
    mut receiver: mpsc::UnboundedReceiver<QueuedJob>,
    acquirer: Arc<Acquirer>,
    notifier: Arc<dyn Notifier>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        update_job_status(&inner, &job.id, JobStatus::Running, "Running");
        let acquirer = acquirer.clone();
        let notifier = notifier.clone();
        let request = job.request;
        let result =
            tokio::task::spawn_blocking(move || acquirer.acquire(&request, notifier.as_ref()))
                .await
                .unwrap_or_else(|err| {
                    Err(AcquireError::Internal(anyhow::anyhow!(
                        "acquisition task failed: {err}"
                    )))
                });

        match &result {
            Ok(acquisition) => {
                let message = if acquisition.cached {
                    "Done (cached)"
                } else {
                    "Done"
                };
                update_job_status(&inner, &job.id, JobStatus::Completed, message);
            }
            Err(err) => {
                update_job_status(&inner, &job.id, JobStatus::Failed, &err.user_message());
            }
        }
        if job.reply.send(result).is_err() {
            warn!(job = %job.id, "nobody is waiting for the job outcome");
        }
    }

    receiver.close();
    while let Ok(job) = receiver.try_recv() {
        update_job_status(&inner, &job.id, JobStatus::Failed, "Queue shut down");
    }
    info!("job queue stopped");
}

fn update_job_status(inner: &QueueInner, id: &str, status: JobStatus, message: &str) {
    if let Some(job) = inner.jobs.lock().get_mut(id) {
        job.status = status;
        job.message = message.to_string();
    }
}
