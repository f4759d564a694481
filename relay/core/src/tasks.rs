//! Detached Task Runner
//!
//! Runs background jobs (reply and title generation) independently of the
//! request that started them.
//!
//! # Design Philosophy
//!
//! A job does not inherit the request's lifetime. When it is forked, the
//! request's identifiers are copied into a [`JobContext`] snapshot: job id,
//! request id, trace id and service identity. Nothing else carries over, in
//! particular no deadline, so a client going away never stops generation.
//! The only bound on a job is the timeout given to
//! [`TaskRunner::fork_with_timeout`].
//!
//! A job body returns `Result<(), JobError>`. The supervisor around it
//! additionally catches panics and elapsed timeouts, logs every failure at a
//! level derived from its classification, and hands it to the job's fault
//! hook. The caller of `fork` never blocks and never sees the outcome unless
//! it awaits the returned [`JobHandle`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{codes, RelayError, StructuredError};

/// Job identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Generate a new unique job ID
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self(format!("job_{timestamp}_{count}"))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the running service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name
    pub name: String,
    /// Deployment environment (`development`, `production`, ...)
    pub environment: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Context of an inbound request
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Request identifier
    pub request_id: String,
    /// Trace identifier
    pub trace_id: String,
    /// Service identity
    pub service: ServiceInfo,
    /// When the request itself gives up
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// Fresh context with generated identifiers
    #[must_use]
    pub fn new(service: ServiceInfo) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            service,
            deadline: None,
        }
    }

    /// Set the request deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(ServiceInfo::default())
    }
}

/// What a job keeps from the request that forked it
///
/// Carries no deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
    /// Job identifier
    pub job_id: JobId,
    /// Request identifier of the parent
    pub request_id: String,
    /// Trace identifier of the parent
    pub trace_id: String,
    /// Service identity
    pub service: ServiceInfo,
}

impl JobContext {
    /// Snapshot the identifiers of a request
    #[must_use]
    pub fn detach(parent: &RequestContext) -> Self {
        Self {
            job_id: JobId::generate(),
            request_id: parent.request_id.clone(),
            trace_id: parent.trace_id.clone(),
            service: parent.service.clone(),
        }
    }
}

/// Log level a job failure is reported at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Expected (e.g. cancellation)
    Info,
    /// Caller-side problem
    Warn,
    /// Our problem
    Error,
}

/// Why a job failed
#[derive(Debug, Error)]
pub enum JobError {
    /// The body returned an error
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The body panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The body outlived its timeout
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
}

impl JobError {
    /// Classify for logging
    ///
    /// Structured errors log at error when server-side, at info when they
    /// report cancellation and at warn otherwise. Everything unclassified
    /// logs at error.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Relay(RelayError::Structured(e)) if e.code == codes::CONTEXT_CANCELED => {
                Severity::Info
            }
            Self::Relay(RelayError::Structured(e)) if !e.is_server_side() => Severity::Warn,
            _ => Severity::Error,
        }
    }

    /// Outcome recorded for this failure
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Relay(_) => JobStatus::Failed,
            Self::Panicked(_) => JobStatus::Panicked,
            Self::TimedOut(_) => JobStatus::TimedOut,
        }
    }

    /// Structured form for persistence and subscribers
    #[must_use]
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::Relay(e) => e.to_structured(),
            Self::Panicked(message) => {
                StructuredError::new(codes::GENERATION_FAULT).with_meta("message", message.clone())
            }
            Self::TimedOut(timeout) => StructuredError::new(codes::GENERATION_TIMED_OUT)
                .with_meta("timeout_ms", u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// Final status of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Body returned `Ok`
    Done,
    /// Body returned an error
    Failed,
    /// Body panicked
    Panicked,
    /// Timeout elapsed
    TimedOut,
    /// Task was aborted by the runtime
    Cancelled,
}

impl JobStatus {
    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done => "Done",
            Self::Failed => "Failed",
            Self::Panicked => "Panicked",
            Self::TimedOut => "Timed out",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether the job succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

type FaultHook = Box<dyn FnOnce(JobContext, JobError) -> BoxFuture<'static, ()> + Send>;

/// Per-job settings
pub struct JobOptions {
    name: &'static str,
    timeout: Option<Duration>,
    on_fault: Option<FaultHook>,
}

impl JobOptions {
    /// Options for a named job
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            timeout: None,
            on_fault: None,
        }
    }

    /// Bound the job's run time
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run `hook` with the error when the job fails for any reason
    #[must_use]
    pub fn on_fault<H, Fut>(mut self, hook: H) -> Self
    where
        H: FnOnce(JobContext, JobError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_fault = Some(Box::new(move |ctx, err| hook(ctx, err).boxed()));
        self
    }
}

/// Handle to a forked job
pub struct JobHandle {
    id: JobId,
    task: JoinHandle<JobStatus>,
}

impl JobHandle {
    /// Job identifier
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Wait for the job to finish
    pub async fn join(self) -> JobStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) if e.is_panic() => JobStatus::Panicked,
            Err(_) => JobStatus::Cancelled,
        }
    }
}

#[derive(Default)]
struct ActiveJobs {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the active count when a job ends, however it ends
struct ActiveGuard(Arc<ActiveJobs>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Spawns and supervises detached jobs
#[derive(Clone, Default)]
pub struct TaskRunner {
    active: Arc<ActiveJobs>,
}

impl TaskRunner {
    /// Create a runner
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` detached from `parent`
    pub fn fork<F, Fut>(&self, parent: &RequestContext, name: &'static str, body: F) -> JobHandle
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.spawn(parent, JobOptions::new(name), body)
    }

    /// Run `body` detached from `parent`, bounded by a fresh `timeout`
    pub fn fork_with_timeout<F, Fut>(
        &self,
        parent: &RequestContext,
        name: &'static str,
        timeout: Duration,
        body: F,
    ) -> JobHandle
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.spawn(parent, JobOptions::new(name).with_timeout(timeout), body)
    }

    /// Run `body` detached from `parent` with explicit options
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&self, parent: &RequestContext, options: JobOptions, body: F) -> JobHandle
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let ctx = JobContext::detach(parent);
        let id = ctx.job_id.clone();
        let span = tracing::info_span!(
            "job",
            job = options.name,
            job_id = %ctx.job_id,
            request_id = %ctx.request_id,
            trace_id = %ctx.trace_id,
            service = %ctx.service.name,
            environment = %ctx.service.environment,
        );

        self.active.count.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let JobOptions {
                    name,
                    timeout,
                    on_fault,
                } = options;

                let result = supervise(body(ctx.clone()), timeout).await;
                match result {
                    Ok(()) => {
                        tracing::debug!(job = name, "Job finished");
                        JobStatus::Done
                    }
                    Err(err) => {
                        log_failure(name, &err);
                        let status = err.status();
                        if let Some(hook) = on_fault {
                            if AssertUnwindSafe(hook(ctx, err)).catch_unwind().await.is_err() {
                                tracing::error!(job = name, "Fault hook panicked");
                            }
                        }
                        status
                    }
                }
            }
            .instrument(span),
        );

        JobHandle { id, task }
    }

    /// Number of jobs still running
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.count.load(Ordering::SeqCst)
    }

    /// Wait until no job is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.active.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Run a job body, converting panics and an elapsed timeout into errors
async fn supervise<Fut>(body: Fut, timeout: Option<Duration>) -> Result<(), JobError>
where
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    let guarded = AssertUnwindSafe(body).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(JobError::TimedOut(limit)),
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn log_failure(name: &str, err: &JobError) {
    match err.severity() {
        Severity::Info => tracing::info!(job = name, error = %err, "Job stopped"),
        Severity::Warn => tracing::warn!(job = name, error = %err, "Job failed"),
        Severity::Error => tracing::error!(job = name, error = %err, "Job failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_job_id_generate() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert!(a.as_str().starts_with("job_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_detach_drops_deadline() {
        let parent = RequestContext::default().with_deadline(Instant::now());
        let ctx = JobContext::detach(&parent);
        assert_eq!(ctx.request_id, parent.request_id);
        assert_eq!(ctx.trace_id, parent.trace_id);
        assert_eq!(ctx.service, parent.service);
    }

    #[test]
    fn test_severity_classification() {
        let canceled =
            JobError::from(RelayError::from(StructuredError::new(codes::CONTEXT_CANCELED)));
        let owner = JobError::from(RelayError::from(StructuredError::new(codes::INVALID_OWNER)));
        let unknown = JobError::from(RelayError::from(StructuredError::unknown("boom")));

        assert_eq!(canceled.severity(), Severity::Info);
        assert_eq!(owner.severity(), Severity::Warn);
        assert_eq!(unknown.severity(), Severity::Error);
        assert_eq!(JobError::Panicked("x".into()).severity(), Severity::Error);
    }

    #[test]
    fn test_fault_codes() {
        assert_eq!(
            JobError::Panicked("x".into()).to_structured().code,
            codes::GENERATION_FAULT
        );
        let timed_out = JobError::TimedOut(Duration::from_millis(1500)).to_structured();
        assert_eq!(timed_out.code, codes::GENERATION_TIMED_OUT);
        assert_eq!(timed_out.meta["timeout_ms"], 1500);
    }

    #[tokio::test]
    async fn test_fork_runs_body() {
        let runner = TaskRunner::new();
        let (tx, rx) = oneshot::channel();

        let handle = runner.fork(&RequestContext::default(), "test", move |ctx| async move {
            let _ = tx.send(ctx.job_id);
            Ok(())
        });
        let id = handle.id().clone();

        assert_eq!(handle.join().await, JobStatus::Done);
        assert_eq!(rx.await.unwrap(), id);
    }

    async fn explode() -> Result<(), JobError> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let runner = TaskRunner::new();
        let (tx, rx) = oneshot::channel();

        let options = JobOptions::new("panics").on_fault(move |_ctx, err| async move {
            let _ = tx.send(err.to_string());
        });
        let handle = runner.spawn(&RequestContext::default(), options, |_ctx| explode());

        assert_eq!(handle.join().await, JobStatus::Panicked);
        assert_eq!(rx.await.unwrap(), "job panicked: kaboom");

        // Runner keeps working
        let handle = runner.fork(&RequestContext::default(), "after", |_| async { Ok(()) });
        assert!(handle.join().await.is_success());
    }

    #[tokio::test]
    async fn test_timeout_bounds_job() {
        let runner = TaskRunner::new();
        let handle = runner.fork_with_timeout(
            &RequestContext::default(),
            "slow",
            Duration::from_millis(20),
            |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
        );

        assert_eq!(handle.join().await, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_expired_parent_deadline_does_not_stop_job() {
        let runner = TaskRunner::new();
        let parent = RequestContext::default().with_deadline(Instant::now());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handle = runner.fork(&parent, "detached", |_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        assert_eq!(handle.join().await, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let runner = TaskRunner::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        runner.fork(&RequestContext::default(), "blocked", move |_| async move {
            let _ = release_rx.await;
            Ok(())
        });
        assert_eq!(runner.active_count(), 1);

        let waiter = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runner.active_count(), 0);
    }
}
