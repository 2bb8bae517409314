//! Caller-side job lifecycle: dispatch, poll until finished, fetch.

use ac_types::{
    AcError, AcResult, BackendError, JobId, JobStatus, Observation, ParticipantBatch,
    ParticipantId, RemoteJob,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::RemoteBackend;
use crate::retry::RetryPolicy;

/// Wall-clock cap on a whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    /// Expires `limit` from now.
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_past(&self) -> bool {
        Instant::now() >= self.at
    }

    /// `DeadlineExceeded` carrying the configured limit.
    pub fn error(&self) -> AcError {
        AcError::DeadlineExceeded {
            seconds: self.limit.as_secs_f64(),
        }
    }

    /// Fails once the deadline has passed.
    pub fn check(&self) -> AcResult<()> {
        if self.is_past() {
            Err(self.error())
        } else {
            Ok(())
        }
    }
}

/// Drives jobs through a [`RemoteBackend`].
///
/// Transient backend failures are retried according to the [`RetryPolicy`];
/// anything still failing afterwards is returned to the caller. Every backend
/// call, retries and backoffs included, is abandoned as soon as the
/// cancellation token fires. Observations are only fetched once a poll has
/// reported `Finished`.
pub struct RemoteJobClient<B: RemoteBackend> {
    backend: B,
    retry: RetryPolicy,
    cancel: CancellationToken,
    jobs: HashMap<JobId, RemoteJob>,
}

impl<B: RemoteBackend> RemoteJobClient<B> {
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            cancel: CancellationToken::new(),
            jobs: HashMap::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn job(&self, id: JobId) -> Option<&RemoteJob> {
        self.jobs.get(&id)
    }

    /// Dispatch with retries. A cancelled dispatch releases whatever the
    /// backend may already hold for `job`.
    pub async fn dispatch(&mut self, job: JobId, batches: &[ParticipantBatch]) -> AcResult<()> {
        let backend = &self.backend;
        let attempt = self
            .retry
            .execute("dispatch", || backend.dispatch(job, batches));
        let result = cancellable(&self.cancel, attempt).await;
        if let Err(err) = result {
            if matches!(err, AcError::Cancelled) {
                self.release(job).await;
            }
            return Err(err);
        }
        self.jobs.insert(job, RemoteJob::new(job, batches.len()));
        info!(
            job = %job,
            slots = batches.len(),
            backend = self.backend.name(),
            "job dispatched"
        );
        Ok(())
    }

    /// One poll of the backend, with retries.
    pub async fn poll_status(
        &mut self,
        job: JobId,
        reclaim_timeout: Duration,
    ) -> AcResult<JobStatus> {
        if !self.jobs.contains_key(&job) {
            return Err(BackendError::UnknownJob { job_id: job }.into());
        }
        let backend = &self.backend;
        let attempt = self
            .retry
            .execute("poll", || backend.poll_status(job, reclaim_timeout));
        let status = cancellable(&self.cancel, attempt).await?;
        if let Some(record) = self.jobs.get_mut(&job) {
            record.observe(status);
            debug!(job = %job, status = %status, polls = record.polls, "polled job");
        }
        Ok(status)
    }

    /// Observations of a finished job, keyed by participant.
    pub async fn fetch_observations(
        &mut self,
        job: JobId,
    ) -> AcResult<BTreeMap<ParticipantId, Observation>> {
        match self.jobs.get(&job) {
            None => return Err(BackendError::UnknownJob { job_id: job }.into()),
            Some(record) if !record.is_finished() => {
                return Err(BackendError::NotReady { job_id: job }.into())
            }
            Some(_) => {}
        }
        let backend = &self.backend;
        let attempt = self
            .retry
            .execute("fetch", || backend.fetch_observations(job));
        let observations = cancellable(&self.cancel, attempt).await?;
        info!(job = %job, participants = observations.len(), "observations fetched");
        Ok(observations)
    }

    /// Poll every `poll_interval` until the job finishes.
    ///
    /// Any failure, including cancellation and an expired `deadline`,
    /// releases the job's reclaim timers before it is returned.
    pub async fn wait_until_finished(
        &mut self,
        job: JobId,
        reclaim_timeout: Duration,
        poll_interval: Duration,
        deadline: Option<Deadline>,
    ) -> AcResult<()> {
        let result = self
            .poll_until_finished(job, reclaim_timeout, poll_interval, deadline)
            .await;
        if let Err(err) = &result {
            warn!(job = %job, error = %err, "stopped waiting for job");
            self.release(job).await;
        }
        result
    }

    async fn poll_until_finished(
        &mut self,
        job: JobId,
        reclaim_timeout: Duration,
        poll_interval: Duration,
        deadline: Option<Deadline>,
    ) -> AcResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(AcError::Cancelled);
            }
            if let Some(deadline) = deadline {
                deadline.check()?;
            }

            let poll = self.poll_status(job, reclaim_timeout);
            let status = match deadline {
                Some(deadline) => tokio::time::timeout(deadline.remaining(), poll)
                    .await
                    .map_err(|_| deadline.error())??,
                None => poll.await?,
            };
            if status == JobStatus::Finished {
                return Ok(());
            }

            let wait = match deadline {
                Some(deadline) => poll_interval.min(deadline.remaining()),
                None => poll_interval,
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Best-effort release of reclaim timers; failures are logged only.
    pub async fn release(&mut self, job: JobId) {
        if let Err(err) = self.backend.release(job).await {
            warn!(job = %job, error = %err, "failed to release reclaim timers");
        }
    }

    /// Drop the local record and the backend's copy once the observations
    /// have been consumed.
    pub async fn retire(&mut self, job: JobId) -> Option<RemoteJob> {
        if let Err(err) = self.backend.forget(job).await {
            warn!(job = %job, error = %err, "failed to discard backend job state");
        }
        self.jobs.remove(&job)
    }
}

/// Runs `attempt` unless `cancel` fires first.
async fn cancellable<T, Fut>(cancel: &CancellationToken, attempt: Fut) -> AcResult<T>
where
    Fut: Future<Output = Result<T, BackendError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcError::Cancelled),
        result = attempt => result.map_err(AcError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxBackend;
    use ac_types::{Block, SandboxSettings, SlotState};
    use serde_json::json;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(100);
    const POLL: Duration = Duration::from_secs(5);

    fn batches(slots: usize) -> Vec<ParticipantBatch> {
        (0..slots)
            .map(|slot| ParticipantBatch {
                slot,
                blocks: vec![Block { trials: vec![] }],
            })
            .collect()
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40))
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_before_finished_is_not_ready() {
        let backend = Arc::new(SandboxBackend::manual());
        let mut client = RemoteJobClient::new(backend.clone(), quick_retry());
        client.dispatch(JobId(0), &batches(1)).await.unwrap();

        assert!(matches!(
            client.fetch_observations(JobId(0)).await,
            Err(AcError::Backend(BackendError::NotReady { .. }))
        ));
        assert!(matches!(
            client.fetch_observations(JobId(5)).await,
            Err(AcError::Backend(BackendError::UnknownJob { .. }))
        ));

        let session = backend.begin_session(JobId(0)).unwrap().unwrap();
        backend
            .submit(JobId(0), session.participant, Observation::new(vec![json!({})]))
            .unwrap();
        assert_eq!(
            client.poll_status(JobId(0), TIMEOUT).await.unwrap(),
            JobStatus::Finished
        );
        assert_eq!(client.fetch_observations(JobId(0)).await.unwrap().len(), 1);
        assert!(client.job(JobId(0)).unwrap().is_finished());
        assert!(client.retire(JobId(0)).await.is_some());
        assert!(client.job(JobId(0)).is_none());
        assert_eq!(backend.job_count(), 0);
        assert!(matches!(
            backend.slot_states(JobId(0)),
            Err(BackendError::UnknownJob { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_simulated_participants_finish() {
        let backend = SandboxBackend::new(SandboxSettings {
            arrivals_per_poll: 1,
            abandon_probability: 0.0,
            seed: 3,
        });
        let mut client = RemoteJobClient::new(backend, quick_retry());
        client.dispatch(JobId(1), &batches(3)).await.unwrap();
        client
            .wait_until_finished(JobId(1), TIMEOUT, POLL, None)
            .await
            .unwrap();

        let record = client.job(JobId(1)).unwrap();
        assert_eq!(record.polls, 3);
        assert_eq!(client.fetch_observations(JobId(1)).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failures_are_retried() {
        let backend = Arc::new(SandboxBackend::new(SandboxSettings {
            arrivals_per_poll: 2,
            ..SandboxSettings::default()
        }));
        let mut client = RemoteJobClient::new(backend.clone(), quick_retry());
        client.dispatch(JobId(0), &batches(2)).await.unwrap();

        backend.inject_outage(2);
        let status = client.poll_status(JobId(0), TIMEOUT).await.unwrap();
        assert_eq!(status, JobStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_error() {
        let backend = Arc::new(SandboxBackend::manual());
        let mut client = RemoteJobClient::new(backend.clone(), quick_retry());
        backend.inject_outage(10);
        let err = client.dispatch(JobId(0), &batches(1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(client.job(JobId(0)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_timers() {
        let backend = Arc::new(SandboxBackend::manual());
        let mut client = RemoteJobClient::new(backend.clone(), quick_retry())
            .with_cancel_token(cancel_after(Duration::from_secs(12)));
        client.dispatch(JobId(0), &batches(1)).await.unwrap();
        backend.begin_session(JobId(0)).unwrap().unwrap();

        let result = client
            .wait_until_finished(JobId(0), TIMEOUT, POLL, None)
            .await;
        assert!(matches!(result, Err(AcError::Cancelled)));
        assert!(backend.is_released(JobId(0)).unwrap());

        // released timers never fire
        sleep(Duration::from_secs(300)).await;
        backend.poll_status(JobId(0), TIMEOUT).await.unwrap();
        assert_eq!(
            backend.slot_states(JobId(0)).unwrap(),
            vec![SlotState::Running]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_through_retry_backoff() {
        let backend = Arc::new(SandboxBackend::manual());
        let retry = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(30));
        let mut client = RemoteJobClient::new(backend.clone(), retry)
            .with_cancel_token(cancel_after(Duration::from_secs(1)));
        client.dispatch(JobId(0), &batches(1)).await.unwrap();
        backend.begin_session(JobId(0)).unwrap().unwrap();
        backend.inject_outage(100);

        let started = Instant::now();
        let result = client
            .wait_until_finished(JobId(0), TIMEOUT, POLL, None)
            .await;
        assert!(matches!(result, Err(AcError::Cancelled)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(backend.is_released(JobId(0)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn escalated_poll_failure_releases_timers() {
        let backend = Arc::new(SandboxBackend::manual());
        let mut client = RemoteJobClient::new(backend.clone(), RetryPolicy::none());
        client.dispatch(JobId(0), &batches(1)).await.unwrap();
        backend.begin_session(JobId(0)).unwrap().unwrap();
        backend.inject_outage(1);

        let err = client
            .wait_until_finished(JobId(0), TIMEOUT, POLL, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AcError::Backend(BackendError::Unavailable { .. })));
        assert!(backend.is_released(JobId(0)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dispatch_is_not_recorded() {
        let backend = Arc::new(SandboxBackend::manual());
        let retry = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(30));
        let mut client = RemoteJobClient::new(backend.clone(), retry)
            .with_cancel_token(cancel_after(Duration::from_secs(3)));
        backend.inject_outage(100);

        let err = client.dispatch(JobId(0), &batches(1)).await.unwrap_err();
        assert!(matches!(err, AcError::Cancelled));
        assert!(client.job(JobId(0)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_waiting() {
        let backend = Arc::new(SandboxBackend::manual());
        let mut client = RemoteJobClient::new(backend.clone(), quick_retry());
        client.dispatch(JobId(0), &batches(1)).await.unwrap();

        let deadline = Deadline::after(Duration::from_secs(30));
        let err = client
            .wait_until_finished(JobId(0), TIMEOUT, POLL, Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, AcError::DeadlineExceeded { seconds } if seconds == 30.0));
        assert_eq!(err.to_string(), "Run deadline of 30 seconds exceeded");
        assert!(backend.is_released(JobId(0)).unwrap());
    }
}
