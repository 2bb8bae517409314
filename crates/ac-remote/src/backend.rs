//! Backend abstraction for remote participant execution.

use ac_types::{BackendError, JobId, JobStatus, Observation, ParticipantBatch, ParticipantId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Core backend interface.
///
/// Implementations may talk to a hosted study service over HTTP (see
/// [`crate::http::HttpBackend`]) or simulate participants locally (see
/// [`crate::sandbox::SandboxBackend`]). Calls are single attempts; retrying
/// is the caller's job.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Upload one batch per participant slot and open the job.
    async fn dispatch(&self, job: JobId, batches: &[ParticipantBatch]) -> BackendResult<()>;

    /// Report job status. Running slots whose participant has held them
    /// longer than `reclaim_timeout` are reopened as part of the poll.
    async fn poll_status(&self, job: JobId, reclaim_timeout: Duration)
        -> BackendResult<JobStatus>;

    /// One observation per completed slot, keyed by participant.
    async fn fetch_observations(
        &self,
        job: JobId,
    ) -> BackendResult<BTreeMap<ParticipantId, Observation>>;

    /// Drop any reclaim timers held for `job`.
    async fn release(&self, job: JobId) -> BackendResult<()>;

    /// Discard local state for `job` after its observations were consumed.
    /// Backends that keep none can rely on the default.
    async fn forget(&self, _job: JobId) -> BackendResult<()> {
        Ok(())
    }

    /// Backend name for logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: RemoteBackend + ?Sized> RemoteBackend for Arc<T> {
    async fn dispatch(&self, job: JobId, batches: &[ParticipantBatch]) -> BackendResult<()> {
        (**self).dispatch(job, batches).await
    }

    async fn poll_status(
        &self,
        job: JobId,
        reclaim_timeout: Duration,
    ) -> BackendResult<JobStatus> {
        (**self).poll_status(job, reclaim_timeout).await
    }

    async fn fetch_observations(
        &self,
        job: JobId,
    ) -> BackendResult<BTreeMap<ParticipantId, Observation>> {
        (**self).fetch_observations(job).await
    }

    async fn release(&self, job: JobId) -> BackendResult<()> {
        (**self).release(job).await
    }

    async fn forget(&self, job: JobId) -> BackendResult<()> {
        (**self).forget(job).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
