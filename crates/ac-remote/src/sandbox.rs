//! In-process backend for sandbox mode.
//!
//! Holds jobs in memory and enforces the same slot rules as a hosted study
//! service: one participant per slot, reclaim after the timeout, and
//! `Finished` only once every slot has a stored submission. With
//! `arrivals_per_poll > 0` simulated participants join on every poll;
//! otherwise sessions are driven through [`SandboxBackend::begin_session`]
//! and [`SandboxBackend::submit`].

use ac_types::{
    BackendError, JobId, JobStatus, Observation, ParticipantBatch, ParticipantId, SandboxSettings,
    SlotState,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{BackendResult, RemoteBackend};
use crate::simulator::ParticipantSimulator;

/// A participant's claim on one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub job: JobId,
    pub participant: ParticipantId,
    pub slot: usize,
    pub batch: ParticipantBatch,
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    participant: Option<ParticipantId>,
    started_at: Option<Instant>,
    submission: Option<(ParticipantId, Observation)>,
    reclaims: u32,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Pending,
            participant: None,
            started_at: None,
            submission: None,
            reclaims: 0,
        }
    }
}

#[derive(Debug)]
struct SandboxJob {
    batches: Vec<ParticipantBatch>,
    slots: Vec<Slot>,
    released: bool,
}

impl SandboxJob {
    fn status(&self) -> JobStatus {
        if self.slots.iter().all(|s| s.state == SlotState::Finished) {
            JobStatus::Finished
        } else if self.slots.iter().all(|s| s.state == SlotState::Pending) {
            JobStatus::Pending
        } else {
            JobStatus::Running
        }
    }

    fn reclaim_expired(&mut self, job: JobId, now: Instant, timeout: Duration) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state != SlotState::Running {
                continue;
            }
            let expired = slot
                .started_at
                .map(|t| now.saturating_duration_since(t) >= timeout)
                .unwrap_or(false);
            if expired {
                info!(
                    job = %job,
                    slot = index,
                    participant = ?slot.participant,
                    "reclaiming slot after timeout"
                );
                slot.state = SlotState::Reclaimed;
                slot.participant = None;
                slot.started_at = None;
                slot.reclaims += 1;
            }
        }
    }

    fn assign(&mut self, participant: ParticipantId, now: Instant) -> Option<usize> {
        let index = self.slots.iter().position(|s| s.state.is_open())?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Running;
        slot.participant = Some(participant);
        slot.started_at = Some(now);
        Some(index)
    }

    fn complete(&mut self, index: usize, participant: ParticipantId, observation: Observation) {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Finished;
        slot.started_at = None;
        slot.submission = Some((participant, observation));
    }
}

/// A fully in-process backend that simulates a participant pool.
#[derive(Debug)]
pub struct SandboxBackend {
    settings: SandboxSettings,
    jobs: DashMap<JobId, SandboxJob>,
    simulator: Mutex<ParticipantSimulator>,
    next_participant: AtomicU32,
    outages: AtomicU32,
}

impl SandboxBackend {
    pub fn new(settings: SandboxSettings) -> Self {
        let simulator = ParticipantSimulator::from_settings(&settings);
        Self {
            settings,
            jobs: DashMap::new(),
            simulator: Mutex::new(simulator),
            next_participant: AtomicU32::new(0),
            outages: AtomicU32::new(0),
        }
    }

    /// No simulated arrivals; sessions are driven by the caller.
    pub fn manual() -> Self {
        Self::new(SandboxSettings {
            arrivals_per_poll: 0,
            ..SandboxSettings::default()
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Fail the next `calls` backend operations with `Unavailable`.
    pub fn inject_outage(&self, calls: u32) {
        self.outages.store(calls, Ordering::SeqCst);
    }

    /// Assign a fresh participant to the first open slot, if any.
    pub fn begin_session(&self, job: JobId) -> BackendResult<Option<Session>> {
        let mut entry = self
            .jobs
            .get_mut(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        if !entry.slots.iter().any(|s| s.state.is_open()) {
            return Ok(None);
        }
        let participant = self.allocate_participant();
        let Some(slot) = entry.assign(participant, Instant::now()) else {
            return Ok(None);
        };
        debug!(job = %job, slot, participant = %participant, "session started");
        Ok(Some(Session {
            job,
            participant,
            slot,
            batch: entry.batches[slot].clone(),
        }))
    }

    /// Store a participant's log. Rejected unless the participant still holds
    /// a running slot; a reclaimed session cannot submit late.
    pub fn submit(
        &self,
        job: JobId,
        participant: ParticipantId,
        observation: Observation,
    ) -> BackendResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        let index = entry
            .slots
            .iter()
            .position(|s| s.state == SlotState::Running && s.participant == Some(participant))
            .ok_or_else(|| BackendError::Rejected {
                reason: format!("{participant} holds no running slot in job {job}"),
            })?;
        entry.complete(index, participant, observation);
        debug!(job = %job, slot = index, participant = %participant, "submission stored");
        Ok(())
    }

    pub fn slot_states(&self, job: JobId) -> BackendResult<Vec<SlotState>> {
        let entry = self
            .jobs
            .get(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        Ok(entry.slots.iter().map(|s| s.state).collect())
    }

    /// Total reclaims across all slots of `job`.
    pub fn reclaim_count(&self, job: JobId) -> BackendResult<u32> {
        let entry = self
            .jobs
            .get(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        Ok(entry.slots.iter().map(|s| s.reclaims).sum())
    }

    /// Jobs still held in memory.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_released(&self, job: JobId) -> BackendResult<bool> {
        let entry = self
            .jobs
            .get(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        Ok(entry.released)
    }

    fn allocate_participant(&self) -> ParticipantId {
        ParticipantId(self.next_participant.fetch_add(1, Ordering::SeqCst))
    }

    fn check_outage(&self, operation: &str) -> BackendResult<()> {
        let remaining = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(BackendError::Unavailable {
                message: format!("sandbox outage during {operation}"),
            }),
            Err(_) => Ok(()),
        }
    }

    fn simulate_arrivals(&self, job: JobId, entry: &mut SandboxJob, now: Instant) {
        let mut simulator = self.simulator.lock();
        for _ in 0..self.settings.arrivals_per_poll {
            if !entry.slots.iter().any(|s| s.state.is_open()) {
                break;
            }
            let participant = self.allocate_participant();
            let Some(index) = entry.assign(participant, now) else {
                break;
            };
            if simulator.abandons() {
                debug!(job = %job, slot = index, participant = %participant, "participant abandoned");
                continue;
            }
            let observation = simulator.run_session(&entry.batches[index]);
            entry.complete(index, participant, observation);
        }
    }

    fn poll_now(&self, job: JobId, reclaim_timeout: Duration) -> BackendResult<JobStatus> {
        let mut entry = self
            .jobs
            .get_mut(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        if !entry.released {
            let now = Instant::now();
            entry.reclaim_expired(job, now, reclaim_timeout);
            if self.settings.arrivals_per_poll > 0 {
                self.simulate_arrivals(job, &mut entry, now);
            }
        }
        Ok(entry.status())
    }

    fn collect_observations(
        &self,
        job: JobId,
    ) -> BackendResult<BTreeMap<ParticipantId, Observation>> {
        let entry = self
            .jobs
            .get(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        if entry.status() != JobStatus::Finished {
            return Err(BackendError::NotReady { job_id: job });
        }
        Ok(entry
            .slots
            .iter()
            .filter_map(|s| s.submission.clone())
            .collect())
    }
}

impl Default for SandboxBackend {
    fn default() -> Self {
        Self::new(SandboxSettings::default())
    }
}

#[async_trait]
impl RemoteBackend for SandboxBackend {
    async fn dispatch(&self, job: JobId, batches: &[ParticipantBatch]) -> BackendResult<()> {
        self.check_outage("dispatch")?;
        if batches.is_empty() {
            return Err(BackendError::Rejected {
                reason: "a job needs at least one participant batch".into(),
            });
        }
        if self.jobs.contains_key(&job) {
            return Err(BackendError::Rejected {
                reason: format!("job {job} has already been dispatched"),
            });
        }
        self.jobs.insert(
            job,
            SandboxJob {
                batches: batches.to_vec(),
                slots: vec![Slot::new(); batches.len()],
                released: false,
            },
        );
        info!(job = %job, slots = batches.len(), "sandbox job dispatched");
        Ok(())
    }

    async fn poll_status(
        &self,
        job: JobId,
        reclaim_timeout: Duration,
    ) -> BackendResult<JobStatus> {
        self.check_outage("poll")?;
        self.poll_now(job, reclaim_timeout)
    }

    async fn fetch_observations(
        &self,
        job: JobId,
    ) -> BackendResult<BTreeMap<ParticipantId, Observation>> {
        self.check_outage("fetch")?;
        self.collect_observations(job)
    }

    async fn release(&self, job: JobId) -> BackendResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        entry.released = true;
        for slot in &mut entry.slots {
            slot.started_at = None;
        }
        debug!(job = %job, "reclaim timers released");
        Ok(())
    }

    async fn forget(&self, job: JobId) -> BackendResult<()> {
        self.jobs
            .remove(&job)
            .ok_or(BackendError::UnknownJob { job_id: job })?;
        debug!(job = %job, "sandbox job discarded");
        Ok(())
    }

    fn name(&self) -> &str {
        "sandbox"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_types::{Block, Condition, Trial};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(100);

    fn batches(slots: usize) -> Vec<ParticipantBatch> {
        (0..slots)
            .map(|slot| {
                let mut trial = Trial::new(BTreeMap::new());
                trial.condition = Some(Condition::new(0.5).unwrap());
                ParticipantBatch {
                    slot,
                    blocks: vec![Block {
                        trials: vec![trial; 2],
                    }],
                }
            })
            .collect()
    }

    fn log() -> Observation {
        Observation::new(vec![json!({"trial_type": "rok", "correct": true})])
    }

    #[tokio::test(start_paused = true)]
    async fn job_finishes_only_when_every_slot_submits() {
        let backend = SandboxBackend::manual();
        let job = JobId(0);
        backend.dispatch(job, &batches(2)).await.unwrap();
        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Pending);

        let a = backend.begin_session(job).unwrap().unwrap();
        let b = backend.begin_session(job).unwrap().unwrap();
        assert_eq!((a.slot, b.slot), (0, 1));
        assert!(backend.begin_session(job).unwrap().is_none());
        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Running);

        backend.submit(job, a.participant, log()).unwrap();
        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Running);
        assert!(matches!(
            backend.fetch_observations(job).await,
            Err(BackendError::NotReady { .. })
        ));

        backend.submit(job, b.participant, log()).unwrap();
        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Finished);

        let observations = backend.fetch_observations(job).await.unwrap();
        assert_eq!(observations.len(), 2);
        assert!(observations.contains_key(&a.participant));
        assert!(observations.contains_key(&b.participant));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_slot_is_reclaimed_and_late_submission_rejected() {
        let backend = SandboxBackend::manual();
        let job = JobId(1);
        backend.dispatch(job, &batches(1)).await.unwrap();

        let stale = backend.begin_session(job).unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(99)).await;
        backend.poll_status(job, TIMEOUT).await.unwrap();
        assert_eq!(backend.slot_states(job).unwrap(), vec![SlotState::Running]);

        tokio::time::advance(Duration::from_secs(2)).await;
        let status = backend.poll_status(job, TIMEOUT).await.unwrap();
        assert_eq!(status, JobStatus::Running);
        assert_eq!(backend.slot_states(job).unwrap(), vec![SlotState::Reclaimed]);
        assert_eq!(backend.reclaim_count(job).unwrap(), 1);

        assert!(matches!(
            backend.submit(job, stale.participant, log()),
            Err(BackendError::Rejected { .. })
        ));

        let fresh = backend.begin_session(job).unwrap().unwrap();
        assert_eq!(fresh.slot, 0);
        assert_ne!(fresh.participant, stale.participant);
        backend.submit(job, fresh.participant, log()).unwrap();
        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Finished);

        let observations = backend.fetch_observations(job).await.unwrap();
        assert_eq!(observations.keys().copied().collect::<Vec<_>>(), vec![fresh.participant]);
    }

    #[tokio::test(start_paused = true)]
    async fn released_job_stops_reclaiming() {
        let backend = SandboxBackend::manual();
        let job = JobId(2);
        backend.dispatch(job, &batches(1)).await.unwrap();
        backend.begin_session(job).unwrap().unwrap();

        backend.release(job).await.unwrap();
        assert!(backend.is_released(job).unwrap());
        tokio::time::advance(Duration::from_secs(500)).await;
        backend.poll_status(job, TIMEOUT).await.unwrap();
        assert_eq!(backend.slot_states(job).unwrap(), vec![SlotState::Running]);
    }

    #[tokio::test]
    async fn unknown_and_duplicate_jobs() {
        let backend = SandboxBackend::manual();
        assert!(matches!(
            backend.poll_status(JobId(9), TIMEOUT).await,
            Err(BackendError::UnknownJob { .. })
        ));
        assert!(matches!(
            backend.fetch_observations(JobId(9)).await,
            Err(BackendError::UnknownJob { .. })
        ));

        backend.dispatch(JobId(0), &batches(1)).await.unwrap();
        assert!(matches!(
            backend.dispatch(JobId(0), &batches(1)).await,
            Err(BackendError::Rejected { .. })
        ));
        assert!(backend.dispatch(JobId(1), &[]).await.is_err());
    }

    #[tokio::test]
    async fn simulated_participants_fill_slots_over_polls() {
        let backend = SandboxBackend::new(SandboxSettings {
            arrivals_per_poll: 2,
            abandon_probability: 0.0,
            seed: 11,
        });
        let job = JobId(0);
        backend.dispatch(job, &batches(4)).await.unwrap();

        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Running);
        assert_eq!(backend.poll_status(job, TIMEOUT).await.unwrap(), JobStatus::Finished);

        let observations = backend.fetch_observations(job).await.unwrap();
        assert_eq!(observations.len(), 4);
        for observation in observations.values() {
            // fixation + response per trial
            assert_eq!(observation.len(), 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_sessions_are_eventually_replaced() {
        let backend = SandboxBackend::new(SandboxSettings {
            arrivals_per_poll: 1,
            abandon_probability: 0.5,
            seed: 5,
        });
        let job = JobId(0);
        backend.dispatch(job, &batches(3)).await.unwrap();

        let mut status = JobStatus::Pending;
        for _ in 0..500 {
            status = backend.poll_status(job, TIMEOUT).await.unwrap();
            if status == JobStatus::Finished {
                break;
            }
            tokio::time::advance(Duration::from_secs(101)).await;
        }
        assert_eq!(status, JobStatus::Finished);
        assert_eq!(backend.fetch_observations(job).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn forgotten_jobs_leave_the_table() {
        let backend = SandboxBackend::new(SandboxSettings {
            arrivals_per_poll: 2,
            ..SandboxSettings::default()
        });
        for id in 0..3 {
            backend.dispatch(JobId(id), &batches(2)).await.unwrap();
        }
        assert_eq!(backend.job_count(), 3);

        backend.poll_status(JobId(1), TIMEOUT).await.unwrap();
        backend.fetch_observations(JobId(1)).await.unwrap();
        backend.forget(JobId(1)).await.unwrap();

        assert_eq!(backend.job_count(), 2);
        assert!(matches!(
            backend.poll_status(JobId(1), TIMEOUT).await,
            Err(BackendError::UnknownJob { .. })
        ));
        assert!(matches!(
            backend.forget(JobId(1)).await,
            Err(BackendError::UnknownJob { .. })
        ));
        assert_eq!(backend.slot_states(JobId(0)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injected_outage_fails_then_recovers() {
        let backend = SandboxBackend::manual();
        backend.inject_outage(2);
        assert!(matches!(
            backend.dispatch(JobId(0), &batches(1)).await,
            Err(BackendError::Unavailable { .. })
        ));
        assert!(backend.dispatch(JobId(0), &batches(1)).await.is_err());
        backend.dispatch(JobId(0), &batches(1)).await.unwrap();
    }
}
