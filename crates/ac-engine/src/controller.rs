//! The closed-loop cycle controller.

use ac_aggregate::{AggregationReport, Diagnostic, ObservationAggregator};
use ac_design::{attach_conditions, partition, SequenceSynthesizer};
use ac_remote::{Deadline, RemoteBackend, RemoteJobClient, RetryPolicy};
use ac_sampler::{ConditionSampler, SamplingStrategy};
use ac_types::{AcError, AcResult, ConditionBatch, CycleConfig, JobId, ParticipantBatch};
use crossbeam_channel::Sender;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::ModelFitter;
use crate::snapshot::{CycleSnapshot, SnapshotHandle, SnapshotPublisher};
use crate::state::{CyclePhase, CycleState};

/// Terminal failure of a run. Accumulated state stays on the controller.
#[derive(Debug, Error)]
#[error("run failed while {phase} in cycle {cycle}: {source}")]
pub struct RunError {
    pub phase: CyclePhase,
    pub cycle: usize,
    #[source]
    pub source: AcError,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub cycles_completed: usize,
    pub observations: usize,
    pub diagnostics: usize,
    pub first_model: Option<String>,
    pub last_model: Option<String>,
}

/// Orchestrates sampling, synthesis, remote execution, aggregation and model
/// fitting for `cycles_total` strictly sequential cycles.
///
/// The controller owns [`CycleState`] outright. After every phase change it
/// publishes a fresh [`CycleSnapshot`]; new data only becomes visible in the
/// single publish that follows a successful fit.
pub struct CycleController<B: RemoteBackend, F: ModelFitter> {
    config: CycleConfig,
    sampler: Box<dyn SamplingStrategy>,
    synthesizer: SequenceSynthesizer,
    client: RemoteJobClient<B>,
    aggregator: ObservationAggregator,
    fitter: F,
    state: CycleState<F::Model>,
    phase: CyclePhase,
    publisher: SnapshotPublisher,
    cancel: CancellationToken,
}

impl<B: RemoteBackend, F: ModelFitter> CycleController<B, F> {
    /// Validate `config` and build every stage. Fails before any backend call.
    pub fn new(config: CycleConfig, backend: B, fitter: F) -> AcResult<Self> {
        config.validate()?;

        let sampler = ConditionSampler::new(config.random_seed)
            .with_oversampling(config.oversampling_factor)?;
        let synthesizer = SequenceSynthesizer::new(config.random_seed);
        // Counts are identical every cycle, so a dry run on a copy rules out
        // constraint failures before anything is dispatched.
        synthesizer.clone().synthesize(
            &config.design,
            config.total_trials(),
            config.min_trials_per_cell,
        )?;

        let aggregator = ObservationAggregator::from_config(&config)?;
        let cancel = CancellationToken::new();
        let client = RemoteJobClient::new(backend, RetryPolicy::from_config(&config.retry))
            .with_cancel_token(cancel.clone());

        Ok(Self {
            config,
            sampler: Box::new(sampler),
            synthesizer,
            client,
            aggregator,
            fitter,
            state: CycleState::new(),
            phase: CyclePhase::Sampling,
            publisher: SnapshotPublisher::new(),
            cancel,
        })
    }

    pub fn with_sampler(mut self, sampler: Box<dyn SamplingStrategy>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.client = self.client.with_cancel_token(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Forward aggregation diagnostics to `tx` as they are recorded.
    pub fn with_diagnostics(mut self, tx: Sender<Diagnostic>) -> Self {
        self.aggregator = self.aggregator.with_diagnostics(tx);
        self
    }

    pub fn snapshots(&self) -> SnapshotHandle {
        self.publisher.handle()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &CycleState<F::Model> {
        &self.state
    }

    pub fn into_state(self) -> CycleState<F::Model> {
        self.state
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn client(&self) -> &RemoteJobClient<B> {
        &self.client
    }

    /// Run every remaining cycle. On error the state of all completed cycles
    /// is kept and a failure snapshot is published.
    pub async fn run(&mut self) -> Result<RunSummary, RunError> {
        let deadline = self
            .config
            .run_deadline_seconds
            .map(|s| Deadline::after(Duration::from_secs_f64(s)));

        info!(
            cycles = self.config.cycles_total,
            participants = self.config.participants_per_cycle,
            blocks = self.config.blocks_per_participant,
            sampler = self.sampler.name(),
            model = self.fitter.name(),
            backend = self.client.backend().name(),
            "starting closed-loop run"
        );

        for cycle in self.state.cycles_completed..self.config.cycles_total {
            if let Err(source) = self.run_cycle(cycle, deadline).await {
                let err = RunError {
                    phase: self.phase,
                    cycle,
                    source,
                };
                error!(phase = %err.phase, cycle, error = %err.source, "run aborted");
                self.publish(format!("failed: {err}"));
                return Err(err);
            }
        }

        self.phase = CyclePhase::Done;
        let summary = RunSummary {
            cycles_completed: self.state.cycles_completed,
            observations: self.state.len(),
            diagnostics: self.state.diagnostics.len(),
            first_model: self.state.model_reports.first().cloned(),
            last_model: self.state.model_reports.last().cloned(),
        };
        self.publish(format!(
            "done: {} cycles, {} observations",
            summary.cycles_completed, summary.observations
        ));
        info!(
            cycles = summary.cycles_completed,
            observations = summary.observations,
            diagnostics = summary.diagnostics,
            first_model = summary.first_model.as_deref().unwrap_or("-"),
            last_model = summary.last_model.as_deref().unwrap_or("-"),
            "run complete"
        );
        Ok(summary)
    }

    async fn run_cycle(&mut self, cycle: usize, deadline: Option<Deadline>) -> AcResult<()> {
        let total = self.config.cycles_total;
        let job = JobId::from(cycle);

        self.enter(CyclePhase::Sampling, cycle, deadline)?;
        let conditions = self
            .sampler
            .sample(&self.state.conditions, self.config.blocks_per_participant)?;
        let batch = ConditionBatch::new(conditions);
        info!(cycle, conditions = %format_values(&batch.values()), "conditions sampled");

        self.enter(CyclePhase::Synthesizing, cycle, deadline)?;
        let batches = self.synthesize(&batch)?;

        self.enter(CyclePhase::Dispatching, cycle, deadline)?;
        self.client.dispatch(job, &batches).await?;

        self.enter(CyclePhase::Polling, cycle, deadline)?;
        self.client
            .wait_until_finished(
                job,
                Duration::from_secs_f64(self.config.reclaim_timeout_seconds),
                Duration::from_secs_f64(self.config.poll_interval_seconds),
                deadline,
            )
            .await?;
        let observations = self.client.fetch_observations(job).await?;

        self.enter(CyclePhase::Aggregating, cycle, deadline)?;
        let report = self.aggregator.aggregate(&observations, batch.as_slice());
        self.client.retire(job).await;

        self.enter(CyclePhase::Fitting, cycle, deadline)?;
        self.fit_and_commit(cycle, report)?;
        info!(
            cycle = cycle + 1,
            total,
            observations = self.state.len(),
            model = self.state.model_reports.last().map(String::as_str).unwrap_or("-"),
            "cycle complete"
        );
        Ok(())
    }

    fn synthesize(&mut self, batch: &ConditionBatch) -> AcResult<Vec<ParticipantBatch>> {
        let trials = self.synthesizer.synthesize(
            &self.config.design,
            self.config.total_trials(),
            self.config.min_trials_per_cell,
        )?;
        let batches = partition(
            trials,
            self.config.participants_per_cycle,
            self.config.blocks_per_participant,
        )?;
        Ok(attach_conditions(batches, batch)?)
    }

    /// Fit on the extended data, then swap everything in with one publish.
    fn fit_and_commit(&mut self, cycle: usize, report: AggregationReport) -> AcResult<()> {
        let mut conditions = self.state.conditions.clone();
        let mut accuracies = self.state.accuracies.clone();
        for accuracy in report.accuracies() {
            conditions.push(accuracy.condition);
            accuracies.push(accuracy.accuracy);
        }

        let x: Vec<Vec<f64>> = conditions.iter().map(|c| vec![c.value()]).collect();
        let y: Vec<Vec<f64>> = accuracies.iter().map(|a| vec![*a]).collect();
        let model = self.fitter.fit(&x, &y)?;
        let predictions = self.fitter.predict(&model, &x)?;
        let model_report = self.fitter.report(&model);

        self.state.conditions = conditions;
        self.state.accuracies = accuracies;
        self.state.predictions = predictions;
        self.state.model = Some(model);
        self.state.model_reports.push(model_report);
        self.state
            .diagnostics
            .extend(report.diagnostics.into_iter().map(|d| d.in_cycle(cycle)));
        self.state.cycles_completed = cycle + 1;

        self.publish(format!(
            "cycle {} of {} fitted",
            cycle + 1,
            self.config.cycles_total
        ));
        Ok(())
    }

    /// Cancellation and deadline checkpoint between phases.
    fn enter(
        &mut self,
        phase: CyclePhase,
        cycle: usize,
        deadline: Option<Deadline>,
    ) -> AcResult<()> {
        if self.cancel.is_cancelled() {
            warn!(cycle, next = %phase, "run cancelled");
            return Err(AcError::Cancelled);
        }
        if let Some(deadline) = deadline {
            deadline.check()?;
        }
        self.phase = phase;
        self.publish(format!(
            "cycle {} of {}: {phase}",
            cycle + 1,
            self.config.cycles_total
        ));
        Ok(())
    }

    fn publish(&self, status: String) {
        self.publisher
            .publish(CycleSnapshot::capture(&self.state, self.phase, status));
    }
}

fn format_values(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{v:.3}")).collect();
    format!("[{}]", parts.join(", "))
}
