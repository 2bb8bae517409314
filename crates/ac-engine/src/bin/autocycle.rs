use ac_engine::{CycleController, CyclePhase, LinearRegression, SnapshotHandle};
use ac_remote::{HttpBackend, RemoteBackend, SandboxBackend};
use ac_types::{BackendConfig, CycleConfig};
use anyhow::Context;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often the presentation task logs progress.
const DISPLAY_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CycleConfig::from_env().context("loading configuration")?;

    match config.backend.clone() {
        BackendConfig::Sandbox(settings) => drive(config, SandboxBackend::new(settings)).await,
        BackendConfig::Http {
            base_url,
            headers,
            request_timeout_seconds,
        } => {
            let backend = HttpBackend::new(
                base_url,
                &headers,
                Duration::from_secs_f64(request_timeout_seconds),
            )
            .context("building HTTP backend")?;
            drive(config, backend).await
        }
    }
}

async fn drive<B>(config: CycleConfig, backend: B) -> anyhow::Result<()>
where
    B: RemoteBackend + 'static,
{
    let shutdown = CancellationToken::new();
    let (diag_tx, diag_rx) = crossbeam_channel::unbounded();
    let mut controller = CycleController::new(config, backend, LinearRegression::new())
        .context("initialising cycle controller")?
        .with_diagnostics(diag_tx)
        .with_cancel_token(shutdown.child_token());

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling the run");
            interrupt.cancel();
        }
    });

    let presenter = tokio::spawn(present(controller.snapshots(), shutdown.clone()));
    let driver = tokio::spawn(async move {
        let result = controller.run().await;
        (controller, result)
    });

    let (controller, result) = driver.await.context("driver task panicked")?;
    shutdown.cancel();
    presenter.await.context("presenter task panicked")?;

    let diagnostics: Vec<_> = diag_rx.try_iter().collect();
    if !diagnostics.is_empty() {
        info!(count = diagnostics.len(), "aggregation diagnostics recorded");
    }

    let state = controller.state();
    match result {
        Ok(summary) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&*controller.snapshots().latest())?
            );
            info!(cycles = summary.cycles_completed, "autocycle finished");
            Ok(())
        }
        Err(err) => {
            warn!(
                cycles_completed = state.cycles_completed,
                observations = state.len(),
                "run aborted; accumulated state kept"
            );
            Err(err.into())
        }
    }
}

/// Read-only observer: logs the latest snapshot until the run is done or
/// `shutdown` fires.
async fn present(snapshots: SnapshotHandle, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(DISPLAY_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let snapshot = snapshots.latest();
        info!(
            phase = %snapshot.phase,
            observations = snapshot.conditions.len(),
            last_prediction = snapshot.predictions.last().copied().unwrap_or(f64::NAN),
            status = %snapshot.status,
            "progress"
        );
        if snapshot.phase == CyclePhase::Done {
            return;
        }
    }
}
