//! Scheduler loop with graceful shutdown.
//!
//! Due strands run concurrently, one task per strand, each under its own
//! lease and time budget. Polls that find nothing new back off according
//! to the [`PollingStrategy`].

use std::collections::HashSet;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::{EngineError, PollingStrategy, RunOutcome, Worker};

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Idle sleep policy.
    pub polling: PollingStrategy,
    /// Wall-clock budget for one strand run. Must stay well below the lease TTL.
    pub time_budget: Duration,
    /// Most strands run at once.
    pub batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            polling: PollingStrategy::default(),
            time_budget: Duration::from_secs(10),
            batch_size: 32,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Strands listed as due.
    pub due: usize,
    /// Runs that ended in a nap.
    pub napped: usize,
    /// Runs that ended in an exit.
    pub exited: usize,
    /// Runs stopped by the time budget.
    pub exhausted: usize,
    /// Strands leased by someone else, or gone, by the time we got to them.
    pub busy: usize,
    /// Already-exited strands whose late semaphores were cleared.
    pub cleaned: usize,
    /// Runs that failed with a recoverable error.
    pub failed: usize,
}

impl TickReport {
    /// Whether this tick ran at least one label.
    #[must_use]
    pub const fn did_work(&self) -> bool {
        self.napped + self.exited + self.exhausted + self.failed > 0
    }
}

/// Creates a shutdown channel. Send `true` to stop [`Worker::run`].
#[must_use]
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Waits for SIGINT or SIGTERM, then sends `true` through `shutdown_tx`.
#[allow(clippy::cognitive_complexity)]
pub async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, stopping after in-flight strands"),
        () = terminate => tracing::info!("Received SIGTERM, stopping after in-flight strands"),
    }

    if let Err(e) = shutdown_tx.send(true) {
        tracing::error!("Failed to send shutdown signal: {}", e);
    }
}

impl TickReport {
    fn record(&mut self, strand_id: Uuid, result: Result<RunOutcome, EngineError>) -> Option<EngineError> {
        match result {
            Ok(RunOutcome::Napped(_)) => self.napped += 1,
            Ok(RunOutcome::Exited { .. }) => self.exited += 1,
            Ok(RunOutcome::BudgetExhausted) => self.exhausted += 1,
            Ok(RunOutcome::Busy) | Err(EngineError::StrandNotFound(_)) => self.busy += 1,
            Ok(RunOutcome::AlreadyExited) => self.cleaned += 1,
            Err(e) if e.is_fatal() => {
                tracing::error!(strand_id = %strand_id, error = %e, "Fatal engine error");
                self.failed += 1;
                return Some(e);
            }
            Err(e) => {
                tracing::warn!(strand_id = %strand_id, error = %e, "Strand run failed");
                self.failed += 1;
            }
        }
        None
    }
}

type Run = (Uuid, Result<RunOutcome, EngineError>);

impl Worker {
    fn spawn_run(&self, runs: &mut JoinSet<Run>, strand_id: Uuid, budget: Duration) {
        let worker = self.clone();
        runs.spawn(async move { (strand_id, worker.run_strand(strand_id, budget).await) });
    }

    /// Runs every due strand once, concurrently, and waits for all of them.
    ///
    /// Recoverable per-strand errors are logged and counted. In-flight
    /// strands always finish (and release their leases) before a fatal
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error any strand raised (see
    /// [`EngineError::is_fatal`]), or `EngineError::Storage` if due strands
    /// cannot be listed.
    pub async fn tick(&self, config: &RunnerConfig) -> Result<TickReport, EngineError> {
        let due = self.store().due_strands(config.batch_size).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        let mut runs = JoinSet::new();
        for strand_id in due {
            self.spawn_run(&mut runs, strand_id, config.time_budget);
        }

        let mut fatal = None;
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((strand_id, result)) => {
                    if let Some(e) = report.record(strand_id, result) {
                        fatal.get_or_insert(e);
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id(), error = %e, "Strand task aborted");
                    report.failed += 1;
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Runs strands until `shutdown` turns `true` or a fatal error occurs.
    ///
    /// Up to `config.batch_size` strands run at once. Whenever a slot is
    /// free the store is polled for more due strands, so children budded
    /// by a running parent start while the parent is still joining.
    /// In-flight runs always finish before this returns.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the loop.
    pub async fn run(
        &self,
        config: RunnerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        tracing::info!(
            worker_id = %self.worker_id(),
            progs = ?self.registry().names(),
            polling = ?config.polling,
            time_budget = ?config.time_budget,
            batch_size = config.batch_size,
            "Worker started"
        );

        let mut runs: JoinSet<Run> = JoinSet::new();
        let mut running: HashSet<Uuid> = HashSet::new();
        let mut totals = TickReport::default();
        let mut fatal = None;
        let mut interval = config.polling.initial_interval();

        while fatal.is_none() && !*shutdown.borrow() {
            let mut started = 0;
            let free = config.batch_size.saturating_sub(running.len());
            if free > 0 {
                match self.store().due_strands(config.batch_size).await {
                    Ok(due) => {
                        let fresh: Vec<Uuid> = due
                            .into_iter()
                            .filter(|id| !running.contains(id))
                            .take(free)
                            .collect();
                        for strand_id in fresh {
                            running.insert(strand_id);
                            self.spawn_run(&mut runs, strand_id, config.time_budget);
                            started += 1;
                        }
                        totals.due += started;
                    }
                    Err(e) => tracing::warn!(worker_id = %self.worker_id(), error = %e, "Failed to list due strands"),
                }
            }

            interval = config.polling.next_interval(interval, started > 0);
            let pause = config.polling.apply_jitter(interval);
            tokio::select! {
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    match joined {
                        Ok((strand_id, result)) => {
                            running.remove(&strand_id);
                            fatal = totals.record(strand_id, result);
                        }
                        Err(e) => {
                            tracing::error!(worker_id = %self.worker_id(), error = %e, "Strand task aborted");
                            totals.failed += 1;
                            // The id is lost with the task; leases still keep
                            // a rerun of a live strand out.
                            running.clear();
                        }
                    }
                }
                () = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::warn!(worker_id = %self.worker_id(), "Shutdown channel closed, stopping");
                        break;
                    }
                }
            }
        }

        if !runs.is_empty() {
            tracing::info!(
                worker_id = %self.worker_id(),
                in_flight = runs.len(),
                "Waiting for in-flight strands"
            );
        }
        while let Some(joined) = runs.join_next().await {
            if let Ok((strand_id, result)) = joined {
                if let Some(e) = totals.record(strand_id, result) {
                    fatal.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            worker_id = %self.worker_id(),
            started = totals.due,
            napped = totals.napped,
            exited = totals.exited,
            failed = totals.failed,
            "Worker stopped"
        );

        match fatal {
            Some(e) => {
                tracing::error!(worker_id = %self.worker_id(), error = %e, "Worker stopped on fatal error");
                Err(e)
            }
            None => Ok(()),
        }
    }
}
