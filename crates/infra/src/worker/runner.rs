//! Long-running loop: one cycle immediately, then one per poll interval.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::RunnerConfig;

use super::{CycleReport, QueueCycle, WorkerError};

/// Runner statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    /// Ticks that found another cycle (e.g. an HTTP trigger) in flight.
    pub overlaps: u64,
    pub emails_sent: u64,
    pub last_report: Option<CycleReport>,
}

pub struct QueueRunner {
    cycle: Arc<dyn QueueCycle>,
    config: RunnerConfig,
}

/// Handle to a spawned runner. Dropping it also stops the loop.
#[derive(Debug)]
pub struct QueueRunnerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl QueueRunnerHandle {
    /// Stop after the cycle in flight (if any) and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            error!(error = %e, "email queue runner task failed");
        }
    }

    pub fn stats(&self) -> RunnerStats {
        snapshot(&self.stats)
    }
}

impl QueueRunner {
    pub fn new(cycle: Arc<dyn QueueCycle>, config: RunnerConfig) -> Self {
        Self { cycle, config }
    }

    pub fn spawn(self) -> QueueRunnerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(RunnerStats::default()));
        let join = tokio::spawn(runner_loop(self, shutdown_rx, stats.clone()));

        QueueRunnerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run_until<F>(self, signal: F) -> RunnerStats
    where
        F: Future<Output = ()>,
    {
        let handle = self.spawn();
        signal.await;
        info!("shutdown requested, stopping email queue runner");
        let stats = handle.stats.clone();
        handle.shutdown().await;
        snapshot(&stats)
    }
}

fn snapshot(stats: &Mutex<RunnerStats>) -> RunnerStats {
    stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

async fn runner_loop(
    runner: QueueRunner,
    mut shutdown: oneshot::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) {
    let mut interval = tokio::time::interval(runner.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        poll_interval_secs = runner.config.poll_interval.as_secs_f64(),
        "email queue runner started"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {}
        }

        let result = runner.cycle.run_cycle().await;
        let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(report) => {
                stats.cycles += 1;
                stats.emails_sent += report.sent as u64;
                stats.last_report = Some(report);
            }
            Err(WorkerError::AlreadyRunning) => {
                debug!("previous cycle still running, skipping tick");
                stats.overlaps += 1;
            }
            Err(e) => {
                error!(error = %e, "email queue cycle failed");
                stats.cycles += 1;
                stats.failed_cycles += 1;
            }
        }
    }

    info!("email queue runner stopped");
}
