//! Batch supervision: dataset iteration, resume, restart policy, abort.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use log::{info, warn};

use crate::batch::dataset::ScenarioDescriptor;
use crate::batch::executor::{RunReport, ScenarioExecutor};
use crate::batch::outcomes::{OutcomeRecord, OutcomeStore};
use crate::config::{HarnessConfig, RenderMode};
use crate::error::{HarnessError, TerminalCause};
use crate::sim::server::{HealthState, ServerLifecycle};
use crate::sim::session::ConnectionManager;

/// Probe bound for the pre-scenario health check.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the orchestrator needs from server supervision. The real
/// implementation is [`ServerLifecycle`]; tests script health states.
#[async_trait]
pub trait ServerSupervisor: Send {
    async fn start(&mut self) -> Result<(), HarnessError>;
    async fn health(&mut self) -> HealthState;
    async fn restart(&mut self) -> Result<(), HarnessError>;
    async fn shutdown(&mut self);
}

#[async_trait]
impl ServerSupervisor for ServerLifecycle {
    async fn start(&mut self) -> Result<(), HarnessError> {
        Self::start(self).await
    }

    async fn health(&mut self) -> HealthState {
        self.health_check(HEALTH_PROBE_TIMEOUT).await
    }

    async fn restart(&mut self) -> Result<(), HarnessError> {
        Self::restart(self).await
    }

    async fn shutdown(&mut self) {
        self.stop().await;
    }
}

#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub restarts: u32,
    /// Set when an explicit stop request cut the batch short.
    pub stopped_early: bool,
}

impl BatchSummary {
    #[must_use]
    pub const fn completed_fully(&self) -> bool {
        !self.stopped_early
    }
}

pub struct BatchOrchestrator {
    supervisor: Box<dyn ServerSupervisor>,
    manager: ConnectionManager,
    config: HarnessConfig,
    store: OutcomeStore,
    stop: Arc<AtomicBool>,
}

impl BatchOrchestrator {
    #[must_use]
    pub fn new(
        supervisor: Box<dyn ServerSupervisor>,
        manager: ConnectionManager,
        config: HarnessConfig,
        store: OutcomeStore,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            supervisor,
            manager,
            config,
            store,
            stop,
        }
    }

    /// Runs the dataset in order. Every attempt appends exactly one outcome
    /// record before the next scenario starts; the only errors that escape
    /// are `FatalAbort` (restart ceiling) and an unwritable outcome store.
    /// The server is shut down on every exit path.
    pub async fn run(
        &mut self,
        dataset: &[ScenarioDescriptor],
    ) -> Result<BatchSummary, HarnessError> {
        let result = self.run_inner(dataset).await;
        // No orphaned simulator process, whichever way the batch ended.
        self.supervisor.shutdown().await;
        result
    }

    async fn run_inner(
        &mut self,
        dataset: &[ScenarioDescriptor],
    ) -> Result<BatchSummary, HarnessError> {
        let mut summary = BatchSummary {
            total: dataset.len(),
            ..BatchSummary::default()
        };
        let mut restarts: u32 = 0;
        let ceiling = self.config.batch.restart_ceiling;

        for descriptor in dataset {
            if self.stop.load(Ordering::SeqCst) {
                summary.stopped_early = true;
                break;
            }
            if self.config.batch.resume && self.store.has_success(&descriptor.id) {
                info!("skipping '{}': already succeeded", descriptor.id);
                summary.skipped += 1;
                continue;
            }

            // Re-run the same scenario after a server-level failure, until
            // it resolves or the restart ceiling is hit.
            loop {
                self.ensure_server().await;

                let attempt = self.store.next_attempt(&descriptor.id);
                let executor = ScenarioExecutor::new(
                    &self.manager,
                    &self.config.session,
                    &self.config.run,
                    &self.config.batch.recording_dir,
                    self.config.server.render == RenderMode::Offscreen,
                    self.stop.clone(),
                );
                let report = executor.run(descriptor).await;
                let record = to_record(descriptor, attempt, &report);
                self.store
                    .append(&record)
                    .map_err(|e| HarnessError::Io(std::io::Error::other(e.to_string())))?;
                announce(descriptor, &record, &report);
                summary.executed += 1;
                if record.cause.is_success() {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }

                if self.stop.load(Ordering::SeqCst) {
                    summary.stopped_early = true;
                    break;
                }
                if !record.cause.is_server_failure() {
                    break;
                }
                if restarts >= ceiling {
                    warn!(
                        "server failed again on '{}' with the restart ceiling spent",
                        descriptor.id
                    );
                    return Err(HarnessError::FatalAbort {
                        ceiling,
                        scenario: descriptor.id.clone(),
                    });
                }
                restarts += 1;
                info!(
                    "server-level failure on '{}', restart {restarts}/{ceiling}",
                    descriptor.id
                );
                if let Err(e) = self.supervisor.restart().await {
                    warn!("restart failed: {e}");
                }
            }

            if summary.stopped_early {
                break;
            }
        }

        summary.restarts = restarts;
        Ok(summary)
    }

    /// Pre-scenario health gate: start a stopped server, restart an
    /// unresponsive one. These restarts do not charge the ceiling — only
    /// restarts provoked by a failed attempt do. Failures here are logged
    /// and left for the executor's connect to classify.
    async fn ensure_server(&mut self) {
        match self.supervisor.health().await {
            HealthState::Ready => {}
            HealthState::Stopped => {
                if let Err(e) = self.supervisor.start().await {
                    warn!("server start failed: {e}");
                }
            }
            HealthState::Starting | HealthState::Unresponsive => {
                warn!("server unresponsive before scenario, restarting");
                if let Err(e) = self.supervisor.restart().await {
                    warn!("restart failed: {e}");
                }
            }
        }
    }
}

fn to_record(descriptor: &ScenarioDescriptor, attempt: u32, report: &RunReport) -> OutcomeRecord {
    let mut record = OutcomeRecord::now(&descriptor.id, attempt, report.cause);
    record.frames = report.frames;
    record.sim_seconds = report.sim_seconds;
    record.wall_time = report.wall_time;
    record.recording = report.recording.clone();
    record.retries_used = report.retries_used;
    record
}

fn announce(descriptor: &ScenarioDescriptor, record: &OutcomeRecord, report: &RunReport) {
    if record.cause.is_success() {
        println!(
            "✅ [{}] attempt {} - {} frames in {:?}",
            descriptor.id.green(),
            record.attempt,
            record.frames,
            record.wall_time
        );
    } else {
        let detail = report.detail.as_deref().unwrap_or(record.cause.describe());
        eprintln!(
            "❌ [{}] attempt {} - {} after {} frames: {}",
            descriptor.id.red(),
            record.attempt,
            record.cause.describe(),
            record.frames,
            detail
        );
    }
}
