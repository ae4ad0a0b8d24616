//! One scenario end-to-end: connect, configure, step, classify, clean up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::batch::dataset::ScenarioDescriptor;
use crate::config::{RunPolicy, SessionConfig};
use crate::error::{HarnessError, TerminalCause};
use crate::sim::client::{ScenarioStatus, TickInfo};
use crate::sim::session::{ConnectionManager, Session};

/// Everything the orchestrator needs to persist and classify one attempt.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub cause: TerminalCause,
    pub frames: u64,
    pub sim_seconds: f64,
    pub retries_used: u32,
    pub recording: Option<PathBuf>,
    pub wall_time: Duration,
    /// Human-readable failure detail for the console and the log.
    pub detail: Option<String>,
}

/// Mutable per-attempt record, dropped once the report is emitted.
struct RunState {
    frame: u64,
    sim_time: f64,
    retries_used: u32,
    anchor: Option<[f64; 3]>,
    ticks_since_progress: u64,
}

impl RunState {
    const fn new() -> Self {
        Self {
            frame: 0,
            sim_time: 0.0,
            retries_used: 0,
            anchor: None,
            ticks_since_progress: 0,
        }
    }

    /// Stuck tracking: the anchor only moves once the ego has travelled
    /// more than the epsilon away from it, so slow-but-steady progress
    /// never trips the detector.
    fn note_position(&mut self, position: [f64; 3], epsilon: f64) {
        match self.anchor {
            Some(anchor) if distance(anchor, position) <= epsilon => {
                self.ticks_since_progress += 1;
            }
            _ => {
                self.anchor = Some(position);
                self.ticks_since_progress = 0;
            }
        }
    }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx.mul_add(dx, dy.mul_add(dy, dz * dz)).sqrt()
}

pub struct ScenarioExecutor<'a> {
    manager: &'a ConnectionManager,
    session_cfg: &'a SessionConfig,
    policy: &'a RunPolicy,
    recording_dir: &'a Path,
    no_rendering: bool,
    stop: Arc<AtomicBool>,
}

impl<'a> ScenarioExecutor<'a> {
    #[must_use]
    pub fn new(
        manager: &'a ConnectionManager,
        session_cfg: &'a SessionConfig,
        policy: &'a RunPolicy,
        recording_dir: &'a Path,
        no_rendering: bool,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            manager,
            session_cfg,
            policy,
            recording_dir,
            no_rendering,
            stop,
        }
    }

    /// Runs one attempt. Emits exactly one report on every path; cleanup
    /// (recorder, actors, session) runs regardless of how the run ended.
    pub async fn run(&self, descriptor: &ScenarioDescriptor) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport {
            cause: TerminalCause::Aborted,
            frames: 0,
            sim_seconds: 0.0,
            retries_used: 0,
            recording: None,
            wall_time: Duration::ZERO,
            detail: None,
        };

        // INIT: a malformed descriptor never touches the server.
        if let Err(e) = descriptor.validate() {
            report.cause = TerminalCause::InvalidScenario;
            report.detail = Some(e.to_string());
            report.wall_time = started.elapsed();
            return report;
        }
        if self.stop.load(Ordering::SeqCst) {
            report.wall_time = started.elapsed();
            return report;
        }

        // CONNECTING
        let mut session = match self.manager.connect().await {
            Ok(session) => session,
            Err(e) => {
                report.cause = TerminalCause::ConnectionFailed;
                report.detail = Some(e.to_string());
                report.wall_time = started.elapsed();
                return report;
            }
        };

        // CONFIGURING + RUNNING, with cleanup guaranteed afterwards.
        let mut recorder_started = false;
        let drive = self
            .drive(descriptor, &mut session, &mut report, &mut recorder_started)
            .await;
        match drive {
            Ok(cause) => report.cause = cause,
            Err(e) => {
                report.detail = Some(e.to_string());
                report.cause = classify_error(&e);
            }
        }

        // CLEANUP
        self.cleanup(&mut session, recorder_started).await;
        if recorder_started {
            report.recording = Some(self.recording_path(descriptor));
        }
        report.wall_time = started.elapsed();
        report
    }

    fn recording_path(&self, descriptor: &ScenarioDescriptor) -> PathBuf {
        self.recording_dir.join(format!("{}.rec", descriptor.id))
    }

    async fn drive(
        &self,
        descriptor: &ScenarioDescriptor,
        session: &mut Session,
        report: &mut RunReport,
        recorder_started: &mut bool,
    ) -> Result<TerminalCause, HarnessError> {
        // CONFIGURING: deterministic stepping first, then world content.
        self.manager
            .configure(
                session,
                self.session_cfg.fixed_delta_seconds,
                self.session_cfg.synchronous,
                self.no_rendering,
            )
            .await
            .map_err(into_setup)?;
        session
            .api()?
            .load_map(&descriptor.map)
            .await
            .map_err(into_setup)?;
        session
            .api()?
            .spawn_ego(
                &descriptor.blueprint,
                "hero",
                &descriptor.spawn.to_sim_transform(),
            )
            .await
            .map_err(into_setup)?;
        session
            .api()?
            .bind_scenario(
                descriptor.logic.as_deref(),
                &descriptor.destination.to_sim_transform(),
            )
            .await
            .map_err(into_setup)?;

        std::fs::create_dir_all(self.recording_dir)?;
        let recording = self.recording_path(descriptor);
        session
            .api()?
            .start_recorder(&recording.to_string_lossy())
            .await
            .map_err(into_setup)?;
        *recorder_started = true;
        debug!("recording {} to {}", descriptor.id, recording.display());

        // RUNNING: one bounded tick per iteration, fixed-precedence
        // termination check after each.
        let mut state = RunState::new();
        let delta = self.session_cfg.fixed_delta_seconds;
        let cause = loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("stop requested, aborting scenario {}", descriptor.id);
                break TerminalCause::Aborted;
            }

            let info = match session.api()?.tick().await {
                Ok(info) => info,
                Err(e) if is_transient(&e) && state.retries_used < self.policy.step_retry_limit => {
                    state.retries_used += 1;
                    warn!(
                        "tick dropped ({}), retry {}/{}",
                        e, state.retries_used, self.policy.step_retry_limit
                    );
                    continue;
                }
                Err(e) if is_transient(&e) => {
                    report.frames = state.frame;
                    report.sim_seconds = state.sim_time;
                    report.retries_used = state.retries_used;
                    return Err(HarnessError::ServerCrashed(format!(
                        "tick failed {} times in a row: {e}",
                        self.policy.step_retry_limit + 1
                    )));
                }
                Err(e) => {
                    report.frames = state.frame;
                    report.sim_seconds = state.sim_time;
                    report.retries_used = state.retries_used;
                    return Err(e);
                }
            };

            state.frame += 1;
            state.sim_time = info.sim_time;

            if let Some(cause) = self.evaluate(&mut state, &info, delta) {
                break cause;
            }
            if state.frame >= descriptor.timeout_frames {
                break TerminalCause::TimedOut;
            }
        };

        report.frames = state.frame;
        report.sim_seconds = state.sim_time;
        report.retries_used = state.retries_used;
        Ok(cause)
    }

    /// Termination predicates in fixed precedence:
    /// collision > goal > scenario failure > actor lost > stuck.
    /// The frame budget is checked by the caller, last.
    fn evaluate(&self, state: &mut RunState, info: &TickInfo, delta: f64) -> Option<TerminalCause> {
        if !info.collisions.is_empty() {
            return Some(TerminalCause::Collision);
        }
        match info.scenario {
            ScenarioStatus::Passed => return Some(TerminalCause::GoalReached),
            ScenarioStatus::Failed | ScenarioStatus::Error => {
                return Some(TerminalCause::ScenarioFailed);
            }
            ScenarioStatus::Running => {}
        }
        let Some(ego) = info.ego.as_ref() else {
            return Some(TerminalCause::ActorLost);
        };
        if ego.position[2] < 0.0 {
            // Fallen through the map.
            return Some(TerminalCause::ActorLost);
        }
        state.note_position(ego.position, self.policy.stuck_epsilon);
        if state.ticks_since_progress as f64 * delta > self.policy.stuck_window_secs {
            return Some(TerminalCause::Stuck);
        }
        None
    }

    /// Best-effort teardown; failures here are logged, never propagated.
    async fn cleanup(&self, session: &mut Session, recorder_started: bool) {
        if session.is_open() {
            if recorder_started
                && let Ok(api) = session.api()
                && let Err(e) = api.stop_recorder().await
            {
                warn!("stop_recorder during cleanup failed: {e}");
            }
            if let Ok(api) = session.api()
                && let Err(e) = api.destroy_actors().await
            {
                warn!("destroy_actors during cleanup failed: {e}");
            }
        }
        self.manager.disconnect(session);
    }
}

fn into_setup(e: HarnessError) -> HarnessError {
    match e {
        // Hangs and dead sockets during setup are server problems, keep them.
        HarnessError::TimedOut { .. } | HarnessError::ServerCrashed(_) | HarnessError::Io(_) => e,
        other => HarnessError::Setup(other.to_string()),
    }
}

const fn is_transient(e: &HarnessError) -> bool {
    matches!(e, HarnessError::Protocol(_) | HarnessError::Io(_))
}

fn classify_error(e: &HarnessError) -> TerminalCause {
    match e {
        HarnessError::TimedOut { .. } => TerminalCause::TimedOut,
        HarnessError::ServerCrashed(_) | HarnessError::Io(_) => TerminalCause::ServerCrashed,
        HarnessError::Connection { .. } => TerminalCause::ConnectionFailed,
        HarnessError::InvalidScenario { .. } => TerminalCause::InvalidScenario,
        _ => TerminalCause::SetupFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::backoff::testing::RecordingClock;
    use crate::batch::dataset::sample_descriptor;
    use crate::sim::testing::{FakeSimulator, ScriptedConnector};

    struct Harness {
        manager: ConnectionManager,
        session_cfg: SessionConfig,
        policy: RunPolicy,
        recording_dir: PathBuf,
        stop: Arc<AtomicBool>,
    }

    impl Harness {
        fn new(sim: FakeSimulator) -> Self {
            Self::with_connector(ScriptedConnector::with_sim(sim))
        }

        fn with_connector(connector: ScriptedConnector) -> Self {
            let manager = ConnectionManager::with_connector(
                Box::new(connector),
                3,
                BackoffPolicy::fixed(Duration::from_millis(1)),
                Arc::new(RecordingClock::default()),
            );
            Self {
                manager,
                session_cfg: SessionConfig::default(),
                policy: RunPolicy::default(),
                recording_dir: std::env::temp_dir().join("simharness-exec-recordings"),
                stop: Arc::new(AtomicBool::new(false)),
            }
        }

        fn run(&self, descriptor: &ScenarioDescriptor) -> RunReport {
            let executor = ScenarioExecutor::new(
                &self.manager,
                &self.session_cfg,
                &self.policy,
                &self.recording_dir,
                true,
                self.stop.clone(),
            );
            tokio_test::block_on(executor.run(descriptor))
        }
    }

    #[test]
    fn budget_exhaustion_yields_timed_out_at_exact_frame_count() {
        let harness = Harness::new(FakeSimulator::default());
        let descriptor = sample_descriptor("budget");
        let report = harness.run(&descriptor);
        assert_eq!(report.cause, TerminalCause::TimedOut);
        assert_eq!(report.frames, 50);
        assert!(report.recording.is_some());
    }

    #[test]
    fn collision_stops_stepping_at_the_colliding_frame() {
        let sim = FakeSimulator {
            collide_at: Some(30),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("collision"));
        assert_eq!(report.cause, TerminalCause::Collision);
        assert_eq!(report.frames, 30);
    }

    #[test]
    fn scenario_pass_maps_to_goal_reached() {
        let sim = FakeSimulator {
            pass_at: Some(20),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("goal"));
        assert_eq!(report.cause, TerminalCause::GoalReached);
        assert_eq!(report.frames, 20);
    }

    #[test]
    fn collision_outranks_goal_on_the_same_tick() {
        let sim = FakeSimulator {
            collide_at: Some(25),
            pass_at: Some(25),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("both"));
        assert_eq!(report.cause, TerminalCause::Collision);
    }

    #[test]
    fn scenario_failure_is_content_not_server_level() {
        let sim = FakeSimulator {
            scenario_fail_at: Some(10),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("logic-fail"));
        assert_eq!(report.cause, TerminalCause::ScenarioFailed);
        assert!(!report.cause.is_server_failure());
    }

    #[test]
    fn fallen_ego_classifies_as_actor_lost() {
        let sim = FakeSimulator {
            fall_at: Some(12),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("fallen"));
        assert_eq!(report.cause, TerminalCause::ActorLost);
        assert_eq!(report.frames, 12);
    }

    #[test]
    fn despawned_ego_classifies_as_actor_lost() {
        let sim = FakeSimulator {
            despawn_at: Some(8),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("despawn"));
        assert_eq!(report.cause, TerminalCause::ActorLost);
        assert_eq!(report.frames, 8);
    }

    #[test]
    fn stalled_ego_trips_the_stuck_detector() {
        let sim = FakeSimulator {
            stall_from: Some(5),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let mut descriptor = sample_descriptor("stuck");
        descriptor.timeout_frames = 1_000;
        let report = harness.run(&descriptor);
        assert_eq!(report.cause, TerminalCause::Stuck);
        // Fires roughly one stuck-window after the stall, well before budget.
        assert!(report.frames > 200 && report.frames < 300, "{}", report.frames);
    }

    #[test]
    fn single_dropped_tick_is_retried_in_place() {
        let sim = FakeSimulator {
            flaky_ticks: vec![10],
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("flaky"));
        assert_eq!(report.cause, TerminalCause::TimedOut);
        assert_eq!(report.frames, 50);
        assert_eq!(report.retries_used, 1);
    }

    #[test]
    fn repeated_tick_failures_abort_as_server_crash() {
        let sim = FakeSimulator {
            crash_from: Some(10),
            ..FakeSimulator::default()
        };
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("crash"));
        assert_eq!(report.cause, TerminalCause::ServerCrashed);
        assert_eq!(report.frames, 9);
        assert!(report.cause.is_server_failure());
    }

    #[test]
    fn invalid_descriptor_never_touches_the_server() {
        let connector = ScriptedConnector::with_sim(FakeSimulator::default());
        let attempts = connector.attempt_counter();
        let harness = Harness::with_connector(connector);
        let mut descriptor = sample_descriptor("invalid");
        descriptor.map.clear();
        let report = harness.run(&descriptor);
        assert_eq!(report.cause, TerminalCause::InvalidScenario);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn setup_failure_still_cleans_up_the_session() {
        let sim = FakeSimulator {
            failing_op: Some("load_map"),
            ..FakeSimulator::default()
        };
        let calls = sim.calls.clone();
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("bad-map"));
        assert_eq!(report.cause, TerminalCause::SetupFailed);
        // destroy_actors ran during cleanup even though setup failed early
        let calls = calls.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c == "destroy_actors"));
        assert!(!calls.iter().any(|c| c == "tick"));
    }

    #[test]
    fn connect_exhaustion_reports_connection_failed() {
        let harness = Harness::with_connector(ScriptedConnector::refusing(99));
        let report = harness.run(&sample_descriptor("unreachable"));
        assert_eq!(report.cause, TerminalCause::ConnectionFailed);
        assert!(report.cause.is_server_failure());
    }

    #[test]
    fn stop_flag_aborts_before_any_connection() {
        let connector = ScriptedConnector::with_sim(FakeSimulator::default());
        let attempts = connector.attempt_counter();
        let harness = Harness::with_connector(connector);
        harness.stop.store(true, Ordering::SeqCst);
        let report = harness.run(&sample_descriptor("stopped"));
        assert_eq!(report.cause, TerminalCause::Aborted);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recorder_is_stopped_during_cleanup() {
        let sim = FakeSimulator {
            pass_at: Some(5),
            ..FakeSimulator::default()
        };
        let calls = sim.calls.clone();
        let harness = Harness::new(sim);
        let report = harness.run(&sample_descriptor("recorded"));
        assert_eq!(report.cause, TerminalCause::GoalReached);
        let calls = calls.lock().unwrap().clone();
        let start = calls.iter().position(|c| c == "start_recorder").unwrap();
        let stop = calls.iter().position(|c| c == "stop_recorder").unwrap();
        assert!(start < stop);
    }
}
