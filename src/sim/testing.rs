//! Scripted simulator fakes shared by session, executor, and orchestrator
//! tests. Compiled only for test builds.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::batch::dataset::SimTransform;
use crate::error::HarnessError;
use crate::sim::client::{CollisionEvent, EgoState, ScenarioStatus, SimulatorApi, TickInfo};
use crate::sim::session::Connector;

/// A simulator whose world is a straight road: the ego drives forward at a
/// constant speed until one of the scripted events fires.
#[derive(Debug, Clone)]
pub struct FakeSimulator {
    pub version: String,
    pub delta: f64,
    /// Tick on which a collision event is reported.
    pub collide_at: Option<u64>,
    /// Tick on which the scenario framework reports Passed.
    pub pass_at: Option<u64>,
    /// Tick on which the scenario framework reports Failed.
    pub scenario_fail_at: Option<u64>,
    /// From this tick on the ego stops moving.
    pub stall_from: Option<u64>,
    /// From this tick on the ego is below the map (z < 0).
    pub fall_at: Option<u64>,
    /// From this tick on the ego is gone from the tick report.
    pub despawn_at: Option<u64>,
    /// Ticks that fail once with a transient error.
    pub flaky_ticks: Vec<u64>,
    /// From this tick on every tick fails (simulated crash).
    pub crash_from: Option<u64>,
    /// Which non-tick operation fails with a setup error, if any.
    pub failing_op: Option<&'static str>,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub frame: u64,
}

impl Default for FakeSimulator {
    fn default() -> Self {
        Self {
            version: "0.9.15-fake".to_string(),
            delta: 0.01,
            collide_at: None,
            pass_at: None,
            scenario_fail_at: None,
            stall_from: None,
            fall_at: None,
            despawn_at: None,
            flaky_ticks: Vec::new(),
            crash_from: None,
            failing_op: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            frame: 0,
        }
    }
}

impl FakeSimulator {
    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }

    fn check_op(&self, op: &'static str) -> Result<(), HarnessError> {
        self.record(op);
        if self.failing_op == Some(op) {
            return Err(HarnessError::Setup(format!("{op} rejected by script")));
        }
        Ok(())
    }
}

#[async_trait]
impl SimulatorApi for FakeSimulator {
    async fn handshake(&mut self) -> Result<String, HarnessError> {
        self.check_op("handshake")?;
        Ok(self.version.clone())
    }

    async fn apply_settings(
        &mut self,
        fixed_delta_seconds: f64,
        _synchronous: bool,
        _no_rendering: bool,
    ) -> Result<(), HarnessError> {
        self.delta = fixed_delta_seconds;
        self.check_op("apply_settings")
    }

    async fn load_map(&mut self, _map: &str) -> Result<(), HarnessError> {
        self.check_op("load_map")
    }

    async fn spawn_ego(
        &mut self,
        _blueprint: &str,
        _role_name: &str,
        _transform: &SimTransform,
    ) -> Result<u32, HarnessError> {
        self.check_op("spawn_ego")?;
        Ok(42)
    }

    async fn bind_scenario(
        &mut self,
        _logic: Option<&str>,
        _destination: &SimTransform,
    ) -> Result<(), HarnessError> {
        self.check_op("bind_scenario")
    }

    async fn start_recorder(&mut self, _path: &str) -> Result<(), HarnessError> {
        self.check_op("start_recorder")
    }

    async fn stop_recorder(&mut self) -> Result<(), HarnessError> {
        self.check_op("stop_recorder")
    }

    async fn tick(&mut self) -> Result<TickInfo, HarnessError> {
        let next = self.frame + 1;
        if let Some(from) = self.crash_from
            && next >= from
        {
            self.record("tick:crash");
            return Err(HarnessError::ServerCrashed("scripted crash".to_string()));
        }
        if let Some(pos) = self.flaky_ticks.iter().position(|&f| f == next) {
            self.flaky_ticks.remove(pos);
            self.record("tick:flaky");
            return Err(HarnessError::Protocol("scripted dropped tick".to_string()));
        }

        self.frame = next;
        self.record("tick");

        let moving = self.stall_from.is_none_or(|from| self.frame < from);
        let moving_frames = match self.stall_from {
            Some(from) => self.frame.min(from.saturating_sub(1)),
            None => self.frame,
        };
        let speed = 5.0;
        let x = speed * self.delta * moving_frames as f64;
        let z = match self.fall_at {
            Some(at) if self.frame >= at => -1.0,
            _ => 0.3,
        };
        let ego = match self.despawn_at {
            Some(at) if self.frame >= at => None,
            _ => Some(EgoState {
                position: [x, 0.0, z],
                velocity: [if moving { speed } else { 0.0 }, 0.0, 0.0],
            }),
        };
        let collisions = if self.collide_at == Some(self.frame) {
            vec![CollisionEvent {
                actor: 42,
                other: 7,
            }]
        } else {
            Vec::new()
        };
        let scenario = if self.pass_at == Some(self.frame) {
            ScenarioStatus::Passed
        } else if self.scenario_fail_at == Some(self.frame) {
            ScenarioStatus::Failed
        } else {
            ScenarioStatus::Running
        };

        Ok(TickInfo {
            frame: self.frame,
            sim_time: self.frame as f64 * self.delta,
            ego,
            collisions,
            scenario,
        })
    }

    async fn destroy_actors(&mut self) -> Result<(), HarnessError> {
        self.check_op("destroy_actors")
    }
}

/// Connector that refuses the first N attempts, then hands out clones of a
/// template [`FakeSimulator`].
pub struct ScriptedConnector {
    refusals: u32,
    attempts: Arc<AtomicU32>,
    template: FakeSimulator,
}

impl ScriptedConnector {
    pub fn refusing(refusals: u32) -> Self {
        Self {
            refusals,
            attempts: Arc::new(AtomicU32::new(0)),
            template: FakeSimulator::default(),
        }
    }

    pub fn with_sim(template: FakeSimulator) -> Self {
        Self {
            refusals: 0,
            attempts: Arc::new(AtomicU32::new(0)),
            template,
        }
    }

    pub fn attempt_counter(&self) -> Arc<AtomicU32> {
        self.attempts.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self) -> Result<Box<dyn SimulatorApi>, HarnessError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.refusals {
            return Err(HarnessError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("scripted refusal {attempt}"),
            )));
        }
        Ok(Box::new(self.template.clone()))
    }
}
