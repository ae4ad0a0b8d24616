//! Capability surface of a live simulator connection.
//!
//! The executor only ever sees [`SimulatorApi`]; the TCP implementation lives
//! behind it so scenario logic tests against scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::batch::dataset::SimTransform;
use crate::error::HarnessError;
use crate::sim::rpc::RpcTransport;

/// Result of the external scenario framework's per-tick evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Running,
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgoState {
    pub position: [f64; 3],
    pub velocity: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionEvent {
    pub actor: u32,
    pub other: u32,
}

/// Everything one synchronous step reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickInfo {
    pub frame: u64,
    pub sim_time: f64,
    pub ego: Option<EgoState>,
    #[serde(default)]
    pub collisions: Vec<CollisionEvent>,
    pub scenario: ScenarioStatus,
}

#[async_trait]
pub trait SimulatorApi: Send {
    /// Liveness probe and version exchange; the first call on any connection.
    async fn handshake(&mut self) -> Result<String, HarnessError>;

    /// Deterministic stepping: with `synchronous` set, sim time advances only
    /// on explicit [`SimulatorApi::tick`] calls.
    async fn apply_settings(
        &mut self,
        fixed_delta_seconds: f64,
        synchronous: bool,
        no_rendering: bool,
    ) -> Result<(), HarnessError>;

    async fn load_map(&mut self, map: &str) -> Result<(), HarnessError>;

    async fn spawn_ego(
        &mut self,
        blueprint: &str,
        role_name: &str,
        transform: &SimTransform,
    ) -> Result<u32, HarnessError>;

    /// Hands goal/route evaluation to the scenario execution framework.
    async fn bind_scenario(
        &mut self,
        logic: Option<&str>,
        destination: &SimTransform,
    ) -> Result<(), HarnessError>;

    async fn start_recorder(&mut self, path: &str) -> Result<(), HarnessError>;

    async fn stop_recorder(&mut self) -> Result<(), HarnessError>;

    /// Advances the simulation by exactly one fixed-delta step.
    async fn tick(&mut self) -> Result<TickInfo, HarnessError>;

    /// Destroys every actor the session spawned.
    async fn destroy_actors(&mut self) -> Result<(), HarnessError>;
}

pub struct TcpSimulator {
    transport: RpcTransport,
}

impl TcpSimulator {
    pub async fn connect(
        host: &str,
        port: u16,
        rpc_timeout: Duration,
    ) -> Result<Self, HarnessError> {
        let transport = RpcTransport::connect(host, port, rpc_timeout).await?;
        Ok(Self { transport })
    }

    fn decode<T: serde::de::DeserializeOwned>(
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<T, HarnessError> {
        serde_json::from_value(payload)
            .map_err(|e| HarnessError::Protocol(format!("decoding '{kind}' payload: {e}")))
    }
}

#[async_trait]
impl SimulatorApi for TcpSimulator {
    async fn handshake(&mut self) -> Result<String, HarnessError> {
        let payload = self.transport.call("handshake", json!({})).await?;
        #[derive(Deserialize)]
        struct Handshake {
            server_version: String,
        }
        let hs: Handshake = Self::decode("handshake", payload)?;
        Ok(hs.server_version)
    }

    async fn apply_settings(
        &mut self,
        fixed_delta_seconds: f64,
        synchronous: bool,
        no_rendering: bool,
    ) -> Result<(), HarnessError> {
        self.transport
            .call(
                "apply_settings",
                json!({
                    "fixed_delta_seconds": fixed_delta_seconds,
                    "synchronous_mode": synchronous,
                    "no_rendering_mode": no_rendering,
                }),
            )
            .await?;
        Ok(())
    }

    async fn load_map(&mut self, map: &str) -> Result<(), HarnessError> {
        self.transport.call("load_map", json!({ "map": map })).await?;
        Ok(())
    }

    async fn spawn_ego(
        &mut self,
        blueprint: &str,
        role_name: &str,
        transform: &SimTransform,
    ) -> Result<u32, HarnessError> {
        let payload = self
            .transport
            .call(
                "spawn_actor",
                json!({
                    "blueprint": blueprint,
                    "role_name": role_name,
                    "transform": transform,
                }),
            )
            .await?;
        #[derive(Deserialize)]
        struct Spawned {
            actor_id: u32,
        }
        let spawned: Spawned = Self::decode("spawn_actor", payload)?;
        Ok(spawned.actor_id)
    }

    async fn bind_scenario(
        &mut self,
        logic: Option<&str>,
        destination: &SimTransform,
    ) -> Result<(), HarnessError> {
        self.transport
            .call(
                "bind_scenario",
                json!({ "logic": logic, "destination": destination }),
            )
            .await?;
        Ok(())
    }

    async fn start_recorder(&mut self, path: &str) -> Result<(), HarnessError> {
        self.transport
            .call("start_recorder", json!({ "path": path }))
            .await?;
        Ok(())
    }

    async fn stop_recorder(&mut self) -> Result<(), HarnessError> {
        self.transport.call("stop_recorder", json!({})).await?;
        Ok(())
    }

    async fn tick(&mut self) -> Result<TickInfo, HarnessError> {
        let payload = self.transport.call("tick", json!({})).await?;
        Self::decode("tick", payload)
    }

    async fn destroy_actors(&mut self) -> Result<(), HarnessError> {
        self.transport.call("destroy_actors", json!({})).await?;
        Ok(())
    }
}
