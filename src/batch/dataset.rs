//! Scenario descriptors and the dataset file.
//!
//! Dataset poses are right-handed with heading in radians; the simulator
//! wants a left-handed frame with yaw in degrees and its zero axis rotated a
//! quarter turn. The conversion (and its inverse, used by the replay
//! decoder) lives here so nothing else has to know about it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Dataset-convention pose: meters, right-handed, heading in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading: f64,
}

/// Simulator-convention transform: left-handed, rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimTransform {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl Pose {
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.heading.is_finite()
    }

    /// Converts into the simulator frame: y negated, yaw remapped and
    /// wrapped into [-180, 180).
    #[must_use]
    pub fn to_sim_transform(&self) -> SimTransform {
        let yaw = wrap_degrees(-self.heading.to_degrees() - 90.0);
        SimTransform {
            x: self.x,
            y: -self.y,
            z: self.z,
            pitch: 0.0,
            yaw,
            roll: 0.0,
        }
    }
}

/// Wraps an angle in degrees into [-180, 180).
#[must_use]
pub fn wrap_degrees(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}

/// Inverse of the yaw remap in [`Pose::to_sim_transform`]: simulator yaw in
/// degrees back to dataset heading in radians, wrapped into [-pi, pi).
#[must_use]
pub fn heading_from_sim_yaw(yaw_deg: f64) -> f64 {
    wrap_degrees(-(yaw_deg + 90.0)).to_radians()
}

/// One test case: static for the lifetime of its run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    pub id: String,
    /// Map name or OpenDRIVE file reference understood by the server.
    pub map: String,
    pub spawn: Pose,
    pub destination: Pose,
    /// Scenario-logic reference handed to the execution framework.
    #[serde(default)]
    pub logic: Option<String>,
    /// Frame budget; runs past this many ticks are classified TimedOut.
    pub timeout_frames: u64,
    #[serde(default = "default_blueprint")]
    pub blueprint: String,
}

fn default_blueprint() -> String {
    "vehicle.tesla.model3".to_string()
}

impl ScenarioDescriptor {
    pub fn validate(&self) -> Result<(), HarnessError> {
        let fail = |reason: &str| {
            Err(HarnessError::InvalidScenario {
                id: self.id.clone(),
                reason: reason.to_string(),
            })
        };
        if self.id.trim().is_empty() {
            return fail("empty id");
        }
        if self.map.trim().is_empty() {
            return fail("empty map reference");
        }
        if self.timeout_frames == 0 {
            return fail("zero frame budget");
        }
        if !self.spawn.is_finite() {
            return fail("non-finite spawn pose");
        }
        if !self.destination.is_finite() {
            return fail("non-finite destination pose");
        }
        Ok(())
    }
}

/// Loads the dataset file (a JSON array of descriptors) in file order.
pub fn load_dataset(path: &Path) -> Result<Vec<ScenarioDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let descriptors: Vec<ScenarioDescriptor> = serde_json::from_str(&raw)
        .with_context(|| format!("decoding dataset {}", path.display()))?;
    Ok(descriptors)
}

#[cfg(test)]
pub fn sample_descriptor(id: &str) -> ScenarioDescriptor {
    ScenarioDescriptor {
        id: id.to_string(),
        map: "Town04".to_string(),
        spawn: Pose {
            x: 10.0,
            y: 5.0,
            z: 0.3,
            heading: 0.0,
        },
        destination: Pose {
            x: 120.0,
            y: 5.0,
            z: 0.3,
            heading: 0.0,
        },
        logic: Some("FollowLeadingVehicle".to_string()),
        timeout_frames: 50,
        blueprint: default_blueprint(),
    }
}
