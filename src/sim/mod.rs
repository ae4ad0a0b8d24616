pub mod client;
pub mod rpc;
pub mod server;
pub mod session;

#[cfg(test)]
pub mod testing;

pub use client::{ScenarioStatus, SimulatorApi, TickInfo};
pub use server::{HealthState, ServerLifecycle};
pub use session::{ConnectionManager, Session};
