pub mod dataset;
pub mod executor;
pub mod orchestrator;
pub mod outcomes;
pub mod report;

pub use dataset::{ScenarioDescriptor, load_dataset};
pub use orchestrator::{BatchOrchestrator, BatchSummary};
pub use outcomes::{OutcomeRecord, OutcomeStore};
