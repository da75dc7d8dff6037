//! Core engine — the round loop: fetch → decide → push → record → resync.

pub mod catalog;
pub mod ledger;
pub mod orchestrator;
pub mod pricing;
pub mod repricer;
pub mod status;

pub use catalog::{CatalogSync, SyncReport};
pub use ledger::Ledger;
pub use orchestrator::{Orchestrator, OrchestratorSettings, RoundReport};
pub use repricer::{Repricer, RepricerSettings};
pub use status::{EngineState, StatusBoard};
