//! DEMPER — concurrent marketplace repricing engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod proxy;
pub mod marketplace;
pub mod session;
pub mod storage;
pub mod engine;
pub mod dashboard;
