//! Shared test utilities for docqc integration tests.
//!
//! - `TestHarness` owns temporary watch and output folders and builds configs
//! - `ScriptedEngine` and `AutoQcApi` stand in for the office suite and the
//!   remote QC service

pub mod fakes;
pub mod harness;

pub use fakes::{AutoQcApi, EngineLog, ScriptedEngine};
pub use harness::{wait_for, wait_for_async, TestHarness};
