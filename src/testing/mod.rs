//! Declarative scenario files
//!
//! Reads YAML scenarios and runs them with the scenario executor, so a test
//! can be written as data instead of Rust.

mod config;
mod runner;

pub use config::*;
pub use runner::{run_scenario, TestResult};
