//! proxy-e2e - end-to-end test driver for proxies fed by a control plane
//!
//! A test is a [`scenario::Scenario`] of [`steps::Step`]s run against one
//! [`params::Params`]: start the control-plane mock, publish configuration,
//! launch proxies, send traffic and assert on admin stats. Steps are torn
//! down in reverse order whatever the outcome.

pub mod cli;
pub mod commands;
pub mod common;
pub mod controlplane;
pub mod params;
pub mod scenario;
pub mod stats;
pub mod steps;
pub mod supervisor;
pub mod template;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use params::{Params, PortRef, Ports};
pub use scenario::{Lifecycle, Scenario};
pub use steps::Step;
