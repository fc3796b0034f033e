//! Scenario steps
//!
//! [`Step`] is the closed set of things a scenario can do. Each variant
//! wraps a type implementing [`Lifecycle`]; the enum dispatches to it.

mod envoy;
mod http;
mod repeat;
mod sleep;
mod stats;
mod xds;

pub use envoy::{ClientServerEnvoy, Envoy};
pub use http::{BodyMatch, HttpCall};
pub use repeat::Repeat;
pub use sleep::Sleep;
pub use stats::Stats;
pub use xds::{AckWait, Update, Xds};

use async_trait::async_trait;

use crate::common::Result;
use crate::params::Params;
use crate::scenario::Lifecycle;

/// One scenario step
pub enum Step {
    /// Start the control-plane mock
    Xds(Xds),
    /// Push a snapshot to the control plane
    Update(Update),
    /// Run one proxy
    Envoy(Envoy),
    /// Run a client and a server proxy
    ClientServerEnvoy(ClientServerEnvoy),
    /// Send one HTTP request
    HttpCall(HttpCall),
    /// Run a step several times
    Repeat(Repeat),
    /// Pause
    Sleep(Sleep),
    /// Assert on admin stats
    Stats(Stats),
}

impl Step {
    fn inner(&self) -> &dyn Lifecycle {
        match self {
            Step::Xds(s) => s,
            Step::Update(s) => s,
            Step::Envoy(s) => s,
            Step::ClientServerEnvoy(s) => s,
            Step::HttpCall(s) => s,
            Step::Repeat(s) => s,
            Step::Sleep(s) => s,
            Step::Stats(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Lifecycle {
        match self {
            Step::Xds(s) => s,
            Step::Update(s) => s,
            Step::Envoy(s) => s,
            Step::ClientServerEnvoy(s) => s,
            Step::HttpCall(s) => s,
            Step::Repeat(s) => s,
            Step::Sleep(s) => s,
            Step::Stats(s) => s,
        }
    }
}

#[async_trait]
impl Lifecycle for Step {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        self.inner_mut().run(params).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner_mut().close().await
    }

    fn kind(&self) -> &'static str {
        self.inner().kind()
    }

    fn diagnostics(&self) -> Option<String> {
        self.inner().diagnostics()
    }
}

macro_rules! impl_from_step {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Step {
                fn from(step: $variant) -> Self {
                    Step::$variant(step)
                }
            }
        )*
    };
}

impl_from_step!(Xds, Update, Envoy, ClientServerEnvoy, HttpCall, Repeat, Sleep, Stats);
