//! Pause step

use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;
use crate::params::Params;
use crate::scenario::Lifecycle;

/// Pause the scenario
///
/// A pause that would outlive the scenario deadline sleeps until the
/// deadline and fails.
#[derive(Debug, Clone, Copy)]
pub struct Sleep {
    pub duration: Duration,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Lifecycle for Sleep {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let bounded = params.clamp(self.duration);
        tokio::time::sleep(bounded).await;
        if bounded < self.duration {
            return Err(params.deadline_exceeded());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sleep"
    }
}
