//! Scenario executor
//!
//! A scenario is an ordered list of steps. Steps run one after another; the
//! first failure stops the run. Every step that started is then closed in
//! reverse order, whatever the outcome, so processes and sockets never
//! outlive the scenario.

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::params::Params;
use crate::steps::Step;

/// Run/close lifecycle shared by every step
#[async_trait]
pub trait Lifecycle: Send {
    /// Start the step, or perform it for one-shot steps
    async fn run(&mut self, params: &mut Params) -> Result<()>;

    /// Release whatever `run` acquired
    ///
    /// Must be safe when `run` never ran, failed midway or was cancelled, and
    /// when called more than once.
    async fn close(&mut self) -> Result<()>;

    /// Short name used in logs and errors
    fn kind(&self) -> &'static str;

    /// Captured output worth attaching to a failure report
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// An ordered list of steps
pub struct Scenario<S = Step> {
    steps: Vec<S>,
}

impl<S> Default for Scenario<S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<S> From<Vec<S>> for Scenario<S> {
    fn from(steps: Vec<S>) -> Self {
        Self { steps }
    }
}

impl<S: Lifecycle> Scenario<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; insertion order is execution order
    pub fn push(&mut self, step: S) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[S] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, then tear down
    ///
    /// Each step is bounded by the scenario deadline. On failure the failing
    /// step is closed first, then the started steps in reverse order, and the
    /// error names the step. Close errors are logged; with strict teardown a
    /// close error also fails an otherwise successful run.
    pub async fn run(&mut self, params: &mut Params) -> Result<()> {
        let strict = params.config().teardown.strict;
        let mut started = 0;
        let mut failure = None;

        for (i, step) in self.steps.iter_mut().enumerate() {
            let index = i + 1;
            let kind = step.kind();
            tracing::info!(scenario = params.name(), step = index, kind, "Running step");

            let deadline = params.deadline();
            let outcome = tokio::time::timeout_at(deadline, step.run(params)).await;
            let outcome = match outcome {
                Ok(result) => result,
                Err(_) => Err(params.deadline_exceeded()),
            };

            match outcome {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(scenario = params.name(), step = index, kind, "Step failed: {}", e);
                    failure = Some((i, e));
                    break;
                }
            }
        }

        if self.steps.is_empty() {
            return Ok(());
        }

        let logs = match &failure {
            Some(_) => self.collect_diagnostics(started),
            None => String::new(),
        };

        let mut teardown_errors = Vec::new();
        if let Some((failed, _)) = &failure {
            let step = &mut self.steps[*failed];
            if let Err(e) = step.close().await {
                tracing::warn!(step = failed + 1, kind = step.kind(), "Close failed: {}", e);
                teardown_errors.push(format!("step {} ({}): {}", failed + 1, step.kind(), e));
            }
        }
        for (i, step) in self.steps[..started].iter_mut().enumerate().rev() {
            tracing::debug!(step = i + 1, kind = step.kind(), "Closing step");
            if let Err(e) = step.close().await {
                tracing::warn!(step = i + 1, kind = step.kind(), "Close failed: {}", e);
                teardown_errors.push(format!("step {} ({}): {}", i + 1, step.kind(), e));
            }
        }

        match failure {
            Some((failed, source)) => Err(Error::Step {
                index: failed + 1,
                kind: self.steps[failed].kind(),
                source: Box::new(source),
                logs,
            }),
            None if strict && !teardown_errors.is_empty() => {
                Err(Error::Teardown(teardown_errors.join("; ")))
            }
            None => {
                tracing::info!(scenario = params.name(), steps = started, "Scenario passed");
                Ok(())
            }
        }
    }

    fn collect_diagnostics(&self, started: usize) -> String {
        self.steps[..started]
            .iter()
            .filter_map(|step| step.diagnostics())
            .filter(|logs| !logs.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
