//! Repetition step

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::params::Params;
use crate::scenario::Lifecycle;

use super::Step;

/// Run an inner step `count` times in sequence
///
/// The inner step is closed after every iteration. The first failing
/// iteration stops the loop and is reported 1-based.
pub struct Repeat<S = Step> {
    pub count: usize,
    pub step: Box<S>,
}

impl<S: Lifecycle> Repeat<S> {
    pub fn new(count: usize, step: S) -> Self {
        Self {
            count,
            step: Box::new(step),
        }
    }
}

#[async_trait]
impl<S: Lifecycle> Lifecycle for Repeat<S> {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        for iteration in 1..=self.count {
            let outcome = self.step.run(params).await;
            let closed = self.step.close().await;

            if let Err(e) = outcome.and(closed) {
                tracing::debug!(iteration, total = self.count, "Iteration failed: {}", e);
                return Err(Error::Iteration {
                    iteration,
                    total: self.count,
                    source: Box::new(e),
                });
            }
        }
        tracing::debug!(iterations = self.count, kind = self.step.kind(), "Repeat finished");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.step.close().await
    }

    fn kind(&self) -> &'static str {
        "repeat"
    }

    fn diagnostics(&self) -> Option<String> {
        self.step.diagnostics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        runs: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl Lifecycle for Counter {
        async fn run(&mut self, _params: &mut Params) -> Result<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_at {
                return Err(Error::Assertion(format!("run {} failed", n)));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "counter"
        }
    }

    fn params() -> Params {
        Params::new("repeat_test", Default::default(), Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_runs_n_times() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut repeat = Repeat::new(10, Counter { runs: runs.clone(), fail_at: None });

        repeat.run(&mut params()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_stops_at_failing_iteration() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut repeat = Repeat::new(10, Counter { runs: runs.clone(), fail_at: Some(4) });

        let err = repeat.run(&mut params()).await.unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        match err {
            Error::Iteration { iteration, total, .. } => assert_eq!((iteration, total), (4, 10)),
            other => panic!("expected Iteration, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_count_is_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut repeat = Repeat::new(0, Counter { runs: runs.clone(), fail_at: Some(1) });

        repeat.run(&mut params()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
