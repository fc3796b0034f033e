//! Polling stats verification

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::common::{Error, Result, StatFailure};

use super::matcher::Check;
use super::parser::Stats;

/// Upper bound on the delay between scrapes
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Something that can be scraped for stats
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn scrape(&self) -> Result<Stats>;

    /// Port reported in mismatch errors
    fn port(&self) -> u16;
}

/// How long and how often to poll
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub timeout: Duration,
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(timeout: Duration, initial: Duration) -> Self {
        Self {
            timeout,
            initial,
            max: MAX_BACKOFF.max(initial),
        }
    }
}

/// Metrics from `checks` that `stats` does not satisfy
pub fn evaluate(checks: &[(String, Check)], stats: &Stats) -> Vec<StatFailure> {
    checks
        .iter()
        .filter_map(|(name, check)| {
            let observed = stats.get(name);
            if check.evaluate(observed) {
                None
            } else {
                Some(StatFailure {
                    name: name.clone(),
                    expected: check.to_string(),
                    observed: observed.map(|v| v.to_string()),
                })
            }
        })
        .collect()
}

/// Scrape `source` until every check passes or `backoff.timeout` elapses
///
/// The delay between scrapes doubles from `backoff.initial` up to
/// `backoff.max`. Returns the number of scrapes on success. On timeout the
/// error lists every failing metric with the value seen on the last
/// successful scrape; if no scrape ever succeeded the last scrape error is
/// returned instead.
pub async fn verify<S>(source: &S, checks: &[(String, Check)], backoff: Backoff) -> Result<u32>
where
    S: StatsSource + ?Sized,
{
    let deadline = Instant::now() + backoff.timeout;
    let mut delay = backoff.initial;
    let mut attempts = 0u32;
    let mut failures: Option<Vec<StatFailure>> = None;
    let mut scrape_error: Option<Error> = None;

    loop {
        attempts += 1;
        match source.scrape().await {
            Ok(stats) => {
                let failed = evaluate(checks, &stats);
                if failed.is_empty() {
                    tracing::debug!(port = source.port(), attempts, "Stats matched");
                    return Ok(attempts);
                }
                tracing::trace!(port = source.port(), attempts, failing = failed.len(), "Stats not matched yet");
                failures = Some(failed);
            }
            Err(e) => {
                tracing::debug!(port = source.port(), attempts, "Stats scrape failed: {}", e);
                scrape_error = Some(e);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(backoff.max);
    }

    match (failures, scrape_error) {
        (Some(failures), _) => Err(Error::StatMismatch {
            port: source.port(),
            attempts,
            failures,
        }),
        (None, Some(e)) => Err(e),
        (None, None) => Err(Error::Internal("stats were never scraped".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{StatMatcher, StatValue};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports `requests` equal to the number of scrapes so far
    struct Counting {
        scrapes: AtomicU32,
    }

    #[async_trait]
    impl StatsSource for Counting {
        async fn scrape(&self) -> Result<Stats> {
            let n = self.scrapes.fetch_add(1, Ordering::SeqCst) + 1;
            let mut stats = Stats::new();
            stats.insert("requests".to_string(), StatValue::from(n as u64));
            Ok(stats)
        }

        fn port(&self) -> u16 {
            15000
        }
    }

    struct Unreachable;

    #[async_trait]
    impl StatsSource for Unreachable {
        async fn scrape(&self) -> Result<Stats> {
            Err(Error::Internal("connection refused".to_string()))
        }

        fn port(&self) -> u16 {
            15001
        }
    }

    fn checks(pairs: &[(&str, StatMatcher)]) -> Vec<(String, Check)> {
        pairs
            .iter()
            .map(|(name, m)| (name.to_string(), m.resolve(|t| Ok(t.to_string())).unwrap()))
            .collect()
    }

    fn fast(timeout_ms: u64) -> Backoff {
        Backoff::new(Duration::from_millis(timeout_ms), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_retries_until_converged() {
        let source = Counting {
            scrapes: AtomicU32::new(0),
        };
        let attempts = verify(
            &source,
            &checks(&[("requests", StatMatcher::partial(">= 3"))]),
            fast(5_000),
        )
        .await
        .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_reports_last_observed() {
        let source = Counting {
            scrapes: AtomicU32::new(0),
        };
        let err = verify(
            &source,
            &checks(&[
                ("requests", StatMatcher::exact(1_000_000)),
                ("missing", StatMatcher::exact(1)),
                ("requests_absent", StatMatcher::Absent),
            ]),
            fast(100),
        )
        .await
        .unwrap_err();

        match err {
            Error::StatMismatch {
                port,
                attempts,
                failures,
            } => {
                assert_eq!(port, 15000);
                assert!(attempts >= 2);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].name, "requests");
                assert_eq!(failures[0].observed, Some(attempts.to_string()));
                assert_eq!(failures[1].name, "missing");
                assert_eq!(failures[1].observed, None);
            }
            other => panic!("expected StatMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_admin_returns_scrape_error() {
        let err = verify(
            &Unreachable,
            &checks(&[("requests", StatMatcher::exact(1))]),
            fast(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "{:?}", err);
    }

    #[test]
    fn test_evaluate_is_pure() {
        let mut stats = Stats::new();
        stats.insert("a".to_string(), StatValue::from(1));
        let c = checks(&[("a", StatMatcher::exact(1)), ("b", StatMatcher::Absent)]);

        assert!(evaluate(&c, &stats).is_empty());
        assert!(evaluate(&c, &stats).is_empty());
    }
}
