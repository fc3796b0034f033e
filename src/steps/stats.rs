//! Stats assertion step

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;
use crate::params::{Params, PortRef};
use crate::scenario::Lifecycle;
use crate::stats::{verify, AdminClient, Backoff, Check, StatMatcher};

/// Assert on a proxy's admin stats, polling until they converge
///
/// Metric names and `Partial` expectations are templates. All of them are
/// rendered before the first scrape, so a missing variable fails at once.
#[derive(Debug, Clone)]
pub struct Stats {
    pub admin_port: PortRef,
    pub matchers: BTreeMap<String, StatMatcher>,
    /// Overrides the configured stats timeout
    pub timeout: Option<Duration>,
}

impl Stats {
    pub fn new(admin_port: impl Into<PortRef>) -> Self {
        Self {
            admin_port: admin_port.into(),
            matchers: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn expect(mut self, name: impl Into<String>, matcher: StatMatcher) -> Self {
        self.matchers.insert(name.into(), matcher);
        self
    }

    fn resolve(&self, params: &Params) -> Result<Vec<(String, Check)>> {
        self.matchers
            .iter()
            .map(|(name, matcher)| {
                let name = params.render(name)?;
                let check = matcher.resolve(|t| params.render(t))?;
                Ok((name, check))
            })
            .collect()
    }
}

#[async_trait]
impl Lifecycle for Stats {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let checks = self.resolve(params)?;
        let port = params.port(&self.admin_port)?;
        let timeouts = &params.config().timeouts;

        let admin = AdminClient::new(params.http().clone(), port, timeouts.request());
        let backoff = Backoff::new(
            params.clamp(self.timeout.unwrap_or_else(|| timeouts.stats())),
            timeouts.stats_poll(),
        );

        let attempts = verify(&admin, &checks, backoff).await?;
        tracing::info!(port, metrics = checks.len(), attempts, "Stats verified");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Config;
    use crate::common::Error;
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    /// Admin endpoint answering every request with `body`
    async fn admin(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let service = service_fn(move |_: Request<Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
                });
                tokio::spawn(http1::Builder::new().serve_connection(TokioIo::new(stream), service));
            }
        });
        port
    }

    fn params() -> Params {
        let mut config = Config::default();
        config.timeouts.stats_secs = 1;
        config.timeouts.stats_poll_ms = 10;
        let mut p = Params::new("stats_test", Default::default(), config).unwrap();
        p.set_var("RequestCount", "10");
        p
    }

    #[tokio::test]
    async fn test_matches_rendered_expectations() {
        let port = admin("listener.ingress.downstream_rq_2xx: 10\nserver.state: 0\n").await;

        Stats::new(port)
            .expect("listener.ingress.downstream_rq_2xx", StatMatcher::partial("{{ Vars.RequestCount }}"))
            .expect("server.state", StatMatcher::exact(0))
            .expect("cluster.gone.upstream_rq", StatMatcher::Absent)
            .run(&mut params())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_after_timeout() {
        let port = admin("listener.ingress.downstream_rq_2xx: 9\n").await;

        let err = Stats::new(port)
            .expect("listener.ingress.downstream_rq_2xx", StatMatcher::partial("{{ Vars.RequestCount }}"))
            .run(&mut params())
            .await
            .unwrap_err();
        match err {
            Error::StatMismatch { failures, .. } => {
                assert_eq!(failures[0].expected, "10");
                assert_eq!(failures[0].observed.as_deref(), Some("9"));
            }
            other => panic!("expected StatMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_variable_fails_before_scraping() {
        let err = Stats::new(1)
            .expect("x", StatMatcher::partial("{{ Vars.Unset }}"))
            .run(&mut params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingVariable(_)), "{:?}", err);
    }
}
