//! Admin endpoint scraping

use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Error, Result};

use super::parser::{parse_stats, Stats};
use super::verifier::StatsSource;

/// Scrapes `/stats` from a proxy admin port on localhost
pub struct AdminClient {
    http: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl AdminClient {
    pub fn new(http: reqwest::Client, port: u16, timeout: Duration) -> Self {
        Self { http, port, timeout }
    }

    fn url(&self) -> String {
        format!("http://127.0.0.1:{}/stats", self.port)
    }
}

#[async_trait]
impl StatsSource for AdminClient {
    async fn scrape(&self) -> Result<Stats> {
        let url = self.url();
        let http_err = |source| Error::Http {
            method: "GET".to_string(),
            url: url.clone(),
            source,
        };

        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(http_err)?;

        let status = resp.status();
        let body = resp.text().await.map_err(http_err)?;
        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                method: "GET".to_string(),
                url,
                expected: 200,
                actual: status.as_u16(),
                body,
            });
        }

        Ok(parse_stats(&body))
    }

    fn port(&self) -> u16 {
        self.port
    }
}
