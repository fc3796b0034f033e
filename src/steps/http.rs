//! HTTP traffic step

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use crate::common::{Error, Result};
use crate::params::{Params, PortRef};
use crate::scenario::Lifecycle;

/// Expected response body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMatch {
    Exact(String),
    Contains(String),
}

/// Send one request to a local port and check the response
///
/// Path, body, header values and the expected body are templates.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub port: PortRef,
    pub path: String,
    pub method: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub expected_status: u16,
    pub expected_body: Option<BodyMatch>,
}

impl HttpCall {
    /// `GET path` on `port`, expecting 200
    pub fn get(port: impl Into<PortRef>, path: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            path: path.into(),
            method: "GET".to_string(),
            body: None,
            headers: BTreeMap::new(),
            expected_status: 200,
            expected_body: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    pub fn expect_body(mut self, body: BodyMatch) -> Self {
        self.expected_body = Some(body);
        self
    }

    fn url(&self, params: &Params) -> Result<String> {
        let port = params.port(&self.port)?;
        let path = params.render(&self.path)?;
        let slash = if path.starts_with('/') { "" } else { "/" };
        Ok(format!("http://127.0.0.1:{}{}{}", port, slash, path))
    }
}

#[async_trait]
impl Lifecycle for HttpCall {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let url = self.url(params)?;
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("invalid HTTP method '{}'", self.method)))?;
        let timeout = params.clamp(params.config().timeouts.request());

        let mut request = params.http().request(method.clone(), &url).timeout(timeout);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), params.render(value)?);
        }
        if let Some(body) = &self.body {
            request = request.body(params.render(body)?);
        }

        let http_err = |source| Error::Http {
            method: method.to_string(),
            url: url.clone(),
            source,
        };
        let resp = request.send().await.map_err(http_err)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(http_err)?;

        tracing::debug!(%method, %url, status, "HTTP call");

        if status != self.expected_status {
            return Err(Error::UnexpectedStatus {
                method: method.to_string(),
                url,
                expected: self.expected_status,
                actual: status,
                body: text,
            });
        }

        match &self.expected_body {
            Some(BodyMatch::Exact(expected)) => {
                let expected = params.render(expected)?;
                if text != expected {
                    return Err(Error::Assertion(format!(
                        "{} {} body was {:?}, expected {:?}",
                        method, url, text, expected
                    )));
                }
            }
            Some(BodyMatch::Contains(needle)) => {
                let needle = params.render(needle)?;
                if !text.contains(&needle) {
                    return Err(Error::Assertion(format!(
                        "{} {} body {:?} does not contain {:?}",
                        method, url, text, needle
                    )));
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http_call"
    }
}
