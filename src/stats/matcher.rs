//! Metric matchers
//!
//! Matching runs in two phases. [`StatMatcher::resolve`] renders templates
//! and parses expressions once, before any polling. [`Check::evaluate`] is
//! then a pure function of the parsed stats and can be retried freely.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::common::{Error, Result};

use super::parser::{Number, StatValue};

/// Expected state of one metric
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatMatcher {
    /// The metric equals this value (numerically when both sides are numbers)
    Exact(#[serde(deserialize_with = "scalar_text")] String),
    /// The rendered template is an expectation expression, see [`Expectation::parse`]
    Partial(String),
    /// The metric must not be reported at all
    Absent,
}

/// Accept any scalar for an exact value, so `{exact: 1}` and `{exact: "1"}` agree
fn scalar_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(text) => text,
        Scalar::Signed(n) => n.to_string(),
        Scalar::Unsigned(n) => n.to_string(),
        Scalar::Float(n) => Number::Float(n).to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

impl StatMatcher {
    pub fn exact(value: impl ToString) -> Self {
        StatMatcher::Exact(value.to_string())
    }

    pub fn partial(template: impl Into<String>) -> Self {
        StatMatcher::Partial(template.into())
    }

    /// Render and parse into a check that can be evaluated repeatedly
    pub fn resolve<F>(&self, render: F) -> Result<Check>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        match self {
            StatMatcher::Exact(value) => Ok(Check::Present(Expectation::literal(value))),
            StatMatcher::Partial(template) => {
                let rendered = render(template)?;
                Ok(Check::Present(Expectation::parse(&rendered)?))
            }
            StatMatcher::Absent => Ok(Check::Absent),
        }
    }
}

/// Comparison applied to an observed value
#[derive(Debug, Clone)]
pub enum Expectation {
    Eq(Number),
    Ne(Number),
    Gt(Number),
    Ge(Number),
    Lt(Number),
    Le(Number),
    Matches(Regex),
    Text(String),
}

impl Expectation {
    /// Parse an expectation expression
    ///
    /// `N`, `== N`, `!= N`, `> N`, `>= N`, `< N`, `<= N` compare numerically,
    /// `~ re` matches a regex against the value's text, and anything else
    /// must equal the value's text.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        const OPERATORS: [(&str, fn(Number) -> Expectation); 6] = [
            ("==", Expectation::Eq),
            ("!=", Expectation::Ne),
            (">=", Expectation::Ge),
            ("<=", Expectation::Le),
            (">", Expectation::Gt),
            ("<", Expectation::Lt),
        ];
        for (op, build) in OPERATORS {
            if let Some(operand) = expr.strip_prefix(op) {
                let n = Number::parse(operand).ok_or_else(|| {
                    Error::Config(format!(
                        "stat expectation '{}': '{}' is not a number",
                        expr,
                        operand.trim()
                    ))
                })?;
                return Ok(build(n));
            }
        }

        if let Some(pattern) = expr.strip_prefix('~') {
            let re = Regex::new(pattern.trim()).map_err(|e| {
                Error::Config(format!("stat expectation '{}': {}", expr, e))
            })?;
            return Ok(Expectation::Matches(re));
        }

        Ok(Self::literal(expr))
    }

    /// A plain value: numeric equality if it is a number, text equality otherwise
    pub fn literal(value: &str) -> Self {
        let value = value.trim();
        match Number::parse(value) {
            Some(n) => Expectation::Eq(n),
            None => Expectation::Text(value.to_string()),
        }
    }

    pub fn matches(&self, observed: &StatValue) -> bool {
        let number = observed.as_number();
        match self {
            Expectation::Eq(n) => number.is_some_and(|v| v == *n),
            Expectation::Ne(n) => number.is_some_and(|v| v != *n),
            Expectation::Gt(n) => number.is_some_and(|v| v > *n),
            Expectation::Ge(n) => number.is_some_and(|v| v >= *n),
            Expectation::Lt(n) => number.is_some_and(|v| v < *n),
            Expectation::Le(n) => number.is_some_and(|v| v <= *n),
            Expectation::Matches(re) => re.is_match(&observed.to_string()),
            Expectation::Text(text) => observed.to_string() == *text,
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Eq(n) => write!(f, "{}", n),
            Expectation::Ne(n) => write!(f, "!= {}", n),
            Expectation::Gt(n) => write!(f, "> {}", n),
            Expectation::Ge(n) => write!(f, ">= {}", n),
            Expectation::Lt(n) => write!(f, "< {}", n),
            Expectation::Le(n) => write!(f, "<= {}", n),
            Expectation::Matches(re) => write!(f, "~ {}", re.as_str()),
            Expectation::Text(text) => write!(f, "'{}'", text),
        }
    }
}

/// A resolved matcher
#[derive(Debug, Clone)]
pub enum Check {
    Present(Expectation),
    Absent,
}

impl Check {
    pub fn evaluate(&self, observed: Option<&StatValue>) -> bool {
        match (self, observed) {
            (Check::Present(expectation), Some(value)) => expectation.matches(value),
            (Check::Present(_), None) => false,
            (Check::Absent, observed) => observed.is_none(),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Present(expectation) => fmt::Display::fmt(expectation, f),
            Check::Absent => f.write_str("absent"),
        }
    }
}
