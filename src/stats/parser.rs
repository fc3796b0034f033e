//! Parser for the admin `/stats` text format
//!
//! One metric per line as `name: value`. Counters and gauges carry integer
//! values; histograms and text stats carry free-form text.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A numeric metric value
///
/// Integers are kept exact so counters past 2^53 still compare correctly;
/// only values with a fractional part or exponent are floats.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i128),
    Float(f64),
}

impl Number {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(n) = raw.parse::<i128>() {
            return Some(Number::Int(n));
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Some(Number::Float(n)),
            _ => None,
        }
    }
}

/// Exact ordering of an integer against a float
fn cmp_int_float(int: i128, float: f64) -> Option<Ordering> {
    if float.is_nan() {
        return None;
    }
    if float < i128::MIN as f64 {
        return Some(Ordering::Greater);
    }
    if float >= i128::MAX as f64 {
        return Some(Ordering::Less);
    }
    let floor = float.floor();
    match int.cmp(&(floor as i128)) {
        Ordering::Equal if float > floor => Some(Ordering::Less),
        other => Some(other),
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (*self, *other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
            (Number::Float(a), Number::Float(b)) => a.partial_cmp(&b),
            (Number::Int(a), Number::Float(b)) => cmp_int_float(a, b),
            (Number::Float(a), Number::Int(b)) => cmp_int_float(b, a).map(Ordering::reverse),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Number::Int(n.into())
    }
}

impl From<u64> for Number {
    fn from(n: u64) -> Self {
        Number::Int(n.into())
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(n) => write!(f, "{}", n),
            // integral floats print without a fractional part
            Number::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Number::Float(n) => write!(f, "{}", n),
        }
    }
}

/// Value of one metric
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Number(Number),
    Text(String),
}

impl StatValue {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match Number::parse(raw) {
            Some(n) => StatValue::Number(n),
            None => StatValue::Text(raw.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            StatValue::Number(n) => Some(*n),
            StatValue::Text(_) => None,
        }
    }
}

impl From<u64> for StatValue {
    fn from(n: u64) -> Self {
        StatValue::Number(n.into())
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Number(n) => fmt::Display::fmt(n, f),
            StatValue::Text(s) => f.write_str(s),
        }
    }
}

/// Parsed metrics keyed by name
pub type Stats = BTreeMap<String, StatValue>;

/// Parse a `/stats` response body
///
/// Blank lines, `#` comments and lines without a separator are skipped.
pub fn parse_stats(body: &str) -> Stats {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (name, value) = line.split_once(": ").or_else(|| line.split_once(':'))?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), StatValue::parse(value)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counters_and_text() {
        let body = "\
cluster.backend.upstream_rq_total: 10
http.ingress.downstream_rq_2xx: 9

# scraped at startup
control_plane.identifier: server-node
cluster.backend.upstream_cx_length_ms: P0(nan,0) P25(nan,1)
garbage line
";
        let stats = parse_stats(body);

        assert_eq!(stats.len(), 4);
        assert_eq!(stats["cluster.backend.upstream_rq_total"], StatValue::from(10));
        assert_eq!(
            stats["control_plane.identifier"],
            StatValue::Text("server-node".to_string())
        );
        assert!(stats["cluster.backend.upstream_cx_length_ms"].as_number().is_none());
    }

    #[test]
    fn test_display_drops_trailing_zero() {
        assert_eq!(StatValue::Number(Number::Float(10.0)).to_string(), "10");
        assert_eq!(StatValue::Number(Number::Float(0.5)).to_string(), "0.5");
        assert_eq!(StatValue::parse("9007199254740993").to_string(), "9007199254740993");
    }

    #[test]
    fn test_large_counters_compare_exactly() {
        let observed = Number::parse("9007199254740992").unwrap();
        let expected = Number::parse("9007199254740993").unwrap();
        assert!(observed != expected);
        assert!(observed < expected);

        // mixed int/float comparisons stay exact
        assert!(Number::Int(2) == Number::Float(2.0));
        assert!(Number::Int(2) < Number::Float(2.5));
        assert!(Number::Int(3) > Number::Float(2.5));
        assert!(Number::Float(-0.5) < Number::Int(0));
        assert!(Number::Int(9007199254740993) != Number::Float(9007199254740992.0));
    }
}
