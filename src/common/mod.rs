//! Common utilities shared by the library, the CLI and the mock proxy

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Category, Error, Result, StatFailure};

/// Split a `KEY=VALUE` pair as given on the command line
pub fn parse_key_value(pair: &str) -> Option<(String, String)> {
    let (key, value) = pair.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("RequestCount=10"),
            Some(("RequestCount".to_string(), "10".to_string()))
        );
        assert_eq!(
            parse_key_value("Body=a=b"),
            Some(("Body".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_key_value("=10"), None);
        assert_eq!(parse_key_value("novalue"), None);
    }
}
