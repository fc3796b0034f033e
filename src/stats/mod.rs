//! Stats scraping and verification

mod admin;
mod matcher;
mod parser;
mod verifier;

pub use admin::AdminClient;
pub use matcher::{Check, Expectation, StatMatcher};
pub use parser::{parse_stats, Number, StatValue, Stats};
pub use verifier::{evaluate, verify, Backoff, StatsSource, MAX_BACKOFF};
