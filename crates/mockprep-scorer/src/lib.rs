//! mockprep-scorer: Scorer integrations and configuration.
//!
//! Implements the `Scorer` trait for a remote HTTP scoring service and a
//! scripted local mock, and loads `mockprep.toml`.

pub mod config;
pub mod http;
pub mod mock;

pub use config::{create_scorer, load_config, load_config_from, MockprepConfig, ScorerConfig};
pub use http::HttpScorer;
pub use mock::{MockOutcome, MockScorer};
