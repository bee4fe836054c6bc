//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::model::ResultLabel;
use crate::storage::StoreOptions;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_QC_RATE: f64 = 0.10;
pub const DEFAULT_STANDARD_VERSION: &str = "v1.0";
pub const DEFAULT_RESULTS: &str = "yes,no,skip";
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the shared store file.
    pub db_path: PathBuf,
    pub batch_size: usize,
    /// Fraction of each batch drawn from the QC pool.
    pub qc_rate: f64,
    /// Ruleset version stamped on every decision.
    pub standard_version: String,
    /// Labels workers may submit.
    pub results: Vec<ResultLabel>,
    pub busy_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let db_path = var("REVIEW_DB_PATH").map(PathBuf::from).ok_or_else(|| {
            Error::Config("required environment variable REVIEW_DB_PATH is not set".to_string())
        })?;

        let batch_size = parse_var("REVIEW_BATCH_SIZE", var("REVIEW_BATCH_SIZE"), DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(Error::Config("REVIEW_BATCH_SIZE must be at least 1".to_string()));
        }

        let qc_rate = parse_var("REVIEW_QC_RATE", var("REVIEW_QC_RATE"), DEFAULT_QC_RATE)?;
        if !(0.0..=1.0).contains(&qc_rate) {
            return Err(Error::Config(format!(
                "REVIEW_QC_RATE must be within [0, 1], got {qc_rate}"
            )));
        }

        let busy_secs = parse_var(
            "REVIEW_BUSY_TIMEOUT_SECS",
            var("REVIEW_BUSY_TIMEOUT_SECS"),
            DEFAULT_BUSY_TIMEOUT_SECS,
        )?;

        Ok(Self {
            db_path,
            batch_size,
            qc_rate,
            standard_version: var("REVIEW_STANDARD_VERSION")
                .unwrap_or_else(|| DEFAULT_STANDARD_VERSION.to_string()),
            results: parse_results(
                &var("REVIEW_RESULTS").unwrap_or_else(|| DEFAULT_RESULTS.to_string()),
            )?,
            busy_timeout: Duration::from_secs(busy_secs),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Engine settings derived from this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            store: StoreOptions {
                busy_timeout: self.busy_timeout,
            },
            allowed_results: self.results.clone(),
            ..EngineOptions::default()
        }
    }
}

fn parse_var<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
    }
}

/// Parse a comma-separated label allow-list.
pub fn parse_results(raw: &str) -> Result<Vec<ResultLabel>> {
    let mut labels: Vec<ResultLabel> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let label = ResultLabel::new(part);
        if let Some(code) = label.synthetic() {
            return Err(Error::Config(format!(
                "REVIEW_RESULTS may not contain the reserved code {code}"
            )));
        }
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    if labels.is_empty() {
        return Err(Error::Config("REVIEW_RESULTS lists no labels".to_string()));
    }
    Ok(labels)
}
