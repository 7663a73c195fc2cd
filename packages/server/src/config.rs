use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tickwork::{SchedulerKind, TimeIssuerOptions, DEFAULT_MAX_RETRIES};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub refresh_interval: Duration,
    pub issuer: TimeIssuerOptions,
    pub max_retries: u32,
    pub scheduler: SchedulerKind,
    pub catalogue_path: Option<PathBuf>,
    /// Simulated response time of the catalogue source
    pub source_latency: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup. Unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let issuer = TimeIssuerOptions {
            actions_per_second: parse_or(&lookup, "ACTIONS_PER_SECOND", 1.0)?,
            concurrent_actions: parse_or(&lookup, "CONCURRENT_ACTIONS", 1)?,
            actions_delay_min: parse_or(&lookup, "ACTIONS_DELAY_MIN", 0.001)?,
            actions_delay_max: parse_or(&lookup, "ACTIONS_DELAY_MAX", 0.25)?,
            is_stack: parse_or(&lookup, "ACTIONS_IS_STACK", false)?,
            seed: lookup("ACTIONS_SEED")
                .map(|raw| raw.parse::<u64>().context("ACTIONS_SEED must be a valid number"))
                .transpose()?,
        };

        Ok(Self {
            port: parse_or(&lookup, "PORT", 8080)?,
            refresh_interval: Duration::from_secs(parse_or(&lookup, "REFRESH_INTERVAL_SECS", 300)?),
            issuer: issuer.normalized(),
            max_retries: parse_or(&lookup, "MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            scheduler: match lookup("DISPATCH_SCHEDULER") {
                Some(raw) => raw
                    .parse::<SchedulerKind>()
                    .context("DISPATCH_SCHEDULER must be 'eager' or 'demand'")?,
                None => SchedulerKind::default(),
            },
            catalogue_path: lookup("CATALOGUE_PATH")
                .filter(|raw| !raw.trim().is_empty())
                .map(PathBuf::from),
            source_latency: Duration::from_millis(parse_or(&lookup, "SOURCE_LATENCY_MS", 250)?),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid value, got '{raw}'")),
        None => Ok(default),
    }
}
