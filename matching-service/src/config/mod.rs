//! Configuration module for matching-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub matching: MatchingTuning,
    pub decay: DecayConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Tunables for candidate fetching and ranking. Scoring weights and the
/// proposal threshold are fixed; only the fetch window and review page size
/// vary by deployment.
#[derive(Debug, Clone, Copy)]
pub struct MatchingTuning {
    pub candidate_window_days: i64,
    pub max_candidates: usize,
}

impl Default for MatchingTuning {
    fn default() -> Self {
        Self {
            candidate_window_days: 7,
            max_candidates: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecayConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub stale_after_days: i64,
    pub decay_factor: f64,
    pub min_confidence: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24 * 7,
            stale_after_days: 180,
            decay_factor: 0.9,
            min_confidence: 0.5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl MatchingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let tuning = MatchingTuning::default();
        let decay = DecayConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "matching-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2),
            },
            matching: MatchingTuning {
                candidate_window_days: env_parse(
                    "CANDIDATE_WINDOW_DAYS",
                    tuning.candidate_window_days,
                ),
                max_candidates: env_parse("MAX_CANDIDATES", tuning.max_candidates),
            },
            decay: DecayConfig {
                enabled: env_parse("DECAY_JOB_ENABLED", decay.enabled),
                interval_hours: env_parse("DECAY_INTERVAL_HOURS", decay.interval_hours),
                stale_after_days: env_parse("ALIAS_STALE_AFTER_DAYS", decay.stale_after_days),
                decay_factor: env_parse("ALIAS_DECAY_FACTOR", decay.decay_factor),
                min_confidence: env_parse("ALIAS_MIN_CONFIDENCE", decay.min_confidence),
            },
        })
    }
}
