//! Periodic vendor alias confidence decay.
//!
//! Aliases that have not matched anything for a long window lose 10% of
//! their confidence per run. The work is idempotent: re-running without new
//! matches keeps decaying monotonically, and an alias refreshed by a new
//! confirmed match drops out of the stale set entirely.

use crate::config::DecayConfig;
use crate::services::metrics::record_alias_decay;
use crate::services::store::MatchStore;
use chrono::{Duration, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Counters from one decay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecaySummary {
    pub examined: u32,
    pub decayed: u32,
    pub failed: u32,
}

pub struct AliasDecayJob {
    store: Arc<dyn MatchStore>,
    config: DecayConfig,
}

impl AliasDecayJob {
    pub fn new(store: Arc<dyn MatchStore>, config: DecayConfig) -> Self {
        Self { store, config }
    }

    /// One decay pass over the stale alias set. A single alias failing to
    /// update is logged and skipped rather than aborting the run.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<DecaySummary, AppError> {
        let cutoff = Utc::now() - Duration::days(self.config.stale_after_days);
        let stale = self
            .store
            .stale_aliases(cutoff, self.config.min_confidence)
            .await?;

        let mut summary = DecaySummary {
            examined: stale.len() as u32,
            ..DecaySummary::default()
        };

        for alias in stale {
            match self
                .store
                .decay_alias(alias.alias_id, self.config.decay_factor)
                .await
            {
                Ok(()) => summary.decayed += 1,
                Err(e) => {
                    warn!(
                        alias_id = %alias.alias_id,
                        pattern = %alias.pattern,
                        error = %e,
                        "Alias decay failed; continuing"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            examined = summary.examined,
            decayed = summary.decayed,
            failed = summary.failed,
            "Alias decay pass finished"
        );
        record_alias_decay(if summary.failed == 0 { "ok" } else { "partial" });
        Ok(summary)
    }

    /// Run on the configured cadence until cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("Alias decay job disabled by configuration");
                return;
            }

            let period = std::time::Duration::from_secs(self.config.interval_hours * 3600);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so boot does not
            // double as a scheduled run.
            ticker.tick().await;

            info!(
                interval_hours = self.config.interval_hours,
                stale_after_days = self.config.stale_after_days,
                "Alias decay job scheduled"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Alias decay job shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Alias decay run failed");
                            record_alias_decay("error");
                        }
                    }
                }
            }
        })
    }
}
