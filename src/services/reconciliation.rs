// services/reconciliation.rs
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::ReconciliationConfig;
use crate::errors::PaymentError;
use crate::services::orchestrator::{ApplyResult, PaymentOrchestrator};

const CONCURRENCY: usize = 8;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub applied: usize,
    pub still_pending: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Polls providers for transactions whose webhook is late.
#[derive(Clone)]
pub struct ReconciliationSweep {
    orchestrator: PaymentOrchestrator,
    staleness_threshold: Duration,
    interval: Duration,
    batch_size: usize,
}

impl ReconciliationSweep {
    pub fn new(orchestrator: PaymentOrchestrator, config: &ReconciliationConfig) -> Self {
        ReconciliationSweep {
            orchestrator,
            staleness_threshold: config.staleness_threshold,
            interval: config.interval,
            batch_size: config.batch_size,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, PaymentError> {
        let threshold = chrono::Duration::from_std(self.staleness_threshold)
            .map_err(|e| PaymentError::Validation(format!("staleness threshold: {}", e)))?;
        let cutoff = Utc::now() - threshold;

        let stale = self
            .orchestrator
            .ledger()
            .find_stale_processing(cutoff, self.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };
        if stale.is_empty() {
            return Ok(report);
        }

        let results: Vec<_> = stream::iter(stale)
            .map(|tx| async move { (tx.id, self.orchestrator.reconcile(tx.id).await) })
            .buffer_unordered(CONCURRENCY)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(applied) => match applied.result {
                    ApplyResult::Applied => report.applied += 1,
                    ApplyResult::StillPending => report.still_pending += 1,
                    _ => report.skipped += 1,
                },
                // Settled by a webhook between the query and the poll.
                Err(PaymentError::InvalidState { .. }) => report.skipped += 1,
                Err(e) => {
                    warn!(transaction_id = %id, "Reconciliation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            applied = report.applied,
            still_pending = report.still_pending,
            errors = report.errors,
            "🔄 Reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Runs forever on the configured interval.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            staleness_secs = self.staleness_threshold.as_secs(),
            "Reconciliation sweep started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                error!("Reconciliation sweep failed: {}", e);
            }
        }
    }
}
