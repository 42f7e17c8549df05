use chrono::Duration;
use std::sync::Arc;
use tracing::{error, info, warn};
use transit_core::capacity::CapacityLedger;
use transit_core::clock::Clock;
use transit_core::intent::IntentStatus;
use transit_core::repository::IntentRepository;
use transit_core::StoreError;

use crate::orchestrator::BookingOrchestrator;
use crate::reservation;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open intents moved to `expired` by this pass.
    pub expired: usize,
    /// Intents whose capacity was released, including retries.
    pub released: usize,
    /// Candidates another writer changed first.
    pub skipped: usize,
    pub failed: usize,
    /// Stalled `confirming` intents driven to a terminal outcome.
    pub recovered: usize,
}

/// Expires lapsed holds and retries capacity releases that failed earlier.
///
/// The expiry write is a compare-and-swap on the intent version, so an
/// intent that was cancelled or moved into `confirming` between listing and
/// writing is skipped untouched. With confirmation recovery enabled it also
/// resumes intents left in `confirming` for longer than the grace period.
pub struct IntentSweeper {
    intents: Arc<dyn IntentRepository>,
    ledger: Arc<dyn CapacityLedger>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    confirmations: Option<(Arc<BookingOrchestrator>, Duration)>,
}

impl IntentSweeper {
    pub fn new(
        intents: Arc<dyn IntentRepository>,
        ledger: Arc<dyn CapacityLedger>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            intents,
            ledger,
            clock,
            batch_size: batch_size.max(1),
            confirmations: None,
        }
    }

    pub fn with_confirmation_recovery(mut self, orchestrator: Arc<BookingOrchestrator>, grace: Duration) -> Self {
        self.confirmations = Some((orchestrator, grace));
        self
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let candidates = self.intents.list_expired(now, self.batch_size).await?;
        for intent in candidates {
            if !intent.status.is_open() || !intent.is_expired(now) {
                report.skipped += 1;
                continue;
            }

            let mut next = intent.clone();
            if next.transition(IntentStatus::Expired, now).is_err() {
                report.skipped += 1;
                continue;
            }
            next.cancellation_reason = Some("hold_expired".to_string());

            match self.intents.replace(&next, intent.version).await {
                Ok(true) => {
                    next.version = intent.version + 1;
                    report.expired += 1;
                    info!(intent_id = %next.id, expires_at = %next.expires_at, "Intent expired");
                }
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(intent_id = %intent.id, error = %e, "Failed to expire intent");
                    report.failed += 1;
                    continue;
                }
            }

            match reservation::release_intent_capacity(
                self.ledger.as_ref(),
                self.intents.as_ref(),
                self.clock.as_ref(),
                next,
            )
            .await
            {
                Ok(_) => report.released += 1,
                Err(e) => {
                    warn!(intent_id = %intent.id, error = %e, "Release after expiry failed; will retry");
                    report.failed += 1;
                }
            }
        }

        let pending = self.intents.list_unreleased(self.batch_size).await?;
        for intent in pending {
            let intent_id = intent.id;
            match reservation::release_intent_capacity(
                self.ledger.as_ref(),
                self.intents.as_ref(),
                self.clock.as_ref(),
                intent,
            )
            .await
            {
                Ok(_) => report.released += 1,
                Err(e) => {
                    warn!(intent_id = %intent_id, error = %e, "Capacity release retry failed");
                    report.failed += 1;
                }
            }
        }

        if let Some((orchestrator, grace)) = &self.confirmations {
            let stalled = self.intents.list_stalled_confirmations(now - *grace, self.batch_size).await?;
            for intent in stalled {
                let intent_id = intent.id;
                match orchestrator.resume_confirmation(intent).await {
                    Ok(_) => report.recovered += 1,
                    Err(e) => match self.intents.get(intent_id).await {
                        Ok(Some(current)) if current.status != IntentStatus::Confirming => {
                            warn!(intent_id = %intent_id, status = %current.status, error = %e, "Stalled confirmation resolved without booking");
                            report.recovered += 1;
                        }
                        _ => {
                            warn!(intent_id = %intent_id, error = %e, "Stalled confirmation still pending; will retry");
                            report.failed += 1;
                        }
                    },
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                recovered = report.recovered,
                "Sweep finished"
            );
        }
        Ok(report)
    }
}
