//! `RunPhase`: claim and apply one regional unit.

use serde_json::json;
use tracing::{debug, warn};

use super::{Coordinator, CoordinatorError, duration_ms};
use crate::store::{DetailStatus, PendingDetail, TransactionDetail, events};

/// What one `RunPhase` tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No READY detail and no expired lease in this region.
    Idle,
    /// The selected transaction's type has no job.
    DeadLettered {
        /// Transaction left untouched.
        transaction_uid: String,
    },
    /// Another process claimed the detail first.
    LostRace {
        /// The contested detail.
        detail_uid: String,
    },
    /// The unit succeeded and the detail is FINISH.
    Completed {
        /// Owning transaction.
        transaction_uid: String,
        /// Finished detail.
        detail_uid: String,
    },
    /// The unit succeeded but a concurrent duplicate had already finished
    /// the detail.
    AlreadyFinished {
        /// The detail.
        detail_uid: String,
    },
    /// The unit failed; the detail stays RUNNING until its lease expires.
    Failed {
        /// Owning transaction.
        transaction_uid: String,
        /// The detail left RUNNING.
        detail_uid: String,
        /// Failure description.
        error: String,
    },
}

impl Coordinator {
    /// One `RunPhase` tick.
    ///
    /// Picks the oldest READY detail of this region, else the oldest
    /// RUNNING detail whose lease expired, claims it by compare-and-swap on
    /// its observed status and timestamp, and runs the job's unit.
    pub async fn run_unit_tick(&self) -> Result<RunOutcome, CoordinatorError> {
        let Some(PendingDetail {
            detail,
            transaction,
        }) = self.next_claimable()?
        else {
            return Ok(RunOutcome::Idle);
        };

        let Some(job) = self.jobs.job_for(&transaction) else {
            warn!(
                transaction_uid = %transaction.uid,
                transaction_type = %transaction.transaction_type,
                "no job for transaction type"
            );
            return Ok(RunOutcome::DeadLettered {
                transaction_uid: transaction.uid,
            });
        };

        let claimed_at = self.clock.now_ms();
        if !self.store.claim_detail(&detail, claimed_at)? {
            debug!(detail_uid = %detail.uid, "lost claim race");
            return Ok(RunOutcome::LostRace {
                detail_uid: detail.uid,
            });
        }
        let running = TransactionDetail {
            status: DetailStatus::Running,
            updated_at_ms: claimed_at,
            ..detail
        };

        match job.unit(&transaction.info_uid).await {
            Ok(()) => {
                if self.store.finish_detail(&running, self.clock.now_ms())? {
                    Ok(RunOutcome::Completed {
                        transaction_uid: transaction.uid,
                        detail_uid: running.uid,
                    })
                } else {
                    Ok(RunOutcome::AlreadyFinished {
                        detail_uid: running.uid,
                    })
                }
            },
            Err(e) => {
                let error = e.to_string();
                warn!(
                    transaction_uid = %transaction.uid,
                    detail_uid = %running.uid,
                    region_uid = %running.region_uid,
                    error = %error,
                    "unit failed; detail stays RUNNING until its lease expires"
                );
                self.store.append_event(
                    events::UNIT_FAILED,
                    &transaction.uid,
                    &json!({
                        "detail_uid": running.uid,
                        "region_uid": running.region_uid,
                        "error": error,
                    }),
                    self.clock.now_ms(),
                )?;
                Ok(RunOutcome::Failed {
                    transaction_uid: transaction.uid,
                    detail_uid: running.uid,
                    error,
                })
            },
        }
    }

    fn next_claimable(&self) -> Result<Option<PendingDetail>, CoordinatorError> {
        let types = self.jobs.types();
        if types.is_empty() {
            return Ok(None);
        }
        if let Some(ready) = self.store.oldest_ready_detail(&self.region_uid, &types)? {
            return Ok(Some(ready));
        }
        let now = self.clock.now_ms();
        let cutoffs: Vec<_> = self
            .jobs
            .iter()
            .map(|job| {
                (
                    job.transaction_type(),
                    now.saturating_sub(duration_ms(job.unit_timeout())),
                )
            })
            .collect();
        Ok(self
            .store
            .oldest_expired_running_detail(&self.region_uid, &cutoffs)?)
    }
}
