//! `CommitPhase`: finalize exactly once, or abandon after the commit window.

use serde_json::json;
use tracing::{debug, warn};

use super::{Coordinator, CoordinatorError, duration_ms};
use crate::store::{StoreError, events};

/// Reason recorded when a commit is abandoned.
pub const COMMIT_TIMEOUT_REASON: &str = "commit timeout";

/// What one `CommitPhase` tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No FINISH transaction without a commit marker.
    Idle,
    /// The selected transaction's type has no job.
    DeadLettered {
        /// Transaction left untouched.
        transaction_uid: String,
    },
    /// Commit preconditions do not hold yet; retried next tick.
    NotReady {
        /// The waiting transaction.
        transaction_uid: String,
    },
    /// The commit was applied.
    Committed {
        /// The committed transaction.
        transaction_uid: String,
    },
    /// The commit window passed; the transaction is now ERROR.
    TimedOut {
        /// The abandoned transaction.
        transaction_uid: String,
    },
    /// Another process wrote the commit marker first.
    LostRace {
        /// The contested transaction.
        transaction_uid: String,
    },
    /// The commit failed and will be retried next tick.
    Failed {
        /// The transaction, still FINISH.
        transaction_uid: String,
        /// Failure description.
        error: String,
    },
}

impl Coordinator {
    /// One `CommitPhase` tick.
    ///
    /// Takes the oldest FINISH transaction without a commit marker. Past its
    /// job's commit window it is abandoned as ERROR; otherwise, when the job
    /// can commit, the job performs its external calls and finalizes.
    pub async fn commit_tick(&self) -> Result<CommitOutcome, CoordinatorError> {
        let types = self.jobs.types();
        if types.is_empty() {
            return Ok(CommitOutcome::Idle);
        }
        let Some(transaction) = self.store.oldest_uncommitted_finished(&types)? else {
            return Ok(CommitOutcome::Idle);
        };
        let transaction_uid = transaction.uid.clone();
        let Some(job) = self.jobs.job_for(&transaction) else {
            warn!(%transaction_uid, "no job for transaction type");
            return Ok(CommitOutcome::DeadLettered { transaction_uid });
        };

        let now = self.clock.now_ms();
        let age = now.saturating_sub(transaction.updated_at_ms);
        if age > duration_ms(job.commit_timeout()) {
            return match self
                .store
                .abandon_commit(&transaction_uid, COMMIT_TIMEOUT_REASON, now)
            {
                Ok(()) => {
                    warn!(%transaction_uid, age_ms = age, "commit window passed; transaction abandoned");
                    Ok(CommitOutcome::TimedOut { transaction_uid })
                },
                Err(StoreError::AlreadyCommitted { .. } | StoreError::StaleTransition { .. }) => {
                    Ok(CommitOutcome::LostRace { transaction_uid })
                },
                Err(e) => Err(e.into()),
            };
        }

        if !job.can_commit() {
            debug!(%transaction_uid, "commit preconditions not met");
            return Ok(CommitOutcome::NotReady { transaction_uid });
        }

        match job.commit(&transaction, now).await {
            Ok(()) => Ok(CommitOutcome::Committed { transaction_uid }),
            Err(e) if e.is_lost_race() => {
                debug!(%transaction_uid, "commit already finalized elsewhere");
                Ok(CommitOutcome::LostRace { transaction_uid })
            },
            Err(e) => {
                let error = e.to_string();
                warn!(%transaction_uid, error = %error, "commit failed; will retry");
                self.store.append_event(
                    events::COMMIT_FAILED,
                    &transaction_uid,
                    &json!({ "error": error }),
                    self.clock.now_ms(),
                )?;
                Ok(CommitOutcome::Failed {
                    transaction_uid,
                    error,
                })
            },
        }
    }
}
