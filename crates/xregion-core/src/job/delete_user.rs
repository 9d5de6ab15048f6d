//! `DELETE_USER`: remove a user's resource from every region, then retire
//! the global account.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use super::{JobError, JobTimeouts, TransactionType};
use crate::region::RegionalUserApi;
use crate::store::{
    CommitEffect, DeleteUserTransactionInfo, PrecommitTransaction, TransactionStore, events,
};

/// Deletes a user everywhere.
#[derive(Debug, Clone)]
pub struct DeleteUserJob {
    store: TransactionStore,
    region: Arc<dyn RegionalUserApi>,
    timeouts: JobTimeouts,
}

impl DeleteUserJob {
    /// Creates the job.
    #[must_use]
    pub fn new(
        store: TransactionStore,
        region: Arc<dyn RegionalUserApi>,
        timeouts: JobTimeouts,
    ) -> Self {
        Self {
            store,
            region,
            timeouts,
        }
    }

    pub(super) const fn timeouts(&self) -> JobTimeouts {
        self.timeouts
    }

    fn info(&self, info_uid: &str) -> Result<DeleteUserTransactionInfo, JobError> {
        self.store
            .delete_user_info(info_uid)?
            .ok_or_else(|| JobError::MissingInfo {
                transaction_type: TransactionType::DeleteUser,
                info_uid: info_uid.to_string(),
            })
    }

    /// Deletes the user's regional resource. Already absent is a no-op.
    pub async fn unit(&self, info_uid: &str) -> Result<(), JobError> {
        let info = self.info(info_uid)?;
        match self.region.find_user_resource(&info.user_uid).await? {
            Some(resource) => {
                self.region.delete_user_resource(&resource).await?;
                info!(user_uid = %info.user_uid, resource = %resource.name, "regional resource deleted");
            },
            None => debug!(user_uid = %info.user_uid, "regional resource already absent"),
        }
        Ok(())
    }

    /// Deletion needs nothing beyond the store.
    #[must_use]
    pub const fn can_commit(&self) -> bool {
        true
    }

    /// Records the deletion and retires the global account atomically with
    /// the commit marker.
    pub fn commit(&self, transaction: &PrecommitTransaction, now_ms: u64) -> Result<(), JobError> {
        let info = self.info(&transaction.info_uid)?;
        let effects = [
            CommitEffect::RecordUserDeletion {
                user_uid: info.user_uid.clone(),
            },
            CommitEffect::MarkAccountDeleted {
                user_uid: info.user_uid.clone(),
            },
            CommitEffect::Event {
                name: events::USER_DELETED.to_string(),
                main_id: info.user_uid.clone(),
                data: json!({ "transaction_uid": transaction.uid }),
            },
        ];
        self.store.finalize_commit(&transaction.uid, &effects, now_ms)?;
        info!(transaction_uid = %transaction.uid, user_uid = %info.user_uid, "user deletion committed");
        Ok(())
    }
}
