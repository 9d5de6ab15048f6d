//! Per-type business logic.
//!
//! Each [`TransactionType`] has one job. A job knows how to apply its
//! regional unit, whether its commit preconditions hold, and how to perform
//! the global commit. Jobs are dispatched through [`TransactionJob`] and
//! looked up in a [`JobRegistry`] once per phase tick.

mod delete_user;
mod merge_user;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use delete_user::DeleteUserJob;
pub use merge_user::{MergeUserJob, RoleMergeAction, plan_role_merge};

use crate::config::{JobTimeoutOverrides, JobsConfig};
use crate::region::{RegionError, RegionalUserApi};
use crate::services::{AccountServices, ServiceError};
pub use crate::store::TransactionType;
use crate::store::{PrecommitTransaction, StoreError, TransactionStore};

/// Errors raised by job units and commits.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A regional API call failed.
    #[error(transparent)]
    Region(#[from] RegionError),

    /// An external service call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The transaction's payload row is missing.
    #[error("{transaction_type} info {info_uid} not found")]
    MissingInfo {
        /// Transaction type whose payload was expected.
        transaction_type: TransactionType,
        /// The dangling reference.
        info_uid: String,
    },
}

impl JobError {
    /// Returns `true` when another process already finalized or abandoned
    /// the transaction.
    #[must_use]
    pub const fn is_lost_race(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::AlreadyCommitted { .. } | StoreError::StaleTransition { .. })
        )
    }
}

/// Lease and commit window for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    /// A RUNNING detail older than this is presumed abandoned.
    pub unit: Duration,
    /// A FINISH transaction older than this is abandoned as ERROR.
    pub commit: Duration,
}

impl JobTimeouts {
    /// Defaults for `DELETE_USER`.
    pub const DELETE_USER: Self = Self {
        unit: Duration::from_secs(60),
        commit: Duration::from_secs(10 * 60),
    };

    /// Defaults for `MERGE_USER`.
    pub const MERGE_USER: Self = Self {
        unit: Duration::from_secs(2 * 60),
        commit: Duration::from_secs(30 * 60),
    };

    /// Applies configured overrides on top of `self`.
    #[must_use]
    pub fn with_overrides(self, overrides: &JobTimeoutOverrides) -> Self {
        Self {
            unit: overrides.unit_timeout(self.unit),
            commit: overrides.commit_timeout(self.commit),
        }
    }
}

/// A job, dispatched by transaction type.
#[derive(Debug, Clone)]
pub enum TransactionJob {
    /// `DELETE_USER`.
    DeleteUser(DeleteUserJob),
    /// `MERGE_USER`.
    MergeUser(MergeUserJob),
}

impl TransactionJob {
    /// Type this job handles.
    #[must_use]
    pub const fn transaction_type(&self) -> TransactionType {
        match self {
            Self::DeleteUser(_) => TransactionType::DeleteUser,
            Self::MergeUser(_) => TransactionType::MergeUser,
        }
    }

    /// Applies the regional portion for the payload `info_uid`.
    ///
    /// Safe to repeat and to run concurrently with itself: state already
    /// reflecting the unit is left untouched.
    pub async fn unit(&self, info_uid: &str) -> Result<(), JobError> {
        match self {
            Self::DeleteUser(job) => job.unit(info_uid).await,
            Self::MergeUser(job) => job.unit(info_uid).await,
        }
    }

    /// Pure commit precondition.
    #[must_use]
    pub fn can_commit(&self) -> bool {
        match self {
            Self::DeleteUser(job) => job.can_commit(),
            Self::MergeUser(job) => job.can_commit(),
        }
    }

    /// Performs the global commit and finalizes `transaction` as COMMITED.
    ///
    /// Any failed external call aborts before the store is touched.
    pub async fn commit(&self, transaction: &PrecommitTransaction, now_ms: u64) -> Result<(), JobError> {
        match self {
            Self::DeleteUser(job) => job.commit(transaction, now_ms),
            Self::MergeUser(job) => job.commit(transaction, now_ms).await,
        }
    }

    /// Regional lease length.
    #[must_use]
    pub const fn unit_timeout(&self) -> Duration {
        self.timeouts().unit
    }

    /// Commit window measured from the FINISH transition.
    #[must_use]
    pub const fn commit_timeout(&self) -> Duration {
        self.timeouts().commit
    }

    const fn timeouts(&self) -> JobTimeouts {
        match self {
            Self::DeleteUser(job) => job.timeouts(),
            Self::MergeUser(job) => job.timeouts(),
        }
    }
}

impl From<DeleteUserJob> for TransactionJob {
    fn from(job: DeleteUserJob) -> Self {
        Self::DeleteUser(job)
    }
}

impl From<MergeUserJob> for TransactionJob {
    fn from(job: MergeUserJob) -> Self {
        Self::MergeUser(job)
    }
}

/// Jobs keyed by transaction type.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<TransactionType, TransactionJob>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers both standard jobs with timeouts from `config`.
    #[must_use]
    pub fn standard(
        store: &TransactionStore,
        region: &Arc<dyn RegionalUserApi>,
        services: &Arc<dyn AccountServices>,
        config: &JobsConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(DeleteUserJob::new(
            store.clone(),
            Arc::clone(region),
            JobTimeouts::DELETE_USER.with_overrides(&config.delete_user),
        ));
        registry.register(MergeUserJob::new(
            store.clone(),
            Arc::clone(region),
            Arc::clone(services),
            JobTimeouts::MERGE_USER.with_overrides(&config.merge_user),
        ));
        registry
    }

    /// Adds or replaces the job for its type.
    pub fn register(&mut self, job: impl Into<TransactionJob>) -> &mut Self {
        let job = job.into();
        self.jobs.insert(job.transaction_type(), job);
        self
    }

    /// Job for `kind`.
    #[must_use]
    pub fn get(&self, kind: TransactionType) -> Option<&TransactionJob> {
        self.jobs.get(&kind)
    }

    /// Job for a stored transaction; `None` when its type label is unknown
    /// or has no registered job.
    #[must_use]
    pub fn job_for(&self, transaction: &PrecommitTransaction) -> Option<&TransactionJob> {
        transaction.kind().and_then(|kind| self.get(kind))
    }

    /// Registered types.
    #[must_use]
    pub fn types(&self) -> Vec<TransactionType> {
        self.jobs.keys().copied().collect()
    }

    /// Iterates over registered jobs.
    pub fn iter(&self) -> impl Iterator<Item = &TransactionJob> {
        self.jobs.values()
    }

    /// Returns `true` when no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
