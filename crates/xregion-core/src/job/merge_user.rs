//! `MERGE_USER`: fold one account into another.
//!
//! Regionally, every workspace role the merged account holds is handed to
//! the surviving account. Globally, billing, work orders and VMs move over,
//! then OAuth identities are rebound and the merged account is retired.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use super::{JobError, JobTimeouts, TransactionType};
use crate::region::{RegionalUserApi, WorkspaceRole};
use crate::services::{AccountServices, MergeRequest};
use crate::store::{
    CommitEffect, MergeUserTransactionInfo, PrecommitTransaction, TransactionStore, events,
};

/// How one workspace membership of the merged account is handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMergeAction {
    /// Target is not a member: grant it the merged account's role.
    Grant(WorkspaceRole),
    /// Merged account outranks the target: raise the target's role.
    Update(WorkspaceRole),
    /// Target already holds the same or a stronger role.
    Keep,
}

/// Decides how the target's membership changes before the merged account
/// is deprived of `merge_role`.
#[must_use]
pub const fn plan_role_merge(
    merge_role: WorkspaceRole,
    target_role: Option<WorkspaceRole>,
) -> RoleMergeAction {
    match target_role {
        None => RoleMergeAction::Grant(merge_role),
        Some(target) if target.covers(merge_role) => RoleMergeAction::Keep,
        Some(_) => RoleMergeAction::Update(merge_role),
    }
}

/// Merges `merge_user_uid` into `user_uid`.
#[derive(Debug, Clone)]
pub struct MergeUserJob {
    store: TransactionStore,
    region: Arc<dyn RegionalUserApi>,
    services: Arc<dyn AccountServices>,
    timeouts: JobTimeouts,
}

impl MergeUserJob {
    /// Creates the job.
    #[must_use]
    pub fn new(
        store: TransactionStore,
        region: Arc<dyn RegionalUserApi>,
        services: Arc<dyn AccountServices>,
        timeouts: JobTimeouts,
    ) -> Self {
        Self {
            store,
            region,
            services,
            timeouts,
        }
    }

    pub(super) const fn timeouts(&self) -> JobTimeouts {
        self.timeouts
    }

    fn info(&self, info_uid: &str) -> Result<MergeUserTransactionInfo, JobError> {
        self.store
            .merge_user_info(info_uid)?
            .ok_or_else(|| JobError::MissingInfo {
                transaction_type: TransactionType::MergeUser,
                info_uid: info_uid.to_string(),
            })
    }

    /// Hands every workspace role of the merged account to the target.
    ///
    /// Once complete the merged account holds no roles, so a repeat finds
    /// nothing to do.
    pub async fn unit(&self, info_uid: &str) -> Result<(), JobError> {
        let info = self.info(info_uid)?;
        let merge_bindings = self.region.workspace_roles(&info.merge_user_uid).await?;
        if merge_bindings.is_empty() {
            debug!(merge_user_uid = %info.merge_user_uid, "no workspace roles to merge");
            return Ok(());
        }
        let target_roles: BTreeMap<String, WorkspaceRole> = self
            .region
            .workspace_roles(&info.user_uid)
            .await?
            .into_iter()
            .map(|binding| (binding.workspace, binding.role))
            .collect();

        for binding in &merge_bindings {
            let workspace = binding.workspace.as_str();
            let action = plan_role_merge(binding.role, target_roles.get(workspace).copied());
            match action {
                RoleMergeAction::Grant(role) => {
                    self.region.grant_role(workspace, &info.user_uid, role).await?;
                },
                RoleMergeAction::Update(role) => {
                    self.region.update_role(workspace, &info.user_uid, role).await?;
                },
                RoleMergeAction::Keep => {},
            }
            self.region
                .deprive_role(workspace, &info.merge_user_uid)
                .await?;
            debug!(workspace, ?action, "workspace role merged");
        }
        info!(
            merge_user_uid = %info.merge_user_uid,
            user_uid = %info.user_uid,
            workspaces = merge_bindings.len(),
            "regional roles merged"
        );
        Ok(())
    }

    /// Billing, work-order and VM endpoints must all be configured.
    #[must_use]
    pub fn can_commit(&self) -> bool {
        self.services.is_configured()
    }

    /// Calls the three services, then finalizes the merge atomically with
    /// the commit marker. Stops at the first failed call.
    pub async fn commit(&self, transaction: &PrecommitTransaction, now_ms: u64) -> Result<(), JobError> {
        let info = self.info(&transaction.info_uid)?;
        let request = MergeRequest {
            transaction_uid: transaction.uid.clone(),
            merge_user_uid: info.merge_user_uid.clone(),
            user_uid: info.user_uid.clone(),
        };
        self.services.transfer_balance(&request).await?;
        self.services.migrate_work_orders(&request).await?;
        self.services.merge_vms(&request).await?;

        let effects = [
            CommitEffect::RecordUserMerge {
                merge_user_uid: info.merge_user_uid.clone(),
                user_uid: info.user_uid.clone(),
            },
            CommitEffect::RebindOauthProviders {
                from_user_uid: info.merge_user_uid.clone(),
                to_user_uid: info.user_uid.clone(),
            },
            CommitEffect::MarkAccountDeleted {
                user_uid: info.merge_user_uid.clone(),
            },
            CommitEffect::Event {
                name: events::USER_MERGED.to_string(),
                main_id: info.user_uid.clone(),
                data: json!({
                    "merge_user_uid": info.merge_user_uid,
                    "transaction_uid": transaction.uid,
                }),
            },
        ];
        self.store.finalize_commit(&transaction.uid, &effects, now_ms)?;
        info!(transaction_uid = %transaction.uid, "user merge committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::region::MemoryRegionalApi;
    use crate::services::ServiceError;
    use crate::store::{NewTransactionInfo, TransactionStatus};

    #[derive(Debug, Default)]
    struct CountingServices {
        calls: AtomicUsize,
        fail_vm: bool,
    }

    #[async_trait]
    impl AccountServices for CountingServices {
        fn is_configured(&self) -> bool {
            true
        }

        async fn transfer_balance(&self, _: &MergeRequest) -> Result<(), ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn migrate_work_orders(&self, _: &MergeRequest) -> Result<(), ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn merge_vms(&self, _: &MergeRequest) -> Result<(), ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_vm {
                Err(ServiceError::Rejected {
                    service: "vm",
                    message: "{}".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        store: TransactionStore,
        region: Arc<MemoryRegionalApi>,
        services: Arc<CountingServices>,
        job: MergeUserJob,
        uid: String,
    }

    fn fixture(fail_vm: bool) -> Fixture {
        let store = TransactionStore::in_memory().unwrap();
        let region = Arc::new(MemoryRegionalApi::new());
        let services = Arc::new(CountingServices {
            fail_vm,
            ..CountingServices::default()
        });
        let job = MergeUserJob::new(
            store.clone(),
            region.clone(),
            services.clone(),
            JobTimeouts::MERGE_USER,
        );
        let regions: BTreeSet<String> = ["r1".to_string()].into();
        let uid = store
            .create_transaction(
                &NewTransactionInfo::MergeUser {
                    merge_user_uid: "m".into(),
                    user_uid: "u".into(),
                },
                &regions,
                0,
            )
            .unwrap();
        Fixture {
            store,
            region,
            services,
            job,
            uid,
        }
    }

    fn finish(store: &TransactionStore, uid: &str) -> PrecommitTransaction {
        let detail = store.details_for(uid).unwrap().remove(0);
        assert!(store.claim_detail(&detail, 1).unwrap());
        let running = store.details_for(uid).unwrap().remove(0);
        assert!(store.finish_detail(&running, 2).unwrap());
        let version = store.transaction(uid).unwrap().unwrap().version;
        let regions: BTreeSet<String> = ["r1".to_string()].into();
        store
            .promote_finished(&[(uid.to_string(), version)], &regions, 3)
            .unwrap();
        store.transaction(uid).unwrap().unwrap()
    }

    #[test]
    fn role_plan_covers_all_four_cases() {
        use WorkspaceRole::{Developer, Manager, Owner};
        assert_eq!(plan_role_merge(Manager, None), RoleMergeAction::Grant(Manager));
        assert_eq!(plan_role_merge(Manager, Some(Manager)), RoleMergeAction::Keep);
        assert_eq!(plan_role_merge(Developer, Some(Owner)), RoleMergeAction::Keep);
        assert_eq!(plan_role_merge(Owner, Some(Developer)), RoleMergeAction::Update(Owner));
    }

    #[tokio::test]
    async fn unit_hands_over_every_role_and_repeats_as_noop() {
        let f = fixture(false);
        f.region.set_role("absent", "m", WorkspaceRole::Manager).unwrap();
        f.region.set_role("same", "m", WorkspaceRole::Developer).unwrap();
        f.region.set_role("same", "u", WorkspaceRole::Developer).unwrap();
        f.region.set_role("weaker", "m", WorkspaceRole::Developer).unwrap();
        f.region.set_role("weaker", "u", WorkspaceRole::Owner).unwrap();
        f.region.set_role("stronger", "m", WorkspaceRole::Owner).unwrap();
        f.region.set_role("stronger", "u", WorkspaceRole::Developer).unwrap();
        let info_uid = f.store.transaction(&f.uid).unwrap().unwrap().info_uid;

        f.job.unit(&info_uid).await.unwrap();
        let after_first = f.region.mutation_count();
        f.job.unit(&info_uid).await.unwrap();
        assert_eq!(f.region.mutation_count(), after_first);

        for workspace in ["absent", "same", "weaker", "stronger"] {
            assert_eq!(f.region.role_of(workspace, "m").unwrap(), None, "{workspace}");
        }
        assert_eq!(f.region.role_of("absent", "u").unwrap(), Some(WorkspaceRole::Manager));
        assert_eq!(f.region.role_of("same", "u").unwrap(), Some(WorkspaceRole::Developer));
        assert_eq!(f.region.role_of("weaker", "u").unwrap(), Some(WorkspaceRole::Owner));
        assert_eq!(f.region.role_of("stronger", "u").unwrap(), Some(WorkspaceRole::Owner));
    }

    #[tokio::test]
    async fn commit_rebinds_identities_and_retires_merged_account() {
        let f = fixture(false);
        f.store.insert_user_account("m", 0).unwrap();
        f.store.insert_user_account("u", 0).unwrap();
        f.store.bind_oauth_provider("m", "GITHUB", "gh-9", 0).unwrap();
        let transaction = finish(&f.store, &f.uid);

        f.job.commit(&transaction, 10).await.unwrap();

        assert_eq!(f.services.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.store.merge_log_count("m").unwrap(), 1);
        assert_eq!(f.store.oauth_bindings("u").unwrap().len(), 1);
        assert_eq!(f.store.account_status("m").unwrap().as_deref(), Some("DELETED"));
        assert_eq!(f.store.account_status("u").unwrap().as_deref(), Some("NORMAL"));
        assert_eq!(
            f.store.transaction(&f.uid).unwrap().unwrap().status,
            TransactionStatus::Commited
        );
    }

    #[tokio::test]
    async fn failed_service_call_leaves_transaction_finished() {
        let f = fixture(true);
        let transaction = finish(&f.store, &f.uid);

        let err = f.job.commit(&transaction, 10).await.unwrap_err();
        assert!(matches!(err, JobError::Service(ServiceError::Rejected { .. })));
        assert!(!f.store.has_commit_marker(&f.uid).unwrap());
        assert_eq!(f.store.merge_log_count("m").unwrap(), 0);
        assert_eq!(
            f.store.transaction(&f.uid).unwrap().unwrap().status,
            TransactionStatus::Finish
        );
    }
}
