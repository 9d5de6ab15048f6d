//! In-memory regional state for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{RegionError, RegionalUserApi, RoleBinding, UserResource, WorkspaceRole};

#[derive(Debug, Default)]
struct RegionState {
    resources: BTreeSet<String>,
    // workspace -> user -> role
    workspaces: BTreeMap<String, BTreeMap<String, WorkspaceRole>>,
}

/// [`RegionalUserApi`] backed by process memory.
///
/// Counts every state-changing call so repeated units can be checked for
/// extra side effects. [`MemoryRegionalApi::fail_next`] injects transient
/// failures.
#[derive(Debug, Default)]
pub struct MemoryRegionalApi {
    state: Mutex<RegionState>,
    mutations: AtomicU64,
    failures_remaining: AtomicU32,
}

impl MemoryRegionalApi {
    /// Creates an empty region.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, RegionState>, RegionError> {
        self.state
            .lock()
            .map_err(|e| RegionError::Transport(format!("region state lock poisoned: {e}")))
    }

    fn check_injected_failure(&self) -> Result<(), RegionError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(RegionError::Transport("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes the next `calls` API calls fail with a transport error.
    pub fn fail_next(&self, calls: u32) {
        self.failures_remaining.store(calls, Ordering::SeqCst);
    }

    /// Number of successful state-changing calls so far.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Seeds a regional resource for `user_uid`.
    pub fn add_user_resource(&self, user_uid: &str) -> Result<(), RegionError> {
        self.state()?.resources.insert(user_uid.to_string());
        Ok(())
    }

    /// Returns `true` if `user_uid` still has a regional resource.
    pub fn has_user_resource(&self, user_uid: &str) -> Result<bool, RegionError> {
        Ok(self.state()?.resources.contains(user_uid))
    }

    /// Seeds a workspace membership.
    pub fn set_role(&self, workspace: &str, user_uid: &str, role: WorkspaceRole) -> Result<(), RegionError> {
        self.state()?
            .workspaces
            .entry(workspace.to_string())
            .or_default()
            .insert(user_uid.to_string(), role);
        Ok(())
    }

    /// Role `user_uid` holds in `workspace`, if any.
    pub fn role_of(&self, workspace: &str, user_uid: &str) -> Result<Option<WorkspaceRole>, RegionError> {
        Ok(self
            .state()?
            .workspaces
            .get(workspace)
            .and_then(|members| members.get(user_uid).copied()))
    }
}

fn resource_name(user_uid: &str) -> String {
    format!("ns-{user_uid}")
}

#[async_trait]
impl RegionalUserApi for MemoryRegionalApi {
    async fn find_user_resource(&self, user_uid: &str) -> Result<Option<UserResource>, RegionError> {
        self.check_injected_failure()?;
        let exists = self.state()?.resources.contains(user_uid);
        Ok(exists.then(|| UserResource {
            user_uid: user_uid.to_string(),
            name: resource_name(user_uid),
        }))
    }

    async fn delete_user_resource(&self, resource: &UserResource) -> Result<(), RegionError> {
        self.check_injected_failure()?;
        if self.state()?.resources.remove(&resource.user_uid) {
            self.record_mutation();
        }
        Ok(())
    }

    async fn workspace_roles(&self, user_uid: &str) -> Result<Vec<RoleBinding>, RegionError> {
        self.check_injected_failure()?;
        Ok(self
            .state()?
            .workspaces
            .iter()
            .filter_map(|(workspace, members)| {
                members.get(user_uid).map(|role| RoleBinding {
                    workspace: workspace.clone(),
                    role: *role,
                })
            })
            .collect())
    }

    async fn grant_role(
        &self,
        workspace: &str,
        user_uid: &str,
        role: WorkspaceRole,
    ) -> Result<(), RegionError> {
        self.check_injected_failure()?;
        let mut state = self.state()?;
        let members = state.workspaces.entry(workspace.to_string()).or_default();
        if members.get(user_uid) != Some(&role) {
            members.insert(user_uid.to_string(), role);
            self.record_mutation();
        }
        Ok(())
    }

    async fn deprive_role(&self, workspace: &str, user_uid: &str) -> Result<(), RegionError> {
        self.check_injected_failure()?;
        let mut state = self.state()?;
        let removed = state
            .workspaces
            .get_mut(workspace)
            .and_then(|members| members.remove(user_uid))
            .is_some();
        if removed {
            self.record_mutation();
        }
        Ok(())
    }

    async fn update_role(
        &self,
        workspace: &str,
        user_uid: &str,
        role: WorkspaceRole,
    ) -> Result<(), RegionError> {
        self.check_injected_failure()?;
        let mut state = self.state()?;
        let current = state
            .workspaces
            .get_mut(workspace)
            .and_then(|members| members.get_mut(user_uid))
            .ok_or_else(|| RegionError::Api {
                status: 404,
                message: format!("{user_uid} is not a member of {workspace}"),
            })?;
        if *current != role {
            *current = role;
            self.record_mutation();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_is_idempotent() {
        let region = MemoryRegionalApi::new();
        region.add_user_resource("u1").unwrap();
        let resource = region.find_user_resource("u1").await.unwrap().unwrap();

        region.delete_user_resource(&resource).await.unwrap();
        region.delete_user_resource(&resource).await.unwrap();
        assert_eq!(region.mutation_count(), 1);
        assert!(region.find_user_resource("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let region = MemoryRegionalApi::new();
        region.fail_next(2);
        assert!(region.workspace_roles("u1").await.is_err());
        assert!(region.workspace_roles("u1").await.is_err());
        assert!(region.workspace_roles("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_requires_membership() {
        let region = MemoryRegionalApi::new();
        let err = region
            .update_role("ns-a", "u1", WorkspaceRole::Owner)
            .await
            .unwrap_err();
        assert!(matches!(err, RegionError::Api { status: 404, .. }));

        region.set_role("ns-a", "u1", WorkspaceRole::Developer).unwrap();
        region.update_role("ns-a", "u1", WorkspaceRole::Owner).await.unwrap();
        assert_eq!(
            region.role_of("ns-a", "u1").unwrap(),
            Some(WorkspaceRole::Owner)
        );
    }
}
