//! Region registry and the local region's user API.
//!
//! A transaction fans out one unit of work per registered region. The
//! registry says which regions exist; [`RegionalUserApi`] is how a unit
//! reads and mutates user state inside the coordinator's own region.

mod http;
mod memory;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpRegionalApi;
pub use memory::MemoryRegionalApi;

use crate::store::{StoreError, TransactionStore};

/// Errors from region lookups and regional API calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegionError {
    /// The regional API answered with a non-success status.
    #[error("regional API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The request never produced a response.
    #[error("regional API transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("regional API decode error: {0}")]
    Decode(String),

    /// Invalid client configuration.
    #[error("invalid regional API configuration: {0}")]
    Configuration(String),

    /// Reading the region table failed.
    #[error("region registry unavailable: {0}")]
    Registry(#[from] StoreError),
}

impl From<reqwest::Error> for RegionError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

/// Source of the currently active region set.
pub trait RegionRegistry: Send + Sync + fmt::Debug {
    /// Returns every active region uid.
    fn regions(&self) -> Result<BTreeSet<String>, RegionError>;
}

/// Registry fixed at startup from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegionRegistry {
    regions: BTreeSet<String>,
}

impl StaticRegionRegistry {
    /// Creates a registry over `regions`.
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            regions: regions.into_iter().map(Into::into).collect(),
        }
    }
}

impl RegionRegistry for StaticRegionRegistry {
    fn regions(&self) -> Result<BTreeSet<String>, RegionError> {
        Ok(self.regions.clone())
    }
}

impl RegionRegistry for TransactionStore {
    fn regions(&self) -> Result<BTreeSet<String>, RegionError> {
        Ok(Self::regions(self)?)
    }
}

/// Workspace role, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceRole {
    /// Full control, including deleting the workspace.
    Owner,
    /// Manages members and resources.
    Manager,
    /// Uses resources.
    Developer,
}

impl WorkspaceRole {
    /// Numeric precedence; larger outranks smaller.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Manager => 2,
            Self::Developer => 1,
        }
    }

    /// Returns `true` if `self` grants at least what `other` grants.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.precedence() >= other.precedence()
    }
}

impl fmt::Display for WorkspaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Owner => "owner",
            Self::Manager => "manager",
            Self::Developer => "developer",
        })
    }
}

/// A user's regional custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResource {
    /// Owning user.
    pub user_uid: String,
    /// Resource name inside the region.
    pub name: String,
}

/// One workspace membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    /// Workspace identifier.
    pub workspace: String,
    /// Role held in that workspace.
    pub role: WorkspaceRole,
}

/// User state inside the local region.
///
/// Implementations must make every mutation safe to repeat: deleting an
/// absent resource or depriving an absent role succeeds.
#[async_trait]
pub trait RegionalUserApi: Send + Sync + fmt::Debug {
    /// Looks up the user's regional resource.
    async fn find_user_resource(&self, user_uid: &str) -> Result<Option<UserResource>, RegionError>;

    /// Deletes a regional resource. Already absent is success.
    async fn delete_user_resource(&self, resource: &UserResource) -> Result<(), RegionError>;

    /// Lists the workspaces the user belongs to.
    async fn workspace_roles(&self, user_uid: &str) -> Result<Vec<RoleBinding>, RegionError>;

    /// Adds `user_uid` to `workspace` with `role`.
    async fn grant_role(
        &self,
        workspace: &str,
        user_uid: &str,
        role: WorkspaceRole,
    ) -> Result<(), RegionError>;

    /// Removes `user_uid` from `workspace`. Not a member is success.
    async fn deprive_role(&self, workspace: &str, user_uid: &str) -> Result<(), RegionError>;

    /// Changes the role `user_uid` holds in `workspace`.
    async fn update_role(
        &self,
        workspace: &str,
        user_uid: &str,
        role: WorkspaceRole,
    ) -> Result<(), RegionError>;
}
