//! External services a merge commit must notify.
//!
//! Billing, work-order and VM provisioning each expose one endpoint that
//! moves the merged account's assets to the surviving account. A commit is
//! only finalized after all three confirm success.

mod http;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use http::{HttpAccountServices, IDEMPOTENCY_HEADER};

/// Errors from external service calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The service's base URL is not configured.
    #[error("{service} service is not configured")]
    NotConfigured {
        /// Service name.
        service: &'static str,
    },

    /// The service answered with a non-success HTTP status.
    #[error("{service} service error ({status}): {message}")]
    Api {
        /// Service name.
        service: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The service answered 2xx but did not report success.
    #[error("{service} service rejected the request: {message}")]
    Rejected {
        /// Service name.
        service: &'static str,
        /// Response body.
        message: String,
    },

    /// The request never produced a response.
    #[error("{service} service transport error: {message}")]
    Transport {
        /// Service name.
        service: &'static str,
        /// Transport failure.
        message: String,
    },

    /// Invalid client configuration.
    #[error("invalid services configuration: {0}")]
    Configuration(String),
}

/// Body sent to every merge endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    /// Transaction driving the merge; doubles as the idempotency key.
    pub transaction_uid: String,
    /// Account being folded away.
    pub merge_user_uid: String,
    /// Surviving account.
    pub user_uid: String,
}

/// Global services touched by a merge commit.
///
/// Calls may be repeated for the same transaction after a partial failure;
/// implementations pass [`MergeRequest::transaction_uid`] upstream so the
/// services can deduplicate.
#[async_trait]
pub trait AccountServices: Send + Sync + fmt::Debug {
    /// Returns `true` when every endpoint has a base URL.
    fn is_configured(&self) -> bool;

    /// Moves the merged account's balance to the surviving account.
    async fn transfer_balance(&self, request: &MergeRequest) -> Result<(), ServiceError>;

    /// Reassigns the merged account's work orders.
    async fn migrate_work_orders(&self, request: &MergeRequest) -> Result<(), ServiceError>;

    /// Reassigns the merged account's virtual machines.
    async fn merge_vms(&self, request: &MergeRequest) -> Result<(), ServiceError>;
}
