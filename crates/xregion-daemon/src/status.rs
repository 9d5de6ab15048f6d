//! Operator view of stored transactions.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use xregion_core::TransactionStore;
use xregion_core::store::{DetailStatus, TransactionStatus};

/// One transaction with its per-region progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionReport {
    /// Transaction uid.
    pub uid: String,
    /// Stored type label.
    pub transaction_type: String,
    /// Current status.
    pub status: TransactionStatus,
    /// Last status change, RFC 3339.
    pub updated_at: String,
    /// Whether the commit marker exists.
    pub committed_or_abandoned: bool,
    /// Abandon reason for ERROR transactions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Per-region detail status.
    pub regions: Vec<RegionProgress>,
}

/// Detail status for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionProgress {
    /// Region uid.
    pub region_uid: String,
    /// Detail status.
    pub status: DetailStatus,
    /// Last claim or transition, RFC 3339.
    pub updated_at: String,
}

/// Collects reports for every transaction, optionally filtered by status.
pub fn collect(
    store: &TransactionStore,
    status: Option<TransactionStatus>,
) -> Result<Vec<TransactionReport>> {
    let transactions = store
        .list_transactions(status)
        .context("failed to list transactions")?;

    let mut reports = Vec::with_capacity(transactions.len());
    for transaction in transactions {
        let details = store
            .details_for(&transaction.uid)
            .with_context(|| format!("failed to load details for {}", transaction.uid))?;
        let error_reason = if transaction.status == TransactionStatus::Error {
            store.error_reason(&transaction.uid)?
        } else {
            None
        };
        reports.push(TransactionReport {
            committed_or_abandoned: store.has_commit_marker(&transaction.uid)?,
            uid: transaction.uid,
            transaction_type: transaction.transaction_type,
            status: transaction.status,
            updated_at: format_ms(transaction.updated_at_ms),
            error_reason,
            regions: details
                .into_iter()
                .map(|d| RegionProgress {
                    region_uid: d.region_uid,
                    status: d.status,
                    updated_at: format_ms(d.updated_at_ms),
                })
                .collect(),
        });
    }
    Ok(reports)
}

/// Renders reports as a plain-text table.
#[must_use]
pub fn render_text(reports: &[TransactionReport]) -> String {
    if reports.is_empty() {
        return "no transactions\n".to_string();
    }
    let mut out = String::new();
    for report in reports {
        let _ = writeln!(
            out,
            "{}  {:<11} {:<9} {}",
            report.uid, report.transaction_type, report.status, report.updated_at
        );
        if let Some(reason) = &report.error_reason {
            let _ = writeln!(out, "    error: {reason}");
        }
        for region in &report.regions {
            let _ = writeln!(
                out,
                "    {:<16} {:<8} {}",
                region.region_uid, region.status, region.updated_at
            );
        }
    }
    out
}

/// Formats epoch milliseconds as RFC 3339 (UTC).
#[must_use]
pub fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| ms.to_string(), |t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}
