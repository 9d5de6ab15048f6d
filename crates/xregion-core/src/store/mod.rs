//! `SQLite`-backed transaction store.
//!
//! The store is the single source of truth and the only synchronization
//! point between coordinator instances. Every state transition is a single
//! conditional `UPDATE ... WHERE status = ? [AND updated_at_ms = ?]`; a
//! transition succeeds iff exactly one row changed. Multi-row transitions
//! (claim, promote, commit, abandon) run inside one `IMMEDIATE` `SQLite`
//! transaction so a crash leaves either all or none of their rows.
//!
//! Several processes may open the same database file. WAL journaling and a
//! busy timeout let their writes serialize instead of failing.
//!
//! Rows are never deleted.

// SQLite stores timestamps and versions as i64; they are always non-negative.
// Mutex poisoning is surfaced as `StoreError::LockPoisoned`.
#![allow(clippy::cast_sign_loss)]

mod error;
mod handle;
pub mod model;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::json;
use tracing::debug;

pub use error::StoreError;
pub use handle::StoreHandle;
pub use model::{
    CommitEffect, DeleteUserTransactionInfo, DetailStatus, EventRecord, MergeUserTransactionInfo,
    NewTransactionInfo, OauthBinding, OpenTransaction, PendingDetail, PrecommitTransaction,
    TransactionDetail, TransactionStatus, TransactionType, UnknownLabel,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Audit event names written to `event_log`.
pub mod events {
    /// A READY detail was claimed.
    pub const DETAIL_CLAIMED: &str = "transaction.detail.claimed";
    /// A RUNNING detail with an expired lease was claimed again.
    pub const DETAIL_RECLAIMED: &str = "transaction.detail.reclaimed";
    /// A regional unit completed.
    pub const DETAIL_FINISHED: &str = "transaction.detail.finished";
    /// A regional unit failed; the detail stays RUNNING.
    pub const UNIT_FAILED: &str = "transaction.unit.failed";
    /// Every region finished; the transaction reached FINISH.
    pub const TRANSACTION_FINISHED: &str = "transaction.finished";
    /// A commit attempt failed and will be retried.
    pub const COMMIT_FAILED: &str = "transaction.commit.failed";
    /// The commit was applied.
    pub const COMMITTED: &str = "transaction.committed";
    /// The commit was abandoned after its timeout.
    pub const COMMIT_TIMEOUT: &str = "transaction.commit.timeout";
    /// Business event: a user was deleted everywhere.
    pub const USER_DELETED: &str = "user.deleted";
    /// Business event: an account was merged into another.
    pub const USER_MERGED: &str = "user.merged";
}

/// Account status written by [`CommitEffect::MarkAccountDeleted`].
pub const ACCOUNT_DELETED: &str = "DELETED";

const ACCOUNT_NORMAL: &str = "NORMAL";

const TRANSACTION_COLUMNS: &str =
    "t.uid, t.transaction_type, t.info_uid, t.status, t.version, t.created_at_ms, t.updated_at_ms";

const DETAIL_COLUMNS: &str = "d.uid, d.transaction_uid, d.region_uid, d.status, d.updated_at_ms";

/// Transaction store handle. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct TransactionStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore").finish_non_exhaustive()
    }
}

impl TransactionStore {
    /// Opens or creates a store at `path` with WAL journaling.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened transaction store");
        Self::initialize(conn)
    }

    /// Creates a private in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Folds the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    // =========================================================================
    // Regions
    // =========================================================================

    /// Adds a region to the registry. Re-registering is a no-op.
    pub fn register_region(&self, uid: &str, now_ms: u64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO region (uid, created_at_ms) VALUES (?1, ?2)",
            params![uid, sql_ms(now_ms)?],
        )?;
        Ok(rows == 1)
    }

    /// Returns every registered region uid.
    pub fn regions(&self) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT uid FROM region")?;
        let regions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<BTreeSet<String>, _>>()?;
        Ok(regions)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Atomically creates a READY transaction, its info row and one READY
    /// detail per region. Returns the new transaction uid.
    pub fn create_transaction(
        &self,
        info: &NewTransactionInfo,
        regions: &BTreeSet<String>,
        now_ms: u64,
    ) -> Result<String, StoreError> {
        if regions.is_empty() {
            return Err(StoreError::NoRegions);
        }
        let now = sql_ms(now_ms)?;
        let transaction_uid = new_uid();
        let info_uid = new_uid();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match info {
            NewTransactionInfo::DeleteUser { user_uid } => {
                tx.execute(
                    "INSERT INTO delete_user_transaction_info (uid, user_uid) VALUES (?1, ?2)",
                    params![&info_uid, user_uid],
                )?;
            },
            NewTransactionInfo::MergeUser {
                merge_user_uid,
                user_uid,
            } => {
                tx.execute(
                    "INSERT INTO merge_user_transaction_info (uid, merge_user_uid, user_uid)
                     VALUES (?1, ?2, ?3)",
                    params![&info_uid, merge_user_uid, user_uid],
                )?;
            },
        }
        tx.execute(
            "INSERT INTO precommit_transaction
             (uid, transaction_type, info_uid, status, version, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![
                &transaction_uid,
                info.transaction_type(),
                &info_uid,
                TransactionStatus::Ready,
                now
            ],
        )?;
        for region_uid in regions {
            tx.execute(
                "INSERT INTO transaction_detail (uid, transaction_uid, region_uid, status, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new_uid(),
                    &transaction_uid,
                    region_uid,
                    DetailStatus::Ready,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(transaction_uid)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads one transaction.
    pub fn transaction(&self, uid: &str) -> Result<Option<PrecommitTransaction>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM precommit_transaction t WHERE t.uid = ?1");
        Ok(conn
            .query_row(&sql, params![uid], |row| transaction_from_row(row, 0))
            .optional()?)
    }

    /// Loads every detail of a transaction, ordered by region.
    pub fn details_for(&self, transaction_uid: &str) -> Result<Vec<TransactionDetail>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DETAIL_COLUMNS} FROM transaction_detail d
             WHERE d.transaction_uid = ?1
             ORDER BY d.region_uid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let details = stmt
            .query_map(params![transaction_uid], |row| detail_from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(details)
    }

    /// Lists transactions, oldest first, optionally filtered by status.
    pub fn list_transactions(
        &self,
        status: Option<TransactionStatus>,
    ) -> Result<Vec<PrecommitTransaction>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM precommit_transaction t
             WHERE ?1 IS NULL OR t.status = ?1
             ORDER BY t.created_at_ms ASC, t.uid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(params![status], |row| transaction_from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    /// Loads a `DELETE_USER` payload.
    pub fn delete_user_info(
        &self,
        info_uid: &str,
    ) -> Result<Option<DeleteUserTransactionInfo>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT uid, user_uid FROM delete_user_transaction_info WHERE uid = ?1",
                params![info_uid],
                |row| {
                    Ok(DeleteUserTransactionInfo {
                        uid: row.get(0)?,
                        user_uid: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Loads a `MERGE_USER` payload.
    pub fn merge_user_info(
        &self,
        info_uid: &str,
    ) -> Result<Option<MergeUserTransactionInfo>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT uid, merge_user_uid, user_uid FROM merge_user_transaction_info WHERE uid = ?1",
                params![info_uid],
                |row| {
                    Ok(MergeUserTransactionInfo {
                        uid: row.get(0)?,
                        merge_user_uid: row.get(1)?,
                        user_uid: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Returns `true` if the commit marker exists for `transaction_uid`.
    pub fn has_commit_marker(&self, transaction_uid: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM commit_transaction_set WHERE transaction_uid = ?1",
                params![transaction_uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns the recorded abandonment reason, if any.
    pub fn error_reason(&self, transaction_uid: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT reason FROM error_precommit_transaction WHERE transaction_uid = ?1",
                params![transaction_uid],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Returns the audit trail for one entity, oldest first.
    pub fn events_for(&self, main_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq_id, event_name, main_id, data, timestamp_ms
             FROM event_log WHERE main_id = ?1 ORDER BY seq_id ASC",
        )?;
        let raw = stmt
            .query_map(params![main_id], |row| {
                Ok((
                    column_u64(row, 0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    column_u64(row, 4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(seq_id, event_name, main_id, data, timestamp_ms)| {
                Ok(EventRecord {
                    seq_id,
                    event_name,
                    main_id,
                    data: serde_json::from_str(&data)?,
                    timestamp_ms,
                })
            })
            .collect()
    }

    /// Appends an audit event outside any transition.
    pub fn append_event(
        &self,
        name: &str,
        main_id: &str,
        data: &serde_json::Value,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        insert_event(&conn, name, main_id, data, sql_ms(now_ms)?)
    }

    // =========================================================================
    // Global accounts
    // =========================================================================

    /// Inserts a global account in NORMAL status. Existing accounts are kept.
    pub fn insert_user_account(&self, uid: &str, now_ms: u64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_account (uid, status, updated_at_ms) VALUES (?1, ?2, ?3)",
            params![uid, ACCOUNT_NORMAL, sql_ms(now_ms)?],
        )?;
        Ok(())
    }

    /// Returns the account status label, if the account exists.
    pub fn account_status(&self, uid: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT status FROM user_account WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Binds an OAuth identity to an account.
    pub fn bind_oauth_provider(
        &self,
        user_uid: &str,
        provider_type: &str,
        provider_id: &str,
        now_ms: u64,
    ) -> Result<String, StoreError> {
        let uid = new_uid();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO oauth_provider (uid, user_uid, provider_type, provider_id, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&uid, user_uid, provider_type, provider_id, sql_ms(now_ms)?],
        )?;
        Ok(uid)
    }

    /// Lists the OAuth identities bound to an account.
    pub fn oauth_bindings(&self, user_uid: &str) -> Result<Vec<OauthBinding>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT uid, user_uid, provider_type, provider_id FROM oauth_provider
             WHERE user_uid = ?1 ORDER BY provider_type, provider_id",
        )?;
        let bindings = stmt
            .query_map(params![user_uid], |row| {
                Ok(OauthBinding {
                    uid: row.get(0)?,
                    user_uid: row.get(1)?,
                    provider_type: row.get(2)?,
                    provider_id: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    /// Number of deletion-log rows for `user_uid`.
    pub fn deletion_log_count(&self, user_uid: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM delete_user_log WHERE user_uid = ?1",
            params![user_uid],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of merge-log rows for `merge_user_uid`.
    pub fn merge_log_count(&self, merge_user_uid: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM merge_user_log WHERE merge_user_uid = ?1",
            params![merge_user_uid],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // =========================================================================
    // Phase selection
    // =========================================================================

    /// Oldest READY detail of `region_uid` whose transaction type is in
    /// `known_types` (FIFO by `updated_at_ms`).
    pub fn oldest_ready_detail(
        &self,
        region_uid: &str,
        known_types: &[TransactionType],
    ) -> Result<Option<PendingDetail>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DETAIL_COLUMNS}, {TRANSACTION_COLUMNS}
             FROM transaction_detail d
             JOIN precommit_transaction t ON t.uid = d.transaction_uid
             WHERE d.region_uid = ?1 AND d.status = ?2 AND t.transaction_type = ?3
             ORDER BY d.updated_at_ms ASC, d.uid ASC
             LIMIT 1"
        );
        let mut oldest: Option<PendingDetail> = None;
        for transaction_type in known_types {
            let candidate = conn
                .query_row(
                    &sql,
                    params![region_uid, DetailStatus::Ready, transaction_type],
                    pending_from_row,
                )
                .optional()?;
            oldest = older_pending(oldest, candidate);
        }
        Ok(oldest)
    }

    /// Oldest RUNNING detail of `region_uid` whose lease started before the
    /// per-type cutoff.
    pub fn oldest_expired_running_detail(
        &self,
        region_uid: &str,
        cutoffs: &[(TransactionType, u64)],
    ) -> Result<Option<PendingDetail>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DETAIL_COLUMNS}, {TRANSACTION_COLUMNS}
             FROM transaction_detail d
             JOIN precommit_transaction t ON t.uid = d.transaction_uid
             WHERE d.region_uid = ?1 AND d.status = ?2 AND t.transaction_type = ?3
               AND d.updated_at_ms < ?4
             ORDER BY d.updated_at_ms ASC, d.uid ASC
             LIMIT 1"
        );
        let mut oldest: Option<PendingDetail> = None;
        for (transaction_type, cutoff_ms) in cutoffs {
            let candidate = conn
                .query_row(
                    &sql,
                    params![
                        region_uid,
                        DetailStatus::Running,
                        transaction_type,
                        sql_ms(*cutoff_ms)?
                    ],
                    pending_from_row,
                )
                .optional()?;
            oldest = older_pending(oldest, candidate);
        }
        Ok(oldest)
    }

    /// Every READY or RUNNING transaction with all of its details.
    pub fn open_transactions_with_details(&self) -> Result<Vec<OpenTransaction>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM precommit_transaction t
             WHERE t.status IN (?1, ?2)
             ORDER BY t.updated_at_ms ASC, t.uid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(
                params![TransactionStatus::Ready, TransactionStatus::Running],
                |row| transaction_from_row(row, 0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let sql = format!(
            "SELECT {DETAIL_COLUMNS} FROM transaction_detail d
             JOIN precommit_transaction t ON t.uid = d.transaction_uid
             WHERE t.status IN (?1, ?2)"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut details: BTreeMap<String, Vec<TransactionDetail>> = BTreeMap::new();
        for detail in stmt.query_map(
            params![TransactionStatus::Ready, TransactionStatus::Running],
            |row| detail_from_row(row, 0),
        )? {
            let detail = detail?;
            details
                .entry(detail.transaction_uid.clone())
                .or_default()
                .push(detail);
        }

        Ok(transactions
            .into_iter()
            .map(|transaction| OpenTransaction {
                details: details.remove(&transaction.uid).unwrap_or_default(),
                transaction,
            })
            .collect())
    }

    /// Oldest FINISH transaction without a commit marker whose type is in
    /// `known_types`.
    pub fn oldest_uncommitted_finished(
        &self,
        known_types: &[TransactionType],
    ) -> Result<Option<PrecommitTransaction>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM precommit_transaction t
             WHERE t.status = ?1 AND t.transaction_type = ?2
               AND NOT EXISTS (
                 SELECT 1 FROM commit_transaction_set c WHERE c.transaction_uid = t.uid
               )
             ORDER BY t.updated_at_ms ASC, t.uid ASC
             LIMIT 1"
        );
        let mut oldest: Option<PrecommitTransaction> = None;
        for transaction_type in known_types {
            let candidate = conn
                .query_row(
                    &sql,
                    params![TransactionStatus::Finish, transaction_type],
                    |row| transaction_from_row(row, 0),
                )
                .optional()?;
            oldest = match (oldest, candidate) {
                (Some(a), Some(b)) => Some(if (b.updated_at_ms, &b.uid) < (a.updated_at_ms, &a.uid) {
                    b
                } else {
                    a
                }),
                (a, b) => a.or(b),
            };
        }
        Ok(oldest)
    }

    // =========================================================================
    // Conditional transitions
    // =========================================================================

    /// Claims `observed` for this caller: READY→RUNNING, or a renewed
    /// RUNNING lease. The update requires the row to still carry the
    /// observed status and timestamp. Returns `false` when another process
    /// won the race.
    ///
    /// The owning transaction moves READY→RUNNING in the same `SQLite`
    /// transaction. A FINISH observation is never claimable.
    pub fn claim_detail(&self, observed: &TransactionDetail, now_ms: u64) -> Result<bool, StoreError> {
        if observed.status == DetailStatus::Finish {
            return Ok(false);
        }
        let now = sql_ms(now_ms)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = tx.execute(
            "UPDATE transaction_detail SET status = ?1, updated_at_ms = ?2
             WHERE uid = ?3 AND status = ?4 AND updated_at_ms = ?5",
            params![
                DetailStatus::Running,
                now,
                &observed.uid,
                observed.status,
                sql_ms(observed.updated_at_ms)?
            ],
        )?;
        if rows != 1 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE precommit_transaction
             SET status = ?1, version = version + 1, updated_at_ms = ?2
             WHERE uid = ?3 AND status = ?4",
            params![
                TransactionStatus::Running,
                now,
                &observed.transaction_uid,
                TransactionStatus::Ready
            ],
        )?;
        let event = if observed.status == DetailStatus::Ready {
            events::DETAIL_CLAIMED
        } else {
            events::DETAIL_RECLAIMED
        };
        insert_event(
            &tx,
            event,
            &observed.transaction_uid,
            &json!({
                "detail_uid": observed.uid,
                "region_uid": observed.region_uid,
                "previous_updated_at_ms": observed.updated_at_ms,
            }),
            now,
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Moves a RUNNING detail to FINISH. Returns `false` if it is no longer
    /// RUNNING (a concurrent duplicate already finished it).
    pub fn finish_detail(&self, detail: &TransactionDetail, now_ms: u64) -> Result<bool, StoreError> {
        let now = sql_ms(now_ms)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = tx.execute(
            "UPDATE transaction_detail SET status = ?1, updated_at_ms = ?2
             WHERE uid = ?3 AND status = ?4",
            params![DetailStatus::Finish, now, &detail.uid, DetailStatus::Running],
        )?;
        if rows != 1 {
            return Ok(false);
        }
        insert_event(
            &tx,
            events::DETAIL_FINISHED,
            &detail.transaction_uid,
            &json!({ "detail_uid": detail.uid, "region_uid": detail.region_uid }),
            now,
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Promotes each `(uid, observed_version)` candidate to FINISH.
    ///
    /// Inside one `SQLite` transaction, each candidate is re-checked: its
    /// FINISH details must still cover `regions`, and the update requires the
    /// observed version and a READY/RUNNING status. Returns the promoted uids.
    pub fn promote_finished(
        &self,
        candidates: &[(String, u64)],
        regions: &BTreeSet<String>,
        now_ms: u64,
    ) -> Result<Vec<String>, StoreError> {
        let now = sql_ms(now_ms)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut promoted = Vec::new();
        {
            let mut finished_regions = tx.prepare(
                "SELECT region_uid FROM transaction_detail
                 WHERE transaction_uid = ?1 AND status = ?2",
            )?;
            for (uid, version) in candidates {
                let finished = finished_regions
                    .query_map(params![uid, DetailStatus::Finish], |row| row.get(0))?
                    .collect::<Result<BTreeSet<String>, _>>()?;
                if !regions.is_subset(&finished) {
                    continue;
                }
                let rows = tx.execute(
                    "UPDATE precommit_transaction
                     SET status = ?1, version = version + 1, updated_at_ms = ?2
                     WHERE uid = ?3 AND version = ?4 AND status IN (?5, ?6)",
                    params![
                        TransactionStatus::Finish,
                        now,
                        uid,
                        sql_ms(*version)?,
                        TransactionStatus::Ready,
                        TransactionStatus::Running
                    ],
                )?;
                if rows == 1 {
                    insert_event(
                        &tx,
                        events::TRANSACTION_FINISHED,
                        uid,
                        &json!({ "regions": regions }),
                        now,
                    )?;
                    promoted.push(uid.clone());
                }
            }
        }
        tx.commit()?;
        Ok(promoted)
    }

    /// Applies a successful commit: marker, business effects, COMMITED
    /// status and the `transaction.committed` event, all or nothing.
    ///
    /// Fails with [`StoreError::AlreadyCommitted`] if the marker exists and
    /// with [`StoreError::StaleTransition`] if the transaction is not FINISH;
    /// nothing is written in either case.
    pub fn finalize_commit(
        &self,
        transaction_uid: &str,
        effects: &[CommitEffect],
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let now = sql_ms(now_ms)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_commit_marker(&tx, transaction_uid, now)?;
        for effect in effects {
            apply_effect(&tx, transaction_uid, effect, now)?;
        }
        transition_from_finish(&tx, transaction_uid, TransactionStatus::Commited, now)?;
        insert_event(
            &tx,
            events::COMMITTED,
            transaction_uid,
            &json!({ "effects": effects.len() }),
            now,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Abandons a commit: marker, error row with `reason`, ERROR status and
    /// the `transaction.commit.timeout` event, all or nothing.
    pub fn abandon_commit(
        &self,
        transaction_uid: &str,
        reason: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let now = sql_ms(now_ms)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_commit_marker(&tx, transaction_uid, now)?;
        tx.execute(
            "INSERT INTO error_precommit_transaction (uid, transaction_uid, reason, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![new_uid(), transaction_uid, reason, now],
        )?;
        transition_from_finish(&tx, transaction_uid, TransactionStatus::Error, now)?;
        insert_event(
            &tx,
            events::COMMIT_TIMEOUT,
            transaction_uid,
            &json!({ "reason": reason }),
            now,
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn sql_ms(ms: u64) -> Result<i64, StoreError> {
    i64::try_from(ms).map_err(|_| StoreError::TimestampOutOfRange(ms))
}

fn column_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn transaction_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<PrecommitTransaction> {
    Ok(PrecommitTransaction {
        uid: row.get(offset)?,
        transaction_type: row.get(offset + 1)?,
        info_uid: row.get(offset + 2)?,
        status: row.get(offset + 3)?,
        version: column_u64(row, offset + 4)?,
        created_at_ms: column_u64(row, offset + 5)?,
        updated_at_ms: column_u64(row, offset + 6)?,
    })
}

fn detail_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<TransactionDetail> {
    Ok(TransactionDetail {
        uid: row.get(offset)?,
        transaction_uid: row.get(offset + 1)?,
        region_uid: row.get(offset + 2)?,
        status: row.get(offset + 3)?,
        updated_at_ms: column_u64(row, offset + 4)?,
    })
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingDetail> {
    Ok(PendingDetail {
        detail: detail_from_row(row, 0)?,
        transaction: transaction_from_row(row, 5)?,
    })
}

fn older_pending(a: Option<PendingDetail>, b: Option<PendingDetail>) -> Option<PendingDetail> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let key_a = (a.detail.updated_at_ms, &a.detail.uid);
            let key_b = (b.detail.updated_at_ms, &b.detail.uid);
            Some(if key_b < key_a { b } else { a })
        },
        (a, b) => a.or(b),
    }
}

fn insert_event(
    conn: &Connection,
    name: &str,
    main_id: &str,
    data: &serde_json::Value,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO event_log (event_name, main_id, data, timestamp_ms) VALUES (?1, ?2, ?3, ?4)",
        params![name, main_id, serde_json::to_string(data)?, now],
    )?;
    Ok(())
}

fn insert_commit_marker(conn: &Connection, transaction_uid: &str, now: i64) -> Result<(), StoreError> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO commit_transaction_set (transaction_uid, created_at_ms) VALUES (?1, ?2)",
        params![transaction_uid, now],
    )?;
    if rows == 1 {
        Ok(())
    } else {
        Err(StoreError::AlreadyCommitted {
            uid: transaction_uid.to_string(),
        })
    }
}

fn transition_from_finish(
    conn: &Connection,
    transaction_uid: &str,
    to: TransactionStatus,
    now: i64,
) -> Result<(), StoreError> {
    let rows = conn.execute(
        "UPDATE precommit_transaction
         SET status = ?1, version = version + 1, updated_at_ms = ?2
         WHERE uid = ?3 AND status = ?4",
        params![to, now, transaction_uid, TransactionStatus::Finish],
    )?;
    if rows == 1 {
        Ok(())
    } else {
        Err(StoreError::StaleTransition {
            uid: transaction_uid.to_string(),
            expected: TransactionStatus::Finish,
        })
    }
}

fn apply_effect(
    conn: &Connection,
    transaction_uid: &str,
    effect: &CommitEffect,
    now: i64,
) -> Result<(), StoreError> {
    match effect {
        CommitEffect::RecordUserDeletion { user_uid } => {
            conn.execute(
                "INSERT INTO delete_user_log (uid, user_uid, transaction_uid, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![new_uid(), user_uid, transaction_uid, now],
            )?;
        },
        CommitEffect::RecordUserMerge {
            merge_user_uid,
            user_uid,
        } => {
            conn.execute(
                "INSERT INTO merge_user_log
                 (uid, merge_user_uid, user_uid, transaction_uid, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new_uid(), merge_user_uid, user_uid, transaction_uid, now],
            )?;
        },
        CommitEffect::MarkAccountDeleted { user_uid } => {
            conn.execute(
                "UPDATE user_account SET status = ?1, updated_at_ms = ?2 WHERE uid = ?3",
                params![ACCOUNT_DELETED, now, user_uid],
            )?;
        },
        CommitEffect::RebindOauthProviders {
            from_user_uid,
            to_user_uid,
        } => {
            conn.execute(
                "UPDATE oauth_provider SET user_uid = ?1, updated_at_ms = ?2 WHERE user_uid = ?3",
                params![to_user_uid, now, from_user_uid],
            )?;
        },
        CommitEffect::Event {
            name,
            main_id,
            data,
        } => insert_event(conn, name, main_id, data, now)?,
    }
    Ok(())
}
