//! Row types persisted by the transaction store.

use std::fmt;
use std::str::FromStr;

use rusqlite::ToSql;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored label did not match any known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} label: {value}")]
pub struct UnknownLabel {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected label.
    pub value: String,
}

macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $label)]
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Returns the stable label stored in the database.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownLabel;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($label => Ok(Self::$variant),)+
                    other => Err(UnknownLabel {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownLabel| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

labelled_enum! {
    /// Kind of cross-region operation a transaction performs.
    TransactionType ("transaction type") {
        /// Remove a user from every region, then finalize globally.
        DeleteUser => "DELETE_USER",
        /// Fold one account into another across every region.
        MergeUser => "MERGE_USER",
    }
}

labelled_enum! {
    /// Lifecycle state of a [`PrecommitTransaction`].
    TransactionStatus ("transaction status") {
        /// Created; no region has claimed work yet.
        Ready => "READY",
        /// At least one region has claimed its unit.
        Running => "RUNNING",
        /// Every registered region finished its unit.
        Finish => "FINISH",
        /// Global commit applied. Terminal.
        Commited => "COMMITED",
        /// Commit abandoned after timeout. Terminal.
        Error => "ERROR",
    }
}

labelled_enum! {
    /// Lifecycle state of a per-region [`TransactionDetail`].
    DetailStatus ("detail status") {
        /// Waiting to be claimed by the region's coordinator.
        Ready => "READY",
        /// Claimed; `updated_at_ms` is the lease start.
        Running => "RUNNING",
        /// Regional unit applied.
        Finish => "FINISH",
    }
}

impl TransactionStatus {
    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Commited | Self::Error)
    }
}

/// One logical cross-region operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecommitTransaction {
    /// Transaction identifier.
    pub uid: String,
    /// Raw stored type label. Kept raw so unknown labels can be dead-lettered.
    pub transaction_type: String,
    /// Reference to the type-specific info row.
    pub info_uid: String,
    /// Current status.
    pub status: TransactionStatus,
    /// Bumped on every status change.
    pub version: u64,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// Last status change (ms since epoch).
    pub updated_at_ms: u64,
}

impl PrecommitTransaction {
    /// Parses the stored type label.
    #[must_use]
    pub fn kind(&self) -> Option<TransactionType> {
        self.transaction_type.parse().ok()
    }
}

/// Per-(transaction, region) progress row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionDetail {
    /// Detail identifier.
    pub uid: String,
    /// Owning transaction.
    pub transaction_uid: String,
    /// Region this unit of work belongs to.
    pub region_uid: String,
    /// Current status.
    pub status: DetailStatus,
    /// Last claim or transition (ms since epoch).
    pub updated_at_ms: u64,
}

/// A claimable detail together with its owning transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDetail {
    /// The observed detail row (status and timestamp are the CAS guard).
    pub detail: TransactionDetail,
    /// The owning transaction.
    pub transaction: PrecommitTransaction,
}

/// A transaction that has not reached FINISH, with all of its details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTransaction {
    /// The transaction row.
    pub transaction: PrecommitTransaction,
    /// Every detail row created for it.
    pub details: Vec<TransactionDetail>,
}

/// Payload of a `DELETE_USER` transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserTransactionInfo {
    /// Info row identifier (the transaction's `info_uid`).
    pub uid: String,
    /// The user being deleted.
    pub user_uid: String,
}

/// Payload of a `MERGE_USER` transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeUserTransactionInfo {
    /// Info row identifier (the transaction's `info_uid`).
    pub uid: String,
    /// The account being folded away.
    pub merge_user_uid: String,
    /// The surviving account.
    pub user_uid: String,
}

/// Type-specific payload supplied when a transaction is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewTransactionInfo {
    /// Delete `user_uid` everywhere.
    DeleteUser {
        /// The user being deleted.
        user_uid: String,
    },
    /// Merge `merge_user_uid` into `user_uid`.
    MergeUser {
        /// The account being folded away.
        merge_user_uid: String,
        /// The surviving account.
        user_uid: String,
    },
}

impl NewTransactionInfo {
    /// Transaction type this payload belongs to.
    #[must_use]
    pub const fn transaction_type(&self) -> TransactionType {
        match self {
            Self::DeleteUser { .. } => TransactionType::DeleteUser,
            Self::MergeUser { .. } => TransactionType::MergeUser,
        }
    }
}

/// One audit-trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Monotonic sequence id assigned on insert.
    pub seq_id: u64,
    /// Event name, e.g. `transaction.committed`.
    pub event_name: String,
    /// Main entity id the event is about.
    pub main_id: String,
    /// JSON payload.
    pub data: serde_json::Value,
    /// Insert time (ms since epoch).
    pub timestamp_ms: u64,
}

/// An OAuth identity bound to a global account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OauthBinding {
    /// Binding identifier.
    pub uid: String,
    /// Owning account.
    pub user_uid: String,
    /// Provider kind, e.g. `GITHUB`.
    pub provider_type: String,
    /// Identity at the provider.
    pub provider_id: String,
}

/// A global write applied atomically with the commit marker.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitEffect {
    /// Append a row to the deletion log.
    RecordUserDeletion {
        /// The deleted user.
        user_uid: String,
    },
    /// Append a row to the merge log.
    RecordUserMerge {
        /// The account folded away.
        merge_user_uid: String,
        /// The surviving account.
        user_uid: String,
    },
    /// Flag a global account as deleted. No-op for unknown accounts.
    MarkAccountDeleted {
        /// The account to flag.
        user_uid: String,
    },
    /// Move every OAuth binding from one account to another.
    RebindOauthProviders {
        /// Current owner.
        from_user_uid: String,
        /// New owner.
        to_user_uid: String,
    },
    /// Append an audit event.
    Event {
        /// Event name.
        name: String,
        /// Main entity id.
        main_id: String,
        /// JSON payload.
        data: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_through_from_str() {
        for status in TransactionStatus::ALL {
            assert_eq!(status.as_str().parse::<TransactionStatus>(), Ok(*status));
        }
        assert_eq!("MERGE_USER".parse(), Ok(TransactionType::MergeUser));
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = "RENAME_USER".parse::<TransactionType>().unwrap_err();
        assert_eq!(err.value, "RENAME_USER");
        assert_eq!(
            err.to_string(),
            "unknown transaction type label: RENAME_USER"
        );
    }

    #[test]
    fn only_commited_and_error_are_terminal() {
        let terminal: Vec<_> = TransactionStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![&TransactionStatus::Commited, &TransactionStatus::Error]
        );
    }

    #[test]
    fn raw_type_label_parses_lazily() {
        let txn = PrecommitTransaction {
            uid: "t".into(),
            transaction_type: "SOMETHING_NEW".into(),
            info_uid: "i".into(),
            status: TransactionStatus::Ready,
            version: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert_eq!(txn.kind(), None);
    }
}
