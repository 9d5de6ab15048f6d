//! xregion-core - cross-region transaction coordinator.
//!
//! Account lifecycle operations (user deletion, account merge) must apply to
//! every independently deployed regional cluster and to several global
//! services. This crate drives them as a tick-based saga over a shared
//! transaction store:
//!
//! ```text
//! detail:       READY --claim--> RUNNING --unit ok--> FINISH
//!                                  ^   |
//!                                  +---+ lease expired, re-claim
//!
//! transaction:  READY/RUNNING --all regions FINISH--> FINISH
//!               FINISH --commit ok--> COMMITED
//!               FINISH --commit timeout--> ERROR
//! ```
//!
//! # Modules
//!
//! - [`store`]: SQLite transaction store with compare-and-swap transitions
//! - [`job`]: per-transaction-type business logic (`unit`, `can_commit`,
//!   `commit`)
//! - [`coordinator`]: the RunPhase, FinishPhase and CommitPhase ticks
//! - [`region`]: region registry and the regional user-resource API
//! - [`services`]: global billing, work-order and VM services
//! - [`config`]: TOML configuration model
//! - [`clock`]: injectable wall clock
//!
//! Mutual exclusion between coordinator instances comes entirely from
//! conditional updates in the store. No in-memory lock is held across an
//! await point.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod job;
pub mod region;
pub mod services;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{CommitOutcome, Coordinator, CoordinatorError, FinishReport, RunOutcome};
pub use job::{JobError, JobRegistry, TransactionJob, TransactionType};
pub use store::{StoreError, TransactionStore};
