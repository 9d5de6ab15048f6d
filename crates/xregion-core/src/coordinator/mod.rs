//! The three coordinator phases.
//!
//! An external scheduler calls each phase on its own interval:
//!
//! - `RunPhase` ([`Coordinator::run_unit`]) claims one detail of the local
//!   region and applies its job's unit.
//! - `FinishPhase` ([`Coordinator::finish_aggregation`]) promotes every
//!   transaction whose details cover the whole region registry to FINISH.
//! - `CommitPhase` ([`Coordinator::attempt_commit`]) commits one FINISH
//!   transaction, or abandons it once its commit window has passed.
//!
//! Each call handles at most one unit of work and never panics the
//! scheduler: errors are logged and, where useful, appended to the event
//! log. Mutual exclusion between coordinator processes comes only from the
//! store's conditional updates, so a unit may run more than once and every
//! job tolerates that.
//!
//! The `*_tick` methods are the same operations returning what they did.

mod commit;
mod finish;
mod run;


use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

pub use commit::{COMMIT_TIMEOUT_REASON, CommitOutcome};
pub use finish::{FinishReport, qualifies_for_finish};
pub use run::RunOutcome;

use crate::clock::Clock;
use crate::job::JobRegistry;
use crate::region::{RegionError, RegionRegistry};
use crate::store::{StoreError, TransactionStore};

/// Errors that abort a phase tick.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The region registry could not be read.
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Drives transactions for one region.
#[derive(Debug, Clone)]
pub struct Coordinator {
    store: TransactionStore,
    region_uid: String,
    registry: Arc<dyn RegionRegistry>,
    jobs: JobRegistry,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    /// Creates a coordinator running units for `region_uid`.
    #[must_use]
    pub fn new(
        store: TransactionStore,
        region_uid: impl Into<String>,
        registry: Arc<dyn RegionRegistry>,
        jobs: JobRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            region_uid: region_uid.into(),
            registry,
            jobs,
            clock,
        }
    }

    /// Region whose details this coordinator claims.
    #[must_use]
    pub fn region_uid(&self) -> &str {
        &self.region_uid
    }

    /// Underlying store.
    #[must_use]
    pub const fn store(&self) -> &TransactionStore {
        &self.store
    }

    /// `RunPhase` entry point. Errors are logged.
    pub async fn run_unit(&self) {
        match self.run_unit_tick().await {
            Ok(RunOutcome::Idle) => debug!(region_uid = %self.region_uid, "run: nothing to claim"),
            Ok(outcome) => info!(region_uid = %self.region_uid, ?outcome, "run tick"),
            Err(e) => error!(region_uid = %self.region_uid, error = %e, "run tick failed"),
        }
    }

    /// `FinishPhase` entry point. Errors are logged.
    pub fn finish_aggregation(&self) {
        match self.finish_tick() {
            Ok(report) if report.promoted.is_empty() => {
                debug!(examined = report.examined, "finish: nothing promoted");
            },
            Ok(report) => info!(promoted = ?report.promoted, "finish tick"),
            Err(e) => error!(error = %e, "finish tick failed"),
        }
    }

    /// `CommitPhase` entry point. Errors are logged.
    pub async fn attempt_commit(&self) {
        match self.commit_tick().await {
            Ok(CommitOutcome::Idle) => debug!("commit: nothing to commit"),
            Ok(outcome) => info!(?outcome, "commit tick"),
            Err(e) => error!(error = %e, "commit tick failed"),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
