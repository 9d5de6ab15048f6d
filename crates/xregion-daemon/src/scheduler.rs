//! Interval scheduler driving the three coordinator phases.
//!
//! Each phase runs in its own task on its own interval. A tick that has
//! started always runs to completion; shutdown is observed between ticks.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;
use xregion_core::config::CoordinatorSection;
use xregion_core::{CommitOutcome, Coordinator, FinishReport, RunOutcome};

use crate::state::SharedState;

/// One of the three coordinator phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Claim and apply one regional unit.
    Run,
    /// Promote fully finished transactions.
    Finish,
    /// Commit or abandon one finished transaction.
    Commit,
}

impl Phase {
    /// Phase name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Finish => "finish",
            Self::Commit => "commit",
        }
    }

    /// Interval configured for this phase.
    #[must_use]
    pub const fn interval(self, config: &CoordinatorSection) -> Duration {
        match self {
            Self::Run => config.run_interval(),
            Self::Finish => config.finish_interval(),
            Self::Commit => config.commit_interval(),
        }
    }

    async fn tick(self, coordinator: &Coordinator) {
        match self {
            Self::Run => coordinator.run_unit().await,
            Self::Finish => coordinator.finish_aggregation(),
            Self::Commit => coordinator.attempt_commit().await,
        }
    }
}

/// Runs `phase` every `period` until shutdown is requested.
pub async fn phase_loop(phase: Phase, period: Duration, coordinator: Coordinator, state: SharedState) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(phase = phase.name(), period_ms = period.as_millis(), "phase loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            () = state.shutdown_requested() => break,
        }
        if state.is_shutdown_requested() {
            break;
        }
        phase.tick(&coordinator).await;
    }
    info!(phase = phase.name(), "phase loop stopped");
}

/// Spawns one loop per phase.
#[must_use]
pub fn spawn_phase_loops(
    coordinator: &Coordinator,
    config: &CoordinatorSection,
    state: &SharedState,
) -> Vec<JoinHandle<()>> {
    [Phase::Run, Phase::Finish, Phase::Commit]
        .into_iter()
        .map(|phase| {
            tokio::spawn(phase_loop(
                phase,
                phase.interval(config),
                coordinator.clone(),
                SharedState::clone(state),
            ))
        })
        .collect()
}

/// Result of running each phase once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnceReport {
    /// `RunPhase` outcome.
    pub run: RunOutcome,
    /// `FinishPhase` report.
    pub finish: FinishReport,
    /// `CommitPhase` outcome.
    pub commit: CommitOutcome,
}

/// Runs one tick of each phase in order (cron mode).
pub async fn run_once(coordinator: &Coordinator) -> Result<OnceReport> {
    let run = coordinator.run_unit_tick().await?;
    let finish = coordinator.finish_tick()?;
    let commit = coordinator.commit_tick().await?;
    Ok(OnceReport {
        run,
        finish,
        commit,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use xregion_core::config::CoordinatorConfig;
    use xregion_core::store::{NewTransactionInfo, TransactionStatus};
    use xregion_core::{Clock, SystemClock, TransactionStore};

    use super::*;
    use crate::state::SchedulerState;
    use crate::wiring::build_coordinator;

    fn coordinator(store: &TransactionStore) -> Coordinator {
        let mut config = CoordinatorConfig::default();
        config.coordinator.region_uid = "r1".into();
        config.regions.uids = vec!["r1".into()];
        config.regional_api.dry_run = true;
        build_coordinator(&config, store.clone(), Arc::new(SystemClock)).unwrap()
    }

    fn submit(store: &TransactionStore) -> String {
        let regions: BTreeSet<String> = ["r1".to_string()].into();
        store
            .create_transaction(
                &NewTransactionInfo::DeleteUser {
                    user_uid: "u1".into(),
                },
                &regions,
                SystemClock.now_ms(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn run_once_drives_a_single_region_transaction_to_commit() {
        let store = TransactionStore::in_memory().unwrap();
        let uid = submit(&store);
        let report = run_once(&coordinator(&store)).await.unwrap();
        assert!(matches!(report.run, RunOutcome::Completed { .. }));
        assert_eq!(report.finish.promoted, vec![uid.clone()]);
        assert!(matches!(report.commit, CommitOutcome::Committed { .. }));
        assert_eq!(
            store.transaction(&uid).unwrap().unwrap().status,
            TransactionStatus::Commited
        );
    }

    #[tokio::test]
    async fn two_regions_share_one_database_file() {
        use xregion_core::store::StoreHandle;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xregion.db");
        let instance = |region: &str| {
            let handle = StoreHandle::new(&path);
            let mut config = CoordinatorConfig::default();
            config.coordinator.region_uid = region.into();
            config.regions.uids = vec!["eu-1".into(), "us-1".into()];
            config.regional_api.dry_run = true;
            let coordinator =
                build_coordinator(&config, handle.get().unwrap(), Arc::new(SystemClock)).unwrap();
            (handle, coordinator)
        };
        let (eu_handle, eu) = instance("eu-1");
        let (us_handle, us) = instance("us-1");

        let regions: BTreeSet<String> = ["eu-1".to_string(), "us-1".to_string()].into();
        let uid = eu
            .store()
            .create_transaction(
                &NewTransactionInfo::DeleteUser {
                    user_uid: "u1".into(),
                },
                &regions,
                SystemClock.now_ms(),
            )
            .unwrap();

        let first = run_once(&eu).await.unwrap();
        assert!(first.finish.promoted.is_empty());
        assert_eq!(first.commit, CommitOutcome::Idle);

        let second = run_once(&us).await.unwrap();
        assert_eq!(second.finish.promoted, vec![uid.clone()]);
        assert!(matches!(second.commit, CommitOutcome::Committed { .. }));

        eu_handle.shutdown().unwrap();
        us_handle.shutdown().unwrap();
        let reopened = TransactionStore::open(&path).unwrap();
        assert_eq!(
            reopened.transaction(&uid).unwrap().unwrap().status,
            TransactionStatus::Commited
        );
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let store = TransactionStore::in_memory().unwrap();
        let uid = submit(&store);
        let mut config = CoordinatorConfig::default().coordinator;
        config.run_interval_ms = 5;
        config.finish_interval_ms = 5;
        config.commit_interval_ms = 5;
        let state: SharedState = Arc::new(SchedulerState::new());

        let handles = spawn_phase_loops(&coordinator(&store), &config, &state);
        for _ in 0..200 {
            if store.transaction(&uid).unwrap().unwrap().status == TransactionStatus::Commited {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        state.request_shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(
            store.transaction(&uid).unwrap().unwrap().status,
            TransactionStatus::Commited
        );
    }
}
