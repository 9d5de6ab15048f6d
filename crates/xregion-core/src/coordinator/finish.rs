//! `FinishPhase`: aggregate regional completion.

use std::collections::BTreeSet;

use tracing::{info, warn};

use super::{Coordinator, CoordinatorError};
use crate::store::{DetailStatus, TransactionDetail};

/// What one `FinishPhase` tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishReport {
    /// READY or RUNNING transactions inspected.
    pub examined: usize,
    /// Transactions moved to FINISH.
    pub promoted: Vec<String>,
}

/// Returns `true` when every region in `regions` has a FINISH detail.
///
/// An empty registry never qualifies.
#[must_use]
pub fn qualifies_for_finish(details: &[TransactionDetail], regions: &BTreeSet<String>) -> bool {
    if regions.is_empty() {
        return false;
    }
    let finished: BTreeSet<&str> = details
        .iter()
        .filter(|d| d.status == DetailStatus::Finish)
        .map(|d| d.region_uid.as_str())
        .collect();
    regions.iter().all(|region| finished.contains(region.as_str()))
}

impl Coordinator {
    /// One `FinishPhase` tick.
    ///
    /// Every READY or RUNNING transaction whose FINISH details cover the
    /// current registry is promoted. Promotion is guarded by the version
    /// observed here and re-checked inside the store.
    pub fn finish_tick(&self) -> Result<FinishReport, CoordinatorError> {
        let open = self.store.open_transactions_with_details()?;
        let regions = self.registry.regions()?;
        let examined = open.len();
        if regions.is_empty() {
            warn!(examined, "region registry is empty; nothing can finish");
            return Ok(FinishReport {
                examined,
                promoted: Vec::new(),
            });
        }

        let candidates: Vec<(String, u64)> = open
            .into_iter()
            .filter(|open| qualifies_for_finish(&open.details, &regions))
            .map(|open| (open.transaction.uid, open.transaction.version))
            .collect();
        if candidates.is_empty() {
            return Ok(FinishReport {
                examined,
                promoted: Vec::new(),
            });
        }

        let promoted = self
            .store
            .promote_finished(&candidates, &regions, self.clock.now_ms())?;
        for uid in &promoted {
            info!(transaction_uid = %uid, "transaction finished in every region");
        }
        Ok(FinishReport { examined, promoted })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn detail(region: &str, status: DetailStatus) -> TransactionDetail {
        TransactionDetail {
            uid: format!("d-{region}"),
            transaction_uid: "t".into(),
            region_uid: region.into(),
            status,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn extra_finished_regions_do_not_matter() {
        let regions: BTreeSet<String> = ["a".to_string()].into();
        let details = [
            detail("a", DetailStatus::Finish),
            detail("retired", DetailStatus::Running),
        ];
        assert!(qualifies_for_finish(&details, &regions));
    }

    #[test]
    fn region_added_after_creation_blocks_finish() {
        let regions: BTreeSet<String> = ["a".to_string(), "late".to_string()].into();
        assert!(!qualifies_for_finish(&[detail("a", DetailStatus::Finish)], &regions));
    }

    #[test]
    fn empty_registry_never_qualifies() {
        assert!(!qualifies_for_finish(
            &[detail("a", DetailStatus::Finish)],
            &BTreeSet::new()
        ));
    }

    fn status_strategy() -> impl Strategy<Value = DetailStatus> {
        prop_oneof![
            Just(DetailStatus::Ready),
            Just(DetailStatus::Running),
            Just(DetailStatus::Finish),
        ]
    }

    proptest! {
        #[test]
        fn qualifies_iff_every_registered_region_finished(
            registry in proptest::collection::btree_set("[a-e]", 1..5),
            statuses in proptest::collection::btree_map("[a-g]", status_strategy(), 0..7),
        ) {
            let details: Vec<_> = statuses
                .iter()
                .map(|(region, status)| detail(region, *status))
                .collect();
            let expected = registry
                .iter()
                .all(|region| statuses.get(region) == Some(&DetailStatus::Finish));
            prop_assert_eq!(qualifies_for_finish(&details, &registry), expected);
        }
    }
}
