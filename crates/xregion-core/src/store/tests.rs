use super::*;

fn regions(uids: &[&str]) -> BTreeSet<String> {
    uids.iter().map(|s| (*s).to_string()).collect()
}

fn delete_user(user_uid: &str) -> NewTransactionInfo {
    NewTransactionInfo::DeleteUser {
        user_uid: user_uid.to_string(),
    }
}

fn detail_in(store: &TransactionStore, txn: &str, region: &str) -> TransactionDetail {
    store
        .details_for(txn)
        .unwrap()
        .into_iter()
        .find(|d| d.region_uid == region)
        .unwrap()
}

fn insert_raw_transaction(store: &TransactionStore, uid: &str, label: &str, region: &str, now: i64) {
    let conn = store.lock().unwrap();
    conn.execute(
        "INSERT INTO precommit_transaction
         (uid, transaction_type, info_uid, status, version, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, 'none', 'READY', 0, ?3, ?3)",
        params![uid, label, now],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO transaction_detail (uid, transaction_uid, region_uid, status, updated_at_ms)
         VALUES (?1, ?2, ?3, 'READY', ?4)",
        params![format!("{uid}-detail"), uid, region, now],
    )
    .unwrap();
}

#[test]
fn create_transaction_writes_info_and_one_detail_per_region() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = store
        .create_transaction(&delete_user("u1"), &regions(&["r1", "r2", "r3"]), 100)
        .unwrap();

    let txn = store.transaction(&uid).unwrap().unwrap();
    assert_eq!(txn.status, TransactionStatus::Ready);
    assert_eq!(txn.kind(), Some(TransactionType::DeleteUser));
    assert_eq!(txn.version, 0);
    assert_eq!(txn.updated_at_ms, 100);

    let details = store.details_for(&uid).unwrap();
    assert_eq!(details.len(), 3);
    assert!(details.iter().all(|d| d.status == DetailStatus::Ready));

    let info = store.delete_user_info(&txn.info_uid).unwrap().unwrap();
    assert_eq!(info.user_uid, "u1");
    assert!(store.merge_user_info(&txn.info_uid).unwrap().is_none());
}

#[test]
fn create_transaction_requires_regions() {
    let store = TransactionStore::in_memory().unwrap();
    let err = store
        .create_transaction(&delete_user("u1"), &BTreeSet::new(), 0)
        .unwrap_err();
    assert!(matches!(err, StoreError::NoRegions));
    assert!(store.list_transactions(None).unwrap().is_empty());
}

#[test]
fn register_region_is_idempotent() {
    let store = TransactionStore::in_memory().unwrap();
    assert!(store.register_region("r1", 0).unwrap());
    assert!(!store.register_region("r1", 5).unwrap());
    assert!(store.register_region("r2", 5).unwrap());
    assert_eq!(store.regions().unwrap(), regions(&["r1", "r2"]));
}

#[test]
fn claim_is_compare_and_swap_on_observed_row() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = store
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 100)
        .unwrap();
    let observed = detail_in(&store, &uid, "r1");

    assert!(store.claim_detail(&observed, 200).unwrap());
    // A second process holding the same observation loses.
    assert!(!store.claim_detail(&observed, 201).unwrap());

    let claimed = detail_in(&store, &uid, "r1");
    assert_eq!(claimed.status, DetailStatus::Running);
    assert_eq!(claimed.updated_at_ms, 200);

    let txn = store.transaction(&uid).unwrap().unwrap();
    assert_eq!(txn.status, TransactionStatus::Running);
    assert_eq!(txn.version, 1);

    let names: Vec<_> = store
        .events_for(&uid)
        .unwrap()
        .into_iter()
        .map(|e| e.event_name)
        .collect();
    assert_eq!(names, vec![events::DETAIL_CLAIMED]);
}

#[test]
fn reclaim_renews_the_lease_without_bumping_a_running_transaction() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = store
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 100)
        .unwrap();
    assert!(store.claim_detail(&detail_in(&store, &uid, "r1"), 200).unwrap());

    let stale = detail_in(&store, &uid, "r1");
    assert!(store.claim_detail(&stale, 90_000).unwrap());
    assert_eq!(detail_in(&store, &uid, "r1").updated_at_ms, 90_000);
    assert_eq!(store.transaction(&uid).unwrap().unwrap().version, 1);

    let last = store.events_for(&uid).unwrap().pop().unwrap();
    assert_eq!(last.event_name, events::DETAIL_RECLAIMED);
    assert_eq!(last.data["previous_updated_at_ms"], 200);
}

#[test]
fn finish_requires_running_and_never_regresses() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = store
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 100)
        .unwrap();
    let ready = detail_in(&store, &uid, "r1");
    assert!(!store.finish_detail(&ready, 150).unwrap());

    assert!(store.claim_detail(&ready, 200).unwrap());
    let running = detail_in(&store, &uid, "r1");
    assert!(store.finish_detail(&running, 300).unwrap());
    assert!(!store.finish_detail(&running, 301).unwrap());

    let finished = detail_in(&store, &uid, "r1");
    assert_eq!(finished.status, DetailStatus::Finish);
    // A stale claim observation cannot pull it back to RUNNING.
    assert!(!store.claim_detail(&running, 400).unwrap());
    assert_eq!(detail_in(&store, &uid, "r1").status, DetailStatus::Finish);
}

#[test]
fn ready_selection_is_fifo_within_the_region() {
    let store = TransactionStore::in_memory().unwrap();
    let later = store
        .create_transaction(&delete_user("late"), &regions(&["r1"]), 500)
        .unwrap();
    let earlier = store
        .create_transaction(
            &NewTransactionInfo::MergeUser {
                merge_user_uid: "m".into(),
                user_uid: "u".into(),
            },
            &regions(&["r1", "r2"]),
            100,
        )
        .unwrap();

    let all = TransactionType::ALL;
    let picked = store.oldest_ready_detail("r1", all).unwrap().unwrap();
    assert_eq!(picked.transaction.uid, earlier);
    assert_eq!(picked.detail.region_uid, "r1");

    let delete_only = store
        .oldest_ready_detail("r1", &[TransactionType::DeleteUser])
        .unwrap()
        .unwrap();
    assert_eq!(delete_only.transaction.uid, later);

    assert!(store.oldest_ready_detail("r9", all).unwrap().is_none());
}

#[test]
fn unknown_types_are_never_selected() {
    let store = TransactionStore::in_memory().unwrap();
    insert_raw_transaction(&store, "legacy", "RENAME_USER", "r1", 1);
    let fresh = store
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 50)
        .unwrap();

    let picked = store
        .oldest_ready_detail("r1", TransactionType::ALL)
        .unwrap()
        .unwrap();
    assert_eq!(picked.transaction.uid, fresh);

    let legacy = store.transaction("legacy").unwrap().unwrap();
    assert_eq!(legacy.kind(), None);
    assert_eq!(legacy.transaction_type, "RENAME_USER");
}

#[test]
fn expired_running_selection_uses_per_type_cutoff() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = store
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 0)
        .unwrap();
    assert!(store.claim_detail(&detail_in(&store, &uid, "r1"), 1_000).unwrap());

    let cutoff_before = [(TransactionType::DeleteUser, 1_000)];
    assert!(
        store
            .oldest_expired_running_detail("r1", &cutoff_before)
            .unwrap()
            .is_none()
    );

    let cutoff_after = [(TransactionType::DeleteUser, 1_001)];
    let expired = store
        .oldest_expired_running_detail("r1", &cutoff_after)
        .unwrap()
        .unwrap();
    assert_eq!(expired.detail.status, DetailStatus::Running);
    assert_eq!(expired.detail.updated_at_ms, 1_000);

    let other_type = [(TransactionType::MergeUser, u64::from(u32::MAX))];
    assert!(
        store
            .oldest_expired_running_detail("r1", &other_type)
            .unwrap()
            .is_none()
    );
}

fn finish_all(store: &TransactionStore, uid: &str, now: u64) {
    for detail in store.details_for(uid).unwrap() {
        assert!(store.claim_detail(&detail, now).unwrap());
        let running = detail_in(store, uid, &detail.region_uid);
        assert!(store.finish_detail(&running, now).unwrap());
    }
}

#[test]
fn promote_requires_observed_version_and_full_coverage() {
    let store = TransactionStore::in_memory().unwrap();
    let all = regions(&["r1", "r2"]);
    let uid = store.create_transaction(&delete_user("u1"), &all, 0).unwrap();
    finish_all(&store, &uid, 10);

    let open = store.open_transactions_with_details().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].details.len(), 2);
    let version = open[0].transaction.version;

    // Coverage is re-checked against the registry passed in.
    let wider = regions(&["r1", "r2", "r3"]);
    let promoted = store
        .promote_finished(&[(uid.clone(), version)], &wider, 20)
        .unwrap();
    assert!(promoted.is_empty());

    // A stale version observation is rejected.
    let promoted = store
        .promote_finished(&[(uid.clone(), version + 7)], &all, 20)
        .unwrap();
    assert!(promoted.is_empty());

    let promoted = store
        .promote_finished(&[(uid.clone(), version)], &all, 20)
        .unwrap();
    assert_eq!(promoted, vec![uid.clone()]);

    let txn = store.transaction(&uid).unwrap().unwrap();
    assert_eq!(txn.status, TransactionStatus::Finish);
    assert_eq!(txn.updated_at_ms, 20);
    assert!(store.open_transactions_with_details().unwrap().is_empty());
}

fn finished_transaction(store: &TransactionStore, user_uid: &str) -> String {
    let all = regions(&["r1"]);
    let uid = store.create_transaction(&delete_user(user_uid), &all, 0).unwrap();
    finish_all(store, &uid, 10);
    let version = store.transaction(&uid).unwrap().unwrap().version;
    store.promote_finished(&[(uid.clone(), version)], &all, 20).unwrap();
    uid
}

#[test]
fn finalize_commit_applies_effects_once() {
    let store = TransactionStore::in_memory().unwrap();
    store.insert_user_account("u1", 0).unwrap();
    let uid = finished_transaction(&store, "u1");
    assert_eq!(
        store.oldest_uncommitted_finished(TransactionType::ALL).unwrap().map(|t| t.uid),
        Some(uid.clone())
    );

    let effects = vec![
        CommitEffect::RecordUserDeletion {
            user_uid: "u1".into(),
        },
        CommitEffect::MarkAccountDeleted {
            user_uid: "u1".into(),
        },
        CommitEffect::Event {
            name: events::USER_DELETED.into(),
            main_id: "u1".into(),
            data: json!({ "transaction_uid": uid }),
        },
    ];
    store.finalize_commit(&uid, &effects, 30).unwrap();

    let err = store.finalize_commit(&uid, &effects, 31).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyCommitted { .. }));

    assert_eq!(
        store.transaction(&uid).unwrap().unwrap().status,
        TransactionStatus::Commited
    );
    assert!(store.has_commit_marker(&uid).unwrap());
    assert_eq!(store.deletion_log_count("u1").unwrap(), 1);
    assert_eq!(store.account_status("u1").unwrap().as_deref(), Some(ACCOUNT_DELETED));
    assert_eq!(store.events_for("u1").unwrap().len(), 1);
    assert!(store.oldest_uncommitted_finished(TransactionType::ALL).unwrap().is_none());
}

#[test]
fn finalize_commit_rolls_back_when_not_finished() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = store
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 0)
        .unwrap();
    let effects = [CommitEffect::RecordUserDeletion {
        user_uid: "u1".into(),
    }];

    let err = store.finalize_commit(&uid, &effects, 5).unwrap_err();
    assert!(matches!(
        err,
        StoreError::StaleTransition {
            expected: TransactionStatus::Finish,
            ..
        }
    ));
    assert!(!store.has_commit_marker(&uid).unwrap());
    assert_eq!(store.deletion_log_count("u1").unwrap(), 0);
}

#[test]
fn rebind_moves_every_oauth_binding() {
    let store = TransactionStore::in_memory().unwrap();
    store.bind_oauth_provider("merged", "GITHUB", "gh-1", 0).unwrap();
    store.bind_oauth_provider("merged", "GOOGLE", "g-1", 0).unwrap();
    store.bind_oauth_provider("target", "PHONE", "555", 0).unwrap();
    let uid = finished_transaction(&store, "merged");

    store
        .finalize_commit(
            &uid,
            &[CommitEffect::RebindOauthProviders {
                from_user_uid: "merged".into(),
                to_user_uid: "target".into(),
            }],
            40,
        )
        .unwrap();

    assert!(store.oauth_bindings("merged").unwrap().is_empty());
    let types: Vec<_> = store
        .oauth_bindings("target")
        .unwrap()
        .into_iter()
        .map(|b| b.provider_type)
        .collect();
    assert_eq!(types, vec!["GITHUB", "GOOGLE", "PHONE"]);
}

#[test]
fn abandon_commit_is_terminal_and_blocks_finalize() {
    let store = TransactionStore::in_memory().unwrap();
    let uid = finished_transaction(&store, "u1");

    store.abandon_commit(&uid, "commit timeout", 999).unwrap();
    let txn = store.transaction(&uid).unwrap().unwrap();
    assert_eq!(txn.status, TransactionStatus::Error);
    assert!(txn.status.is_terminal());
    assert_eq!(store.error_reason(&uid).unwrap().as_deref(), Some("commit timeout"));

    let err = store.finalize_commit(&uid, &[], 1_000).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyCommitted { .. }));
    let err = store.abandon_commit(&uid, "again", 1_001).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyCommitted { .. }));
    assert_eq!(
        store.transaction(&uid).unwrap().unwrap().status,
        TransactionStatus::Error
    );
}

#[test]
fn list_filters_by_status() {
    let store = TransactionStore::in_memory().unwrap();
    let done = finished_transaction(&store, "u1");
    let open = store
        .create_transaction(&delete_user("u2"), &regions(&["r1"]), 50)
        .unwrap();

    let finished: Vec<_> = store
        .list_transactions(Some(TransactionStatus::Finish))
        .unwrap()
        .into_iter()
        .map(|t| t.uid)
        .collect();
    assert_eq!(finished, vec![done.clone()]);
    assert_eq!(store.list_transactions(None).unwrap().len(), 2);
    let ready = store.list_transactions(Some(TransactionStatus::Ready)).unwrap();
    assert_eq!(ready[0].uid, open);
}

#[test]
fn two_handles_share_one_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let a = TransactionStore::open(&path).unwrap();
    let b = TransactionStore::open(&path).unwrap();

    let uid = a
        .create_transaction(&delete_user("u1"), &regions(&["r1"]), 0)
        .unwrap();
    let observed = detail_in(&b, &uid, "r1");
    assert!(a.claim_detail(&observed, 10).unwrap());
    assert!(!b.claim_detail(&observed, 11).unwrap());
    b.checkpoint().unwrap();
}
