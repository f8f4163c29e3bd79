//! Concurrency safety: version-stamp compare-and-swap and the
//! one-confirmed-per-side invariant under racing writers.

mod common;

use common::{date, harness, receipt, transaction};
use matching_service::models::{CodingOverrides, MatchState, NewMatch};
use matching_service::services::MatchStore;
use service_core::error::AppError;

#[tokio::test]
async fn racing_confirms_with_the_same_stale_version_let_exactly_one_win() {
    let h = harness();
    let r = receipt(h.user_id, "120.00", date(2025, 9, 1), "Dell");
    h.store.insert_receipt(r.clone()).await;
    h.store
        .insert_transaction(transaction(h.user_id, "120.00", date(2025, 9, 1), "DELL ORDER 9912"))
        .await;

    h.service.run_auto_match(h.user_id, None).await.unwrap();
    let proposed = h.store.matches_for_receipt(r.receipt_id).await.remove(0);

    let (first, second) = {
        let (service_a, service_b) = (h.service.clone(), h.service.clone());
        let (user, match_id, version) = (h.user_id, proposed.match_id, proposed.version);
        let a = tokio::spawn(async move {
            service_a
                .confirm_match(user, match_id, version, &CodingOverrides::default())
                .await
        });
        let b = tokio::spawn(async move {
            service_b
                .confirm_match(user, match_id, version, &CodingOverrides::default())
                .await
        });
        (a.await.unwrap(), b.await.unwrap())
    };

    let (wins, losses): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);
    assert_eq!(wins.len(), 1, "exactly one confirm must win");
    assert_eq!(losses.len(), 1);
    match losses.into_iter().next() {
        Some(Err(AppError::Conflict(_))) => {}
        other => panic!("loser must see a conflict, got {:?}", other),
    }

    // The match ended confirmed exactly once.
    let final_state = h
        .store
        .get_match(h.user_id, proposed.match_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_state.state(), MatchState::Confirmed);
    assert_eq!(final_state.version, proposed.version + 1);
}

#[tokio::test]
async fn second_confirm_on_a_shared_candidate_hits_the_integrity_guard() {
    let h = harness();
    // Two batch runs racing can leave two proposals against one candidate;
    // simulate that state directly through the store.
    let r1 = receipt(h.user_id, "75.00", date(2025, 9, 2), "Apple");
    let r2 = receipt(h.user_id, "75.00", date(2025, 9, 2), "Apple");
    let t = transaction(h.user_id, "75.00", date(2025, 9, 2), "APPLE STORE 4415");
    h.store.insert_receipt(r1.clone()).await;
    h.store.insert_receipt(r2.clone()).await;
    h.store.insert_transaction(t.clone()).await;

    let proposal = |receipt_id| NewMatch {
        user_id: h.user_id,
        receipt_id,
        target: matching_service::models::MatchTarget::Transaction(t.transaction_id),
        confidence: 75,
        amount_score: 40,
        date_score: 35,
        vendor_score: 0,
        match_reason: "amount exact; same day; vendor differs".to_string(),
        vendor_alias_id: None,
        is_manual: false,
        confirmed_by: None,
    };

    let m1 = h
        .store
        .insert_proposed_match(&proposal(r1.receipt_id))
        .await
        .unwrap();
    let m2 = h
        .store
        .insert_proposed_match(&proposal(r2.receipt_id))
        .await
        .unwrap();

    h.service
        .confirm_match(h.user_id, m1.match_id, m1.version, &CodingOverrides::default())
        .await
        .unwrap();

    // The second proposal is still at its original version, so the CAS
    // passes; the persistence-level invariant has to be the safety net.
    let err = h
        .service
        .confirm_match(h.user_id, m2.match_id, m2.version, &CodingOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DataIntegrity(_)), "got {:?}", err);

    // Exactly one confirmed match exists for the candidate.
    let confirmed: Vec<_> = [m1.match_id, m2.match_id]
        .into_iter()
        .map(|id| h.store.get_match(h.user_id, id))
        .collect();
    let mut confirmed_count = 0;
    for pending in confirmed {
        let m = pending.await.unwrap().unwrap();
        if m.state() == MatchState::Confirmed {
            confirmed_count += 1;
        }
    }
    assert_eq!(confirmed_count, 1);
}

#[tokio::test]
async fn racing_rejects_follow_the_same_cas_rules() {
    let h = harness();
    let r = receipt(h.user_id, "15.00", date(2025, 9, 3), "Lyft");
    h.store.insert_receipt(r.clone()).await;
    h.store
        .insert_transaction(transaction(h.user_id, "15.00", date(2025, 9, 3), "LYFT RIDE 930"))
        .await;

    h.service.run_auto_match(h.user_id, None).await.unwrap();
    let proposed = h.store.matches_for_receipt(r.receipt_id).await.remove(0);

    let (service_a, service_b) = (h.service.clone(), h.service.clone());
    let (user, match_id, version) = (h.user_id, proposed.match_id, proposed.version);
    let a = tokio::spawn(async move { service_a.reject_match(user, match_id, version).await });
    let b = tokio::spawn(async move { service_b.reject_match(user, match_id, version).await });
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AppError::Conflict(_)))));
}
