//! Auto-match batch behavior: thresholds, ambiguity, group preference, and
//! candidate pool exclusions.

mod common;

use common::{alias, date, group, grouped_transaction, harness, receipt, transaction};
use matching_service::models::{MatchState, MatchStatus};
use matching_service::services::MatchStore;

#[tokio::test]
async fn proposes_perfect_match_with_full_breakdown() {
    let h = harness();
    let r = receipt(h.user_id, "425.00", date(2025, 1, 10), "Delta Airlines");
    let t = transaction(h.user_id, "425.00", date(2025, 1, 10), "DELTA AIR 0062334156983");
    h.store.insert_receipt(r.clone()).await;
    h.store.insert_transaction(t.clone()).await;
    h.store
        .insert_alias(alias(h.user_id, "DELTA AIR", "Delta Airlines"))
        .await;

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.proposed, 1);
    assert_eq!(summary.ambiguous, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.group_matches, 0);

    let matches = h.store.matches_for_receipt(r.receipt_id).await;
    assert_eq!(matches.len(), 1);
    let m = &matches[0];
    assert_eq!(m.state(), MatchState::Proposed);
    assert_eq!(m.confidence, 100);
    assert_eq!(m.amount_score, 40);
    assert_eq!(m.date_score, 35);
    assert_eq!(m.vendor_score, 25);
    assert_eq!(m.transaction_id, Some(t.transaction_id));
    assert_eq!(m.group_id, None);
    assert!(m.vendor_alias_id.is_some());
    assert!(!m.is_manual);
    assert_eq!(m.version, 1);

    let r = h
        .store
        .get_receipt(h.user_id, r.receipt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r.status(), MatchStatus::Proposed);
    let t = h
        .store
        .get_transaction(h.user_id, t.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.status(), MatchStatus::Proposed);
}

#[tokio::test]
async fn below_threshold_creates_nothing() {
    let h = harness();
    let r = receipt(h.user_id, "100.00", date(2025, 3, 10), "Acme Tools");
    // Near amount (20) + one day off (30) + unrelated vendor (0) = 50.
    let t = transaction(h.user_id, "100.50", date(2025, 3, 11), "SOMETHING ELSE 4411");
    h.store.insert_receipt(r.clone()).await;
    h.store.insert_transaction(t.clone()).await;

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.proposed, 0);
    assert!(h.store.matches_for_receipt(r.receipt_id).await.is_empty());

    let t = h
        .store
        .get_transaction(h.user_id, t.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.status(), MatchStatus::Unmatched);
}

#[tokio::test]
async fn near_tied_candidates_are_ambiguous() {
    let h = harness();
    let r = receipt(h.user_id, "75.00", date(2025, 5, 5), "Coffee");
    h.store.insert_receipt(r.clone()).await;
    // Two indistinguishable candidates, both at 75.
    h.store
        .insert_transaction(transaction(h.user_id, "75.00", date(2025, 5, 5), "STARBUCKS 0001"))
        .await;
    h.store
        .insert_transaction(transaction(h.user_id, "75.00", date(2025, 5, 5), "STARBUCKS 0002"))
        .await;

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.proposed, 0);
    assert_eq!(summary.ambiguous, 1);
    assert!(h.store.matches_for_receipt(r.receipt_id).await.is_empty());

    let r = h
        .store
        .get_receipt(h.user_id, r.receipt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r.status(), MatchStatus::Unmatched);
}

#[tokio::test]
async fn clear_winner_beats_runner_up_outside_margin() {
    let h = harness();
    let r = receipt(h.user_id, "60.00", date(2025, 5, 5), "Twilio");
    h.store.insert_receipt(r.clone()).await;
    // 100 vs 75: well outside the ambiguity margin.
    let exact = transaction(h.user_id, "60.00", date(2025, 5, 5), "TWILIO 5551");
    let close = transaction(h.user_id, "60.00", date(2025, 5, 5), "UNRELATED VENDOR");
    h.store.insert_transaction(exact.clone()).await;
    h.store.insert_transaction(close).await;
    h.store.insert_alias(alias(h.user_id, "TWILIO", "Twilio")).await;

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.proposed, 1);
    assert_eq!(summary.ambiguous, 0);
    let matches = h.store.matches_for_receipt(r.receipt_id).await;
    assert_eq!(matches[0].transaction_id, Some(exact.transaction_id));
}

#[tokio::test]
async fn group_is_matched_instead_of_its_members() {
    let h = harness();
    let r = receipt(h.user_id, "50.00", date(2025, 4, 1), "Twilio");
    let g = group(h.user_id, "TWILIO (3 charges)", "50.00", date(2025, 4, 1));
    h.store.insert_receipt(r.clone()).await;
    h.store.insert_group(g.clone()).await;
    h.store.insert_alias(alias(h.user_id, "TWILIO", "Twilio")).await;

    let members = [
        grouped_transaction(h.user_id, "20.00", date(2025, 3, 30), "TWILIO 111", g.group_id),
        grouped_transaction(h.user_id, "20.00", date(2025, 3, 31), "TWILIO 112", g.group_id),
        grouped_transaction(h.user_id, "10.00", date(2025, 4, 1), "TWILIO 113", g.group_id),
    ];
    for member in &members {
        h.store.insert_transaction(member.clone()).await;
    }

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.proposed, 1);
    assert_eq!(summary.group_matches, 1);

    let matches = h.store.matches_for_receipt(r.receipt_id).await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].group_id, Some(g.group_id));
    assert_eq!(matches[0].transaction_id, None);
    assert!(matches[0].confidence >= 95);

    // Members stay out of it entirely.
    for member in &members {
        let t = h
            .store
            .get_transaction(h.user_id, member.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.status(), MatchStatus::Unmatched);
        assert_eq!(t.matched_receipt_id, None);
    }
}

#[tokio::test]
async fn grouped_transactions_never_appear_as_candidates() {
    let h = harness();
    let r = receipt(h.user_id, "20.00", date(2025, 4, 2), "Twilio");
    let g = group(h.user_id, "TWILIO (2 charges)", "999.00", date(2025, 2, 1));
    h.store.insert_receipt(r.clone()).await;
    h.store.insert_group(g.clone()).await;
    // Would be a perfect individual match, but it belongs to a group.
    h.store
        .insert_transaction(grouped_transaction(
            h.user_id,
            "20.00",
            date(2025, 4, 2),
            "TWILIO 221",
            g.group_id,
        ))
        .await;

    let candidates = h
        .service
        .get_candidates(h.user_id, r.receipt_id, None)
        .await
        .unwrap();
    assert!(candidates.is_empty());

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();
    assert_eq!(summary.proposed, 0);
}

#[tokio::test]
async fn receipts_without_extraction_are_counted_as_skipped() {
    let h = harness();
    h.store
        .insert_receipt(common::receipt_without_extraction(h.user_id, "Mystery"))
        .await;

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.processed, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.proposed, 0);
}

#[tokio::test]
async fn one_candidate_is_not_proposed_to_two_receipts_in_one_run() {
    let h = harness();
    let first = receipt(h.user_id, "40.00", date(2025, 2, 2), "Lunch");
    let second = receipt(h.user_id, "40.00", date(2025, 2, 2), "Lunch");
    let only = transaction(h.user_id, "40.00", date(2025, 2, 2), "CAFE 4402");
    h.store.insert_receipt(first.clone()).await;
    h.store.insert_receipt(second.clone()).await;
    h.store.insert_transaction(only.clone()).await;

    let summary = h.service.run_auto_match(h.user_id, None).await.unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.proposed, 1);

    let total_matches = h.store.matches_for_receipt(first.receipt_id).await.len()
        + h.store.matches_for_receipt(second.receipt_id).await.len();
    assert_eq!(total_matches, 1);
}

#[tokio::test]
async fn targeted_run_leaves_other_receipts_alone() {
    let h = harness();
    let wanted = receipt(h.user_id, "15.00", date(2025, 6, 1), "Lyft");
    let ignored = receipt(h.user_id, "25.00", date(2025, 6, 2), "Uber");
    h.store.insert_receipt(wanted.clone()).await;
    h.store.insert_receipt(ignored.clone()).await;
    h.store
        .insert_transaction(transaction(h.user_id, "15.00", date(2025, 6, 1), "LYFT RIDE 881"))
        .await;
    h.store
        .insert_transaction(transaction(h.user_id, "25.00", date(2025, 6, 2), "UBER TRIP 882"))
        .await;

    let summary = h
        .service
        .run_auto_match(h.user_id, Some(vec![wanted.receipt_id]))
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.proposed, 1);
    assert!(h.store.matches_for_receipt(ignored.receipt_id).await.is_empty());

    let ignored = h
        .store
        .get_receipt(h.user_id, ignored.receipt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ignored.status(), MatchStatus::Unmatched);
}

#[tokio::test]
async fn rerun_does_not_duplicate_existing_proposals() {
    let h = harness();
    let r = receipt(h.user_id, "12.00", date(2025, 7, 7), "Lyft");
    h.store.insert_receipt(r.clone()).await;
    h.store
        .insert_transaction(transaction(h.user_id, "12.00", date(2025, 7, 7), "LYFT RIDE 120"))
        .await;

    let first = h.service.run_auto_match(h.user_id, None).await.unwrap();
    assert_eq!(first.proposed, 1);

    // The receipt is now proposed, so a second run has nothing to do.
    let second = h.service.run_auto_match(h.user_id, None).await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.proposed, 0);
    assert_eq!(h.store.matches_for_receipt(r.receipt_id).await.len(), 1);
}

#[tokio::test]
async fn candidate_listing_is_ranked_and_creates_nothing() {
    let h = harness();
    let r = receipt(h.user_id, "30.00", date(2025, 8, 1), "Hampton Inn");
    h.store.insert_receipt(r.clone()).await;
    let best = transaction(h.user_id, "30.00", date(2025, 8, 1), "HAMPTON INN 4471");
    let worse = transaction(h.user_id, "30.90", date(2025, 8, 3), "HAMPTON INN 4472");
    h.store.insert_transaction(best.clone()).await;
    h.store.insert_transaction(worse.clone()).await;

    let candidates = h
        .service
        .get_candidates(h.user_id, r.receipt_id, None)
        .await
        .unwrap();

    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].candidate_id, best.transaction_id);
    assert!(candidates[0].score > candidates[1].score);
    assert!(h.store.matches_for_receipt(r.receipt_id).await.is_empty());

    let limited = h
        .service
        .get_candidates(h.user_id, r.receipt_id, Some(1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}
