//! Vendor alias learning and scheduled confidence decay.

mod common;

use common::{date, harness, receipt, stale_alias, transaction};
use matching_service::config::DecayConfig;
use matching_service::models::CodingOverrides;
use matching_service::services::{AliasDecayJob, MatchStore};
use std::sync::Arc;

fn decay_job(h: &common::TestHarness) -> AliasDecayJob {
    AliasDecayJob::new(
        h.store.clone() as Arc<dyn MatchStore>,
        DecayConfig::default(),
    )
}

#[tokio::test]
async fn learning_creates_then_reinforces_an_alias() {
    let h = harness();
    let coding = CodingOverrides::default();

    let created = h
        .store
        .record_alias_use(h.user_id, "TWILIO", "Twilio", &coding)
        .await
        .unwrap();
    assert_eq!(created.match_count, 1);
    assert_eq!(created.confidence, 1.0);

    let reinforced = h
        .store
        .record_alias_use(h.user_id, "TWILIO", "Twilio", &coding)
        .await
        .unwrap();
    assert_eq!(reinforced.alias_id, created.alias_id);
    assert_eq!(reinforced.match_count, 2);
}

#[tokio::test]
async fn coding_overrides_update_alias_defaults_but_absent_ones_do_not_erase() {
    let h = harness();

    h.store
        .record_alias_use(
            h.user_id,
            "HERTZ",
            "Hertz",
            &CodingOverrides {
                gl_code: Some("6400".to_string()),
                department: Some("Sales".to_string()),
            },
        )
        .await
        .unwrap();

    // A later confirm without overrides keeps the learned coding.
    let kept = h
        .store
        .record_alias_use(h.user_id, "HERTZ", "Hertz", &CodingOverrides::default())
        .await
        .unwrap();
    assert_eq!(kept.gl_code.as_deref(), Some("6400"));
    assert_eq!(kept.department.as_deref(), Some("Sales"));

    // A new override replaces just the supplied field.
    let updated = h
        .store
        .record_alias_use(
            h.user_id,
            "HERTZ",
            "Hertz",
            &CodingOverrides {
                gl_code: Some("6450".to_string()),
                department: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.gl_code.as_deref(), Some("6450"));
    assert_eq!(updated.department.as_deref(), Some("Sales"));
}

#[tokio::test]
async fn stale_aliases_decay_monotonically() {
    let h = harness();
    let stale = stale_alias(h.user_id, "DELTA AIR", "Delta Airlines", 200, 1.0);
    h.store.insert_alias(stale.clone()).await;
    let job = decay_job(&h);

    let first = job.run_once().await.unwrap();
    assert_eq!(first.examined, 1);
    assert_eq!(first.decayed, 1);
    assert_eq!(first.failed, 0);
    let after_first = h.store.get_alias(stale.alias_id).await.unwrap();
    assert!((after_first.confidence - 0.9).abs() < 1e-9);

    // Idempotent re-run keeps decaying monotonically.
    let second = job.run_once().await.unwrap();
    assert_eq!(second.decayed, 1);
    let after_second = h.store.get_alias(stale.alias_id).await.unwrap();
    assert!((after_second.confidence - 0.81).abs() < 1e-9);
    assert!(after_second.confidence < after_first.confidence);
}

#[tokio::test]
async fn fresh_aliases_are_left_alone() {
    let h = harness();
    let fresh = common::alias(h.user_id, "TWILIO", "Twilio");
    h.store.insert_alias(fresh.clone()).await;

    let summary = decay_job(&h).run_once().await.unwrap();
    assert_eq!(summary.examined, 0);
    assert_eq!(h.store.get_alias(fresh.alias_id).await.unwrap().confidence, 1.0);
}

#[tokio::test]
async fn decay_stops_at_the_confidence_floor() {
    let h = harness();
    let at_floor = stale_alias(h.user_id, "UBER", "Uber", 400, 0.5);
    let just_above = stale_alias(h.user_id, "LYFT", "Lyft", 400, 0.51);
    h.store.insert_alias(at_floor.clone()).await;
    h.store.insert_alias(just_above.clone()).await;
    let job = decay_job(&h);

    let first = job.run_once().await.unwrap();
    assert_eq!(first.examined, 1);
    assert_eq!(h.store.get_alias(at_floor.alias_id).await.unwrap().confidence, 0.5);

    // 0.51 * 0.9 = 0.459 drops below the floor; the next pass skips it.
    let second = job.run_once().await.unwrap();
    assert_eq!(second.examined, 0);
    let settled = h.store.get_alias(just_above.alias_id).await.unwrap();
    assert!((settled.confidence - 0.459).abs() < 1e-9);
}

#[tokio::test]
async fn a_new_confirmed_match_resets_the_staleness_clock() {
    let h = harness();
    let stale = stale_alias(h.user_id, "DELTA AIR", "Delta Airlines", 300, 0.8);
    h.store.insert_alias(stale.clone()).await;

    // The confirm flow refreshes the alias through learning.
    let r = receipt(h.user_id, "425.00", date(2025, 1, 10), "Delta Airlines");
    let t = transaction(h.user_id, "425.00", date(2025, 1, 10), "DELTA AIR 0062334156983");
    h.store.insert_receipt(r.clone()).await;
    h.store.insert_transaction(t).await;
    h.service.run_auto_match(h.user_id, None).await.unwrap();
    let proposed = h.store.matches_for_receipt(r.receipt_id).await.remove(0);
    h.service
        .confirm_match(h.user_id, proposed.match_id, proposed.version, &CodingOverrides::default())
        .await
        .unwrap();

    let refreshed = h.store.get_alias(stale.alias_id).await.unwrap();
    assert_eq!(refreshed.match_count, 2);
    assert_eq!(refreshed.confidence, 1.0);

    let summary = decay_job(&h).run_once().await.unwrap();
    assert_eq!(summary.examined, 0);
    assert_eq!(h.store.get_alias(stale.alias_id).await.unwrap().confidence, 1.0);
}
