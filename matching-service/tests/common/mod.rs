//! Common test utilities for matching-service integration tests.

#![allow(dead_code)]

use chrono::{Duration, NaiveDate, Utc};
use matching_service::config::MatchingTuning;
use matching_service::models::{
    MatchStatus, Receipt, Transaction, TransactionGroup, VendorAlias,
};
use matching_service::services::{MatchStore, MatchingService, MemoryStore};
use rust_decimal::Decimal;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,matching_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn amount(s: &str) -> Decimal {
    s.parse().expect("valid decimal literal")
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn receipt(user_id: Uuid, amount_str: &str, on: NaiveDate, vendor: &str) -> Receipt {
    Receipt {
        receipt_id: Uuid::new_v4(),
        user_id,
        vendor: vendor.to_string(),
        amount: Some(amount(amount_str)),
        receipt_date: Some(on),
        status: MatchStatus::Unmatched.as_str().to_string(),
        matched_transaction_id: None,
        matched_group_id: None,
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}

pub fn receipt_without_extraction(user_id: Uuid, vendor: &str) -> Receipt {
    Receipt {
        receipt_id: Uuid::new_v4(),
        user_id,
        vendor: vendor.to_string(),
        amount: None,
        receipt_date: None,
        status: MatchStatus::Unmatched.as_str().to_string(),
        matched_transaction_id: None,
        matched_group_id: None,
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}

pub fn transaction(user_id: Uuid, amount_str: &str, on: NaiveDate, description: &str) -> Transaction {
    Transaction {
        transaction_id: Uuid::new_v4(),
        user_id,
        transaction_date: on,
        description: description.to_string(),
        amount: amount(amount_str),
        group_id: None,
        status: MatchStatus::Unmatched.as_str().to_string(),
        matched_receipt_id: None,
        created_utc: Utc::now(),
    }
}

pub fn grouped_transaction(
    user_id: Uuid,
    amount_str: &str,
    on: NaiveDate,
    description: &str,
    group_id: Uuid,
) -> Transaction {
    Transaction {
        group_id: Some(group_id),
        ..transaction(user_id, amount_str, on, description)
    }
}

pub fn group(user_id: Uuid, name: &str, amount_str: &str, on: NaiveDate) -> TransactionGroup {
    TransactionGroup {
        group_id: Uuid::new_v4(),
        user_id,
        name: name.to_string(),
        combined_amount: amount(amount_str),
        display_date: on,
        status: MatchStatus::Unmatched.as_str().to_string(),
        matched_receipt_id: None,
        created_utc: Utc::now(),
    }
}

pub fn alias(user_id: Uuid, pattern: &str, canonical: &str) -> VendorAlias {
    VendorAlias {
        alias_id: Uuid::new_v4(),
        user_id,
        pattern: pattern.to_string(),
        canonical_name: canonical.to_string(),
        gl_code: None,
        department: None,
        match_count: 1,
        confidence: 1.0,
        last_matched_utc: Utc::now(),
        created_utc: Utc::now(),
    }
}

pub fn stale_alias(
    user_id: Uuid,
    pattern: &str,
    canonical: &str,
    days_ago: i64,
    confidence: f64,
) -> VendorAlias {
    VendorAlias {
        confidence,
        last_matched_utc: Utc::now() - Duration::days(days_ago),
        ..alias(user_id, pattern, canonical)
    }
}

/// In-memory store, service, and a fresh user to scope the test's data.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub service: Arc<MatchingService>,
    pub user_id: Uuid,
}

pub fn harness() -> TestHarness {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(MatchingService::new(
        store.clone() as Arc<dyn MatchStore>,
        MatchingTuning::default(),
    ));
    TestHarness {
        store,
        service,
        user_id: Uuid::new_v4(),
    }
}
