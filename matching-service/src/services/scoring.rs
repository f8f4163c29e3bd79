//! Confidence scoring for receipt/candidate pairs.
//!
//! The score is a weighted sum of three components: amount (40), date (35)
//! and vendor (25). It is deterministic and does no I/O; vendor evidence
//! comes from the alias snapshot handed in by the caller.

use crate::models::{MatchCandidate, Receipt};
use crate::services::vendor_alias::{AliasMatchKind, AliasSnapshot};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Minimum total score for a candidate to be auto-proposed.
pub const MIN_PROPOSAL_SCORE: i32 = 70;

/// Top-two candidates closer than this margin suppress auto-proposal.
pub const AMBIGUITY_MARGIN: i32 = 5;

/// Minimum similarity for a fuzzy vendor or alias match.
pub const FUZZY_VENDOR_THRESHOLD: f64 = 0.70;

const AMOUNT_EXACT_POINTS: i32 = 40;
const AMOUNT_NEAR_POINTS: i32 = 20;
const DATE_SAME_DAY_POINTS: i32 = 35;
const DATE_ONE_DAY_POINTS: i32 = 30;
const DATE_THREE_DAY_POINTS: i32 = 25;
const DATE_WEEK_POINTS: i32 = 10;
const VENDOR_ALIAS_POINTS: i32 = 25;
const VENDOR_FUZZY_POINTS: i32 = 15;

/// Result of scoring one candidate against one receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub total: i32,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub reason: String,
    pub vendor_alias_id: Option<Uuid>,
}

/// Uppercase, strip punctuation, collapse whitespace.
pub fn normalize_vendor(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for upper in ch.to_uppercase() {
                out.push(upper);
            }
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Normalized similarity between two vendor strings in [0, 1].
///
/// Takes the better of normalized Levenshtein and Jaro-Winkler so that both
/// transpositions and shared prefixes are recognized.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_vendor(a);
    let b = normalize_vendor(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b).max(strsim::jaro_winkler(&a, &b))
}

/// Score a candidate against a receipt. Returns `None` when the receipt
/// lacks extracted amount or date.
pub fn score(
    receipt: &Receipt,
    candidate: &MatchCandidate,
    aliases: &AliasSnapshot,
) -> Option<ScoreBreakdown> {
    let amount = receipt.amount?;
    let date = receipt.receipt_date?;

    let (amount_score, amount_reason) = score_amount(amount, candidate.amount());
    let (date_score, date_reason) = score_date(date, candidate.date());
    let (vendor_score, vendor_reason, vendor_alias_id) =
        score_vendor(&receipt.vendor, &candidate.vendor_key(), aliases);

    Some(ScoreBreakdown {
        total: amount_score + date_score + vendor_score,
        amount_score,
        date_score,
        vendor_score,
        reason: format!("{}; {}; {}", amount_reason, date_reason, vendor_reason),
        vendor_alias_id,
    })
}

// Amounts are compared sign-agnostically so refunds and credit-card style
// negative postings still pair with their receipts.
fn score_amount(receipt_amount: Decimal, candidate_amount: Decimal) -> (i32, String) {
    let difference = (receipt_amount.abs() - candidate_amount.abs()).abs();

    if difference <= Decimal::new(10, 2) {
        (AMOUNT_EXACT_POINTS, "amount exact".to_string())
    } else if difference <= Decimal::new(100, 2) {
        (AMOUNT_NEAR_POINTS, format!("amount within $1.00 (off by ${})", difference))
    } else {
        (0, format!("amount differs by ${}", difference))
    }
}

fn score_date(receipt_date: NaiveDate, candidate_date: NaiveDate) -> (i32, String) {
    let days = (receipt_date - candidate_date).num_days().abs();

    match days {
        0 => (DATE_SAME_DAY_POINTS, "same day".to_string()),
        1 => (DATE_ONE_DAY_POINTS, "1 day apart".to_string()),
        2..=3 => (DATE_THREE_DAY_POINTS, format!("{} days apart", days)),
        4..=7 => (DATE_WEEK_POINTS, format!("{} days apart", days)),
        _ => (0, format!("{} days apart", days)),
    }
}

fn score_vendor(
    receipt_vendor: &str,
    candidate_vendor: &str,
    aliases: &AliasSnapshot,
) -> (i32, String, Option<Uuid>) {
    // An alias hit only counts when its identity also lines up with the
    // receipt side; the alias maps the candidate's description pattern.
    if let Some(hit) = aliases.lookup(candidate_vendor) {
        let connects = similarity(&hit.alias.canonical_name, receipt_vendor)
            >= FUZZY_VENDOR_THRESHOLD
            || similarity(&hit.alias.pattern, receipt_vendor) >= FUZZY_VENDOR_THRESHOLD;

        if connects {
            return match hit.kind {
                AliasMatchKind::Pattern => (
                    VENDOR_ALIAS_POINTS,
                    format!("vendor alias {}", hit.alias.pattern),
                    Some(hit.alias.alias_id),
                ),
                AliasMatchKind::Fuzzy => (
                    VENDOR_FUZZY_POINTS,
                    format!("vendor ~alias {} ({:.2})", hit.alias.pattern, hit.similarity),
                    Some(hit.alias.alias_id),
                ),
            };
        }
    }

    let direct = similarity(receipt_vendor, candidate_vendor);
    if direct >= FUZZY_VENDOR_THRESHOLD {
        (VENDOR_FUZZY_POINTS, format!("vendor similarity {:.2}", direct), None)
    } else {
        (0, "vendor differs".to_string(), None)
    }
}
