//! Domain models for matching-service.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Status Enums
// ============================================================================

/// Match status carried by receipts, transactions, and transaction groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Unmatched,
    Proposed,
    Matched,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Proposed => "proposed",
            Self::Matched => "matched",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "proposed" => Self::Proposed,
            "matched" => Self::Matched,
            _ => Self::Unmatched,
        }
    }
}

/// Lifecycle state of a match record.
///
/// `Proposed` transitions to `Confirmed` or `Rejected`; a confirmed match
/// that is later undone moves to `Unmatched`. All non-proposed states are
/// terminal and retained for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Proposed,
    Confirmed,
    Rejected,
    Unmatched,
}

impl MatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Unmatched => "unmatched",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "confirmed" => Self::Confirmed,
            "rejected" => Self::Rejected,
            "unmatched" => Self::Unmatched,
            _ => Self::Proposed,
        }
    }
}

// ============================================================================
// Receipt Models
// ============================================================================

/// A scanned receipt with extracted fields. Extraction itself happens
/// upstream; amount and date may be absent when extraction failed.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub user_id: Uuid,
    pub vendor: String,
    pub amount: Option<Decimal>,
    pub receipt_date: Option<NaiveDate>,
    pub status: String,
    pub matched_transaction_id: Option<Uuid>,
    pub matched_group_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Receipt {
    pub fn status(&self) -> MatchStatus {
        MatchStatus::from_str(&self.status)
    }

    /// Amount and date must both be present for the receipt to be scorable.
    pub fn has_extraction(&self) -> bool {
        self.amount.is_some() && self.receipt_date.is_some()
    }
}

// ============================================================================
// Candidate Models
// ============================================================================

/// An imported financial transaction. A non-null `group_id` means the
/// transaction has been absorbed into a group and is not individually
/// matchable.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub group_id: Option<Uuid>,
    pub status: String,
    pub matched_receipt_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Transaction {
    pub fn status(&self) -> MatchStatus {
        MatchStatus::from_str(&self.status)
    }
}

/// A user-created aggregation of transactions, matched as a single unit.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TransactionGroup {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub combined_amount: Decimal,
    pub display_date: NaiveDate,
    pub status: String,
    pub matched_receipt_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl TransactionGroup {
    pub fn status(&self) -> MatchStatus {
        MatchStatus::from_str(&self.status)
    }

    /// Vendor text for scoring: the group name without its trailing
    /// "(N charges)" suffix.
    pub fn vendor_key(&self) -> String {
        static CHARGES_SUFFIX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i)\s*\(\d+\s+charges?\)\s*$").unwrap());
        CHARGES_SUFFIX.replace(&self.name, "").trim().to_string()
    }
}

/// Which side of the candidate union a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Transaction,
    Group,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Group => "group",
        }
    }
}

/// Reference to exactly one matchable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    Transaction(Uuid),
    Group(Uuid),
}

impl MatchTarget {
    pub fn kind(&self) -> CandidateKind {
        match self {
            Self::Transaction(_) => CandidateKind::Transaction,
            Self::Group(_) => CandidateKind::Group,
        }
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            Self::Transaction(id) => Some(*id),
            Self::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<Uuid> {
        match self {
            Self::Transaction(_) => None,
            Self::Group(id) => Some(*id),
        }
    }
}

/// A transaction or group, presented to the scoring engine through one
/// capability surface regardless of concrete type.
#[derive(Debug, Clone)]
pub enum MatchCandidate {
    Transaction(Transaction),
    Group(TransactionGroup),
}

impl MatchCandidate {
    pub fn kind(&self) -> CandidateKind {
        match self {
            Self::Transaction(_) => CandidateKind::Transaction,
            Self::Group(_) => CandidateKind::Group,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Transaction(t) => t.transaction_id,
            Self::Group(g) => g.group_id,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Self::Transaction(t) => t.amount,
            Self::Group(g) => g.combined_amount,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Transaction(t) => t.transaction_date,
            Self::Group(g) => g.display_date,
        }
    }

    pub fn vendor_key(&self) -> String {
        match self {
            Self::Transaction(t) => t.description.clone(),
            Self::Group(g) => g.vendor_key(),
        }
    }

    pub fn target(&self) -> MatchTarget {
        match self {
            Self::Transaction(t) => MatchTarget::Transaction(t.transaction_id),
            Self::Group(g) => MatchTarget::Group(g.group_id),
        }
    }

    pub fn status(&self) -> MatchStatus {
        match self {
            Self::Transaction(t) => t.status(),
            Self::Group(g) => g.status(),
        }
    }
}

// ============================================================================
// Match Models
// ============================================================================

/// The central match record linking one receipt to exactly one candidate.
/// Exactly one of `transaction_id` / `group_id` is set.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReceiptMatch {
    pub match_id: Uuid,
    pub user_id: Uuid,
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub state: String,
    pub confidence: i32,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub match_reason: String,
    pub vendor_alias_id: Option<Uuid>,
    pub is_manual: bool,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub confirmed_utc: Option<DateTime<Utc>>,
    pub confirmed_by: Option<String>,
}

impl ReceiptMatch {
    pub fn state(&self) -> MatchState {
        MatchState::from_str(&self.state)
    }

    pub fn target(&self) -> MatchTarget {
        match (self.transaction_id, self.group_id) {
            (Some(id), None) => MatchTarget::Transaction(id),
            (None, Some(id)) => MatchTarget::Group(id),
            // The XOR constraint on the store makes this unreachable.
            _ => unreachable!("match references exactly one candidate"),
        }
    }
}

/// Insert payload for a new match record.
#[derive(Debug, Clone)]
pub struct NewMatch {
    pub user_id: Uuid,
    pub receipt_id: Uuid,
    pub target: MatchTarget,
    pub confidence: i32,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub match_reason: String,
    pub vendor_alias_id: Option<Uuid>,
    pub is_manual: bool,
    pub confirmed_by: Option<String>,
}

// ============================================================================
// Vendor Alias Models
// ============================================================================

/// A learned mapping from a normalized vendor pattern to a canonical vendor
/// identity and default coding. Confidence decays when the alias goes
/// unused.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VendorAlias {
    pub alias_id: Uuid,
    pub user_id: Uuid,
    pub pattern: String,
    pub canonical_name: String,
    pub gl_code: Option<String>,
    pub department: Option<String>,
    pub match_count: i32,
    pub confidence: f64,
    pub last_matched_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

/// Optional coding fields supplied on confirm or manual match, folded into
/// the learned alias defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodingOverrides {
    pub gl_code: Option<String>,
    pub department: Option<String>,
}

impl CodingOverrides {
    pub fn is_empty(&self) -> bool {
        self.gl_code.is_none() && self.department.is_none()
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Counters returned by an auto-match batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutoMatchSummary {
    pub processed: u32,
    pub proposed: u32,
    pub ambiguous: u32,
    pub skipped: u32,
    pub group_matches: u32,
}

/// Matching statistics for one user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchStats {
    pub matched_count: i64,
    pub proposed_count: i64,
    pub unmatched_receipt_count: i64,
    pub unmatched_candidate_count: i64,
    pub auto_match_rate: f64,
    pub average_confidence: f64,
}
