//! Storage seam for the matching engine.
//!
//! `MatchStore` is the candidate repository: read access to unmatched
//! receipts, transactions and groups, and the mutating operations of the
//! match state machine. Implementations must make every mutating call an
//! atomic unit and must enforce the structural invariants themselves —
//! match-target XOR and at-most-one-confirmed-per-side hold at this
//! boundary, not in the callers, so they survive concurrent access.
//!
//! State-changing match operations are compare-and-swap on the record's
//! version stamp: a mismatch yields `AppError::Conflict` and leaves the
//! store untouched.

use crate::models::{
    CodingOverrides, MatchStats, NewMatch, Receipt, ReceiptMatch, Transaction, TransactionGroup,
    VendorAlias,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait MatchStore: Send + Sync {
    // =========================================================================
    // Receipts
    // =========================================================================

    async fn get_receipt(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
    ) -> Result<Option<Receipt>, AppError>;

    /// All unmatched receipts for a user, optionally restricted to a set of
    /// ids. Includes receipts without extracted amount/date; callers decide
    /// how to handle those.
    async fn unmatched_receipts(
        &self,
        user_id: Uuid,
        receipt_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Receipt>, AppError>;

    /// Delete a receipt. Any candidate linked through a live match is
    /// returned to `Unmatched`; the receipt's match records go with it.
    async fn delete_receipt(&self, user_id: Uuid, receipt_id: Uuid) -> Result<(), AppError>;

    // =========================================================================
    // Candidates
    // =========================================================================

    async fn get_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError>;

    async fn get_group(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<TransactionGroup>, AppError>;

    /// Unmatched, ungrouped transactions dated within `[from, to]`.
    async fn unmatched_transactions(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError>;

    /// Unmatched groups whose display date falls within `[from, to]`.
    async fn unmatched_groups(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TransactionGroup>, AppError>;

    /// Delete a group: a matched receipt cascades back to `Unmatched`, the
    /// member transactions become individually eligible again, and any
    /// confirmed match moves to the `unmatched` audit state.
    async fn delete_group(&self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError>;

    // =========================================================================
    // Matches
    // =========================================================================

    async fn get_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
    ) -> Result<Option<ReceiptMatch>, AppError>;

    /// Create a `Proposed` match and flip the receipt and candidate to
    /// `Proposed`, as one atomic unit. The receipt must currently be
    /// unmatched; the candidate must not be matched (a concurrent batch may
    /// already have proposed it) and a transaction candidate must not belong
    /// to a group.
    async fn insert_proposed_match(&self, new_match: &NewMatch) -> Result<ReceiptMatch, AppError>;

    /// Create a match directly in `Confirmed` state (manual match). Both
    /// sides must currently be unmatched; cross-links are written and the
    /// one-confirmed invariant is enforced.
    async fn insert_manual_match(&self, new_match: &NewMatch) -> Result<ReceiptMatch, AppError>;

    /// Confirm a proposed match. Compare-and-swap on `version`; sets both
    /// sides to `Matched` and writes the mutual references.
    async fn confirm_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        confirmed_by: &str,
    ) -> Result<ReceiptMatch, AppError>;

    /// Reject a proposed match. Compare-and-swap on `version`; both sides
    /// return to `Unmatched`. The record is retained.
    async fn reject_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        rejected_by: &str,
    ) -> Result<ReceiptMatch, AppError>;

    /// Undo a confirmed match: the record moves to the terminal `unmatched`
    /// state (kept for audit) and both sides return to `Unmatched`.
    async fn unmatch(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
    ) -> Result<ReceiptMatch, AppError>;

    // =========================================================================
    // Vendor aliases
    // =========================================================================

    async fn vendor_aliases(&self, user_id: Uuid) -> Result<Vec<VendorAlias>, AppError>;

    /// Record a confirmed use of a vendor pattern: bump the match count,
    /// refresh the staleness clock, restore confidence, and fold in any
    /// coding overrides. Creates the alias when it does not exist yet.
    async fn record_alias_use(
        &self,
        user_id: Uuid,
        pattern: &str,
        canonical_name: &str,
        coding: &CodingOverrides,
    ) -> Result<VendorAlias, AppError>;

    /// Aliases last matched before the cutoff with confidence above the
    /// floor, across all users.
    async fn stale_aliases(
        &self,
        last_matched_before: DateTime<Utc>,
        min_confidence: f64,
    ) -> Result<Vec<VendorAlias>, AppError>;

    /// Multiply one alias's confidence by `factor`.
    async fn decay_alias(&self, alias_id: Uuid, factor: f64) -> Result<(), AppError>;

    // =========================================================================
    // Stats
    // =========================================================================

    async fn match_stats(&self, user_id: Uuid) -> Result<MatchStats, AppError>;
}
