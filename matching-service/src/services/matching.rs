//! Matching workflow orchestration.
//!
//! Owns the match state machine: batch auto-matching, candidate listing for
//! manual review, confirm/reject/manual-match, unmatch, and the deletion
//! cascades. All persistence goes through the `MatchStore` seam; scoring is
//! pure and happens here against a per-run alias snapshot.

use crate::config::MatchingTuning;
use crate::models::{
    AutoMatchSummary, CandidateKind, CodingOverrides, MatchCandidate, MatchStats, MatchTarget,
    NewMatch, Receipt, ReceiptMatch,
};
use crate::services::metrics::{record_match_operation, record_match_proposal};
use crate::services::scoring::{self, ScoreBreakdown, AMBIGUITY_MARGIN, MIN_PROPOSAL_SCORE};
use crate::services::store::MatchStore;
use crate::services::vendor_alias::{self, AliasSnapshot};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One row of the ranked candidate list returned for manual review.
#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub candidate_type: CandidateKind,
    pub candidate_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub score: i32,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub reason: String,
}

/// Result of undoing a confirmed match.
#[derive(Debug, Clone, Serialize)]
pub struct UnmatchOutcome {
    #[serde(rename = "match")]
    pub match_record: ReceiptMatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

enum Proposal {
    Created(ReceiptMatch, CandidateKind),
    Ambiguous,
    NoCandidate,
}

pub struct MatchingService {
    store: Arc<dyn MatchStore>,
    tuning: MatchingTuning,
}

impl MatchingService {
    pub fn new(store: Arc<dyn MatchStore>, tuning: MatchingTuning) -> Self {
        Self { store, tuning }
    }

    pub fn store(&self) -> &Arc<dyn MatchStore> {
        &self.store
    }

    // =========================================================================
    // Auto-match
    // =========================================================================

    /// Score every unmatched receipt against the unmatched candidate pool
    /// and persist a `Proposed` match for each unambiguous winner at or
    /// above the threshold. Per-receipt failures are counted and skipped,
    /// never aborting the batch.
    #[instrument(skip(self, receipt_ids), fields(user_id = %user_id))]
    pub async fn run_auto_match(
        &self,
        user_id: Uuid,
        receipt_ids: Option<Vec<Uuid>>,
    ) -> Result<AutoMatchSummary, AppError> {
        let receipts = self
            .store
            .unmatched_receipts(user_id, receipt_ids.as_deref())
            .await?;

        let mut summary = AutoMatchSummary::default();
        let mut scorable: Vec<Receipt> = Vec::with_capacity(receipts.len());
        for receipt in receipts {
            if receipt.has_extraction() {
                scorable.push(receipt);
            } else {
                // Extraction problems are handled out-of-band; surface the
                // count so they do not vanish silently.
                summary.skipped += 1;
            }
        }

        let Some(window) = self.batch_window(&scorable) else {
            info!(skipped = summary.skipped, "No scorable receipts in batch");
            return Ok(summary);
        };

        // Transactions and groups are independent reads; fetch them
        // concurrently, then snapshot aliases once for the whole run.
        let (transactions, groups) = tokio::try_join!(
            self.store.unmatched_transactions(user_id, window.0, window.1),
            self.store.unmatched_groups(user_id, window.0, window.1),
        )?;
        let aliases = AliasSnapshot::new(self.store.vendor_aliases(user_id).await?);

        let pool: Vec<MatchCandidate> = transactions
            .into_iter()
            .map(MatchCandidate::Transaction)
            .chain(groups.into_iter().map(MatchCandidate::Group))
            .collect();

        info!(
            receipts = scorable.len(),
            candidates = pool.len(),
            aliases = aliases.len(),
            "Auto-match batch started"
        );

        // Candidates proposed earlier in this run are off the table for
        // later receipts; racing runs are resolved at confirm time instead.
        let mut taken: HashSet<Uuid> = HashSet::new();

        for receipt in &scorable {
            summary.processed += 1;
            match self.propose_for_receipt(receipt, &pool, &taken, &aliases).await {
                Ok(Proposal::Created(record, kind)) => {
                    summary.proposed += 1;
                    if kind == CandidateKind::Group {
                        summary.group_matches += 1;
                    }
                    taken.insert(match record.target() {
                        MatchTarget::Transaction(id) => id,
                        MatchTarget::Group(id) => id,
                    });
                    record_match_proposal(kind.as_str());
                }
                Ok(Proposal::Ambiguous) => summary.ambiguous += 1,
                Ok(Proposal::NoCandidate) => {}
                Err(e) => {
                    warn!(
                        receipt_id = %receipt.receipt_id,
                        error = %e,
                        "Skipping receipt after proposal failure"
                    );
                    summary.skipped += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            proposed = summary.proposed,
            ambiguous = summary.ambiguous,
            skipped = summary.skipped,
            group_matches = summary.group_matches,
            "Auto-match batch finished"
        );
        record_match_operation("auto_match", "ok");
        Ok(summary)
    }

    /// Outer candidate window covering every scorable receipt in the batch.
    fn batch_window(&self, receipts: &[Receipt]) -> Option<(NaiveDate, NaiveDate)> {
        let dates: Vec<NaiveDate> = receipts.iter().filter_map(|r| r.receipt_date).collect();
        let earliest = dates.iter().min()?;
        let latest = dates.iter().max()?;
        let pad = Duration::days(self.tuning.candidate_window_days);
        Some((*earliest - pad, *latest + pad))
    }

    async fn propose_for_receipt(
        &self,
        receipt: &Receipt,
        pool: &[MatchCandidate],
        taken: &HashSet<Uuid>,
        aliases: &AliasSnapshot,
    ) -> Result<Proposal, AppError> {
        let ranked = self.rank_candidates(receipt, pool, taken, aliases);

        let Some((best, breakdown)) = ranked.first() else {
            return Ok(Proposal::NoCandidate);
        };
        if breakdown.total < MIN_PROPOSAL_SCORE {
            return Ok(Proposal::NoCandidate);
        }
        if let Some((_, runner_up)) = ranked.get(1) {
            if breakdown.total - runner_up.total <= AMBIGUITY_MARGIN {
                info!(
                    receipt_id = %receipt.receipt_id,
                    best = breakdown.total,
                    runner_up = runner_up.total,
                    "Ambiguous candidates; leaving receipt for manual review"
                );
                return Ok(Proposal::Ambiguous);
            }
        }

        let record = self
            .store
            .insert_proposed_match(&NewMatch {
                user_id: receipt.user_id,
                receipt_id: receipt.receipt_id,
                target: best.target(),
                confidence: breakdown.total,
                amount_score: breakdown.amount_score,
                date_score: breakdown.date_score,
                vendor_score: breakdown.vendor_score,
                match_reason: breakdown.reason.clone(),
                vendor_alias_id: breakdown.vendor_alias_id,
                is_manual: false,
                confirmed_by: None,
            })
            .await?;
        Ok(Proposal::Created(record, best.kind()))
    }

    /// Score the eligible slice of the pool for one receipt, best first.
    fn rank_candidates<'a>(
        &self,
        receipt: &Receipt,
        pool: &'a [MatchCandidate],
        taken: &HashSet<Uuid>,
        aliases: &AliasSnapshot,
    ) -> Vec<(&'a MatchCandidate, ScoreBreakdown)> {
        let Some(receipt_date) = receipt.receipt_date else {
            return Vec::new();
        };
        let pad = Duration::days(self.tuning.candidate_window_days);

        let mut ranked: Vec<(&MatchCandidate, ScoreBreakdown)> = pool
            .iter()
            .filter(|c| !taken.contains(&c.id()))
            .filter(|c| {
                c.date() >= receipt_date - pad && c.date() <= receipt_date + pad
            })
            .filter_map(|c| scoring::score(receipt, c, aliases).map(|b| (c, b)))
            .collect();
        ranked.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.id().cmp(&b.0.id())));
        ranked
    }

    // =========================================================================
    // Manual review
    // =========================================================================

    /// Ranked list of would-be matches for one receipt. Creates nothing.
    #[instrument(skip(self), fields(user_id = %user_id, receipt_id = %receipt_id))]
    pub async fn get_candidates(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<RankedCandidate>, AppError> {
        let receipt = self
            .store
            .get_receipt(user_id, receipt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Receipt not found")))?;
        let Some(receipt_date) = receipt.receipt_date else {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "receipt has no extracted date to match on"
            )));
        };

        let pad = Duration::days(self.tuning.candidate_window_days);
        let (from, to) = (receipt_date - pad, receipt_date + pad);
        let (transactions, groups) = tokio::try_join!(
            self.store.unmatched_transactions(user_id, from, to),
            self.store.unmatched_groups(user_id, from, to),
        )?;
        let aliases = AliasSnapshot::new(self.store.vendor_aliases(user_id).await?);

        let pool: Vec<MatchCandidate> = transactions
            .into_iter()
            .map(MatchCandidate::Transaction)
            .chain(groups.into_iter().map(MatchCandidate::Group))
            .collect();

        let limit = limit.unwrap_or(self.tuning.max_candidates);
        let ranked = self
            .rank_candidates(&receipt, &pool, &HashSet::new(), &aliases)
            .into_iter()
            .take(limit)
            .map(|(candidate, breakdown)| RankedCandidate {
                candidate_type: candidate.kind(),
                candidate_id: candidate.id(),
                description: candidate.vendor_key(),
                amount: candidate.amount(),
                date: candidate.date(),
                score: breakdown.total,
                amount_score: breakdown.amount_score,
                date_score: breakdown.date_score,
                vendor_score: breakdown.vendor_score,
                reason: breakdown.reason,
            })
            .collect();
        Ok(ranked)
    }

    // =========================================================================
    // Review actions
    // =========================================================================

    /// Confirm a proposed match and learn the vendor pattern from it.
    #[instrument(skip(self, coding), fields(user_id = %user_id, match_id = %match_id))]
    pub async fn confirm_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        coding: &CodingOverrides,
    ) -> Result<ReceiptMatch, AppError> {
        let record = self
            .store
            .confirm_match(user_id, match_id, version, &user_id.to_string())
            .await
            .inspect_err(|_| record_match_operation("confirm", "error"))?;

        self.learn_from(user_id, record.target(), coding).await;
        record_match_operation("confirm", "ok");
        Ok(record)
    }

    /// Reject a proposed match; both sides return to the pool.
    #[instrument(skip(self), fields(user_id = %user_id, match_id = %match_id))]
    pub async fn reject_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
    ) -> Result<ReceiptMatch, AppError> {
        let record = self
            .store
            .reject_match(user_id, match_id, version, &user_id.to_string())
            .await
            .inspect_err(|_| record_match_operation("reject", "error"))?;
        record_match_operation("reject", "ok");
        Ok(record)
    }

    /// Create a confirmed match directly from explicit user input.
    #[instrument(skip(self, coding), fields(user_id = %user_id, receipt_id = %receipt_id))]
    pub async fn create_manual_match(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
        transaction_id: Option<Uuid>,
        group_id: Option<Uuid>,
        coding: &CodingOverrides,
    ) -> Result<ReceiptMatch, AppError> {
        let target = match (transaction_id, group_id) {
            (Some(id), None) => MatchTarget::Transaction(id),
            (None, Some(id)) => MatchTarget::Group(id),
            _ => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "exactly one of transaction_id or group_id must be provided"
                )))
            }
        };

        let receipt = self
            .store
            .get_receipt(user_id, receipt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Receipt not found")))?;

        // Score the pair anyway so the audit trail explains the pairing
        // even though the user overrode the engine.
        let breakdown = self
            .score_target(&receipt, target)
            .await?
            .unwrap_or_else(|| ScoreBreakdown {
                total: 0,
                amount_score: 0,
                date_score: 0,
                vendor_score: 0,
                reason: "manual match".to_string(),
                vendor_alias_id: None,
            });

        let record = self
            .store
            .insert_manual_match(&NewMatch {
                user_id,
                receipt_id,
                target,
                confidence: breakdown.total,
                amount_score: breakdown.amount_score,
                date_score: breakdown.date_score,
                vendor_score: breakdown.vendor_score,
                match_reason: format!("manual match; {}", breakdown.reason),
                vendor_alias_id: breakdown.vendor_alias_id,
                is_manual: true,
                confirmed_by: Some(user_id.to_string()),
            })
            .await
            .inspect_err(|_| record_match_operation("manual_match", "error"))?;

        self.learn_from(user_id, target, coding).await;
        record_match_operation("manual_match", "ok");
        Ok(record)
    }

    /// Undo a confirmed match. The record stays queryable in its terminal
    /// state; a warning is attached when a group's total has since drifted
    /// away from the receipt amount.
    #[instrument(skip(self), fields(user_id = %user_id, match_id = %match_id))]
    pub async fn unmatch(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
    ) -> Result<UnmatchOutcome, AppError> {
        let record = self
            .store
            .unmatch(user_id, match_id, version)
            .await
            .inspect_err(|_| record_match_operation("unmatch", "error"))?;

        let warning = self.group_drift_warning(user_id, &record).await;
        record_match_operation("unmatch", "ok");
        Ok(UnmatchOutcome {
            match_record: record,
            warning,
        })
    }

    async fn group_drift_warning(&self, user_id: Uuid, record: &ReceiptMatch) -> Option<String> {
        let group_id = record.group_id?;
        let group = self.store.get_group(user_id, group_id).await.ok()??;
        let receipt = self
            .store
            .get_receipt(user_id, record.receipt_id)
            .await
            .ok()??;
        let receipt_amount = receipt.amount?;

        let drift = (group.combined_amount.abs() - receipt_amount.abs()).abs();
        if drift > Decimal::new(10, 2) {
            Some(format!(
                "group total {} has drifted ${} from the original receipt amount {}",
                group.combined_amount, drift, receipt_amount
            ))
        } else {
            None
        }
    }

    // =========================================================================
    // Deletion cascades
    // =========================================================================

    /// Cascade a group deletion: matched receipt returns to unmatched and
    /// the members become individually eligible.
    #[instrument(skip(self), fields(user_id = %user_id, group_id = %group_id))]
    pub async fn handle_group_deleted(&self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError> {
        self.store.delete_group(user_id, group_id).await
    }

    /// Remove a receipt without stranding any candidate it was linked to.
    #[instrument(skip(self), fields(user_id = %user_id, receipt_id = %receipt_id))]
    pub async fn handle_receipt_deleted(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
    ) -> Result<(), AppError> {
        self.store.delete_receipt(user_id, receipt_id).await
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub async fn stats(&self, user_id: Uuid) -> Result<MatchStats, AppError> {
        self.store.match_stats(user_id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn score_target(
        &self,
        receipt: &Receipt,
        target: MatchTarget,
    ) -> Result<Option<ScoreBreakdown>, AppError> {
        let candidate = match target {
            MatchTarget::Transaction(id) => self
                .store
                .get_transaction(receipt.user_id, id)
                .await?
                .map(MatchCandidate::Transaction),
            MatchTarget::Group(id) => self
                .store
                .get_group(receipt.user_id, id)
                .await?
                .map(MatchCandidate::Group),
        };
        let Some(candidate) = candidate else {
            return Err(AppError::NotFound(anyhow::anyhow!("Candidate not found")));
        };

        let aliases = AliasSnapshot::new(self.store.vendor_aliases(receipt.user_id).await?);
        Ok(scoring::score(receipt, &candidate, &aliases))
    }

    /// Learn the vendor pattern of a confirmed pairing. Failures are logged
    /// and swallowed: the confirmation itself already committed.
    async fn learn_from(&self, user_id: Uuid, target: MatchTarget, coding: &CodingOverrides) {
        let description = match target {
            MatchTarget::Transaction(id) => self
                .store
                .get_transaction(user_id, id)
                .await
                .ok()
                .flatten()
                .map(|t| t.description),
            MatchTarget::Group(id) => self
                .store
                .get_group(user_id, id)
                .await
                .ok()
                .flatten()
                .map(|g| g.vendor_key()),
        };
        let Some(description) = description else {
            warn!("Confirmed candidate vanished before alias learning");
            return;
        };

        let pattern = vendor_alias::extract_vendor_pattern(&description);
        if pattern.is_empty() {
            return;
        }
        let canonical = vendor_alias::default_canonical_name(&description);

        match self
            .store
            .record_alias_use(user_id, &pattern, &canonical, coding)
            .await
        {
            Ok(alias) => info!(
                pattern = %alias.pattern,
                match_count = alias.match_count,
                "Vendor alias learned"
            ),
            Err(e) => warn!(error = %e, pattern = %pattern, "Vendor alias learning failed"),
        }
    }
}
