//! In-memory `MatchStore` implementation.
//!
//! Mirrors the semantics of the PostgreSQL store behind a single mutex so
//! every operation is atomic; the integration test suite drives the full
//! matching workflow against it, including the concurrency rules.

use crate::models::{
    CodingOverrides, MatchState, MatchStats, MatchStatus, MatchTarget, NewMatch, Receipt,
    ReceiptMatch, Transaction, TransactionGroup, VendorAlias,
};
use crate::services::store::MatchStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryInner {
    receipts: HashMap<Uuid, Receipt>,
    transactions: HashMap<Uuid, Transaction>,
    groups: HashMap<Uuid, TransactionGroup>,
    matches: HashMap<Uuid, ReceiptMatch>,
    aliases: HashMap<Uuid, VendorAlias>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for tests and local development.

    pub async fn insert_receipt(&self, receipt: Receipt) {
        self.inner
            .lock()
            .await
            .receipts
            .insert(receipt.receipt_id, receipt);
    }

    pub async fn insert_transaction(&self, transaction: Transaction) {
        self.inner
            .lock()
            .await
            .transactions
            .insert(transaction.transaction_id, transaction);
    }

    pub async fn insert_group(&self, group: TransactionGroup) {
        self.inner.lock().await.groups.insert(group.group_id, group);
    }

    pub async fn insert_alias(&self, alias: VendorAlias) {
        self.inner.lock().await.aliases.insert(alias.alias_id, alias);
    }

    /// Overwrite a group's combined amount, as member edits would.
    pub async fn set_group_amount(&self, group_id: Uuid, combined_amount: Decimal) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&group_id) {
            group.combined_amount = combined_amount;
        }
    }

    pub async fn get_alias(&self, alias_id: Uuid) -> Option<VendorAlias> {
        self.inner.lock().await.aliases.get(&alias_id).cloned()
    }

    pub async fn matches_for_receipt(&self, receipt_id: Uuid) -> Vec<ReceiptMatch> {
        self.inner
            .lock()
            .await
            .matches
            .values()
            .filter(|m| m.receipt_id == receipt_id)
            .cloned()
            .collect()
    }
}

fn not_found(what: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} not found", what))
}

fn same_target(m: &ReceiptMatch, target: MatchTarget) -> bool {
    match target {
        MatchTarget::Transaction(id) => m.transaction_id == Some(id),
        MatchTarget::Group(id) => m.group_id == Some(id),
    }
}

impl MemoryInner {
    /// Guard for the one-confirmed invariant: no other confirmed match may
    /// share this receipt or this candidate.
    fn check_no_confirmed(
        &self,
        except: Option<Uuid>,
        receipt_id: Uuid,
        target: MatchTarget,
    ) -> Result<(), AppError> {
        for m in self.matches.values() {
            if Some(m.match_id) == except || m.state() != MatchState::Confirmed {
                continue;
            }
            if m.receipt_id == receipt_id {
                return Err(AppError::DataIntegrity(anyhow::anyhow!(
                    "receipt already has a confirmed match"
                )));
            }
            if same_target(m, target) {
                return Err(AppError::DataIntegrity(anyhow::anyhow!(
                    "candidate already has a confirmed match"
                )));
            }
        }
        Ok(())
    }

    fn set_candidate_status(
        &mut self,
        target: MatchTarget,
        status: MatchStatus,
        matched_receipt: Option<Uuid>,
    ) {
        match target {
            MatchTarget::Transaction(id) => {
                if let Some(t) = self.transactions.get_mut(&id) {
                    t.status = status.as_str().to_string();
                    t.matched_receipt_id = matched_receipt;
                }
            }
            MatchTarget::Group(id) => {
                if let Some(g) = self.groups.get_mut(&id) {
                    g.status = status.as_str().to_string();
                    g.matched_receipt_id = matched_receipt;
                }
            }
        }
    }

    fn set_receipt_status(
        &mut self,
        receipt_id: Uuid,
        status: MatchStatus,
        target: Option<MatchTarget>,
    ) {
        if let Some(r) = self.receipts.get_mut(&receipt_id) {
            r.status = status.as_str().to_string();
            r.matched_transaction_id = target.and_then(|t| t.transaction_id());
            r.matched_group_id = target.and_then(|t| t.group_id());
            r.updated_utc = Utc::now();
        }
    }

    fn candidate_status(&self, target: MatchTarget) -> Result<MatchStatus, AppError> {
        match target {
            MatchTarget::Transaction(id) => {
                let t = self
                    .transactions
                    .get(&id)
                    .ok_or_else(|| not_found("Transaction"))?;
                if t.group_id.is_some() {
                    return Err(AppError::InvalidState(anyhow::anyhow!(
                        "transaction belongs to a group and cannot be matched individually"
                    )));
                }
                Ok(t.status())
            }
            MatchTarget::Group(id) => {
                let g = self.groups.get(&id).ok_or_else(|| not_found("Group"))?;
                Ok(g.status())
            }
        }
    }
}

fn build_match(new_match: &NewMatch, state: MatchState, now: DateTime<Utc>) -> ReceiptMatch {
    ReceiptMatch {
        match_id: Uuid::new_v4(),
        user_id: new_match.user_id,
        receipt_id: new_match.receipt_id,
        transaction_id: new_match.target.transaction_id(),
        group_id: new_match.target.group_id(),
        state: state.as_str().to_string(),
        confidence: new_match.confidence,
        amount_score: new_match.amount_score,
        date_score: new_match.date_score,
        vendor_score: new_match.vendor_score,
        match_reason: new_match.match_reason.clone(),
        vendor_alias_id: new_match.vendor_alias_id,
        is_manual: new_match.is_manual,
        version: 1,
        created_utc: now,
        confirmed_utc: (state == MatchState::Confirmed).then_some(now),
        confirmed_by: new_match.confirmed_by.clone(),
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn get_receipt(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
    ) -> Result<Option<Receipt>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .receipts
            .get(&receipt_id)
            .filter(|r| r.user_id == user_id)
            .cloned())
    }

    async fn unmatched_receipts(
        &self,
        user_id: Uuid,
        receipt_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Receipt>, AppError> {
        let inner = self.inner.lock().await;
        let mut receipts: Vec<Receipt> = inner
            .receipts
            .values()
            .filter(|r| r.user_id == user_id && r.status() == MatchStatus::Unmatched)
            .filter(|r| receipt_ids.map_or(true, |ids| ids.contains(&r.receipt_id)))
            .cloned()
            .collect();
        receipts.sort_by_key(|r| (r.receipt_date, r.receipt_id));
        Ok(receipts)
    }

    async fn delete_receipt(&self, user_id: Uuid, receipt_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .receipts
            .get(&receipt_id)
            .is_some_and(|r| r.user_id == user_id)
        {
            return Err(not_found("Receipt"));
        }

        // Release candidates held by live matches, then drop the receipt's
        // match history with the receipt itself.
        let live: Vec<(Uuid, MatchTarget)> = inner
            .matches
            .values()
            .filter(|m| m.receipt_id == receipt_id)
            .filter(|m| matches!(m.state(), MatchState::Proposed | MatchState::Confirmed))
            .map(|m| (m.match_id, m.target()))
            .collect();
        for (_, target) in &live {
            inner.set_candidate_status(*target, MatchStatus::Unmatched, None);
        }
        inner.matches.retain(|_, m| m.receipt_id != receipt_id);
        inner.receipts.remove(&receipt_id);
        Ok(())
    }

    async fn get_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .get(&transaction_id)
            .filter(|t| t.user_id == user_id)
            .cloned())
    }

    async fn get_group(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<TransactionGroup>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .groups
            .get(&group_id)
            .filter(|g| g.user_id == user_id)
            .cloned())
    }

    async fn unmatched_transactions(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError> {
        let inner = self.inner.lock().await;
        let mut transactions: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.status() == MatchStatus::Unmatched
                    && t.group_id.is_none()
                    && (from..=to).contains(&t.transaction_date)
            })
            .cloned()
            .collect();
        transactions.sort_by_key(|t| (t.transaction_date, t.transaction_id));
        Ok(transactions)
    }

    async fn unmatched_groups(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TransactionGroup>, AppError> {
        let inner = self.inner.lock().await;
        let mut groups: Vec<TransactionGroup> = inner
            .groups
            .values()
            .filter(|g| {
                g.user_id == user_id
                    && g.status() == MatchStatus::Unmatched
                    && (from..=to).contains(&g.display_date)
            })
            .cloned()
            .collect();
        groups.sort_by_key(|g| (g.display_date, g.group_id));
        Ok(groups)
    }

    async fn delete_group(&self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .groups
            .get(&group_id)
            .is_some_and(|g| g.user_id == user_id)
        {
            return Err(not_found("Group"));
        }

        // Cascade any live match back to unmatched on the receipt side.
        let live: Vec<(Uuid, MatchState, Uuid)> = inner
            .matches
            .values()
            .filter(|m| m.group_id == Some(group_id))
            .filter(|m| matches!(m.state(), MatchState::Proposed | MatchState::Confirmed))
            .map(|m| (m.match_id, m.state(), m.receipt_id))
            .collect();
        for (match_id, state, receipt_id) in live {
            inner.set_receipt_status(receipt_id, MatchStatus::Unmatched, None);
            match state {
                // Proposals against a deleted group carry no audit value.
                MatchState::Proposed => {
                    inner.matches.remove(&match_id);
                }
                // A confirmed link is audit history; park it in the
                // terminal unmatched state instead of deleting it.
                _ => {
                    if let Some(m) = inner.matches.get_mut(&match_id) {
                        m.state = MatchState::Unmatched.as_str().to_string();
                        m.version += 1;
                    }
                }
            }
        }

        // Members become individually eligible again.
        for t in inner.transactions.values_mut() {
            if t.group_id == Some(group_id) {
                t.group_id = None;
            }
        }
        inner.groups.remove(&group_id);
        Ok(())
    }

    async fn get_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
    ) -> Result<Option<ReceiptMatch>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .matches
            .get(&match_id)
            .filter(|m| m.user_id == user_id)
            .cloned())
    }

    async fn insert_proposed_match(&self, new_match: &NewMatch) -> Result<ReceiptMatch, AppError> {
        let mut inner = self.inner.lock().await;

        let receipt = inner
            .receipts
            .get(&new_match.receipt_id)
            .filter(|r| r.user_id == new_match.user_id)
            .ok_or_else(|| not_found("Receipt"))?;
        if receipt.status() != MatchStatus::Unmatched {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "receipt is not unmatched"
            )));
        }

        // A racing batch may have proposed this candidate already; only a
        // real (matched) pairing blocks a new proposal.
        if inner.candidate_status(new_match.target)? == MatchStatus::Matched {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "candidate is already matched"
            )));
        }

        let record = build_match(new_match, MatchState::Proposed, Utc::now());
        inner.set_receipt_status(new_match.receipt_id, MatchStatus::Proposed, None);
        inner.set_candidate_status(new_match.target, MatchStatus::Proposed, None);
        inner.matches.insert(record.match_id, record.clone());
        Ok(record)
    }

    async fn insert_manual_match(&self, new_match: &NewMatch) -> Result<ReceiptMatch, AppError> {
        let mut inner = self.inner.lock().await;

        let receipt = inner
            .receipts
            .get(&new_match.receipt_id)
            .filter(|r| r.user_id == new_match.user_id)
            .ok_or_else(|| not_found("Receipt"))?;
        if receipt.status() != MatchStatus::Unmatched {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "receipt is not unmatched"
            )));
        }
        if inner.candidate_status(new_match.target)? != MatchStatus::Unmatched {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "candidate is not unmatched"
            )));
        }
        inner.check_no_confirmed(None, new_match.receipt_id, new_match.target)?;

        let record = build_match(new_match, MatchState::Confirmed, Utc::now());
        inner.set_receipt_status(
            new_match.receipt_id,
            MatchStatus::Matched,
            Some(new_match.target),
        );
        inner.set_candidate_status(
            new_match.target,
            MatchStatus::Matched,
            Some(new_match.receipt_id),
        );
        inner.matches.insert(record.match_id, record.clone());
        Ok(record)
    }

    async fn confirm_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        confirmed_by: &str,
    ) -> Result<ReceiptMatch, AppError> {
        let mut inner = self.inner.lock().await;

        let current = inner
            .matches
            .get(&match_id)
            .filter(|m| m.user_id == user_id)
            .ok_or_else(|| not_found("Match"))?;
        if current.version != version {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "match was modified concurrently; refresh and retry"
            )));
        }
        if current.state() != MatchState::Proposed {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "match is not in proposed state"
            )));
        }
        let receipt_id = current.receipt_id;
        let target = current.target();
        inner.check_no_confirmed(Some(match_id), receipt_id, target)?;

        let now = Utc::now();
        let updated = {
            // Checks done; this block is the committed write.
            let m = inner
                .matches
                .get_mut(&match_id)
                .ok_or_else(|| not_found("Match"))?;
            m.state = MatchState::Confirmed.as_str().to_string();
            m.version += 1;
            m.confirmed_utc = Some(now);
            m.confirmed_by = Some(confirmed_by.to_string());
            m.clone()
        };
        inner.set_receipt_status(receipt_id, MatchStatus::Matched, Some(target));
        inner.set_candidate_status(target, MatchStatus::Matched, Some(receipt_id));
        Ok(updated)
    }

    async fn reject_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        rejected_by: &str,
    ) -> Result<ReceiptMatch, AppError> {
        let mut inner = self.inner.lock().await;

        let current = inner
            .matches
            .get(&match_id)
            .filter(|m| m.user_id == user_id)
            .ok_or_else(|| not_found("Match"))?;
        if current.version != version {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "match was modified concurrently; refresh and retry"
            )));
        }
        if current.state() != MatchState::Proposed {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "match is not in proposed state"
            )));
        }
        let receipt_id = current.receipt_id;
        let target = current.target();

        let now = Utc::now();
        let updated = {
            let m = inner
                .matches
                .get_mut(&match_id)
                .ok_or_else(|| not_found("Match"))?;
            m.state = MatchState::Rejected.as_str().to_string();
            m.version += 1;
            m.confirmed_utc = Some(now);
            m.confirmed_by = Some(rejected_by.to_string());
            m.clone()
        };
        inner.set_receipt_status(receipt_id, MatchStatus::Unmatched, None);
        inner.set_candidate_status(target, MatchStatus::Unmatched, None);
        Ok(updated)
    }

    async fn unmatch(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
    ) -> Result<ReceiptMatch, AppError> {
        let mut inner = self.inner.lock().await;

        let current = inner
            .matches
            .get(&match_id)
            .filter(|m| m.user_id == user_id)
            .ok_or_else(|| not_found("Match"))?;
        if current.version != version {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "match was modified concurrently; refresh and retry"
            )));
        }
        if current.state() != MatchState::Confirmed {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "only a confirmed match can be unmatched"
            )));
        }
        let receipt_id = current.receipt_id;
        let target = current.target();

        let updated = {
            let m = inner
                .matches
                .get_mut(&match_id)
                .ok_or_else(|| not_found("Match"))?;
            m.state = MatchState::Unmatched.as_str().to_string();
            m.version += 1;
            m.clone()
        };
        inner.set_receipt_status(receipt_id, MatchStatus::Unmatched, None);
        inner.set_candidate_status(target, MatchStatus::Unmatched, None);
        Ok(updated)
    }

    async fn vendor_aliases(&self, user_id: Uuid) -> Result<Vec<VendorAlias>, AppError> {
        let inner = self.inner.lock().await;
        let mut aliases: Vec<VendorAlias> = inner
            .aliases
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        aliases.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        Ok(aliases)
    }

    async fn record_alias_use(
        &self,
        user_id: Uuid,
        pattern: &str,
        canonical_name: &str,
        coding: &CodingOverrides,
    ) -> Result<VendorAlias, AppError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let existing = inner
            .aliases
            .values_mut()
            .find(|a| a.user_id == user_id && a.pattern == pattern);

        if let Some(alias) = existing {
            alias.match_count += 1;
            alias.last_matched_utc = now;
            alias.confidence = 1.0;
            if coding.gl_code.is_some() {
                alias.gl_code = coding.gl_code.clone();
            }
            if coding.department.is_some() {
                alias.department = coding.department.clone();
            }
            return Ok(alias.clone());
        }

        let alias = VendorAlias {
            alias_id: Uuid::new_v4(),
            user_id,
            pattern: pattern.to_string(),
            canonical_name: canonical_name.to_string(),
            gl_code: coding.gl_code.clone(),
            department: coding.department.clone(),
            match_count: 1,
            confidence: 1.0,
            last_matched_utc: now,
            created_utc: now,
        };
        inner.aliases.insert(alias.alias_id, alias.clone());
        Ok(alias)
    }

    async fn stale_aliases(
        &self,
        last_matched_before: DateTime<Utc>,
        min_confidence: f64,
    ) -> Result<Vec<VendorAlias>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .aliases
            .values()
            .filter(|a| a.last_matched_utc < last_matched_before && a.confidence > min_confidence)
            .cloned()
            .collect())
    }

    async fn decay_alias(&self, alias_id: Uuid, factor: f64) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        let alias = inner
            .aliases
            .get_mut(&alias_id)
            .ok_or_else(|| not_found("Vendor alias"))?;
        alias.confidence *= factor;
        Ok(())
    }

    async fn match_stats(&self, user_id: Uuid) -> Result<MatchStats, AppError> {
        let inner = self.inner.lock().await;

        let mut stats = MatchStats::default();
        let mut auto_confirmed = 0i64;
        let mut confidence_sum = 0i64;

        for m in inner.matches.values().filter(|m| m.user_id == user_id) {
            match m.state() {
                MatchState::Confirmed => {
                    stats.matched_count += 1;
                    confidence_sum += i64::from(m.confidence);
                    if !m.is_manual {
                        auto_confirmed += 1;
                    }
                }
                MatchState::Proposed => stats.proposed_count += 1,
                _ => {}
            }
        }
        stats.unmatched_receipt_count = inner
            .receipts
            .values()
            .filter(|r| r.user_id == user_id && r.status() == MatchStatus::Unmatched)
            .count() as i64;
        stats.unmatched_candidate_count = inner
            .transactions
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.status() == MatchStatus::Unmatched
                    && t.group_id.is_none()
            })
            .count() as i64
            + inner
                .groups
                .values()
                .filter(|g| g.user_id == user_id && g.status() == MatchStatus::Unmatched)
                .count() as i64;
        if stats.matched_count > 0 {
            stats.auto_match_rate = auto_confirmed as f64 / stats.matched_count as f64;
            stats.average_confidence = confidence_sum as f64 / stats.matched_count as f64;
        }
        Ok(stats)
    }
}
