//! PostgreSQL `MatchStore` implementation for matching-service.

#![allow(clippy::too_many_arguments)]

use crate::models::{
    CodingOverrides, MatchState, MatchStats, MatchTarget, NewMatch, Receipt, ReceiptMatch,
    Transaction, TransactionGroup, VendorAlias,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::MatchStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const RECEIPT_COLUMNS: &str = "receipt_id, user_id, vendor, amount, receipt_date, status, \
     matched_transaction_id, matched_group_id, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, user_id, transaction_date, description, \
     amount, group_id, status, matched_receipt_id, created_utc";

const GROUP_COLUMNS: &str = "group_id, user_id, name, combined_amount, display_date, status, \
     matched_receipt_id, created_utc";

const MATCH_COLUMNS: &str = "match_id, user_id, receipt_id, transaction_id, group_id, state, \
     confidence, amount_score, date_score, vendor_score, match_reason, vendor_alias_id, \
     is_manual, version, created_utc, confirmed_utc, confirmed_by";

const ALIAS_COLUMNS: &str = "alias_id, user_id, pattern, canonical_name, gl_code, department, \
     match_count, confidence, last_matched_utc, created_utc";

/// Map a sqlx error, surfacing unique-index violations as data-integrity
/// errors so racing confirms fail loudly instead of as opaque 500s.
fn map_db_err(context: &str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return AppError::DataIntegrity(anyhow::anyhow!("{}: {}", context, e));
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn not_found(what: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} not found", what))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "matching-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Diagnose a CAS miss on a match row. A stale version wins over a
    /// wrong state: a racing writer that lost must see a conflict, not the
    /// state its rival just produced.
    async fn diagnose_match_cas<'c>(
        &self,
        tx: &mut sqlx::Transaction<'c, sqlx::Postgres>,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        required_state: MatchState,
    ) -> AppError {
        let query = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE match_id = $1 AND user_id = $2");
        let current = sqlx::query_as::<_, ReceiptMatch>(&query)
            .bind(match_id)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await;

        match current {
            Ok(None) => not_found("Match"),
            Ok(Some(m)) if m.version != version => AppError::Conflict(anyhow::anyhow!(
                "match was modified concurrently; refresh and retry"
            )),
            Ok(Some(m)) if m.state() != required_state => AppError::InvalidState(anyhow::anyhow!(
                "match is not in {} state",
                required_state.as_str()
            )),
            Ok(Some(_)) => AppError::Conflict(anyhow::anyhow!(
                "match was modified concurrently; refresh and retry"
            )),
            Err(e) => map_db_err("Failed to inspect match", e),
        }
    }

    /// Write the matched-side cross-links for a receipt and its candidate.
    async fn link_sides<'c>(
        &self,
        tx: &mut sqlx::Transaction<'c, sqlx::Postgres>,
        receipt_id: Uuid,
        target: MatchTarget,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE receipts
            SET status = 'matched', matched_transaction_id = $2, matched_group_id = $3, updated_utc = now()
            WHERE receipt_id = $1
            "#,
        )
        .bind(receipt_id)
        .bind(target.transaction_id())
        .bind(target.group_id())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_db_err("Failed to link receipt", e))?;

        match target {
            MatchTarget::Transaction(id) => {
                sqlx::query(
                    "UPDATE transactions SET status = 'matched', matched_receipt_id = $2 WHERE transaction_id = $1",
                )
                .bind(id)
                .bind(receipt_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_db_err("Failed to link transaction", e))?;
            }
            MatchTarget::Group(id) => {
                sqlx::query(
                    "UPDATE transaction_groups SET status = 'matched', matched_receipt_id = $2 WHERE group_id = $1",
                )
                .bind(id)
                .bind(receipt_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_db_err("Failed to link group", e))?;
            }
        }
        Ok(())
    }

    /// Return both sides of a match to unmatched and clear their references.
    async fn unlink_sides<'c>(
        &self,
        tx: &mut sqlx::Transaction<'c, sqlx::Postgres>,
        receipt_id: Uuid,
        target: MatchTarget,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE receipts
            SET status = 'unmatched', matched_transaction_id = NULL, matched_group_id = NULL, updated_utc = now()
            WHERE receipt_id = $1
            "#,
        )
        .bind(receipt_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_db_err("Failed to unlink receipt", e))?;

        match target {
            MatchTarget::Transaction(id) => {
                sqlx::query(
                    "UPDATE transactions SET status = 'unmatched', matched_receipt_id = NULL WHERE transaction_id = $1",
                )
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_db_err("Failed to unlink transaction", e))?;
            }
            MatchTarget::Group(id) => {
                sqlx::query(
                    "UPDATE transaction_groups SET status = 'unmatched', matched_receipt_id = NULL WHERE group_id = $1",
                )
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_db_err("Failed to unlink group", e))?;
            }
        }
        Ok(())
    }

    /// Gate a candidate into `proposed`/`unmatched`-only flows. Returns the
    /// precise error when the conditional update matched no row.
    async fn diagnose_candidate<'c>(
        &self,
        tx: &mut sqlx::Transaction<'c, sqlx::Postgres>,
        user_id: Uuid,
        target: MatchTarget,
    ) -> AppError {
        match target {
            MatchTarget::Transaction(id) => {
                let row = sqlx::query_as::<_, (Option<Uuid>, String)>(
                    "SELECT group_id, status FROM transactions WHERE transaction_id = $1 AND user_id = $2",
                )
                .bind(id)
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await;
                match row {
                    Ok(None) => not_found("Transaction"),
                    Ok(Some((Some(_), _))) => AppError::InvalidState(anyhow::anyhow!(
                        "transaction belongs to a group and cannot be matched individually"
                    )),
                    Ok(Some((None, status))) => AppError::InvalidState(anyhow::anyhow!(
                        "transaction is {}",
                        status
                    )),
                    Err(e) => map_db_err("Failed to inspect transaction", e),
                }
            }
            MatchTarget::Group(id) => {
                let row = sqlx::query_as::<_, (String,)>(
                    "SELECT status FROM transaction_groups WHERE group_id = $1 AND user_id = $2",
                )
                .bind(id)
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await;
                match row {
                    Ok(None) => not_found("Group"),
                    Ok(Some((status,))) => {
                        AppError::InvalidState(anyhow::anyhow!("group is {}", status))
                    }
                    Err(e) => map_db_err("Failed to inspect group", e),
                }
            }
        }
    }

    async fn insert_match_row<'c>(
        &self,
        tx: &mut sqlx::Transaction<'c, sqlx::Postgres>,
        new_match: &NewMatch,
        state: MatchState,
    ) -> Result<ReceiptMatch, AppError> {
        let query = format!(
            r#"
            INSERT INTO matches (match_id, user_id, receipt_id, transaction_id, group_id, state,
                                 confidence, amount_score, date_score, vendor_score, match_reason,
                                 vendor_alias_id, is_manual, version, confirmed_utc, confirmed_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1,
                    CASE WHEN $6 = 'confirmed' THEN now() END, $14)
            RETURNING {MATCH_COLUMNS}
            "#
        );
        sqlx::query_as::<_, ReceiptMatch>(&query)
            .bind(Uuid::new_v4())
            .bind(new_match.user_id)
            .bind(new_match.receipt_id)
            .bind(new_match.target.transaction_id())
            .bind(new_match.target.group_id())
            .bind(state.as_str())
            .bind(new_match.confidence)
            .bind(new_match.amount_score)
            .bind(new_match.date_score)
            .bind(new_match.vendor_score)
            .bind(&new_match.match_reason)
            .bind(new_match.vendor_alias_id)
            .bind(new_match.is_manual)
            .bind(new_match.confirmed_by.as_deref())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_db_err("Failed to create match", e))
    }
}

#[async_trait]
impl MatchStore for Database {
    #[instrument(skip(self), fields(user_id = %user_id, receipt_id = %receipt_id))]
    async fn get_receipt(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
    ) -> Result<Option<Receipt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_receipt"])
            .start_timer();

        let query =
            format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE user_id = $1 AND receipt_id = $2");
        let receipt = sqlx::query_as::<_, Receipt>(&query)
            .bind(user_id)
            .bind(receipt_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to get receipt", e))?;

        timer.observe_duration();
        Ok(receipt)
    }

    #[instrument(skip(self, receipt_ids), fields(user_id = %user_id))]
    async fn unmatched_receipts(
        &self,
        user_id: Uuid,
        receipt_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Receipt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatched_receipts"])
            .start_timer();

        let receipts = if let Some(ids) = receipt_ids {
            let query = format!(
                r#"
                SELECT {RECEIPT_COLUMNS} FROM receipts
                WHERE user_id = $1 AND status = 'unmatched' AND receipt_id = ANY($2)
                ORDER BY receipt_date, receipt_id
                "#
            );
            sqlx::query_as::<_, Receipt>(&query)
                .bind(user_id)
                .bind(ids.to_vec())
                .fetch_all(&self.pool)
                .await
        } else {
            let query = format!(
                r#"
                SELECT {RECEIPT_COLUMNS} FROM receipts
                WHERE user_id = $1 AND status = 'unmatched'
                ORDER BY receipt_date, receipt_id
                "#
            );
            sqlx::query_as::<_, Receipt>(&query)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| map_db_err("Failed to list unmatched receipts", e))?;

        timer.observe_duration();
        Ok(receipts)
    }

    #[instrument(skip(self), fields(user_id = %user_id, receipt_id = %receipt_id))]
    async fn delete_receipt(&self, user_id: Uuid, receipt_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_receipt"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let exists = sqlx::query_as::<_, (Uuid,)>(
            "SELECT receipt_id FROM receipts WHERE receipt_id = $1 AND user_id = $2",
        )
        .bind(receipt_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to inspect receipt", e))?;
        if exists.is_none() {
            return Err(not_found("Receipt"));
        }

        // Candidates held by a live match must not stay stuck once the
        // receipt is gone.
        sqlx::query(
            r#"
            UPDATE transactions SET status = 'unmatched', matched_receipt_id = NULL
            WHERE transaction_id IN (
                SELECT transaction_id FROM matches
                WHERE receipt_id = $1 AND state IN ('proposed', 'confirmed') AND transaction_id IS NOT NULL
            )
            "#,
        )
        .bind(receipt_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to release transactions", e))?;

        sqlx::query(
            r#"
            UPDATE transaction_groups SET status = 'unmatched', matched_receipt_id = NULL
            WHERE group_id IN (
                SELECT group_id FROM matches
                WHERE receipt_id = $1 AND state IN ('proposed', 'confirmed') AND group_id IS NOT NULL
            )
            "#,
        )
        .bind(receipt_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to release groups", e))?;

        // Match history cascades with the receipt row.
        sqlx::query("DELETE FROM receipts WHERE receipt_id = $1")
            .bind(receipt_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to delete receipt", e))?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        info!(receipt_id = %receipt_id, "Receipt deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id, transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = $1 AND transaction_id = $2"
        );
        let transaction = sqlx::query_as::<_, Transaction>(&query)
            .bind(user_id)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to get transaction", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self), fields(user_id = %user_id, group_id = %group_id))]
    async fn get_group(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<TransactionGroup>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_group"])
            .start_timer();

        let query =
            format!("SELECT {GROUP_COLUMNS} FROM transaction_groups WHERE user_id = $1 AND group_id = $2");
        let group = sqlx::query_as::<_, TransactionGroup>(&query)
            .bind(user_id)
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to get group", e))?;

        timer.observe_duration();
        Ok(group)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn unmatched_transactions(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatched_transactions"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE user_id = $1 AND status = 'unmatched' AND group_id IS NULL
              AND transaction_date BETWEEN $2 AND $3
            ORDER BY transaction_date, transaction_id
            "#
        );
        let transactions = sqlx::query_as::<_, Transaction>(&query)
            .bind(user_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to list unmatched transactions", e))?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn unmatched_groups(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TransactionGroup>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatched_groups"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM transaction_groups
            WHERE user_id = $1 AND status = 'unmatched' AND display_date BETWEEN $2 AND $3
            ORDER BY display_date, group_id
            "#
        );
        let groups = sqlx::query_as::<_, TransactionGroup>(&query)
            .bind(user_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to list unmatched groups", e))?;

        timer.observe_duration();
        Ok(groups)
    }

    #[instrument(skip(self), fields(user_id = %user_id, group_id = %group_id))]
    async fn delete_group(&self, user_id: Uuid, group_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_group"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let exists = sqlx::query_as::<_, (Uuid,)>(
            "SELECT group_id FROM transaction_groups WHERE group_id = $1 AND user_id = $2",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to inspect group", e))?;
        if exists.is_none() {
            return Err(not_found("Group"));
        }

        // Pending proposals against the group carry no audit value.
        let proposed: Vec<(Uuid,)> = sqlx::query_as(
            "DELETE FROM matches WHERE group_id = $1 AND state = 'proposed' RETURNING receipt_id",
        )
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to drop group proposals", e))?;

        // A confirmed link is audit history; park it in the terminal
        // unmatched state and release the receipt.
        let confirmed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE matches SET state = 'unmatched', version = version + 1
            WHERE group_id = $1 AND state = 'confirmed'
            RETURNING receipt_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to unwind group matches", e))?;

        let receipt_ids: Vec<Uuid> = proposed
            .into_iter()
            .chain(confirmed)
            .map(|(id,)| id)
            .collect();
        if !receipt_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE receipts
                SET status = 'unmatched', matched_transaction_id = NULL, matched_group_id = NULL,
                    updated_utc = now()
                WHERE receipt_id = ANY($1)
                "#,
            )
            .bind(&receipt_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to release receipts", e))?;
        }

        // Members become individually eligible again.
        sqlx::query("UPDATE transactions SET group_id = NULL WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to release group members", e))?;

        sqlx::query("DELETE FROM transaction_groups WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to delete group", e))?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        info!(group_id = %group_id, "Group deleted and receipts released");
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id, match_id = %match_id))]
    async fn get_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
    ) -> Result<Option<ReceiptMatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_match"])
            .start_timer();

        let query =
            format!("SELECT {MATCH_COLUMNS} FROM matches WHERE user_id = $1 AND match_id = $2");
        let record = sqlx::query_as::<_, ReceiptMatch>(&query)
            .bind(user_id)
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to get match", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self, new_match), fields(user_id = %new_match.user_id, receipt_id = %new_match.receipt_id))]
    async fn insert_proposed_match(&self, new_match: &NewMatch) -> Result<ReceiptMatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_proposed_match"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let receipt_gate = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE receipts SET status = 'proposed', updated_utc = now()
            WHERE receipt_id = $1 AND user_id = $2 AND status = 'unmatched'
            RETURNING receipt_id
            "#,
        )
        .bind(new_match.receipt_id)
        .bind(new_match.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to gate receipt", e))?;
        if receipt_gate.is_none() {
            let exists = sqlx::query_as::<_, (Uuid,)>(
                "SELECT receipt_id FROM receipts WHERE receipt_id = $1 AND user_id = $2",
            )
            .bind(new_match.receipt_id)
            .bind(new_match.user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to inspect receipt", e))?;
            return Err(match exists {
                None => not_found("Receipt"),
                Some(_) => AppError::InvalidState(anyhow::anyhow!("receipt is not unmatched")),
            });
        }

        // A racing batch may have proposed this candidate already; only a
        // real (matched) pairing blocks a new proposal.
        let candidate_gate = match new_match.target {
            MatchTarget::Transaction(id) => sqlx::query_as::<_, (Uuid,)>(
                r#"
                UPDATE transactions SET status = 'proposed'
                WHERE transaction_id = $1 AND user_id = $2 AND status <> 'matched' AND group_id IS NULL
                RETURNING transaction_id
                "#,
            )
            .bind(id)
            .bind(new_match.user_id)
            .fetch_optional(&mut *tx)
            .await,
            MatchTarget::Group(id) => sqlx::query_as::<_, (Uuid,)>(
                r#"
                UPDATE transaction_groups SET status = 'proposed'
                WHERE group_id = $1 AND user_id = $2 AND status <> 'matched'
                RETURNING group_id
                "#,
            )
            .bind(id)
            .bind(new_match.user_id)
            .fetch_optional(&mut *tx)
            .await,
        }
        .map_err(|e| map_db_err("Failed to gate candidate", e))?;
        if candidate_gate.is_none() {
            return Err(self
                .diagnose_candidate(&mut tx, new_match.user_id, new_match.target)
                .await);
        }

        let record = self
            .insert_match_row(&mut tx, new_match, MatchState::Proposed)
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self, new_match), fields(user_id = %new_match.user_id, receipt_id = %new_match.receipt_id))]
    async fn insert_manual_match(&self, new_match: &NewMatch) -> Result<ReceiptMatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_manual_match"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let receipt_gate = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE receipts
            SET status = 'matched', matched_transaction_id = $3, matched_group_id = $4, updated_utc = now()
            WHERE receipt_id = $1 AND user_id = $2 AND status = 'unmatched'
            RETURNING receipt_id
            "#,
        )
        .bind(new_match.receipt_id)
        .bind(new_match.user_id)
        .bind(new_match.target.transaction_id())
        .bind(new_match.target.group_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to gate receipt", e))?;
        if receipt_gate.is_none() {
            let exists = sqlx::query_as::<_, (Uuid,)>(
                "SELECT receipt_id FROM receipts WHERE receipt_id = $1 AND user_id = $2",
            )
            .bind(new_match.receipt_id)
            .bind(new_match.user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to inspect receipt", e))?;
            return Err(match exists {
                None => not_found("Receipt"),
                Some(_) => AppError::InvalidState(anyhow::anyhow!("receipt is not unmatched")),
            });
        }

        let candidate_gate = match new_match.target {
            MatchTarget::Transaction(id) => sqlx::query_as::<_, (Uuid,)>(
                r#"
                UPDATE transactions SET status = 'matched', matched_receipt_id = $3
                WHERE transaction_id = $1 AND user_id = $2 AND status = 'unmatched' AND group_id IS NULL
                RETURNING transaction_id
                "#,
            )
            .bind(id)
            .bind(new_match.user_id)
            .bind(new_match.receipt_id)
            .fetch_optional(&mut *tx)
            .await,
            MatchTarget::Group(id) => sqlx::query_as::<_, (Uuid,)>(
                r#"
                UPDATE transaction_groups SET status = 'matched', matched_receipt_id = $3
                WHERE group_id = $1 AND user_id = $2 AND status = 'unmatched'
                RETURNING group_id
                "#,
            )
            .bind(id)
            .bind(new_match.user_id)
            .bind(new_match.receipt_id)
            .fetch_optional(&mut *tx)
            .await,
        }
        .map_err(|e| map_db_err("Failed to gate candidate", e))?;
        if candidate_gate.is_none() {
            return Err(self
                .diagnose_candidate(&mut tx, new_match.user_id, new_match.target)
                .await);
        }

        // The partial unique indexes on confirmed matches hold the
        // one-confirmed invariant even when two manual matches race.
        let record = self
            .insert_match_row(&mut tx, new_match, MatchState::Confirmed)
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        info!(match_id = %record.match_id, "Manual match created");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id, match_id = %match_id))]
    async fn confirm_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        confirmed_by: &str,
    ) -> Result<ReceiptMatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirm_match"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        // Compare-and-swap: the WHERE clause is the whole concurrency story.
        let query = format!(
            r#"
            UPDATE matches
            SET state = 'confirmed', version = version + 1, confirmed_utc = now(), confirmed_by = $4
            WHERE match_id = $1 AND user_id = $2 AND version = $3 AND state = 'proposed'
            RETURNING {MATCH_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, ReceiptMatch>(&query)
            .bind(match_id)
            .bind(user_id)
            .bind(version)
            .bind(confirmed_by)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to confirm match", e))?;

        let record = match updated {
            Some(m) => m,
            None => {
                return Err(self
                    .diagnose_match_cas(&mut tx, user_id, match_id, version, MatchState::Proposed)
                    .await)
            }
        };

        self.link_sides(&mut tx, record.receipt_id, record.target())
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        info!(match_id = %match_id, "Match confirmed");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id, match_id = %match_id))]
    async fn reject_match(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
        rejected_by: &str,
    ) -> Result<ReceiptMatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reject_match"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let query = format!(
            r#"
            UPDATE matches
            SET state = 'rejected', version = version + 1, confirmed_utc = now(), confirmed_by = $4
            WHERE match_id = $1 AND user_id = $2 AND version = $3 AND state = 'proposed'
            RETURNING {MATCH_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, ReceiptMatch>(&query)
            .bind(match_id)
            .bind(user_id)
            .bind(version)
            .bind(rejected_by)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to reject match", e))?;

        let record = match updated {
            Some(m) => m,
            None => {
                return Err(self
                    .diagnose_match_cas(&mut tx, user_id, match_id, version, MatchState::Proposed)
                    .await)
            }
        };

        self.unlink_sides(&mut tx, record.receipt_id, record.target())
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        info!(match_id = %match_id, "Match rejected");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id, match_id = %match_id))]
    async fn unmatch(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        version: i32,
    ) -> Result<ReceiptMatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatch"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let query = format!(
            r#"
            UPDATE matches
            SET state = 'unmatched', version = version + 1
            WHERE match_id = $1 AND user_id = $2 AND version = $3 AND state = 'confirmed'
            RETURNING {MATCH_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, ReceiptMatch>(&query)
            .bind(match_id)
            .bind(user_id)
            .bind(version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to unmatch", e))?;

        let record = match updated {
            Some(m) => m,
            None => {
                return Err(self
                    .diagnose_match_cas(&mut tx, user_id, match_id, version, MatchState::Confirmed)
                    .await)
            }
        };

        self.unlink_sides(&mut tx, record.receipt_id, record.target())
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit", e))?;

        timer.observe_duration();
        info!(match_id = %match_id, "Match unwound to unmatched");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn vendor_aliases(&self, user_id: Uuid) -> Result<Vec<VendorAlias>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["vendor_aliases"])
            .start_timer();

        let query = format!(
            "SELECT {ALIAS_COLUMNS} FROM vendor_aliases WHERE user_id = $1 ORDER BY pattern"
        );
        let aliases = sqlx::query_as::<_, VendorAlias>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to list vendor aliases", e))?;

        timer.observe_duration();
        Ok(aliases)
    }

    #[instrument(skip(self, coding), fields(user_id = %user_id, pattern = %pattern))]
    async fn record_alias_use(
        &self,
        user_id: Uuid,
        pattern: &str,
        canonical_name: &str,
        coding: &CodingOverrides,
    ) -> Result<VendorAlias, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_alias_use"])
            .start_timer();

        let query = format!(
            r#"
            INSERT INTO vendor_aliases (alias_id, user_id, pattern, canonical_name, gl_code,
                                        department, match_count, confidence, last_matched_utc)
            VALUES ($1, $2, $3, $4, $5, $6, 1, 1.0, now())
            ON CONFLICT (user_id, pattern) DO UPDATE SET
                match_count = vendor_aliases.match_count + 1,
                last_matched_utc = now(),
                confidence = 1.0,
                gl_code = COALESCE(EXCLUDED.gl_code, vendor_aliases.gl_code),
                department = COALESCE(EXCLUDED.department, vendor_aliases.department)
            RETURNING {ALIAS_COLUMNS}
            "#
        );
        let alias = sqlx::query_as::<_, VendorAlias>(&query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(pattern)
            .bind(canonical_name)
            .bind(coding.gl_code.as_deref())
            .bind(coding.department.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to record alias use", e))?;

        timer.observe_duration();
        Ok(alias)
    }

    #[instrument(skip(self))]
    async fn stale_aliases(
        &self,
        last_matched_before: DateTime<Utc>,
        min_confidence: f64,
    ) -> Result<Vec<VendorAlias>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["stale_aliases"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {ALIAS_COLUMNS} FROM vendor_aliases
            WHERE last_matched_utc < $1 AND confidence > $2
            ORDER BY last_matched_utc
            "#
        );
        let aliases = sqlx::query_as::<_, VendorAlias>(&query)
            .bind(last_matched_before)
            .bind(min_confidence)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to list stale aliases", e))?;

        timer.observe_duration();
        Ok(aliases)
    }

    #[instrument(skip(self), fields(alias_id = %alias_id))]
    async fn decay_alias(&self, alias_id: Uuid, factor: f64) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["decay_alias"])
            .start_timer();

        let result = sqlx::query("UPDATE vendor_aliases SET confidence = confidence * $2 WHERE alias_id = $1")
            .bind(alias_id)
            .bind(factor)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to decay alias", e))?;
        if result.rows_affected() == 0 {
            return Err(not_found("Vendor alias"));
        }

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn match_stats(&self, user_id: Uuid) -> Result<MatchStats, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["match_stats"])
            .start_timer();

        let (matched_count, proposed_count, auto_confirmed, average_confidence) =
            sqlx::query_as::<_, (i64, i64, i64, f64)>(
                r#"
                SELECT COUNT(*) FILTER (WHERE state = 'confirmed'),
                       COUNT(*) FILTER (WHERE state = 'proposed'),
                       COUNT(*) FILTER (WHERE state = 'confirmed' AND NOT is_manual),
                       COALESCE(AVG(confidence) FILTER (WHERE state = 'confirmed'), 0)::FLOAT8
                FROM matches
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_err("Failed to aggregate matches", e))?;

        let unmatched_receipt_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM receipts WHERE user_id = $1 AND status = 'unmatched'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_err("Failed to count receipts", e))?;

        let unmatched_candidate_count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT (SELECT COUNT(*) FROM transactions
                    WHERE user_id = $1 AND status = 'unmatched' AND group_id IS NULL)
                 + (SELECT COUNT(*) FROM transaction_groups
                    WHERE user_id = $1 AND status = 'unmatched')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_err("Failed to count candidates", e))?;

        timer.observe_duration();
        Ok(MatchStats {
            matched_count,
            proposed_count,
            unmatched_receipt_count,
            unmatched_candidate_count,
            auto_match_rate: if matched_count > 0 {
                auto_confirmed as f64 / matched_count as f64
            } else {
                0.0
            },
            average_confidence,
        })
    }
}
