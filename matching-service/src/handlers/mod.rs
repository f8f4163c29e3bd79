//! HTTP handlers for the matching workflow.
//!
//! Thin transport over `MatchingService`: handlers parse input, resolve the
//! acting user from the `x-user-id` header (identity is established
//! upstream), and hand everything to the service layer.

use crate::models::{AutoMatchSummary, CodingOverrides, MatchStats, ReceiptMatch};
use crate::services::{RankedCandidate, UnmatchOutcome};
use crate::startup::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Acting user for audit stamps and data scoping, injected by the identity
/// layer in front of this service.
fn acting_user(headers: &HeaderMap) -> Result<Uuid, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("{} header is required", USER_ID_HEADER))
        })
}

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RunAutoMatchRequest {
    /// Restrict the batch to these receipts; all unmatched receipts
    /// otherwise.
    #[serde(default)]
    pub receipt_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Deserialize)]
pub struct CandidateQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub gl_code: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmMatchRequest {
    /// Version stamp the caller last observed; mismatches return 409.
    pub version: i32,
    #[serde(default)]
    pub gl_code: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectMatchRequest {
    pub version: i32,
}

#[derive(Debug, Deserialize)]
pub struct UnmatchRequest {
    pub version: i32,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /matching/run
pub async fn run_auto_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RunAutoMatchRequest>,
) -> Result<Json<AutoMatchSummary>, AppError> {
    let user_id = acting_user(&headers)?;
    let summary = state
        .service
        .run_auto_match(user_id, req.receipt_ids)
        .await?;
    Ok(Json(summary))
}

/// GET /receipts/{receipt_id}/candidates
pub async fn get_candidates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receipt_id): Path<Uuid>,
    Query(query): Query<CandidateQuery>,
) -> Result<Json<Vec<RankedCandidate>>, AppError> {
    let user_id = acting_user(&headers)?;
    let candidates = state
        .service
        .get_candidates(user_id, receipt_id, query.limit)
        .await?;
    Ok(Json(candidates))
}

/// POST /matches/manual
pub async fn create_manual_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ManualMatchRequest>,
) -> Result<Json<ReceiptMatch>, AppError> {
    let user_id = acting_user(&headers)?;
    let coding = CodingOverrides {
        gl_code: req.gl_code,
        department: req.department,
    };
    let record = state
        .service
        .create_manual_match(
            user_id,
            req.receipt_id,
            req.transaction_id,
            req.group_id,
            &coding,
        )
        .await?;
    Ok(Json(record))
}

/// POST /matches/{match_id}/confirm
pub async fn confirm_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(match_id): Path<Uuid>,
    Json(req): Json<ConfirmMatchRequest>,
) -> Result<Json<ReceiptMatch>, AppError> {
    let user_id = acting_user(&headers)?;
    let coding = CodingOverrides {
        gl_code: req.gl_code,
        department: req.department,
    };
    let record = state
        .service
        .confirm_match(user_id, match_id, req.version, &coding)
        .await?;
    Ok(Json(record))
}

/// POST /matches/{match_id}/reject
pub async fn reject_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(match_id): Path<Uuid>,
    Json(req): Json<RejectMatchRequest>,
) -> Result<Json<ReceiptMatch>, AppError> {
    let user_id = acting_user(&headers)?;
    let record = state
        .service
        .reject_match(user_id, match_id, req.version)
        .await?;
    Ok(Json(record))
}

/// POST /matches/{match_id}/unmatch
pub async fn unmatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(match_id): Path<Uuid>,
    Json(req): Json<UnmatchRequest>,
) -> Result<Json<UnmatchOutcome>, AppError> {
    let user_id = acting_user(&headers)?;
    let outcome = state
        .service
        .unmatch(user_id, match_id, req.version)
        .await?;
    Ok(Json(outcome))
}

/// GET /matching/stats
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MatchStats>, AppError> {
    let user_id = acting_user(&headers)?;
    let stats = state.service.stats(user_id).await?;
    Ok(Json(stats))
}
