use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use eventsift_common::{BatchItem, ScrapeError};
use eventsift_scraper::batch::{new_batch, parse_batch_csv, BatchRunner};
use eventsift_scraper::session::gather_stats;

use crate::AppState;

// --- Request structs ---

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    url: String,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    session_id: Uuid,
    approved_by: Option<String>,
}

#[derive(Deserialize)]
pub struct TestMethodRequest {
    method_id: Uuid,
    url: String,
}

#[derive(Deserialize)]
pub struct BatchQuery {
    filename: Option<String>,
}

// --- Helpers ---

fn error_response(e: ScrapeError) -> Response {
    let status = match &e {
        ScrapeError::SessionNotFound(_)
        | ScrapeError::MethodNotFound(_)
        | ScrapeError::BatchNotFound(_) => StatusCode::NOT_FOUND,
        ScrapeError::NotApprovable { .. } => StatusCode::CONFLICT,
        ScrapeError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
        ScrapeError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Request failed");
    }
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

// --- Handlers ---

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnalyzeRequest>,
) -> impl IntoResponse {
    match state.pipeline.analyze_url(body.url.trim()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn approve(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApproveRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .approve(body.session_id, body.approved_by)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn test_method(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestMethodRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .test_method(body.method_id, body.url.trim())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match gather_stats(&state.pool).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to gather stats");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Accept a CSV upload (`title,url` rows or bare URLs) and start processing
/// it in the background. Validation is all-or-nothing: any bad row rejects
/// the whole upload with row detail before anything is stored.
pub async fn batch_upload(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BatchQuery>,
    body: String,
) -> impl IntoResponse {
    let (rows, row_errors) = parse_batch_csv(&body);
    if !row_errors.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "CSV contains invalid rows",
                "row_errors": row_errors,
            })),
        )
            .into_response();
    }
    if rows.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "No URLs in the uploaded CSV",
            })),
        )
            .into_response();
    }

    let filename = params.filename.unwrap_or_else(|| "upload.csv".to_string());
    let (batch, items) = new_batch(&filename, &rows);

    if let Err(e) = state.batches.insert(&batch, &items).await {
        error!(error = %e, "Failed to store batch");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let runner = BatchRunner::new(
        state.pipeline.clone(),
        state.batches.clone(),
        state.logs.clone(),
    );
    let batch_id = batch.id;
    tokio::spawn(async move {
        if let Err(e) = runner.run(batch_id).await {
            error!(%batch_id, error = %e, "Batch run failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "batch_id": batch.id,
            "total_urls": batch.total_urls,
        })),
    )
        .into_response()
}

pub async fn batch_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let batch = match state.batches.get(id).await {
        Ok(Some(batch)) => batch,
        Ok(None) => return error_response(ScrapeError::BatchNotFound(id)),
        Err(e) => return error_response(ScrapeError::Other(e)),
    };

    let items = match state.batches.items(id).await {
        Ok(items) => items,
        Err(e) => return error_response(ScrapeError::Other(e)),
    };

    Json(serde_json::json!({
        "batch": batch,
        "items": items,
    }))
    .into_response()
}

pub async fn batch_results_csv(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.batches.get(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(ScrapeError::BatchNotFound(id)),
        Err(e) => return error_response(ScrapeError::Other(e)),
    }

    let items = match state.batches.items(id).await {
        Ok(items) => items,
        Err(e) => return error_response(ScrapeError::Other(e)),
    };

    match results_csv(&items) {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"batch-results.csv\"",
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => error_response(ScrapeError::Other(e)),
    }
}

fn results_csv(items: &[BatchItem]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Title", "URL", "Status", "Events Found", "Error"])?;

    for item in items {
        writer.write_record([
            item.title.clone().unwrap_or_default(),
            item.url.clone(),
            item.status.to_string(),
            item.events_found.to_string(),
            item.error_message.clone().unwrap_or_default(),
        ])?;
    }

    Ok(writer.into_inner()?)
}
