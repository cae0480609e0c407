//! Batch processing: a CSV of URLs becomes a tracked batch whose items are
//! analyzed one at a time with pacing between requests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use eventsift_common::{
    is_valid_scrape_url, BatchItem, BatchItemStatus, BatchStatus, ScrapeBatch, SessionStatus,
};

use crate::logs::{LogEntry, LogStore};
use crate::pipeline::ScrapePipeline;

// ---------------------------------------------------------------------------
// CSV intake
// ---------------------------------------------------------------------------

/// One accepted CSV row: `title,url` or a bare `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub title: Option<String>,
    pub url: String,
}

/// Parse an uploaded CSV into batch rows. A leading header row is skipped
/// and fully blank rows are ignored. Every invalid row is reported with its
/// line number; callers reject the whole upload when any error is present,
/// so nothing persists from a partially bad file.
pub fn parse_batch_csv(data: &str) -> (Vec<BatchRow>, Vec<String>) {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());

    let mut rows = Vec::new();
    let mut errors = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let line = idx + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                errors.push(format!("line {line}: {e}"));
                continue;
            }
        };

        if idx == 0 && looks_like_header(&record) {
            continue;
        }

        let (title, url) = match record.len() {
            0 => continue,
            1 => (None, record[0].to_string()),
            _ => {
                let title = Some(record[0].to_string()).filter(|t| !t.is_empty());
                (title, record[1].to_string())
            }
        };

        if url.is_empty() {
            if title.is_none() {
                continue;
            }
            errors.push(format!("line {line}: missing URL"));
            continue;
        }
        if !is_valid_scrape_url(&url) {
            errors.push(format!("line {line}: not a valid http(s) URL: {url}"));
            continue;
        }

        rows.push(BatchRow { title, url });
    }

    (rows, errors)
}

fn looks_like_header(record: &csv::StringRecord) -> bool {
    record
        .iter()
        .any(|f| f.eq_ignore_ascii_case("url") || f.eq_ignore_ascii_case("title"))
}

/// Build a queued batch plus its pending items from parsed rows.
pub fn new_batch(filename: &str, rows: &[BatchRow]) -> (ScrapeBatch, Vec<BatchItem>) {
    let batch = ScrapeBatch {
        id: Uuid::new_v4(),
        filename: filename.to_string(),
        status: BatchStatus::Queued,
        total_urls: rows.len() as i32,
        processed_urls: 0,
        success_count: 0,
        error_count: 0,
        total_events: 0,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };

    let items = rows
        .iter()
        .enumerate()
        .map(|(i, row)| BatchItem {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            position: i as i32,
            title: row.title.clone(),
            url: row.url.clone(),
            status: BatchItemStatus::Pending,
            events_found: 0,
            session_id: None,
            error_message: None,
            processed_at: None,
        })
        .collect();

    (batch, items)
}

/// Delay before the next URL. Sites answering poorly get a longer breather;
/// a warmed-up run that keeps succeeding speeds up.
pub fn pacing_delay(processed: usize, successes: usize) -> Duration {
    if processed >= 3 {
        let ratio = successes as f64 / processed as f64;
        if ratio < 0.3 {
            return Duration::from_millis(1000);
        }
        return Duration::from_millis(300);
    }
    Duration::from_millis(500)
}

// ---------------------------------------------------------------------------
// BatchStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn insert(&self, batch: &ScrapeBatch, items: &[BatchItem]) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<ScrapeBatch>>;
    async fn items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>>;
    async fn update_batch(&self, batch: &ScrapeBatch) -> Result<()>;
    async fn update_item(&self, item: &BatchItem) -> Result<()>;
}

pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn insert(&self, batch: &ScrapeBatch, items: &[BatchItem]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_batches
                (id, filename, status, total_urls, processed_urls, success_count,
                 error_count, total_events, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.filename)
        .bind(batch.status.to_string())
        .bind(batch.total_urls)
        .bind(batch.processed_urls)
        .bind(batch.success_count)
        .bind(batch.error_count)
        .bind(batch.total_events)
        .bind(batch.created_at)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO scrape_batch_items
                    (id, batch_id, position, title, url, status, events_found,
                     session_id, error_message, processed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(item.id)
            .bind(item.batch_id)
            .bind(item.position)
            .bind(&item.title)
            .bind(&item.url)
            .bind(item.status.to_string())
            .bind(item.events_found)
            .bind(item.session_id)
            .bind(&item.error_message)
            .bind(item.processed_at)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapeBatch>> {
        let row = sqlx::query(
            r#"
            SELECT id, filename, status, total_urls, processed_urls, success_count,
                   error_count, total_events, created_at, started_at, completed_at
            FROM scrape_batches
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_batch))
    }

    async fn items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, position, title, url, status, events_found,
                   session_id, error_message, processed_at
            FROM scrape_batch_items
            WHERE batch_id = $1
            ORDER BY position
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_item).collect())
    }

    async fn update_batch(&self, batch: &ScrapeBatch) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scrape_batches
            SET status = $2, processed_urls = $3, success_count = $4,
                error_count = $5, total_events = $6, started_at = $7, completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(batch.id)
        .bind(batch.status.to_string())
        .bind(batch.processed_urls)
        .bind(batch.success_count)
        .bind(batch.error_count)
        .bind(batch.total_events)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_item(&self, item: &BatchItem) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scrape_batch_items
            SET status = $2, events_found = $3, session_id = $4,
                error_message = $5, processed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.status.to_string())
        .bind(item.events_found)
        .bind(item.session_id)
        .bind(&item.error_message)
        .bind(item.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_batch(r: sqlx::postgres::PgRow) -> ScrapeBatch {
    let status: String = r.get("status");
    ScrapeBatch {
        id: r.get("id"),
        filename: r.get("filename"),
        status: BatchStatus::from_str_loose(&status),
        total_urls: r.get("total_urls"),
        processed_urls: r.get("processed_urls"),
        success_count: r.get("success_count"),
        error_count: r.get("error_count"),
        total_events: r.get("total_events"),
        created_at: r.get("created_at"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
    }
}

fn row_to_item(r: sqlx::postgres::PgRow) -> BatchItem {
    let status: String = r.get("status");
    BatchItem {
        id: r.get("id"),
        batch_id: r.get("batch_id"),
        position: r.get("position"),
        title: r.get("title"),
        url: r.get("url"),
        status: BatchItemStatus::from_str_loose(&status),
        events_found: r.get("events_found"),
        session_id: r.get("session_id"),
        error_message: r.get("error_message"),
        processed_at: r.get("processed_at"),
    }
}

// ---------------------------------------------------------------------------
// MemoryBatchStore (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory batch store for testing. Thread-safe.
pub struct MemoryBatchStore {
    batches: Mutex<Vec<ScrapeBatch>>,
    items: Mutex<Vec<BatchItem>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            items: Mutex::new(Vec::new()),
        }
    }

    /// All stored batches (for test assertions).
    pub fn batches(&self) -> Vec<ScrapeBatch> {
        self.batches.lock().unwrap().clone()
    }
}

impl Default for MemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn insert(&self, batch: &ScrapeBatch, items: &[BatchItem]) -> Result<()> {
        self.batches.lock().unwrap().push(batch.clone());
        self.items.lock().unwrap().extend(items.iter().cloned());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapeBatch>> {
        Ok(self
            .batches
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    async fn items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let mut items: Vec<BatchItem> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.position);
        Ok(items)
    }

    async fn update_batch(&self, batch: &ScrapeBatch) -> Result<()> {
        let mut batches = self.batches.lock().unwrap();
        if let Some(existing) = batches.iter_mut().find(|b| b.id == batch.id) {
            *existing = batch.clone();
        }
        Ok(())
    }

    async fn update_item(&self, item: &BatchItem) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        if let Some(existing) = items.iter_mut().find(|i| i.id == item.id) {
            *existing = item.clone();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BatchRunner
// ---------------------------------------------------------------------------

/// Drives a batch to completion, one URL at a time. Meant to run on a
/// spawned task; pollers read progress off the batch row.
pub struct BatchRunner {
    pipeline: Arc<ScrapePipeline>,
    batches: Arc<dyn BatchStore>,
    logs: Arc<dyn LogStore>,
}

impl BatchRunner {
    pub fn new(
        pipeline: Arc<ScrapePipeline>,
        batches: Arc<dyn BatchStore>,
        logs: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            pipeline,
            batches,
            logs,
        }
    }

    pub async fn run(&self, batch_id: Uuid) -> Result<()> {
        let mut batch = self
            .batches
            .get(batch_id)
            .await?
            .ok_or_else(|| anyhow!("unknown batch: {batch_id}"))?;

        batch.status = BatchStatus::Processing;
        batch.started_at = Some(Utc::now());
        self.batches.update_batch(&batch).await?;
        self.log(
            LogEntry::info(format!("Batch started with {} URLs", batch.total_urls))
                .for_batch(batch.id)
                .with_details(json!({ "filename": batch.filename })),
        )
        .await;

        let items = self.batches.items(batch_id).await?;
        for (idx, mut item) in items.into_iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(pacing_delay(
                    batch.processed_urls as usize,
                    batch.success_count as usize,
                ))
                .await;
            }

            let label = item.title.clone().unwrap_or_else(|| item.url.clone());
            self.log(
                LogEntry::info(format!("Processing: {label}"))
                    .for_batch(batch.id)
                    .with_url(&item.url),
            )
            .await;

            match self.pipeline.analyze_url(&item.url).await {
                Ok(outcome) => {
                    item.session_id = Some(outcome.session_id);
                    if outcome.status == SessionStatus::Error {
                        let reason = outcome.error.clone().unwrap_or_else(|| "Unknown error".into());
                        item.status = BatchItemStatus::Failed;
                        item.error_message = Some(reason.clone());
                        batch.error_count += 1;
                        self.log(
                            LogEntry::error(format!("Failed: {label} - {reason}"))
                                .for_batch(batch.id)
                                .for_session(outcome.session_id)
                                .with_url(&item.url),
                        )
                        .await;
                    } else {
                        item.status = BatchItemStatus::Completed;
                        item.events_found = outcome.events_found as i32;
                        batch.success_count += 1;
                        batch.total_events += outcome.events_found as i32;
                        self.log(
                            LogEntry::info(format!(
                                "Success: found {} events for {label}",
                                outcome.events_found
                            ))
                            .for_batch(batch.id)
                            .for_session(outcome.session_id)
                            .with_url(&item.url),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    item.status = BatchItemStatus::Failed;
                    item.error_message = Some(e.to_string());
                    batch.error_count += 1;
                    self.log(
                        LogEntry::error(format!("Failed: {label} - {e}"))
                            .for_batch(batch.id)
                            .with_url(&item.url),
                    )
                    .await;
                }
            }

            item.processed_at = Some(Utc::now());
            self.batches.update_item(&item).await?;

            batch.processed_urls += 1;
            self.batches.update_batch(&batch).await?;
        }

        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(Utc::now());
        self.batches.update_batch(&batch).await?;
        self.log(
            LogEntry::info(format!(
                "Batch finished: {} succeeded, {} failed, {} events",
                batch.success_count, batch.error_count, batch.total_events
            ))
            .for_batch(batch.id),
        )
        .await;

        info!(
            %batch_id,
            succeeded = batch.success_count,
            failed = batch.error_count,
            events = batch.total_events,
            "Batch finished"
        );
        Ok(())
    }

    /// A lost log row should never abort a running batch.
    async fn log(&self, entry: LogEntry) {
        if let Err(e) = self.logs.append(entry).await {
            warn!(error = %e, "Failed to append batch log entry");
        }
    }
}
