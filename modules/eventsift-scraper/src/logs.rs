//! Durable operational trail for batches and sessions, separate from the
//! process logs: these rows are what the admin UI shows per batch run.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use eventsift_common::LogLevel;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub batch_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub url: Option<String>,
}

impl LogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            batch_id: None,
            session_id: None,
            level,
            message: message.into(),
            details: None,
            url: None,
        }
    }

    pub fn for_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn for_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PgLogStore (production)
// ---------------------------------------------------------------------------

pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_logs
                (id, batch_id, session_id, level, message, details, url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.batch_id)
        .bind(entry.session_id)
        .bind(entry.level.to_string())
        .bind(&entry.message)
        .bind(&entry.details)
        .bind(&entry.url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryLogStore (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory log store for testing. Thread-safe.
pub struct MemoryLogStore {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// All appended entries (for test assertions).
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
