//! Scrape session store and dashboard statistics.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use eventsift_common::{ScrapeSession, ScrapeStats, SessionStatus, SessionSummary};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &ScrapeSession) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<ScrapeSession>>;
    /// Full-row update keyed by id; sessions mutate through their lifecycle
    /// and save at each transition.
    async fn update(&self, session: &ScrapeSession) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PgSessionStore (production)
// ---------------------------------------------------------------------------

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &ScrapeSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_sessions
                (id, url, domain, page_content, analysis, extracted_events,
                 status, error_message, method_id, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.id)
        .bind(&session.url)
        .bind(&session.domain)
        .bind(&session.page_content)
        .bind(&session.analysis)
        .bind(&session.extracted_events)
        .bind(session.status.to_string())
        .bind(&session.error_message)
        .bind(session.method_id)
        .bind(session.created_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapeSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, url, domain, page_content, analysis, extracted_events,
                   status, error_message, method_id, created_at, completed_at
            FROM scrape_sessions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_session))
    }

    async fn update(&self, session: &ScrapeSession) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scrape_sessions
            SET page_content = $2, analysis = $3, extracted_events = $4,
                status = $5, error_message = $6, method_id = $7,
                completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(&session.page_content)
        .bind(&session.analysis)
        .bind(&session.extracted_events)
        .bind(session.status.to_string())
        .bind(&session.error_message)
        .bind(session.method_id)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_session(r: sqlx::postgres::PgRow) -> ScrapeSession {
    let status: String = r.get("status");
    ScrapeSession {
        id: r.get("id"),
        url: r.get("url"),
        domain: r.get("domain"),
        page_content: r.get("page_content"),
        analysis: r.get("analysis"),
        extracted_events: r.get("extracted_events"),
        status: SessionStatus::from_str_loose(&status),
        error_message: r.get("error_message"),
        method_id: r.get("method_id"),
        created_at: r.get("created_at"),
        completed_at: r.get("completed_at"),
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Aggregate counters for the dashboard: method and session totals, the
/// share of finished sessions that found events, and recent activity.
pub async fn gather_stats(pool: &PgPool) -> Result<ScrapeStats> {
    let total_methods = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM extraction_methods WHERE active = TRUE",
    )
    .fetch_one(pool)
    .await?
    .0;

    let total_sessions = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM scrape_sessions")
        .fetch_one(pool)
        .await?
        .0;

    let (succeeded, finished) = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status IN ('events_found', 'approved')),
            COUNT(*)
        FROM scrape_sessions
        WHERE status != 'analyzing'
        "#,
    )
    .fetch_one(pool)
    .await?;

    let success_rate = if finished > 0 {
        ((succeeded as f64 / finished as f64) * 100.0).round() as i64
    } else {
        0
    };

    let total_events = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT COALESCE(SUM(jsonb_array_length(extracted_events)), 0)
        FROM scrape_sessions
        WHERE jsonb_typeof(extracted_events) = 'array'
        "#,
    )
    .fetch_one(pool)
    .await?
    .0;

    let recent = sqlx::query_as::<_, (Uuid, String, String, DateTime<Utc>)>(
        r#"
        SELECT id, url, status, created_at
        FROM scrape_sessions
        ORDER BY created_at DESC
        LIMIT 10
        "#,
    )
    .fetch_all(pool)
    .await?;

    let recent_sessions = recent
        .into_iter()
        .map(|(id, url, status, created_at)| SessionSummary {
            id,
            url,
            status: SessionStatus::from_str_loose(&status),
            created_at,
        })
        .collect();

    Ok(ScrapeStats {
        total_methods,
        total_sessions,
        success_rate,
        total_events,
        recent_sessions,
    })
}

// ---------------------------------------------------------------------------
// MemorySessionStore (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory session store for testing. Thread-safe.
pub struct MemorySessionStore {
    sessions: Mutex<Vec<ScrapeSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// All stored sessions (for test assertions).
    pub fn sessions(&self) -> Vec<ScrapeSession> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &ScrapeSession) -> Result<()> {
        self.sessions.lock().unwrap().push(session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScrapeSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn update(&self, session: &ScrapeSession) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session.clone();
        }
        Ok(())
    }
}
