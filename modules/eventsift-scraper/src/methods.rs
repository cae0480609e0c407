//! Extraction method store: reusable per-domain extraction configuration.
//!
//! A method is born when a reviewer approves a session; from then on every
//! page on that domain tries the stored method before paying for a model
//! call. Reapplications fold into a running success average.

use std::cmp::Ordering;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use eventsift_common::{ExtractionMethod, MethodKind, ScrapeSession, SelectorMap};

use crate::links::generalize_url_pattern;

/// Fold one outcome into the lifetime success average (0–100 scale):
/// `((rate * count) + outcome) / (count + 1)` with outcome 100 or 0.
pub fn updated_success_rate(current: f64, usage_count: i32, success: bool) -> f64 {
    let outcome = if success { 100.0 } else { 0.0 };
    ((current * usage_count as f64) + outcome) / (usage_count as f64 + 1.0)
}

/// Everything needed to persist a new method; counters start at zero.
#[derive(Debug, Clone)]
pub struct MethodDraft {
    pub name: String,
    pub domain: String,
    pub url_pattern: String,
    pub method_kind: MethodKind,
    pub selectors: Option<SelectorMap>,
    pub extraction_rules: Option<serde_json::Value>,
    pub llm_model: Option<String>,
    pub confidence: f64,
    pub test_results: Option<serde_json::Value>,
    pub approved_by: Option<String>,
}

/// Build a method draft from an approved session's stored analysis.
///
/// Selector-bearing analyses become `selectors` methods; the rest fall back
/// to `llm`, meaning future pages on the domain go through the model again.
pub fn build_method(
    session: &ScrapeSession,
    model: &str,
    approved_by: Option<String>,
) -> MethodDraft {
    let analysis = session.analysis.as_ref();

    let selectors: Option<SelectorMap> = analysis
        .and_then(|a| a.get("selectors"))
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .filter(|map: &SelectorMap| !map.is_empty());

    let method_kind = if selectors.is_some() {
        MethodKind::Selectors
    } else {
        MethodKind::Llm
    };

    let extraction_rules = analysis.map(|a| {
        json!({
            "event_type": a.get("event_type").cloned().unwrap_or(json!("list")),
            "patterns": a.get("patterns").cloned().unwrap_or(json!(null)),
        })
    });

    let confidence = analysis
        .and_then(|a| a.get("confidence"))
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.5);

    MethodDraft {
        name: format!("Auto-generated method for {}", session.domain),
        domain: session.domain.clone(),
        url_pattern: generalize_url_pattern(&session.url),
        method_kind,
        selectors,
        extraction_rules,
        llm_model: Some(model.to_string()),
        confidence,
        test_results: Some(json!({
            "events_found": session.events_found(),
            "tested_at": Utc::now(),
        })),
        approved_by,
    }
}

#[async_trait]
pub trait MethodStore: Send + Sync {
    /// Best active method for a domain: highest confidence first, ties broken
    /// by most recent success, then newest.
    async fn find_for_domain(&self, domain: &str) -> Result<Option<ExtractionMethod>>;

    async fn get(&self, id: Uuid) -> Result<Option<ExtractionMethod>>;

    async fn insert(&self, draft: MethodDraft) -> Result<ExtractionMethod>;

    /// Bump usage counters and fold one outcome into the running average.
    async fn record_usage(&self, id: Uuid, success: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PgMethodStore (production)
// ---------------------------------------------------------------------------

pub struct PgMethodStore {
    pool: PgPool,
}

impl PgMethodStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MethodStore for PgMethodStore {
    async fn find_for_domain(&self, domain: &str) -> Result<Option<ExtractionMethod>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, domain, url_pattern, method_kind, selectors,
                   extraction_rules, post_processing, llm_model, confidence,
                   usage_count, success_rate, last_used_at, last_success_at,
                   test_results, approved_by, active, created_at
            FROM extraction_methods
            WHERE domain = $1 AND active = TRUE
            ORDER BY confidence DESC, last_success_at DESC NULLS LAST, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_method))
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExtractionMethod>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, domain, url_pattern, method_kind, selectors,
                   extraction_rules, post_processing, llm_model, confidence,
                   usage_count, success_rate, last_used_at, last_success_at,
                   test_results, approved_by, active, created_at
            FROM extraction_methods
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_method))
    }

    async fn insert(&self, draft: MethodDraft) -> Result<ExtractionMethod> {
        let method = method_from_draft(draft);

        sqlx::query(
            r#"
            INSERT INTO extraction_methods
                (id, name, domain, url_pattern, method_kind, selectors,
                 extraction_rules, llm_model, confidence, usage_count,
                 success_rate, test_results, approved_by, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0.0, $10, $11, TRUE, $12)
            "#,
        )
        .bind(method.id)
        .bind(&method.name)
        .bind(&method.domain)
        .bind(&method.url_pattern)
        .bind(method.method_kind.to_string())
        .bind(
            method
                .selectors
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(&method.extraction_rules)
        .bind(&method.llm_model)
        .bind(method.confidence)
        .bind(&method.test_results)
        .bind(&method.approved_by)
        .bind(method.created_at)
        .execute(&self.pool)
        .await?;

        Ok(method)
    }

    async fn record_usage(&self, id: Uuid, success: bool) -> Result<()> {
        let outcome = if success { 100.0f64 } else { 0.0f64 };

        sqlx::query(
            r#"
            UPDATE extraction_methods
            SET usage_count = usage_count + 1,
                last_used_at = NOW(),
                success_rate = ((success_rate * usage_count) + $2) / (usage_count + 1),
                last_success_at = CASE WHEN $3 THEN NOW() ELSE last_success_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome)
        .bind(success)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn method_from_draft(draft: MethodDraft) -> ExtractionMethod {
    ExtractionMethod {
        id: Uuid::new_v4(),
        name: draft.name,
        domain: draft.domain,
        url_pattern: draft.url_pattern,
        method_kind: draft.method_kind,
        selectors: draft.selectors,
        extraction_rules: draft.extraction_rules,
        post_processing: None,
        llm_model: draft.llm_model,
        confidence: draft.confidence,
        usage_count: 0,
        success_rate: 0.0,
        last_used_at: None,
        last_success_at: None,
        test_results: draft.test_results,
        approved_by: draft.approved_by,
        active: true,
        created_at: Utc::now(),
    }
}

fn row_to_method(r: sqlx::postgres::PgRow) -> ExtractionMethod {
    let method_kind: String = r.get("method_kind");
    let selectors: Option<serde_json::Value> = r.get("selectors");

    ExtractionMethod {
        id: r.get("id"),
        name: r.get("name"),
        domain: r.get("domain"),
        url_pattern: r.get("url_pattern"),
        method_kind: MethodKind::from_str_loose(&method_kind),
        selectors: selectors.and_then(|v| serde_json::from_value(v).ok()),
        extraction_rules: r.get("extraction_rules"),
        post_processing: r.get("post_processing"),
        llm_model: r.get("llm_model"),
        confidence: r.get("confidence"),
        usage_count: r.get("usage_count"),
        success_rate: r.get("success_rate"),
        last_used_at: r.get("last_used_at"),
        last_success_at: r.get("last_success_at"),
        test_results: r.get("test_results"),
        approved_by: r.get("approved_by"),
        active: r.get("active"),
        created_at: r.get("created_at"),
    }
}

// ---------------------------------------------------------------------------
// MemoryMethodStore (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory method store for testing. Thread-safe.
pub struct MemoryMethodStore {
    methods: Mutex<Vec<ExtractionMethod>>,
}

impl MemoryMethodStore {
    pub fn new() -> Self {
        Self {
            methods: Mutex::new(Vec::new()),
        }
    }

    /// All stored methods (for test assertions).
    pub fn methods(&self) -> Vec<ExtractionMethod> {
        self.methods.lock().unwrap().clone()
    }
}

fn priority_order(a: &ExtractionMethod, b: &ExtractionMethod) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.last_success_at.cmp(&a.last_success_at))
        .then_with(|| b.created_at.cmp(&a.created_at))
}

#[async_trait]
impl MethodStore for MemoryMethodStore {
    async fn find_for_domain(&self, domain: &str) -> Result<Option<ExtractionMethod>> {
        let mut candidates: Vec<ExtractionMethod> = self
            .methods
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.domain == domain && m.active)
            .cloned()
            .collect();
        candidates.sort_by(priority_order);
        Ok(candidates.into_iter().next())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExtractionMethod>> {
        Ok(self
            .methods
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn insert(&self, draft: MethodDraft) -> Result<ExtractionMethod> {
        let method = method_from_draft(draft);
        self.methods.lock().unwrap().push(method.clone());
        Ok(method)
    }

    async fn record_usage(&self, id: Uuid, success: bool) -> Result<()> {
        let mut methods = self.methods.lock().unwrap();
        if let Some(method) = methods.iter_mut().find(|m| m.id == id) {
            method.success_rate =
                updated_success_rate(method.success_rate, method.usage_count, success);
            method.usage_count += 1;
            method.last_used_at = Some(Utc::now());
            if success {
                method.last_success_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source registration
// ---------------------------------------------------------------------------

/// Registration of an approved URL as a recurring scrape source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub method_id: Uuid,
    pub created_by: Option<String>,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Returns the new source's id.
    async fn register(&self, source: NewSource) -> Result<Uuid>;
}

pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn register(&self, source: NewSource) -> Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO event_sources
                (id, name, url, scrape_kind, method_id, active, created_by, created_at)
            VALUES ($1, $2, $3, 'intelligent', $4, TRUE, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.method_id)
        .bind(&source.created_by)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

/// In-memory source store for testing. Thread-safe.
pub struct MemorySourceStore {
    sources: Mutex<Vec<(Uuid, NewSource)>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
        }
    }

    /// All registered sources (for test assertions).
    pub fn sources(&self) -> Vec<(Uuid, NewSource)> {
        self.sources.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn register(&self, source: NewSource) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.sources.lock().unwrap().push((id, source));
        Ok(id)
    }
}
