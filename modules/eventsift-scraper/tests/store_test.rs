//! Integration tests for the Postgres-backed stores.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use eventsift_common::{
    BatchItemStatus, BatchStatus, MethodKind, NewEvent, ScrapeSession, SelectorMap, SessionStatus,
};
use eventsift_scraper::batch::{new_batch, BatchRow, BatchStore, PgBatchStore};
use eventsift_scraper::logs::{LogEntry, LogStore, PgLogStore};
use eventsift_scraper::methods::{
    MethodDraft, MethodStore, NewSource, PgMethodStore, PgSourceStore, SourceStore,
};
use eventsift_scraper::persist::{EventSink, PgEventSink};
use eventsift_scraper::session::{gather_stats, PgSessionStore, SessionStore};

/// Tests share one database and truncate it on setup; hold this for the
/// whole test body so they run one at a time.
static DB_LOCK: Mutex<()> = Mutex::new(());

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scrape_sessions (
        id               UUID         PRIMARY KEY,
        url              TEXT         NOT NULL,
        domain           TEXT         NOT NULL,
        page_content     TEXT,
        analysis         JSONB,
        extracted_events JSONB,
        status           TEXT         NOT NULL,
        error_message    TEXT,
        method_id        UUID,
        created_at       TIMESTAMPTZ  NOT NULL,
        completed_at     TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS extraction_methods (
        id               UUID         PRIMARY KEY,
        name             TEXT         NOT NULL,
        domain           TEXT         NOT NULL,
        url_pattern      TEXT         NOT NULL,
        method_kind      TEXT         NOT NULL,
        selectors        JSONB,
        extraction_rules JSONB,
        post_processing  JSONB,
        llm_model        TEXT,
        confidence       DOUBLE PRECISION NOT NULL,
        usage_count      INTEGER      NOT NULL DEFAULT 0,
        success_rate     DOUBLE PRECISION NOT NULL DEFAULT 0,
        last_used_at     TIMESTAMPTZ,
        last_success_at  TIMESTAMPTZ,
        test_results     JSONB,
        approved_by      TEXT,
        active           BOOLEAN      NOT NULL DEFAULT TRUE,
        created_at       TIMESTAMPTZ  NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id             BIGSERIAL    PRIMARY KEY,
        title          TEXT         NOT NULL,
        description    TEXT,
        start_datetime TIMESTAMPTZ  NOT NULL,
        end_datetime   TIMESTAMPTZ,
        location       TEXT         NOT NULL,
        address        TEXT,
        latitude       DOUBLE PRECISION,
        longitude      DOUBLE PRECISION,
        external_url   TEXT,
        contact_info   JSONB,
        status         TEXT         NOT NULL,
        created_at     TIMESTAMPTZ  NOT NULL DEFAULT now(),
        UNIQUE (title, start_datetime, location)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_sources (
        id          UUID         PRIMARY KEY,
        name        TEXT         NOT NULL,
        url         TEXT         NOT NULL,
        scrape_kind TEXT         NOT NULL,
        method_id   UUID,
        active      BOOLEAN      NOT NULL DEFAULT TRUE,
        created_by  TEXT,
        created_at  TIMESTAMPTZ  NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scrape_batches (
        id             UUID         PRIMARY KEY,
        filename       TEXT         NOT NULL,
        status         TEXT         NOT NULL,
        total_urls     INTEGER      NOT NULL,
        processed_urls INTEGER      NOT NULL DEFAULT 0,
        success_count  INTEGER      NOT NULL DEFAULT 0,
        error_count    INTEGER      NOT NULL DEFAULT 0,
        total_events   INTEGER      NOT NULL DEFAULT 0,
        created_at     TIMESTAMPTZ  NOT NULL,
        started_at     TIMESTAMPTZ,
        completed_at   TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scrape_batch_items (
        id            UUID         PRIMARY KEY,
        batch_id      UUID         NOT NULL,
        position      INTEGER      NOT NULL,
        title         TEXT,
        url           TEXT         NOT NULL,
        status        TEXT         NOT NULL,
        events_found  INTEGER      NOT NULL DEFAULT 0,
        session_id    UUID,
        error_message TEXT,
        processed_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scrape_logs (
        id         UUID         PRIMARY KEY,
        batch_id   UUID,
        session_id UUID,
        level      TEXT         NOT NULL,
        message    TEXT         NOT NULL,
        details    JSONB,
        url        TEXT,
        created_at TIMESTAMPTZ  NOT NULL
    )
    "#,
];

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    for ddl in SCHEMA {
        sqlx::query(ddl).execute(&pool).await.ok()?;
    }

    // Clean slate for each test
    sqlx::query(
        "TRUNCATE scrape_sessions, extraction_methods, events, event_sources, \
         scrape_batches, scrape_batch_items, scrape_logs RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .ok()?;

    Some(pool)
}

fn draft(domain: &str, confidence: f64) -> MethodDraft {
    MethodDraft {
        name: format!("Auto-generated method for {domain}"),
        domain: domain.to_string(),
        url_pattern: format!("https://{domain}/events/*"),
        method_kind: MethodKind::Selectors,
        selectors: Some(SelectorMap {
            event_container: Some("div.event".into()),
            title: Some("h3".into()),
            ..Default::default()
        }),
        extraction_rules: Some(json!({"event_type": "list"})),
        llm_model: Some("claude-sonnet-4-20250514".into()),
        confidence,
        test_results: Some(json!({"events_found": 2})),
        approved_by: None,
    }
}

fn sample_event(title: &str, location: &str) -> NewEvent {
    NewEvent {
        title: title.to_string(),
        description: Some("A night out".into()),
        start_datetime: Utc.with_ymd_and_hms(2024, 3, 5, 19, 0, 0).unwrap(),
        end_datetime: None,
        location: location.to_string(),
        address: None,
        latitude: None,
        longitude: None,
        external_url: Some("https://example.com/events/1".into()),
    }
}

// =========================================================================
// Sessions
// =========================================================================

#[tokio::test]
async fn session_rows_round_trip() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgSessionStore::new(pool);

    let mut session = ScrapeSession::started("https://example.com/events");
    store.insert(&session).await.unwrap();

    let loaded = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.url, "https://example.com/events");
    assert_eq!(loaded.domain, "example.com");
    assert_eq!(loaded.status, SessionStatus::Analyzing);
    assert!(loaded.completed_at.is_none());

    session.status = SessionStatus::EventsFound;
    session.page_content = Some("<html/>".into());
    session.analysis = Some(json!({"has_events": true}));
    session.extracted_events = Some(json!([{"title": "Jazz Night"}]));
    session.completed_at = Some(Utc::now());
    store.update(&session).await.unwrap();

    let updated = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(updated.status, SessionStatus::EventsFound);
    assert_eq!(updated.events_found(), 1);
    assert!(updated.page_content.is_some());
    assert!(updated.completed_at.is_some());

    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

// =========================================================================
// Methods
// =========================================================================

#[tokio::test]
async fn method_lookup_prefers_confidence_and_skips_inactive() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgMethodStore::new(pool.clone());

    let low = store.insert(draft("venue.example", 0.5)).await.unwrap();
    let high = store.insert(draft("venue.example", 0.9)).await.unwrap();
    store.insert(draft("other.example", 0.99)).await.unwrap();

    let found = store
        .find_for_domain("venue.example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, high.id);
    assert_eq!(found.method_kind, MethodKind::Selectors);
    assert!(found.selectors.is_some());

    sqlx::query("UPDATE extraction_methods SET active = FALSE WHERE id = $1")
        .bind(high.id)
        .execute(&pool)
        .await
        .unwrap();

    let found = store
        .find_for_domain("venue.example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, low.id);

    assert!(store
        .find_for_domain("unknown.example")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn method_lookup_breaks_confidence_ties_by_recent_success() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgMethodStore::new(pool.clone());

    let stale = store.insert(draft("tie.example", 0.8)).await.unwrap();
    let fresh = store.insert(draft("tie.example", 0.8)).await.unwrap();

    sqlx::query(
        "UPDATE extraction_methods SET last_success_at = NOW() - INTERVAL '7 days' WHERE id = $1",
    )
    .bind(stale.id)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("UPDATE extraction_methods SET last_success_at = NOW() WHERE id = $1")
        .bind(fresh.id)
        .execute(&pool)
        .await
        .unwrap();

    let found = store.find_for_domain("tie.example").await.unwrap().unwrap();
    assert_eq!(found.id, fresh.id);

    // A method that has never succeeded sorts after any that has, even when
    // it is newer.
    store.insert(draft("tie.example", 0.8)).await.unwrap();
    let found = store.find_for_domain("tie.example").await.unwrap().unwrap();
    assert_eq!(found.id, fresh.id);
}

#[tokio::test]
async fn record_usage_folds_outcomes_into_the_average() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgMethodStore::new(pool);

    let method = store.insert(draft("avg.example", 0.7)).await.unwrap();
    assert_eq!(method.usage_count, 0);
    assert_eq!(method.success_rate, 0.0);

    store.record_usage(method.id, true).await.unwrap();
    let m = store.get(method.id).await.unwrap().unwrap();
    assert_eq!(m.usage_count, 1);
    assert_eq!(m.success_rate, 100.0);
    assert!(m.last_used_at.is_some());
    assert!(m.last_success_at.is_some());

    store.record_usage(method.id, false).await.unwrap();
    let m = store.get(method.id).await.unwrap().unwrap();
    assert_eq!(m.usage_count, 2);
    assert_eq!(m.success_rate, 50.0);
    let success_stamp = m.last_success_at;

    store.record_usage(method.id, false).await.unwrap();
    let m = store.get(method.id).await.unwrap().unwrap();
    assert_eq!(m.usage_count, 3);
    assert!((m.success_rate - 100.0 / 3.0).abs() < 1e-9);
    // A failure never advances the success stamp.
    assert_eq!(m.last_success_at, success_stamp);
}

// =========================================================================
// Events
// =========================================================================

#[tokio::test]
async fn duplicate_events_do_not_insert_twice() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let sink = PgEventSink::new(pool.clone());

    let inserted = sink
        .insert_unless_duplicate(&sample_event("Jazz Night", "Blue Note"), "https://example.com")
        .await
        .unwrap();
    assert!(inserted);

    let inserted = sink
        .insert_unless_duplicate(&sample_event("Jazz Night", "Blue Note"), "https://example.com")
        .await
        .unwrap();
    assert!(!inserted);

    // Same title and start at a different venue is a different event.
    let inserted = sink
        .insert_unless_duplicate(&sample_event("Jazz Night", "Red Room"), "https://example.com")
        .await
        .unwrap();
    assert!(inserted);

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let (status, contact): (String, serde_json::Value) =
        sqlx::query_as("SELECT status, contact_info FROM events LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "pending");
    assert_eq!(contact["source"], "AI Scraper");
    assert_eq!(contact["url"], "https://example.com");
}

// =========================================================================
// Sources
// =========================================================================

#[tokio::test]
async fn registered_sources_are_intelligent_and_active() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgSourceStore::new(pool.clone());

    let method_id = Uuid::new_v4();
    let id = store
        .register(NewSource {
            name: "Auto-generated method for venue.example".into(),
            url: "https://venue.example/events".into(),
            method_id,
            created_by: Some("ops@example.com".into()),
        })
        .await
        .unwrap();

    let (name, kind, active, created_by): (String, String, bool, Option<String>) =
        sqlx::query_as(
            "SELECT name, scrape_kind, active, created_by FROM event_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(name, "Auto-generated method for venue.example");
    assert_eq!(kind, "intelligent");
    assert!(active);
    assert_eq!(created_by.as_deref(), Some("ops@example.com"));
}

// =========================================================================
// Batches
// =========================================================================

#[tokio::test]
async fn batch_rows_round_trip_with_item_updates() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgBatchStore::new(pool);

    let rows = vec![
        BatchRow {
            title: Some("Good venue".into()),
            url: "https://example.com/a".into(),
        },
        BatchRow {
            title: None,
            url: "https://example.com/b".into(),
        },
    ];
    let (mut batch, mut items) = new_batch("venues.csv", &rows);
    store.insert(&batch, &items).await.unwrap();

    let loaded = store.get(batch.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::Queued);
    assert_eq!(loaded.total_urls, 2);
    assert_eq!(loaded.filename, "venues.csv");

    items[0].status = BatchItemStatus::Completed;
    items[0].events_found = 3;
    items[0].session_id = Some(Uuid::new_v4());
    items[0].processed_at = Some(Utc::now());
    store.update_item(&items[0]).await.unwrap();

    batch.status = BatchStatus::Completed;
    batch.processed_urls = 2;
    batch.success_count = 1;
    batch.error_count = 1;
    batch.total_events = 3;
    batch.started_at = Some(Utc::now());
    batch.completed_at = Some(Utc::now());
    store.update_batch(&batch).await.unwrap();

    let loaded = store.get(batch.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::Completed);
    assert_eq!(loaded.total_events, 3);
    assert!(loaded.completed_at.is_some());

    let items = store.items(batch.id).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].position, 0);
    assert_eq!(items[0].status, BatchItemStatus::Completed);
    assert_eq!(items[0].events_found, 3);
    assert!(items[0].session_id.is_some());
    assert_eq!(items[1].status, BatchItemStatus::Pending);
}

// =========================================================================
// Logs
// =========================================================================

#[tokio::test]
async fn log_entries_carry_scope_details_and_url() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgLogStore::new(pool.clone());

    let batch_id = Uuid::new_v4();
    store
        .append(
            LogEntry::warning("Failed: broken page")
                .for_batch(batch_id)
                .with_details(json!({"status": 404}))
                .with_url("https://example.com/broken"),
        )
        .await
        .unwrap();

    let (level, message, details, url): (String, String, Option<serde_json::Value>, Option<String>) =
        sqlx::query_as(
            "SELECT level, message, details, url FROM scrape_logs WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(level, "warning");
    assert!(message.contains("Failed"));
    assert_eq!(details.unwrap()["status"], 404);
    assert_eq!(url.as_deref(), Some("https://example.com/broken"));
}

// =========================================================================
// Stats
// =========================================================================

#[tokio::test]
async fn stats_summarize_methods_sessions_and_events() {
    let _guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pool) = test_pool().await else {
        return;
    };
    let sessions = PgSessionStore::new(pool.clone());
    let methods = PgMethodStore::new(pool.clone());

    methods.insert(draft("stats.example", 0.8)).await.unwrap();

    let mut found = ScrapeSession::started("https://stats.example/events");
    found.status = SessionStatus::EventsFound;
    found.extracted_events = Some(json!([{"title": "A"}, {"title": "B"}]));
    found.completed_at = Some(Utc::now());
    sessions.insert(&found).await.unwrap();

    let mut empty = ScrapeSession::started("https://stats.example/news");
    empty.status = SessionStatus::NoEvents;
    empty.completed_at = Some(Utc::now());
    sessions.insert(&empty).await.unwrap();

    // Still analyzing: counts toward totals but not toward the success rate.
    let running = ScrapeSession::started("https://stats.example/live");
    sessions.insert(&running).await.unwrap();

    let stats = gather_stats(&pool).await.unwrap();
    assert_eq!(stats.total_methods, 1);
    assert_eq!(stats.total_sessions, 3);
    assert_eq!(stats.success_rate, 50);
    assert_eq!(stats.total_events, 2);
    assert_eq!(stats.recent_sessions.len(), 3);
}
