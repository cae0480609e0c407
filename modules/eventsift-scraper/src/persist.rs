//! Event persistence: dedup against the events table, best-effort geocoding,
//! per-event failure isolation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use eventsift_common::NewEvent;
use geocode_client::GeocodeClient;

/// Tallies from persisting one page's worth of events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Insert unless an event with the same (title, start, location) exists.
    /// Returns whether a row was written.
    async fn insert_unless_duplicate(&self, event: &NewEvent, source_url: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// PgEventSink (production)
// ---------------------------------------------------------------------------

pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn insert_unless_duplicate(&self, event: &NewEvent, source_url: &str) -> Result<bool> {
        // Dedup rides on the unique index over (title, start_datetime,
        // location); a separate existence check would race concurrent
        // sessions scraping the same page.
        let result = sqlx::query(
            r#"
            INSERT INTO events
                (title, description, start_datetime, end_datetime, location,
                 address, latitude, longitude, external_url, contact_info, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
            ON CONFLICT (title, start_datetime, location) DO NOTHING
            "#,
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_datetime)
        .bind(event.end_datetime)
        .bind(&event.location)
        .bind(&event.address)
        .bind(event.latitude)
        .bind(event.longitude)
        .bind(&event.external_url)
        .bind(json!({ "source": "AI Scraper", "url": source_url }))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// MemoryEventSink (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory sink for testing; dedups on the same key as the table's unique
/// index. Thread-safe.
pub struct MemoryEventSink {
    events: Mutex<Vec<NewEvent>>,
    fail_titles: Mutex<HashSet<String>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_titles: Mutex::new(HashSet::new()),
        }
    }

    /// All inserted events (for test assertions).
    pub fn events(&self) -> Vec<NewEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Make inserts of this title fail, to exercise failure isolation.
    pub fn fail_title(&self, title: &str) {
        self.fail_titles.lock().unwrap().insert(title.to_string());
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn insert_unless_duplicate(&self, event: &NewEvent, _source_url: &str) -> Result<bool> {
        if self.fail_titles.lock().unwrap().contains(&event.title) {
            anyhow::bail!("simulated insert failure for {}", event.title);
        }

        let mut events = self.events.lock().unwrap();
        if events.iter().any(|e| e.dedup_key() == event.dedup_key()) {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// EventPersister
// ---------------------------------------------------------------------------

/// Saves a page's events: geocode best-effort, insert unless duplicate, and
/// never let one bad event stop the rest.
pub struct EventPersister {
    sink: Arc<dyn EventSink>,
    geocoder: Option<GeocodeClient>,
}

impl EventPersister {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            geocoder: None,
        }
    }

    pub fn with_geocoder(mut self, geocoder: GeocodeClient) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub async fn persist_events(&self, events: &[NewEvent], source_url: &str) -> PersistOutcome {
        let mut outcome = PersistOutcome::default();

        for event in events {
            let mut event = event.clone();
            self.fill_coordinates(&mut event).await;

            match self.sink.insert_unless_duplicate(&event, source_url).await {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => {
                    info!(title = %event.title, "Skipping duplicate event");
                    outcome.duplicates += 1;
                }
                Err(e) => {
                    warn!(title = %event.title, error = %e, "Failed to save event");
                    outcome.failed += 1;
                }
            }
        }

        info!(
            source_url,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            failed = outcome.failed,
            "Persisted extracted events"
        );
        outcome
    }

    /// Geocoding failures only log; the event still persists without
    /// coordinates.
    async fn fill_coordinates(&self, event: &mut NewEvent) {
        let Some(geocoder) = &self.geocoder else {
            return;
        };
        if event.latitude.is_some() && event.longitude.is_some() {
            return;
        }

        let query = event.address.as_deref().unwrap_or(&event.location);
        if query.trim().is_empty() {
            return;
        }

        match geocoder.geocode(query).await {
            Ok(Some(place)) => {
                event.latitude = Some(place.latitude);
                event.longitude = Some(place.longitude);
            }
            Ok(None) => {}
            Err(e) => warn!(query, error = %e, "Geocoding failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(title: &str, location: &str) -> NewEvent {
        NewEvent {
            title: title.to_string(),
            description: None,
            start_datetime: Utc.with_ymd_and_hms(2024, 3, 5, 19, 0, 0).unwrap(),
            end_datetime: None,
            location: location.to_string(),
            address: None,
            latitude: None,
            longitude: None,
            external_url: Some("https://example.com/events/1".to_string()),
        }
    }

    #[tokio::test]
    async fn duplicate_events_are_skipped() {
        let sink = Arc::new(MemoryEventSink::new());
        let persister = EventPersister::new(sink.clone());

        let events = vec![
            event("Jazz Night", "Blue Note"),
            event("Jazz Night", "Blue Note"),
            event("Jazz Night", "Red Room"),
        ];
        let outcome = persister
            .persist_events(&events, "https://example.com/events")
            .await;

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let sink = Arc::new(MemoryEventSink::new());
        sink.fail_title("Poetry Slam");
        let persister = EventPersister::new(sink.clone());

        let events = vec![
            event("Jazz Night", "Blue Note"),
            event("Poetry Slam", "Main Library"),
            event("Open Mic", "Corner Cafe"),
        ];
        let outcome = persister
            .persist_events(&events, "https://example.com/events")
            .await;

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.failed, 1);
        let saved: Vec<String> = sink.events().into_iter().map(|e| e.title).collect();
        assert_eq!(saved, vec!["Jazz Night", "Open Mic"]);
    }

    #[tokio::test]
    async fn dedup_key_ignores_surrounding_whitespace() {
        let sink = Arc::new(MemoryEventSink::new());
        let persister = EventPersister::new(sink.clone());

        let first = event("Jazz Night", "Blue Note");
        let mut second = event("Jazz Night", "Blue Note");
        second.title = "  Jazz Night ".to_string();

        let outcome = persister
            .persist_events(&[first, second], "https://example.com")
            .await;
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn without_geocoder_coordinates_stay_empty() {
        let sink = Arc::new(MemoryEventSink::new());
        let persister = EventPersister::new(sink.clone());

        persister
            .persist_events(&[event("Jazz Night", "Blue Note")], "https://example.com")
            .await;

        let saved = sink.events();
        assert!(saved[0].latitude.is_none());
        assert!(saved[0].longitude.is_none());
    }
}
