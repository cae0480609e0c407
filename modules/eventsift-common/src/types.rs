//! Shared domain types: sessions, extraction methods, events, batches.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one scrape session (one attempt to analyze one URL).
///
/// `analyzing → {events_found, no_events, error}`, and `events_found →
/// approved`. Re-analysis of the same URL starts a new session rather than
/// reusing an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Analyzing,
    EventsFound,
    NoEvents,
    Error,
    Approved,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Analyzing => write!(f, "analyzing"),
            SessionStatus::EventsFound => write!(f, "events_found"),
            SessionStatus::NoEvents => write!(f, "no_events"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Approved => write!(f, "approved"),
        }
    }
}

impl SessionStatus {
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "events_found" => Self::EventsFound,
            "no_events" => Self::NoEvents,
            "error" => Self::Error,
            "approved" => Self::Approved,
            _ => Self::Analyzing,
        }
    }

    /// Sessions that finished and produced something reviewable or approved.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::EventsFound | Self::Approved)
    }

    /// Only `events_found` sessions can be approved into a method.
    pub fn can_approve(&self) -> bool {
        matches!(self, Self::EventsFound)
    }
}

/// How an extraction method pulls events out of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Stored CSS selector map applied directly.
    Selectors,
    /// No usable selectors; reanalysis goes through the LLM.
    Llm,
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodKind::Selectors => write!(f, "selectors"),
            MethodKind::Llm => write!(f, "llm"),
        }
    }
}

impl MethodKind {
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "selectors" => Self::Selectors,
            _ => Self::Llm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Queued => write!(f, "queued"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
        }
    }
}

impl BatchStatus {
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for BatchItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchItemStatus::Pending => write!(f, "pending"),
            BatchItemStatus::Completed => write!(f, "completed"),
            BatchItemStatus::Failed => write!(f, "failed"),
        }
    }
}

impl BatchItemStatus {
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Operational log level for batch/session trail rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// CSS selector map an analysis proposes and an approved method stores.
///
/// Every field is optional; a missing or uncompilable selector degrades to
/// "field absent" at application time rather than failing the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SelectorMap {
    /// Selector matching one element per event on the page.
    pub event_container: Option<String>,
    pub title: Option<String>,
    pub date: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    /// Selector for the per-event detail link; `href` is taken and resolved
    /// against the page URL.
    pub link: Option<String>,
}

impl SelectorMap {
    pub fn is_empty(&self) -> bool {
        self.event_container.is_none()
            && self.title.is_none()
            && self.date.is_none()
            && self.location.is_none()
            && self.description.is_none()
            && self.link.is_none()
    }
}

/// One attempt to analyze one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: Uuid,
    pub url: String,
    pub domain: String,
    /// Raw HTML snapshot of the fetched page, kept for review/debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_content: Option<String>,
    pub analysis: Option<serde_json::Value>,
    pub extracted_events: Option<serde_json::Value>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub method_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScrapeSession {
    /// Fresh session in `analyzing` state for a URL.
    pub fn started(url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            domain: domain_of(url).unwrap_or_default(),
            page_content: None,
            analysis: None,
            extracted_events: None,
            status: SessionStatus::Analyzing,
            error_message: None,
            method_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// How many events this session extracted, per the stored JSON array.
    pub fn events_found(&self) -> usize {
        self.extracted_events
            .as_ref()
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    }
}

/// Reusable, domain-scoped extraction configuration created at approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMethod {
    pub id: Uuid,
    pub name: String,
    pub domain: String,
    /// Generalized URL pattern: digit runs replaced with `*`.
    pub url_pattern: String,
    pub method_kind: MethodKind,
    pub selectors: Option<SelectorMap>,
    pub extraction_rules: Option<serde_json::Value>,
    pub post_processing: Option<serde_json::Value>,
    pub llm_model: Option<String>,
    pub confidence: f64,
    pub usage_count: i32,
    /// Running average over reapplications, 0–100.
    pub success_rate: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub test_results: Option<serde_json::Value>,
    pub approved_by: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Normalized event record ready for persistence. Coordinates start empty
/// and are filled by best-effort geocoding just before insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub description: Option<String>,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub location: String,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub external_url: Option<String>,
}

impl NewEvent {
    /// Dedup key shared with the events table: (title, start, location).
    pub fn dedup_key(&self) -> (String, DateTime<Utc>, String) {
        (
            self.title.trim().to_string(),
            self.start_datetime,
            self.location.trim().to_string(),
        )
    }
}

/// A CSV batch upload of URLs to analyze.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeBatch {
    pub id: Uuid,
    pub filename: String,
    pub status: BatchStatus,
    pub total_urls: i32,
    pub processed_urls: i32,
    pub success_count: i32,
    pub error_count: i32,
    pub total_events: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One URL within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub position: i32,
    pub title: Option<String>,
    pub url: String,
    pub status: BatchItemStatus,
    pub events_found: i32,
    pub session_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Compact session row for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub url: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// Aggregates for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeStats {
    pub total_methods: i64,
    pub total_sessions: i64,
    /// Percentage of finished sessions that found events or were approved.
    pub success_rate: i64,
    /// Sum of extracted-event counts across all sessions.
    pub total_events: i64,
    pub recent_sessions: Vec<SessionSummary>,
}

/// Lowercased host of a URL, the key for method lookup.
pub fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// Absolute http(s) URL check used at every submission boundary.
pub fn is_valid_scrape_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips_db_strings() {
        for status in [
            SessionStatus::Analyzing,
            SessionStatus::EventsFound,
            SessionStatus::NoEvents,
            SessionStatus::Error,
            SessionStatus::Approved,
        ] {
            assert_eq!(SessionStatus::from_str_loose(&status.to_string()), status);
        }
    }

    #[test]
    fn only_events_found_can_approve() {
        assert!(SessionStatus::EventsFound.can_approve());
        assert!(!SessionStatus::Analyzing.can_approve());
        assert!(!SessionStatus::NoEvents.can_approve());
        assert!(!SessionStatus::Error.can_approve());
        assert!(!SessionStatus::Approved.can_approve());
    }

    #[test]
    fn success_covers_found_and_approved() {
        assert!(SessionStatus::EventsFound.is_success());
        assert!(SessionStatus::Approved.is_success());
        assert!(!SessionStatus::NoEvents.is_success());
        assert!(!SessionStatus::Error.is_success());
    }

    #[test]
    fn domain_of_lowercases_host() {
        assert_eq!(
            domain_of("https://Events.Example.COM/calendar?page=2"),
            Some("events.example.com".to_string())
        );
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn scrape_url_validation_requires_http_host() {
        assert!(is_valid_scrape_url("https://example.com/events"));
        assert!(is_valid_scrape_url("http://example.com"));
        assert!(!is_valid_scrape_url("ftp://example.com/file"));
        assert!(!is_valid_scrape_url("example.com/events"));
        assert!(!is_valid_scrape_url(""));
    }

    #[test]
    fn started_session_captures_domain() {
        let session = ScrapeSession::started("https://www.townevents.org/calendar");
        assert_eq!(session.domain, "www.townevents.org");
        assert_eq!(session.status, SessionStatus::Analyzing);
        assert!(session.completed_at.is_none());
    }

    #[test]
    fn events_found_counts_stored_array() {
        let mut session = ScrapeSession::started("https://example.com");
        assert_eq!(session.events_found(), 0);
        session.extracted_events = Some(serde_json::json!([{"title": "a"}, {"title": "b"}]));
        assert_eq!(session.events_found(), 2);
    }

    #[test]
    fn empty_selector_map_is_empty() {
        assert!(SelectorMap::default().is_empty());
        let map = SelectorMap {
            title: Some("h3.title".to_string()),
            ..Default::default()
        };
        assert!(!map.is_empty());
    }
}
