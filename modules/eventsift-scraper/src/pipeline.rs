//! The scrape pipeline: session lifecycle from URL to persisted events.
//!
//! Flow for a fresh URL: fetch, model analysis, extraction (inline events,
//! detail-page follow-up, or proposed selectors), normalization, persistence.
//! Domains with an approved method skip the model and replay the stored
//! selectors. Every attempt is recorded as a session; only `events_found`
//! sessions can be approved into a method.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eventsift_common::{
    is_valid_scrape_url, MethodKind, NewEvent, ScrapeError, ScrapeResult, ScrapeSession,
    SessionStatus,
};

use crate::analyze::{ContentAnalyzer, DetailEvent, RawEvent};
use crate::fetch::PageFetcher;
use crate::links::{bound_event_links, resolve_href};
use crate::methods::{build_method, MethodStore, NewSource, SourceStore};
use crate::normalize::normalize_event_datetime;
use crate::persist::EventPersister;
use crate::selectors::apply_selector_map;
use crate::session::SessionStore;

/// Immutable dependencies for the scrape pipeline.
pub struct PipelineDeps {
    pub fetcher: Arc<dyn PageFetcher>,
    pub analyzer: Arc<dyn ContentAnalyzer>,
    pub sessions: Arc<dyn SessionStore>,
    pub methods: Arc<dyn MethodStore>,
    pub sources: Arc<dyn SourceStore>,
    pub persister: EventPersister,
}

/// What one analysis run produced, as reported to API callers. `events`
/// echoes the extracted rows so reviewers can inspect them before approving.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub events_found: usize,
    pub events: serde_json::Value,
    pub inserted: usize,
    pub duplicates: usize,
    pub used_method: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApproveOutcome {
    pub method_id: Uuid,
    pub source_id: Uuid,
}

/// Dry-run result of a stored method against a URL.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub method_id: Uuid,
    pub url: String,
    pub events_found: usize,
    pub events: Vec<RawEvent>,
}

pub struct ScrapePipeline {
    fetcher: Arc<dyn PageFetcher>,
    analyzer: Arc<dyn ContentAnalyzer>,
    sessions: Arc<dyn SessionStore>,
    methods: Arc<dyn MethodStore>,
    sources: Arc<dyn SourceStore>,
    persister: EventPersister,
}

impl ScrapePipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            fetcher: deps.fetcher,
            analyzer: deps.analyzer,
            sessions: deps.sessions,
            methods: deps.methods,
            sources: deps.sources,
            persister: deps.persister,
        }
    }

    /// Analyze one URL end to end. A session row always survives the
    /// attempt: failures after session creation land as `error` status with
    /// the message stored, not as an HTTP-level failure.
    pub async fn analyze_url(&self, url: &str) -> ScrapeResult<AnalyzeOutcome> {
        if !is_valid_scrape_url(url) {
            return Err(ScrapeError::InvalidUrl(url.to_string()));
        }

        let mut session = ScrapeSession::started(url);
        self.sessions.insert(&session).await?;
        info!(session_id = %session.id, url, domain = %session.domain, "Analysis session started");

        match self.run_analysis(&mut session).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Analysis failed");
                session.status = SessionStatus::Error;
                session.error_message = Some(e.to_string());
                session.completed_at = Some(Utc::now());
                self.sessions.update(&session).await?;

                Ok(AnalyzeOutcome {
                    session_id: session.id,
                    status: session.status,
                    events_found: 0,
                    events: serde_json::Value::Array(Vec::new()),
                    inserted: 0,
                    duplicates: 0,
                    used_method: session.method_id,
                    error: session.error_message.clone(),
                })
            }
        }
    }

    /// Turn an `events_found` session into a reusable method plus a source
    /// registration for the scraped URL.
    pub async fn approve(
        &self,
        session_id: Uuid,
        approved_by: Option<String>,
    ) -> ScrapeResult<ApproveOutcome> {
        let mut session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(ScrapeError::SessionNotFound(session_id))?;

        if !session.status.can_approve() {
            return Err(ScrapeError::NotApprovable {
                id: session_id,
                status: session.status,
            });
        }

        let draft = build_method(&session, self.analyzer.model(), approved_by.clone());
        let method = self.methods.insert(draft).await?;

        let source_id = self
            .sources
            .register(NewSource {
                name: method.name.clone(),
                url: session.url.clone(),
                method_id: method.id,
                created_by: approved_by,
            })
            .await?;

        session.method_id = Some(method.id);
        session.status = SessionStatus::Approved;
        session.completed_at = Some(Utc::now());
        self.sessions.update(&session).await?;

        info!(
            %session_id,
            method_id = %method.id,
            %source_id,
            kind = %method.method_kind,
            "Session approved into extraction method"
        );

        Ok(ApproveOutcome {
            method_id: method.id,
            source_id,
        })
    }

    /// Dry-run a stored method against a URL: extraction only, no session,
    /// no persistence, no usage counters.
    pub async fn test_method(&self, method_id: Uuid, url: &str) -> ScrapeResult<TestOutcome> {
        if !is_valid_scrape_url(url) {
            return Err(ScrapeError::InvalidUrl(url.to_string()));
        }

        let method = self
            .methods
            .get(method_id)
            .await?
            .ok_or(ScrapeError::MethodNotFound(method_id))?;

        let page = self
            .fetcher
            .fetch(url)
            .await
            .map_err(anyhow::Error::new)?;

        let events = match (method.method_kind, &method.selectors) {
            (MethodKind::Selectors, Some(map)) => apply_selector_map(&page.html, map, &page.url),
            _ => {
                let analysis = self
                    .analyzer
                    .analyze_listing(&page.url, &page.html)
                    .await
                    .map_err(ScrapeError::Other)?;
                analysis.events
            }
        };

        info!(%method_id, url, events = events.len(), "Method dry-run finished");

        Ok(TestOutcome {
            method_id,
            url: url.to_string(),
            events_found: events.len(),
            events,
        })
    }

    async fn run_analysis(&self, session: &mut ScrapeSession) -> Result<AnalyzeOutcome> {
        if let Some(method) = self.methods.find_for_domain(&session.domain).await? {
            return self.apply_method(session, method).await;
        }
        self.analyze_fresh(session).await
    }

    /// Replay a stored method. Selector methods skip the model entirely;
    /// llm-kind methods mark domains known to need a model pass, which still
    /// counts toward the method's usage stats.
    async fn apply_method(
        &self,
        session: &mut ScrapeSession,
        method: eventsift_common::ExtractionMethod,
    ) -> Result<AnalyzeOutcome> {
        session.method_id = Some(method.id);
        info!(
            session_id = %session.id,
            method_id = %method.id,
            kind = %method.method_kind,
            confidence = method.confidence,
            "Applying stored extraction method"
        );

        let page = self.fetcher.fetch(&session.url).await?;
        session.page_content = Some(page.html.clone());

        let raw = match (method.method_kind, &method.selectors) {
            (MethodKind::Selectors, Some(map)) => apply_selector_map(&page.html, map, &page.url),
            _ => {
                let analysis = self.analyzer.analyze_listing(&page.url, &page.html).await?;
                session.analysis = Some(serde_json::to_value(&analysis)?);
                analysis.events
            }
        };

        self.methods
            .record_usage(method.id, !raw.is_empty())
            .await?;

        session.extracted_events = Some(serde_json::to_value(&raw)?);
        let events = build_from_raw(&raw, &page.url, Utc::now());
        self.finish_with_events(session, &page.url, events).await
    }

    async fn analyze_fresh(&self, session: &mut ScrapeSession) -> Result<AnalyzeOutcome> {
        let page = self.fetcher.fetch(&session.url).await?;
        session.page_content = Some(page.html.clone());

        let analysis = self.analyzer.analyze_listing(&page.url, &page.html).await?;
        session.analysis = Some(serde_json::to_value(&analysis)?);

        if !analysis.has_events {
            return self.finish_no_events(session).await;
        }

        // Events readable straight off the listing.
        if !analysis.events.is_empty() {
            session.extracted_events = Some(serde_json::to_value(&analysis.events)?);
            let events = build_from_raw(&analysis.events, &page.url, Utc::now());
            return self.finish_with_events(session, &page.url, events).await;
        }

        // Sparse listing pointing at per-event pages.
        if !analysis.event_links.is_empty() {
            let details = self.collect_details(&analysis.event_links, &page.url).await;
            if !details.is_empty() {
                let extracted: Vec<&DetailEvent> = details.iter().map(|(_, d)| d).collect();
                session.extracted_events = Some(serde_json::to_value(&extracted)?);
                let events = build_from_details(&details, Utc::now());
                return self.finish_with_events(session, &page.url, events).await;
            }
        }

        // Last resort: run the proposed selectors against the same page.
        if let Some(map) = &analysis.selectors {
            let raw = apply_selector_map(&page.html, map, &page.url);
            if !raw.is_empty() {
                session.extracted_events = Some(serde_json::to_value(&raw)?);
                let events = build_from_raw(&raw, &page.url, Utc::now());
                return self.finish_with_events(session, &page.url, events).await;
            }
        }

        self.finish_no_events(session).await
    }

    /// Fetch up to the link cap of detail pages; one bad link logs and skips
    /// rather than failing the session. Each extracted event keeps the URL
    /// it came from.
    async fn collect_details(&self, links: &[String], base_url: &str) -> Vec<(String, DetailEvent)> {
        let links = bound_event_links(links, base_url);
        let mut details = Vec::new();

        for link in links {
            match self.fetch_detail(&link).await {
                Ok(Some(detail)) => details.push((link, detail)),
                Ok(None) => debug!(url = %link, "Detail page is not an event"),
                Err(e) => warn!(url = %link, error = %e, "Detail page failed, skipping"),
            }
        }
        details
    }

    async fn fetch_detail(&self, url: &str) -> Result<Option<DetailEvent>> {
        let page = self.fetcher.fetch(url).await?;
        self.analyzer.extract_detail(&page.url, &page.html).await
    }

    async fn finish_with_events(
        &self,
        session: &mut ScrapeSession,
        source_url: &str,
        events: Vec<NewEvent>,
    ) -> Result<AnalyzeOutcome> {
        if events.is_empty() {
            return self.finish_no_events(session).await;
        }

        let persisted = self.persister.persist_events(&events, source_url).await;

        session.status = SessionStatus::EventsFound;
        session.completed_at = Some(Utc::now());
        self.sessions.update(session).await?;

        info!(
            session_id = %session.id,
            events = session.events_found(),
            inserted = persisted.inserted,
            duplicates = persisted.duplicates,
            "Session finished with events"
        );

        Ok(AnalyzeOutcome {
            session_id: session.id,
            status: session.status,
            events_found: session.events_found(),
            events: session
                .extracted_events
                .clone()
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
            inserted: persisted.inserted,
            duplicates: persisted.duplicates,
            used_method: session.method_id,
            error: None,
        })
    }

    async fn finish_no_events(&self, session: &mut ScrapeSession) -> Result<AnalyzeOutcome> {
        session.status = SessionStatus::NoEvents;
        session.completed_at = Some(Utc::now());
        self.sessions.update(session).await?;

        info!(session_id = %session.id, url = %session.url, "No events found");

        Ok(AnalyzeOutcome {
            session_id: session.id,
            status: session.status,
            events_found: 0,
            events: serde_json::Value::Array(Vec::new()),
            inserted: 0,
            duplicates: 0,
            used_method: session.method_id,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Event building
// ---------------------------------------------------------------------------

/// Convert one extracted row into a persistable event. Rows without a title
/// are dropped.
fn event_from_raw(raw: &RawEvent, page_url: &str, now: DateTime<Utc>) -> Option<NewEvent> {
    let title = raw.title.trim();
    if title.is_empty() {
        return None;
    }

    let time = Some(raw.time.as_str()).filter(|t| !t.trim().is_empty());
    let start = normalize_event_datetime(&raw.date, time, now);

    let external_url = raw
        .link
        .as_deref()
        .and_then(|href| resolve_href(page_url, href))
        .or_else(|| Some(page_url.to_string()));

    Some(NewEvent {
        title: title.to_string(),
        description: non_empty(&raw.description),
        start_datetime: start,
        end_datetime: None,
        location: raw.location.trim().to_string(),
        address: None,
        latitude: None,
        longitude: None,
        external_url,
    })
}

fn event_from_detail(detail: &DetailEvent, page_url: &str, now: DateTime<Utc>) -> Option<NewEvent> {
    let title = detail.title.as_deref().unwrap_or("").trim();
    if title.is_empty() {
        return None;
    }

    let date = detail.date.as_deref().unwrap_or("");
    let start = normalize_event_datetime(date, detail.start_time.as_deref(), now);

    // An end needs both the page's date and an explicit end time; anything
    // less stays open-ended.
    let end = detail
        .end_time
        .as_deref()
        .filter(|t| !t.trim().is_empty() && !date.trim().is_empty())
        .map(|t| normalize_event_datetime(date, Some(t), now));

    let external_url = detail
        .ticket_url
        .as_deref()
        .and_then(|href| resolve_href(page_url, href))
        .or_else(|| Some(page_url.to_string()));

    Some(NewEvent {
        title: title.to_string(),
        description: detail.description.as_deref().and_then(non_empty),
        start_datetime: start,
        end_datetime: end,
        location: detail
            .location
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_string(),
        address: detail.address.as_deref().and_then(non_empty),
        latitude: None,
        longitude: None,
        external_url,
    })
}

fn build_from_raw(rows: &[RawEvent], page_url: &str, now: DateTime<Utc>) -> Vec<NewEvent> {
    rows.iter()
        .filter_map(|r| event_from_raw(r, page_url, now))
        .collect()
}

fn build_from_details(details: &[(String, DetailEvent)], now: DateTime<Utc>) -> Vec<NewEvent> {
    details
        .iter()
        .filter_map(|(url, d)| event_from_detail(d, url, now))
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
