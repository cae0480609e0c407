//! Model-driven page analysis.
//!
//! The analyzer sees raw HTML (not readable-text renderings) so it can
//! propose CSS selectors that survive into a reusable extraction method.

use std::collections::VecDeque;
use std::sync::Mutex;

use ai_client::Claude;
use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use eventsift_common::SelectorMap;

pub const MAX_ANALYSIS_BYTES: usize = 30_000;

/// One event row as it comes off a page, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RawEvent {
    pub title: String,
    /// Date text as printed on the page, e.g. "March 5, 2024"
    pub date: String,
    /// Time text when printed separately from the date, e.g. "7:00 PM"
    pub time: String,
    pub location: String,
    pub description: String,
    /// URL of the event's own page, absolute or page-relative
    pub link: Option<String>,
}

/// Site-level patterns the model noticed while reading the page.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisPatterns {
    /// How this site prints dates, e.g. "March 5, 2024" or "2024-03-05"
    pub date_format: Option<String>,
    /// URL shape shared by event detail pages, e.g. "/events/123"
    pub url_pattern: Option<String>,
}

/// What the model returns for a listing page.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PageAnalysis {
    /// Whether the page carries event information at all.
    pub has_events: bool,
    /// "list", "calendar", "links", "news", "schedule", or "none"
    #[serde(default)]
    pub event_type: String,
    /// Events readable directly off this page.
    #[serde(default)]
    pub events: Vec<RawEvent>,
    /// Links to per-event detail pages, for listings too sparse to extract
    /// from directly.
    #[serde(default)]
    pub event_links: Vec<String>,
    /// CSS selectors that would re-extract these events without a model call.
    #[serde(default)]
    pub selectors: Option<SelectorMap>,
    #[serde(default)]
    pub patterns: Option<AnalysisPatterns>,
    /// Model's own 0.0-1.0 judgment of extraction fidelity.
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// What the model returns for a single event's detail page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DetailEvent {
    pub title: Option<String>,
    /// Date as printed, e.g. "March 5, 2024"
    pub date: Option<String>,
    /// Start time as printed, e.g. "7:00 PM"
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Venue name
    pub location: Option<String>,
    /// Street address if the page gives one
    pub address: Option<String>,
    pub description: Option<String>,
    pub contact_info: Option<String>,
    pub ticket_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DetailAnalysis {
    /// Whether the page describes one concrete event.
    pub is_event: bool,
    #[serde(default)]
    pub event: Option<DetailEvent>,
}

const LISTING_SYSTEM_PROMPT: &str = r#"You are an expert web scraper analyzing a web page for event information (concerts, meetings, classes, festivals, performances, and similar scheduled happenings).

You receive the page's raw HTML. Work from the markup, not just the visible text — the markup is what selectors will run against later.

## Classification
Set event_type to one of:
- "list": multiple events presented directly on this page
- "calendar": a calendar grid or feed of dated entries
- "links": the page mainly links out to per-event detail pages
- "news": articles or announcements about upcoming events
- "schedule": a recurring timetable (meetings, classes)
- "none": no event information (set has_events to false)

## Inline extraction
When event details are readable directly off this page, fill `events` with one entry per event:
- title: the event name exactly as shown
- date: the date text exactly as printed (e.g. "March 5, 2024"), do not reformat
- time: the time text if printed separately (e.g. "7:00 PM"), else empty
- location: venue or place text, else empty
- description: a short description if present, else empty
- link: the event's own URL if the entry links out (relative URLs are fine)

## Detail links
When the listing shows only titles or thumbnails and the real details live on per-event pages, leave `events` empty and put the detail page URLs in `event_links` (at most the 5 most likely ones).

## Selectors
When you extracted inline events, also propose CSS selectors in `selectors` that would re-extract the same rows without you:
- event_container: matches one element per event
- title, date, location, description: relative to the container
- link: an anchor inside the container, if entries link out
Use classes and structure actually present in the HTML. Leave a field empty if no reliable selector exists.

## Patterns
In `patterns`, note the site's date format and any URL shape shared by event pages.

## Confidence
Set `confidence` between 0.0 and 1.0 for how faithfully the extraction (or the selectors) captures the page's events."#;

const DETAIL_SYSTEM_PROMPT: &str = r#"You are an expert web scraper reading the page of a single event.

You receive the page's raw HTML. Decide whether it describes one concrete scheduled event (a concert, meeting, class, festival, performance, or similar).

If it does not — a listing of many events, a venue's home page, an article — set is_event to false and leave event null.

If it does, set is_event to true and fill `event`:
- title: the event name
- date: the date exactly as printed (e.g. "March 5, 2024"), do not reformat
- start_time / end_time: as printed (e.g. "7:00 PM"), null when absent
- location: venue name
- address: street address if given
- description: one or two sentences of what the event is
- contact_info: phone or email if shown
- ticket_url: registration or ticket link if present

Use null for anything the page does not say. Never invent details."#;

#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    /// Read a fetched page and report what events it holds and how.
    async fn analyze_listing(&self, url: &str, html: &str) -> Result<PageAnalysis>;

    /// Read a single event's page; `None` when it turns out not to be one.
    async fn extract_detail(&self, url: &str, html: &str) -> Result<Option<DetailEvent>>;

    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// ClaudeAnalyzer (production)
// ---------------------------------------------------------------------------

pub struct ClaudeAnalyzer {
    claude: Claude,
}

impl ClaudeAnalyzer {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            claude: Claude::new(api_key, model),
        }
    }
}

#[async_trait]
impl ContentAnalyzer for ClaudeAnalyzer {
    async fn analyze_listing(&self, url: &str, html: &str) -> Result<PageAnalysis> {
        let html = clip(html);
        let user_prompt = format!(
            "Analyze this page for event information.\n\nPage URL: {url}\n\n---\n\n{html}"
        );

        let analysis: PageAnalysis = self
            .claude
            .extract(LISTING_SYSTEM_PROMPT, &user_prompt)
            .await
            .with_context(|| format!("Listing analysis failed for {url}"))?;

        info!(
            url,
            has_events = analysis.has_events,
            event_type = %analysis.event_type,
            inline_events = analysis.events.len(),
            event_links = analysis.event_links.len(),
            has_selectors = analysis.selectors.is_some(),
            "Page analyzed"
        );
        Ok(analysis)
    }

    async fn extract_detail(&self, url: &str, html: &str) -> Result<Option<DetailEvent>> {
        let html = clip(html);
        let user_prompt = format!(
            "Extract the event described on this page.\n\nPage URL: {url}\n\n---\n\n{html}"
        );

        let detail: DetailAnalysis = self
            .claude
            .extract(DETAIL_SYSTEM_PROMPT, &user_prompt)
            .await
            .with_context(|| format!("Detail extraction failed for {url}"))?;

        if !detail.is_event {
            info!(url, "Detail page is not a single event");
            return Ok(None);
        }
        Ok(detail.event)
    }

    fn model(&self) -> &str {
        self.claude.model()
    }
}

/// Cap page HTML before prompting, trimming to a char boundary.
fn clip(html: &str) -> &str {
    if html.len() <= MAX_ANALYSIS_BYTES {
        return html;
    }
    let mut end = MAX_ANALYSIS_BYTES;
    while !html.is_char_boundary(end) {
        end -= 1;
    }
    &html[..end]
}

// ---------------------------------------------------------------------------
// ScriptedAnalyzer (tests — no API key required)
// ---------------------------------------------------------------------------

/// Analyzer double that replays pre-loaded responses in order. Thread-safe.
pub struct ScriptedAnalyzer {
    listings: Mutex<VecDeque<PageAnalysis>>,
    details: Mutex<VecDeque<Option<DetailEvent>>>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self {
            listings: Mutex::new(VecDeque::new()),
            details: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_listing(&self, analysis: PageAnalysis) {
        self.listings.lock().unwrap().push_back(analysis);
    }

    pub fn push_detail(&self, detail: Option<DetailEvent>) {
        self.details.lock().unwrap().push_back(detail);
    }
}

impl Default for ScriptedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentAnalyzer for ScriptedAnalyzer {
    async fn analyze_listing(&self, url: &str, _html: &str) -> Result<PageAnalysis> {
        self.listings
            .lock()
            .unwrap()
            .pop_front()
            .with_context(|| format!("no scripted listing analysis left for {url}"))
    }

    async fn extract_detail(&self, url: &str, _html: &str) -> Result<Option<DetailEvent>> {
        self.details
            .lock()
            .unwrap()
            .pop_front()
            .with_context(|| format!("no scripted detail left for {url}"))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clip_respects_char_boundaries() {
        let s = "é".repeat(MAX_ANALYSIS_BYTES);
        let clipped = clip(&s);
        assert!(clipped.len() <= MAX_ANALYSIS_BYTES);
        assert!(clipped.chars().all(|c| c == 'é'));
    }

    #[test]
    fn clip_leaves_short_input_alone() {
        assert_eq!(clip("<html></html>"), "<html></html>");
    }

    #[test]
    fn page_analysis_tolerates_sparse_response() {
        let analysis: PageAnalysis =
            serde_json::from_value(json!({ "has_events": false })).unwrap();
        assert!(!analysis.has_events);
        assert!(analysis.events.is_empty());
        assert!(analysis.event_links.is_empty());
        assert!(analysis.selectors.is_none());
        assert!(analysis.confidence.is_none());
    }

    #[test]
    fn detail_analysis_decodes_non_event() {
        let detail: DetailAnalysis =
            serde_json::from_value(json!({ "is_event": false, "event": null })).unwrap();
        assert!(!detail.is_event);
        assert!(detail.event.is_none());
    }

    #[test]
    fn raw_event_fills_missing_fields() {
        let event: RawEvent =
            serde_json::from_value(json!({ "title": "Jazz Night", "date": "March 5, 2024" }))
                .unwrap();
        assert_eq!(event.title, "Jazz Night");
        assert!(event.time.is_empty());
        assert!(event.link.is_none());
    }

    #[tokio::test]
    async fn scripted_analyzer_replays_in_order() {
        let analyzer = ScriptedAnalyzer::new();
        analyzer.push_listing(PageAnalysis {
            has_events: true,
            event_type: "list".into(),
            events: vec![],
            event_links: vec![],
            selectors: None,
            patterns: None,
            confidence: Some(0.9),
        });
        analyzer.push_listing(PageAnalysis {
            has_events: false,
            event_type: "none".into(),
            events: vec![],
            event_links: vec![],
            selectors: None,
            patterns: None,
            confidence: None,
        });

        let first = analyzer.analyze_listing("https://a.example", "<html/>").await.unwrap();
        let second = analyzer.analyze_listing("https://b.example", "<html/>").await.unwrap();
        assert!(first.has_events);
        assert!(!second.has_events);
        assert!(analyzer.analyze_listing("https://c.example", "<html/>").await.is_err());
    }
}
