//! CSS selector extraction for pages with an approved method.
//!
//! Selector maps come from model analysis and are stored alongside the
//! method, so a bad selector is data, not a bug: invalid ones degrade to
//! "matched nothing" with a warning instead of failing the scrape.

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use eventsift_common::SelectorMap;

use crate::analyze::RawEvent;
use crate::links::resolve_href;

/// Apply a selector map to page HTML, yielding one raw event per container
/// match. Rows without a title are dropped.
pub fn apply_selector_map(html: &str, map: &SelectorMap, base_url: &str) -> Vec<RawEvent> {
    let Some(container) = compile(&map.event_container) else {
        warn!(
            selector = map.event_container.as_deref().unwrap_or(""),
            "Event container selector missing or invalid, nothing to extract"
        );
        return Vec::new();
    };

    let title_sel = compile(&map.title);
    let date_sel = compile(&map.date);
    let location_sel = compile(&map.location);
    let description_sel = compile(&map.description);
    let link_sel = compile(&map.link);

    let document = Html::parse_document(html);
    let mut events = Vec::new();

    for element in document.select(&container) {
        let title = first_text(element, title_sel.as_ref());
        if title.is_empty() {
            continue;
        }

        let link = link_sel
            .as_ref()
            .and_then(|sel| element.select(sel).next())
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_href(base_url, href));

        events.push(RawEvent {
            title,
            date: first_text(element, date_sel.as_ref()),
            time: String::new(),
            location: first_text(element, location_sel.as_ref()),
            description: first_text(element, description_sel.as_ref()),
            link,
        });
    }

    debug!(count = events.len(), "Selector extraction done");
    events
}

fn compile(selector: &Option<String>) -> Option<Selector> {
    let selector = selector.as_deref()?.trim();
    if selector.is_empty() {
        return None;
    }
    match Selector::parse(selector) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(selector, error = %e, "Invalid CSS selector");
            None
        }
    }
}

/// Text of the first descendant matching `selector`, whitespace-collapsed.
/// Empty when the selector is absent or matches nothing.
fn first_text(element: ElementRef, selector: Option<&Selector>) -> String {
    let Some(selector) = selector else {
        return String::new();
    };
    element
        .select(selector)
        .next()
        .map(|found| collapse_ws(found.text()))
        .unwrap_or_default()
}

fn collapse_ws<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
