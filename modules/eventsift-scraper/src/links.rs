//! Link resolution and URL pattern generalization.

use std::collections::HashSet;

/// Cap on detail links followed from a single listing page.
pub const MAX_EVENT_LINKS: usize = 5;

/// Resolve a possibly-relative href against the page it appeared on.
pub fn resolve_href(base_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    url::Url::parse(base_url)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}

/// Resolve, dedup, and cap candidate detail links from a listing analysis.
pub fn bound_event_links(links: &[String], base_url: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for raw in links {
        let Some(resolved) = resolve_href(base_url, raw) else {
            continue;
        };
        if seen.insert(resolved.clone()) {
            out.push(resolved);
            if out.len() >= MAX_EVENT_LINKS {
                break;
            }
        }
    }

    out
}

/// Generalize a URL into a reusable per-domain pattern: scheme + host with
/// every digit run in the path wildcarded and the query dropped.
/// `https://a.com/events/2024/03` → `https://a.com/events/*/*`.
pub fn generalize_url_pattern(url: &str) -> String {
    let digits = regex::Regex::new(r"\d+").expect("valid regex");

    match url::Url::parse(url) {
        Ok(u) => {
            let host = u.host_str().unwrap_or_default();
            let path = digits.replace_all(u.path(), "*");
            format!("{}://{}{}", u.scheme(), host, path)
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_hrefs_pass_through() {
        assert_eq!(
            resolve_href("https://example.com/events", "https://other.com/x"),
            Some("https://other.com/x".to_string())
        );
    }

    #[test]
    fn relative_hrefs_join_against_base() {
        assert_eq!(
            resolve_href("https://example.com/events/list", "detail?id=7"),
            Some("https://example.com/events/detail?id=7".to_string())
        );
        assert_eq!(
            resolve_href("https://example.com/events/list", "/calendar/march"),
            Some("https://example.com/calendar/march".to_string())
        );
    }

    #[test]
    fn resolution_preserves_scheme_and_host() {
        let resolved = resolve_href("https://example.com/a/b", "../c").unwrap();
        assert!(resolved.starts_with("https://example.com/"), "{resolved}");
    }

    #[test]
    fn blank_href_is_dropped() {
        assert_eq!(resolve_href("https://example.com", ""), None);
        assert_eq!(resolve_href("https://example.com", "   "), None);
    }

    #[test]
    fn event_links_capped_at_five() {
        let links: Vec<String> = (0..10)
            .map(|i| format!("https://example.com/event/{i}"))
            .collect();
        let bounded = bound_event_links(&links, "https://example.com");
        assert_eq!(bounded.len(), MAX_EVENT_LINKS);
        assert_eq!(bounded[0], "https://example.com/event/0");
    }

    #[test]
    fn event_links_deduped_after_resolution() {
        let links = vec![
            "/event/1".to_string(),
            "https://example.com/event/1".to_string(),
            "/event/2".to_string(),
        ];
        let bounded = bound_event_links(&links, "https://example.com");
        assert_eq!(
            bounded,
            vec![
                "https://example.com/event/1".to_string(),
                "https://example.com/event/2".to_string(),
            ]
        );
    }

    #[test]
    fn pattern_wildcards_digit_runs() {
        assert_eq!(
            generalize_url_pattern("https://example.com/events/2024/03/all"),
            "https://example.com/events/*/*/all"
        );
        assert_eq!(
            generalize_url_pattern("https://example.com/event-1234"),
            "https://example.com/event-*"
        );
    }

    #[test]
    fn pattern_drops_query_and_keeps_digitless_paths() {
        assert_eq!(
            generalize_url_pattern("https://example.com/calendar?month=5"),
            "https://example.com/calendar"
        );
        assert_eq!(
            generalize_url_pattern("https://example.com/events"),
            "https://example.com/events"
        );
    }

    #[test]
    fn unparseable_url_returned_verbatim() {
        assert_eq!(generalize_url_pattern("not a url"), "not a url");
    }
}
