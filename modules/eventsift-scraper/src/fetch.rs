//! Page fetching with browser-spoofed headers and host-toggle retry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect;
use thiserror::Error;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(45);
const MAX_REDIRECTS: usize = 5;

pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// DNS resolution failed for both the original host and its
    /// www-toggled alternate.
    #[error("could not resolve host for {url}: {message}")]
    Dns { url: String, message: String },

    #[error("HTTP error {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("empty body from {url}")]
    EmptyBody { url: String },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
}

/// A fetched page, carrying the URL that finally answered (it differs from
/// the requested one after redirects or a host toggle).
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResult<FetchedPage>;
    fn name(&self) -> &str;
}

/// Plain HTTP fetcher presenting itself as a desktop Chrome browser.
///
/// Redirects are followed automatically up to the cap; a final response that
/// is still a 3xx (some hosts hand these back unresolved) gets one explicit
/// follow of its `Location` target. A DNS failure triggers one retry with
/// the `www.` prefix toggled on the host.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .default_headers(browser_headers())
            .build()
            .expect("Failed to build HTTP client");

        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    async fn finish(&self, response: reqwest::Response) -> FetchResult<FetchedPage> {
        let status = response.status();
        let answered_url = response.url().to_string();

        // A 3xx that survived automatic following: chase the Location target
        // explicitly, once. The redirect cap bounds anything cyclic.
        if status.is_redirection() {
            if let Some(target) = redirect_target(&response) {
                info!(url = %answered_url, target = %target, "Following unresolved redirect");
                let followed = self.client.get(&target).send().await.map_err(|e| {
                    FetchError::Network {
                        url: target.clone(),
                        message: e.to_string(),
                    }
                })?;
                let followed_status = followed.status();
                if !followed_status.is_success() {
                    return Err(FetchError::Http {
                        url: followed.url().to_string(),
                        status: followed_status.as_u16(),
                    });
                }
                return page_from(followed).await;
            }
        }

        if !status.is_success() {
            return Err(FetchError::Http {
                url: answered_url,
                status: status.as_u16(),
            });
        }

        page_from(response).await
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<FetchedPage> {
        let parsed =
            url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(FetchError::InvalidUrl(format!(
                "only http/https URLs are allowed, got: {}",
                parsed.scheme()
            )));
        }

        info!(url, fetcher = "http", "Fetching URL");

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) if error_is_dns(&e) => {
                let Some(alt_url) = toggle_www(url) else {
                    return Err(FetchError::Dns {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                };
                warn!(url, alt_url = %alt_url, "DNS failure, retrying with www toggled");
                match self.client.get(&alt_url).send().await {
                    Ok(response) => response,
                    Err(e2) if error_is_dns(&e2) => {
                        return Err(FetchError::Dns {
                            url: alt_url,
                            message: e2.to_string(),
                        });
                    }
                    Err(e2) => {
                        return Err(FetchError::Network {
                            url: alt_url,
                            message: e2.to_string(),
                        });
                    }
                }
            }
            Err(e) => {
                return Err(FetchError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let page = self.finish(response).await?;
        info!(url = %page.url, bytes = page.html.len(), "Fetched successfully");
        Ok(page)
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// ScriptedFetcher (tests — no network required)
// ---------------------------------------------------------------------------

/// In-memory fetcher for testing. Serves stubbed pages by exact URL and
/// records every request.
pub struct ScriptedFetcher {
    pages: Mutex<HashMap<String, String>>,
    requested: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn stub_page(&self, url: &str, html: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), html.to_string());
    }

    /// URLs requested so far (for test assertions).
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<FetchedPage> {
        self.requested.lock().unwrap().push(url.to_string());
        match self.pages.lock().unwrap().get(url) {
            Some(html) => Ok(FetchedPage {
                url: url.to_string(),
                html: html.clone(),
            }),
            None => Err(FetchError::Network {
                url: url.to_string(),
                message: "no scripted page for this URL".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

async fn page_from(response: reqwest::Response) -> FetchResult<FetchedPage> {
    let url = response.url().to_string();
    let html = response.text().await.map_err(|e| FetchError::Network {
        url: url.clone(),
        message: e.to_string(),
    })?;

    if html.trim().is_empty() {
        return Err(FetchError::EmptyBody { url });
    }

    Ok(FetchedPage { url, html })
}

fn redirect_target(response: &reqwest::Response) -> Option<String> {
    let location = response.headers().get(header::LOCATION)?.to_str().ok()?;
    response
        .url()
        .join(location)
        .ok()
        .map(|u| u.to_string())
}

/// Strip or prepend the `www.` prefix on the URL's host.
pub(crate) fn toggle_www(url: &str) -> Option<String> {
    let mut parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();

    let alt_host = match host.strip_prefix("www.") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => format!("www.{host}"),
    };

    parsed.set_host(Some(&alt_host)).ok()?;
    Some(parsed.to_string())
}

/// Whether an error chain points at DNS resolution rather than a refused or
/// dropped connection.
fn error_is_dns(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if message_indicates_dns(&cause.to_string()) {
            return true;
        }
        source = cause.source();
    }
    false
}

fn message_indicates_dns(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("dns")
        || message.contains("resolve")
        || message.contains("name or service not known")
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        ),
    );
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("none"));
    headers.insert(
        "Upgrade-Insecure-Requests",
        HeaderValue::from_static("1"),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_adds_www_to_bare_host() {
        assert_eq!(
            toggle_www("https://example.com/events?page=2").as_deref(),
            Some("https://www.example.com/events?page=2")
        );
    }

    #[test]
    fn toggle_strips_existing_www() {
        assert_eq!(
            toggle_www("https://www.example.com/calendar").as_deref(),
            Some("https://example.com/calendar")
        );
    }

    #[test]
    fn toggle_keeps_scheme_and_path() {
        let alt = toggle_www("http://example.com/a/b#frag").unwrap();
        assert!(alt.starts_with("http://www.example.com/a/b"), "{alt}");
    }

    #[test]
    fn dns_messages_recognized() {
        assert!(message_indicates_dns(
            "dns error: failed to lookup address information"
        ));
        assert!(message_indicates_dns("Could not resolve host"));
        assert!(message_indicates_dns("Name or service not known"));
        assert!(!message_indicates_dns("connection refused"));
        assert!(!message_indicates_dns("timed out"));
    }

    #[test]
    fn browser_headers_present_a_browser() {
        let headers = browser_headers();
        let ua = headers.get(header::USER_AGENT).unwrap().to_str().unwrap();
        assert!(ua.contains("Chrome/"));
        assert!(headers.contains_key("Sec-Fetch-Mode"));
    }
}
