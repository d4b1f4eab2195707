//! Agency directory extractor: selector-driven listing/detail parsing and a
//! restartable, throttled listing cursor.

mod cursor;
mod listing;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use kosher_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use cursor::{DetailFailure, ListingCursor, PageReport};
pub use listing::{
    parse_detail_page, parse_listing_page, CompiledSelectors, DetailFields, ListingPage,
    SkippedListing,
};

pub const CRATE_NAME: &str = "kosher-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{failures} consecutive listing pages failed, last error: {last_error}")]
    Outage { failures: u32, last_error: String },
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_retryable(),
            Self::Outage { .. } => true,
            Self::Selector { .. } => false,
        }
    }
}

/// CSS selectors for one directory layout. Every field has a default matching
/// the agency's current theme, so `pipeline.yaml` only lists what differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSet {
    pub listing_item: String,
    pub name: String,
    pub detail_link: String,
    pub address: String,
    pub phone: String,
    pub website: String,
    pub kosher_type: String,
    pub hours: String,
    pub pagination_link: String,
    pub photo: String,
    pub certificate_link: String,
    pub supervision_notes: String,
    pub detail_hours: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            listing_item: ".listing-item".into(),
            name: ".listing-title".into(),
            detail_link: ".listing-title a[href]".into(),
            address: ".listing-address".into(),
            phone: ".listing-phone".into(),
            website: ".listing-website a[href]".into(),
            kosher_type: ".listing-category".into(),
            hours: ".listing-hours".into(),
            pagination_link: ".pagination a[href]".into(),
            photo: ".listing-photo img[src]".into(),
            certificate_link: "a.certificate[href]".into(),
            supervision_notes: ".supervision-notes".into(),
            detail_hours: ".listing-hours".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub source_id: String,
    pub category_url: String,
    /// `{category_url}` and `{page}` are substituted; page 1 always uses the bare category URL.
    pub page_url_template: Option<String>,
    pub max_pages: Option<u32>,
    pub page_delay: Duration,
    pub detail_delay: Duration,
    pub detail_concurrency: usize,
    pub max_consecutive_page_failures: u32,
    pub fetch_details: bool,
    pub selectors: SelectorSet,
}

impl ExtractorConfig {
    pub fn new(source_id: impl Into<String>, category_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            category_url: category_url.into(),
            page_url_template: None,
            max_pages: Some(100),
            page_delay: Duration::from_secs(3),
            detail_delay: Duration::from_secs(1),
            detail_concurrency: 2,
            max_consecutive_page_failures: 3,
            fetch_details: true,
            selectors: SelectorSet::default(),
        }
    }

    pub fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            return self.category_url.clone();
        }
        match &self.page_url_template {
            Some(template) => template
                .replace("{category_url}", &self.category_url)
                .replace("{page}", &page.to_string()),
            None => format!("{}/page/{page}/", self.category_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError>;
}

/// Live fetches through the shared throttled client.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    source_id: String,
}

impl HttpPageFetcher {
    pub fn new(http: Arc<HttpFetcher>, run_id: Uuid, source_id: impl Into<String>) -> Self {
        Self {
            http,
            run_id,
            source_id: source_id.into(),
        }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        let response = self
            .http
            .fetch_bytes(self.run_id, &self.source_id, url)
            .await?;
        Ok(response.text())
    }
}

/// Serves captured pages keyed by absolute URL; unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FixturePageFetcher {
    pages: HashMap<String, String>,
    failures: HashMap<String, u16>,
    requests: Mutex<Vec<String>>,
}

impl FixturePageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn with_failure(mut self, url: impl Into<String>, status: u16) -> Self {
        self.failures.insert(url.into(), status);
        self
    }

    pub fn with_fixture_file(
        self,
        url: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let html = load_fixture_page(path)?;
        Ok(self.with_page(url, html))
    }

    /// Every URL requested so far, in request order.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        self.requests.lock().await.push(url.to_string());
        if let Some(status) = self.failures.get(url) {
            return Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }
            .into());
        }
        self.pages.get(url).cloned().ok_or_else(|| {
            FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }
            .into()
        })
    }
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("reading fixture page {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_urls_follow_template() {
        let mut config = ExtractorConfig::new("agency", "https://kosher-agency.example/restaurants/");
        assert_eq!(config.page_url(1), "https://kosher-agency.example/restaurants/");
        assert_eq!(
            config.page_url(3),
            "https://kosher-agency.example/restaurants/page/3/"
        );

        config.page_url_template = Some("{category_url}?pg={page}".into());
        assert_eq!(
            config.page_url(2),
            "https://kosher-agency.example/restaurants/?pg=2"
        );
        assert_eq!(config.page_url(1), "https://kosher-agency.example/restaurants/");
    }

    #[test]
    fn selector_defaults_fill_missing_fields() {
        let set: SelectorSet = serde_json::from_str(r#"{"name": "h2.title"}"#).unwrap();
        assert_eq!(set.name, "h2.title");
        assert_eq!(set.listing_item, SelectorSet::default().listing_item);
    }

    #[tokio::test]
    async fn fixture_fetcher_records_requests_and_misses() {
        let fetcher = FixturePageFetcher::new()
            .with_page("https://a.example/1", "<html></html>")
            .with_failure("https://a.example/down", 503);

        assert!(fetcher.fetch_page("https://a.example/1").await.is_ok());
        let missing = fetcher.fetch_page("https://a.example/2").await.unwrap_err();
        assert!(!missing.is_retryable());
        let down = fetcher.fetch_page("https://a.example/down").await.unwrap_err();
        assert!(down.is_retryable());
        assert_eq!(fetcher.requests().await.len(), 3);
    }
}
