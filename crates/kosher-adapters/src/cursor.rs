use std::sync::Arc;

use futures::stream::{self, StreamExt};
use kosher_core::RawCandidate;
use kosher_storage::MinIntervalGate;
use tracing::{debug, info, warn};

use crate::listing::{parse_detail_page, parse_listing_page, CompiledSelectors, SkippedListing};
use crate::{AdapterError, ExtractorConfig, PageFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailFailure {
    pub detail_url: String,
    pub reason: String,
}

/// Outcome of one listing page, including what went wrong without stopping the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReport {
    pub page: u32,
    pub url: String,
    pub candidates: Vec<RawCandidate>,
    pub skipped: Vec<SkippedListing>,
    pub detail_failures: Vec<DetailFailure>,
    /// Set when the listing page itself could not be fetched; the page is incomplete.
    pub fetch_error: Option<String>,
}

impl PageReport {
    pub fn is_incomplete(&self) -> bool {
        self.fetch_error.is_some()
    }
}

/// Walks a paginated category one page per [`ListingCursor::next_page`] call.
///
/// Pages are fetched at least `page_delay` apart and detail pages go through a
/// shared gate spaced `detail_delay` apart, even with several detail fetches in
/// flight. The walk ends on an empty page, past the last page advertised by the
/// pagination links, or at `max_pages`.
pub struct ListingCursor {
    config: ExtractorConfig,
    selectors: CompiledSelectors,
    fetcher: Arc<dyn PageFetcher>,
    page_gate: MinIntervalGate,
    detail_gate: MinIntervalGate,
    next_page: u32,
    last_seen_page: Option<u32>,
    consecutive_failures: u32,
    finished: bool,
}

impl ListingCursor {
    pub fn new(config: ExtractorConfig, fetcher: Arc<dyn PageFetcher>) -> Result<Self, AdapterError> {
        Self::starting_at(config, fetcher, 1)
    }

    /// Resumes a pass at `page` (1-based), e.g. after an interrupted run.
    pub fn starting_at(
        config: ExtractorConfig,
        fetcher: Arc<dyn PageFetcher>,
        page: u32,
    ) -> Result<Self, AdapterError> {
        let selectors = CompiledSelectors::compile(&config.selectors)?;
        Ok(Self {
            page_gate: MinIntervalGate::new(config.page_delay),
            detail_gate: MinIntervalGate::new(config.detail_delay),
            selectors,
            config,
            fetcher,
            next_page: page.max(1),
            last_seen_page: None,
            consecutive_failures: 0,
            finished: false,
        })
    }

    /// Page the next call will fetch, or `None` once the walk is over.
    pub fn position(&self) -> Option<u32> {
        (!self.finished).then_some(self.next_page)
    }

    /// Fetches and enriches the next listing page. `Ok(None)` ends the walk;
    /// `Err` is a configuration problem or a sustained outage.
    pub async fn next_page(&mut self) -> Result<Option<PageReport>, AdapterError> {
        if self.finished {
            return Ok(None);
        }
        let page = self.next_page;
        if let Some(max) = self.config.max_pages {
            if page > max {
                warn!(
                    source_id = %self.config.source_id,
                    max_pages = max,
                    "page limit reached before pagination ended"
                );
                self.finished = true;
                return Ok(None);
            }
        }
        if self.last_seen_page.is_some_and(|last| page > last) {
            debug!(page, "past last advertised page");
            self.finished = true;
            return Ok(None);
        }

        self.next_page += 1;
        let url = self.config.page_url(page);
        self.page_gate.wait().await;

        let html = match self.fetcher.fetch_page(&url).await {
            Ok(html) => {
                self.consecutive_failures = 0;
                html
            }
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(page, %url, error = %err, "listing page fetch failed");
                if self.consecutive_failures >= self.config.max_consecutive_page_failures.max(1) {
                    self.finished = true;
                    return Err(AdapterError::Outage {
                        failures: self.consecutive_failures,
                        last_error: err.to_string(),
                    });
                }
                return Ok(Some(PageReport {
                    page,
                    url,
                    candidates: Vec::new(),
                    skipped: Vec::new(),
                    detail_failures: Vec::new(),
                    fetch_error: Some(err.to_string()),
                }));
            }
        };

        let listing = parse_listing_page(&html, &url, page, &self.selectors);
        // A page without pagination links advertises itself as the last one.
        let last = listing.last_page.unwrap_or(page);
        self.last_seen_page = Some(self.last_seen_page.map_or(last, |seen| seen.max(last)));
        for skipped in &listing.skipped {
            warn!(page, position = skipped.position, reason = %skipped.reason, "listing skipped");
        }
        if listing.candidates.is_empty() {
            info!(page, "empty listing page, stopping");
            self.finished = true;
        }

        let (candidates, detail_failures) = if self.config.fetch_details {
            self.enrich_all(listing.candidates).await
        } else {
            (listing.candidates, Vec::new())
        };

        Ok(Some(PageReport {
            page,
            url,
            candidates,
            skipped: listing.skipped,
            detail_failures,
            fetch_error: None,
        }))
    }

    async fn enrich_all(
        &self,
        candidates: Vec<RawCandidate>,
    ) -> (Vec<RawCandidate>, Vec<DetailFailure>) {
        // `buffered` keeps listing order regardless of completion order.
        let results: Vec<(RawCandidate, Option<DetailFailure>)> = stream::iter(candidates)
            .map(|candidate| self.enrich(candidate))
            .buffered(self.config.detail_concurrency.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        let candidates = results
            .into_iter()
            .map(|(candidate, failure)| {
                failures.extend(failure);
                candidate
            })
            .collect();
        (candidates, failures)
    }

    async fn enrich(&self, mut candidate: RawCandidate) -> (RawCandidate, Option<DetailFailure>) {
        let Some(detail_url) = candidate.source_detail_url.clone() else {
            return (candidate, None);
        };

        self.detail_gate.wait().await;
        let failure = match self.fetcher.fetch_page(&detail_url).await {
            Ok(html) => {
                let fields = parse_detail_page(&html, &detail_url, &self.selectors);
                if fields.is_empty() {
                    Some("no detail fields found".to_string())
                } else {
                    fields.apply_to(&mut candidate);
                    None
                }
            }
            Err(err) => Some(err.to_string()),
        };

        let failure = failure.map(|reason| {
            warn!(%detail_url, %reason, "detail page incomplete");
            DetailFailure { detail_url, reason }
        });
        (candidate, failure)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::FixturePageFetcher;

    const BASE: &str = "https://kosher-agency.example/restaurants/";

    fn page_html(names: &[&str], last_page: u32) -> String {
        let items: String = names
            .iter()
            .map(|name| {
                format!(
                    r#"<div class="listing-item"><h3 class="listing-title"><a href="/r/{slug}/">{name}</a></h3></div>"#,
                    slug = name.to_lowercase().replace(' ', "-")
                )
            })
            .collect();
        let links: String = (1..=last_page)
            .map(|p| format!(r#"<a href="/restaurants/page/{p}/">{p}</a>"#))
            .collect();
        format!(r#"<main>{items}<nav class="pagination">{links}</nav></main>"#)
    }

    fn config() -> ExtractorConfig {
        ExtractorConfig {
            fetch_details: false,
            ..ExtractorConfig::new("agency", BASE)
        }
    }

    async fn drain(cursor: &mut ListingCursor) -> Result<Vec<PageReport>, AdapterError> {
        let mut pages = Vec::new();
        while let Some(report) = cursor.next_page().await? {
            pages.push(report);
        }
        Ok(pages)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_last_advertised_page() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A", "B"], 2))
                .with_page(format!("{BASE}page/2/"), page_html(&["C"], 2)),
        );
        let mut cursor = ListingCursor::new(config(), fetcher.clone()).unwrap();
        let pages = drain(&mut cursor).await.unwrap();

        let names: Vec<_> = pages
            .iter()
            .flat_map(|p| p.candidates.iter().map(|c| c.source_name.as_str()))
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(fetcher.requests().await.len(), 2);
        assert_eq!(cursor.position(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_empty_page_before_last_advertised() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A"], 3))
                .with_page(format!("{BASE}page/2/"), "<main></main>"),
        );
        let mut cursor = ListingCursor::new(config(), fetcher.clone()).unwrap();
        let pages = drain(&mut cursor).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[1].candidates.is_empty());
        assert_eq!(fetcher.requests().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_page_without_pagination_ends_cleanly() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A", "B"], 0))
                .with_failure(format!("{BASE}page/2/"), 404),
        );
        let mut cursor = ListingCursor::new(config(), fetcher.clone()).unwrap();
        let pages = drain(&mut cursor).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(!pages[0].is_incomplete());
        assert_eq!(pages[0].candidates.len(), 2);
        assert_eq!(fetcher.requests().await, vec![BASE.to_string()]);
        assert_eq!(cursor.position(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn max_pages_caps_the_walk() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A"], 9))
                .with_page(format!("{BASE}page/2/"), page_html(&["B"], 9))
                .with_page(format!("{BASE}page/3/"), page_html(&["C"], 9)),
        );
        let config = ExtractorConfig {
            max_pages: Some(2),
            ..config()
        };
        let mut cursor = ListingCursor::new(config, fetcher.clone()).unwrap();
        assert_eq!(drain(&mut cursor).await.unwrap().len(), 2);
        assert_eq!(fetcher.requests().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_a_given_page() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A"], 3))
                .with_page(format!("{BASE}page/2/"), page_html(&["B"], 3))
                .with_page(format!("{BASE}page/3/"), page_html(&["C"], 3)),
        );
        let mut cursor = ListingCursor::starting_at(config(), fetcher.clone(), 2).unwrap();
        assert_eq!(cursor.position(), Some(2));
        let pages = drain(&mut cursor).await.unwrap();
        let pages: Vec<u32> = pages.iter().map(|p| p.page).collect();
        assert_eq!(pages, vec![2, 3]);
        assert!(!fetcher.requests().await.contains(&BASE.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_is_recorded_and_walk_continues() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A"], 3))
                .with_failure(format!("{BASE}page/2/"), 503)
                .with_page(format!("{BASE}page/3/"), page_html(&["C"], 3)),
        );
        let mut cursor = ListingCursor::new(config(), fetcher).unwrap();
        let pages = drain(&mut cursor).await.unwrap();
        assert_eq!(pages.len(), 3);
        assert!(pages[1].is_incomplete());
        assert_eq!(pages[2].candidates[0].source_name, "C");
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_outage_aborts() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_failure(BASE, 503)
                .with_failure(format!("{BASE}page/2/"), 503),
        );
        let config = ExtractorConfig {
            max_consecutive_page_failures: 2,
            ..config()
        };
        let mut cursor = ListingCursor::new(config, fetcher).unwrap();
        let first = cursor.next_page().await.unwrap().unwrap();
        assert!(first.is_incomplete());
        let err = cursor.next_page().await.unwrap_err();
        assert!(matches!(err, AdapterError::Outage { failures: 2, .. }));
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn detail_failures_leave_fields_empty() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["Good", "Gone"], 1))
                .with_page(
                    "https://kosher-agency.example/r/good/",
                    r#"<a class="certificate" href="/c/good.pdf">Cert</a>"#,
                ),
        );
        let config = ExtractorConfig {
            fetch_details: true,
            detail_delay: Duration::from_millis(400),
            page_delay: Duration::from_secs(2),
            ..config()
        };
        let mut cursor = ListingCursor::new(config, fetcher).unwrap();
        let report = cursor.next_page().await.unwrap().unwrap();

        assert_eq!(report.candidates.len(), 2);
        assert_eq!(
            report.candidates[0].certificate_url.as_deref(),
            Some("https://kosher-agency.example/c/good.pdf")
        );
        assert_eq!(report.candidates[1].source_name, "Gone");
        assert_eq!(report.candidates[1].certificate_url, None);
        assert_eq!(report.detail_failures.len(), 1);
        assert_eq!(
            report.detail_failures[0].detail_url,
            "https://kosher-agency.example/r/gone/"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn page_fetches_are_spaced_by_page_delay() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(BASE, page_html(&["A"], 2))
                .with_page(format!("{BASE}page/2/"), page_html(&["B"], 2)),
        );
        let config = ExtractorConfig {
            page_delay: Duration::from_secs(3),
            ..config()
        };
        let started = tokio::time::Instant::now();
        let mut cursor = ListingCursor::new(config, fetcher).unwrap();
        drain(&mut cursor).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
