//! Scrape and refresh orchestration for the kosher restaurant directory.

pub mod config;
pub mod provider;
pub mod refresh;
pub mod upsert;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kosher_adapters::{AdapterError, ExtractorConfig, HttpPageFetcher, ListingCursor, PageFetcher};
use kosher_core::{OverrideList, RestaurantDraft};
use kosher_storage::{
    HttpClientConfig, HttpFetcher, JsonFileStore, PgRestaurantStore, RestaurantStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{load_overrides, PipelineConfig, PipelineFile};
pub use provider::{
    GooglePlacesClient, GooglePlacesConfig, PlacesProvider, ProviderEntityId, ProviderError,
};
pub use refresh::{
    DailyQuota, QuotaCounter, RefreshConfig, RefreshRecordOutcome, RefreshRunSummary,
    RefreshScheduler, RefreshState,
};
pub use upsert::{UpsertEngine, UpsertFailure, UpsertOutcome, UpsertSummary};

pub const CRATE_NAME: &str = "kosher-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_page: u32,
    pub pages_fetched: usize,
    pub incomplete_pages: Vec<u32>,
    pub candidates: usize,
    pub skipped_listings: usize,
    pub invalid_candidates: usize,
    pub detail_failures: usize,
    pub upsert: UpsertSummary,
    /// Set when the pass stopped on a sustained outage.
    pub aborted: Option<String>,
    /// First page a follow-up pass should start from after an abort.
    pub resume_page: Option<u32>,
}

/// One extraction → categorization → upsert pass over the agency directory.
pub struct ScrapePipeline {
    extractor: ExtractorConfig,
    fetcher: Arc<dyn PageFetcher>,
    engine: Arc<UpsertEngine>,
    overrides: Arc<OverrideList>,
}

impl ScrapePipeline {
    pub fn new(
        extractor: ExtractorConfig,
        fetcher: Arc<dyn PageFetcher>,
        engine: Arc<UpsertEngine>,
        overrides: Arc<OverrideList>,
    ) -> Self {
        Self {
            extractor,
            fetcher,
            engine,
            overrides,
        }
    }

    pub async fn run_once(&self) -> Result<ScrapeRunSummary, AdapterError> {
        self.run_from(1).await
    }

    /// Runs a pass starting at `start_page`. Errors are configuration problems;
    /// an outage ends the pass early and is reported in the summary.
    pub async fn run_from(&self, start_page: u32) -> Result<ScrapeRunSummary, AdapterError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id, source_id = %self.extractor.source_id);
        self.scrape(run_id, start_page).instrument(span).await
    }

    async fn scrape(&self, run_id: Uuid, start_page: u32) -> Result<ScrapeRunSummary, AdapterError> {
        let started_at = Utc::now();
        let start_page = start_page.max(1);
        let mut cursor =
            ListingCursor::starting_at(self.extractor.clone(), self.fetcher.clone(), start_page)?;
        let mut summary = ScrapeRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            start_page,
            pages_fetched: 0,
            incomplete_pages: Vec::new(),
            candidates: 0,
            skipped_listings: 0,
            invalid_candidates: 0,
            detail_failures: 0,
            upsert: UpsertSummary::default(),
            aborted: None,
            resume_page: None,
        };
        let mut last_complete_page = start_page - 1;

        loop {
            let report = match cursor.next_page().await {
                Ok(Some(report)) => report,
                Ok(None) => break,
                Err(err @ AdapterError::Outage { .. }) => {
                    warn!(error = %err, "aborting scrape pass");
                    summary.aborted = Some(err.to_string());
                    summary.resume_page = Some(last_complete_page + 1);
                    break;
                }
                Err(err) => return Err(err),
            };

            summary.pages_fetched += 1;
            if report.is_incomplete() {
                summary.incomplete_pages.push(report.page);
                continue;
            }
            last_complete_page = report.page;
            summary.candidates += report.candidates.len();
            summary.skipped_listings += report.skipped.len();
            summary.detail_failures += report.detail_failures.len();

            let mut drafts = Vec::with_capacity(report.candidates.len());
            for raw in &report.candidates {
                match RestaurantDraft::from_candidate(raw, &self.overrides) {
                    Ok(draft) => drafts.push(draft),
                    Err(err) => {
                        warn!(error = %err, page = report.page, "dropping invalid candidate");
                        summary.invalid_candidates += 1;
                    }
                }
            }
            summary.upsert.merge(self.engine.upsert_batch(drafts).await);
        }

        summary.finished_at = Utc::now();
        info!(
            pages = summary.pages_fetched,
            candidates = summary.candidates,
            inserted = summary.upsert.inserted,
            updated = summary.upsert.updated,
            skipped = summary.upsert.skipped,
            failed = summary.upsert.failed,
            incomplete_pages = summary.incomplete_pages.len(),
            "scrape pass finished"
        );
        Ok(summary)
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise the JSON snapshot at `KOSHER_STORE_PATH`.
pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn RestaurantStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgRestaurantStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("migrating postgres schema")?;
            Ok(Arc::new(store))
        }
        None => {
            let store = JsonFileStore::open(&config.store_path)
                .await
                .with_context(|| format!("opening {}", config.store_path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// Everything a process needs to run passes, wired once and shared by cron jobs.
pub struct PipelineRuntime {
    config: PipelineConfig,
    file: PipelineFile,
    http: Arc<HttpFetcher>,
    engine: Arc<UpsertEngine>,
    overrides: Arc<OverrideList>,
    refresh: Option<Arc<RefreshScheduler>>,
}

impl PipelineRuntime {
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let file = PipelineFile::load(config.pipeline_file_path())?;
        let store = open_store(&config).await?;
        Self::with_store(config, file, store)
    }

    pub fn with_store(
        config: PipelineConfig,
        file: PipelineFile,
        store: Arc<dyn RestaurantStore>,
    ) -> Result<Self> {
        let overrides = load_overrides(file.overrides_path(&config.workspace_root))?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let engine = Arc::new(UpsertEngine::new(store));

        let refresh = match &config.google_places_api_key {
            Some(api_key) => {
                let places = GooglePlacesConfig {
                    min_name_similarity: file.refresh.min_name_similarity,
                    ..GooglePlacesConfig::new(api_key.clone())
                };
                let provider = Arc::new(GooglePlacesClient::new(http.clone(), places));
                Some(Arc::new(RefreshScheduler::new(
                    engine.clone(),
                    provider,
                    Arc::new(DailyQuota::new(file.refresh.daily_quota, Utc::now())),
                    file.refresh_config(),
                )))
            }
            None => None,
        };

        Ok(Self {
            config,
            file,
            http,
            engine,
            overrides: Arc::new(overrides),
            refresh,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<UpsertEngine> {
        &self.engine
    }

    pub fn scrape_pipeline(&self) -> ScrapePipeline {
        let extractor = self.file.extractor_config();
        let fetcher = HttpPageFetcher::new(
            self.http.clone(),
            Uuid::new_v4(),
            extractor.source_id.clone(),
        );
        ScrapePipeline::new(
            extractor,
            Arc::new(fetcher),
            self.engine.clone(),
            self.overrides.clone(),
        )
    }

    pub fn refresh_scheduler(&self) -> Result<Arc<RefreshScheduler>> {
        self.refresh
            .clone()
            .context("GOOGLE_PLACES_API_KEY is not set; refresh runs are unavailable")
    }

    /// Cron-driven scrape and refresh jobs, or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let runtime = self.clone();
        let scrape_cron = self.config.scrape_cron.clone();
        let scrape_job = Job::new_async(scrape_cron.as_str(), move |_uuid, _l| {
            let runtime = runtime.clone();
            Box::pin(async move {
                match runtime.scrape_pipeline().run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled scrape pass done"),
                    Err(err) => error!(error = %err, "scheduled scrape pass failed"),
                }
            })
        })
        .with_context(|| format!("creating scrape job for cron {scrape_cron}"))?;
        sched.add(scrape_job).await.context("adding scrape job")?;

        match self.refresh.clone() {
            Some(refresh) => {
                let refresh_cron = self.config.refresh_cron.clone();
                let refresh_job = Job::new_async(refresh_cron.as_str(), move |_uuid, _l| {
                    let refresh = refresh.clone();
                    Box::pin(async move {
                        match refresh.run_once().await {
                            Ok(summary) => {
                                info!(run_id = %summary.run_id, "scheduled refresh run done")
                            }
                            Err(err) => error!(error = %err, "scheduled refresh run failed"),
                        }
                    })
                })
                .with_context(|| format!("creating refresh job for cron {refresh_cron}"))?;
                sched.add(refresh_job).await.context("adding refresh job")?;
            }
            None => warn!("GOOGLE_PLACES_API_KEY is not set; refresh job not scheduled"),
        }

        Ok(Some(sched))
    }
}

pub async fn run_scrape_once_from_env() -> Result<ScrapeRunSummary> {
    let runtime = PipelineRuntime::from_config(PipelineConfig::from_env()).await?;
    Ok(runtime.scrape_pipeline().run_once().await?)
}

pub async fn run_refresh_once_from_env() -> Result<RefreshRunSummary> {
    let runtime = PipelineRuntime::from_config(PipelineConfig::from_env()).await?;
    Ok(runtime.refresh_scheduler()?.run_once().await?)
}

/// Summary rendered for operators, as written by the CLI.
pub fn summary_json<T: Serialize>(summary: &T) -> Result<String> {
    serde_json::to_string_pretty(summary).context("serializing run summary")
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use kosher_adapters::FixturePageFetcher;
    use kosher_core::KosherCategory;
    use kosher_storage::MemoryRestaurantStore;

    use super::*;

    const BASE: &str = "https://kosher-agency.example/restaurants/";

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn agency_fetcher() -> FixturePageFetcher {
        let dir = workspace_root().join("fixtures").join("kosher-agency");
        let pages = [
            (BASE.to_string(), "listing_page_1.html"),
            (format!("{BASE}page/2/"), "listing_page_2.html"),
            (
                "https://kosher-agency.example/restaurant/cafe-noir/".to_string(),
                "detail_cafe-noir.html",
            ),
            (
                "https://kosher-agency.example/restaurant/grill-house/".to_string(),
                "detail_grill-house.html",
            ),
            (
                "https://kosher-agency.example/restaurant/bagel-spot/".to_string(),
                "detail_bagel-spot.html",
            ),
        ];
        pages
            .into_iter()
            .try_fold(FixturePageFetcher::new(), |fetcher, (url, file)| {
                fetcher.with_fixture_file(url, dir.join(file))
            })
            .unwrap()
    }

    fn pipeline(
        fetcher: FixturePageFetcher,
        store: Arc<dyn RestaurantStore>,
        overrides: OverrideList,
    ) -> ScrapePipeline {
        ScrapePipeline::new(
            ExtractorConfig::new("kosher-agency", BASE),
            Arc::new(fetcher),
            Arc::new(UpsertEngine::new(store)),
            Arc::new(overrides),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn second_identical_pass_is_a_no_op() {
        let store = Arc::new(MemoryRestaurantStore::new());
        let pipeline = pipeline(agency_fetcher(), store.clone(), OverrideList::default());

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.pages_fetched, 2);
        assert_eq!(first.candidates, 4);
        assert_eq!(first.skipped_listings, 1);
        assert_eq!(first.upsert.inserted, 4);
        let snapshot = store.all().await;

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.upsert.inserted, 0);
        assert_eq!(second.upsert.updated, 0);
        assert_eq!(second.upsert.skipped, 4);
        assert_eq!(store.all().await, snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn scraped_records_are_categorized_and_normalized() {
        let store = Arc::new(MemoryRestaurantStore::new());
        let mut overrides = OverrideList::default();
        overrides
            .pas_yisroel
            .insert("url:kosher-agency.example/restaurant/cafe-noir".into());
        pipeline(agency_fetcher(), store.clone(), overrides)
            .run_once()
            .await
            .unwrap();

        let noir = store
            .find_by_natural_key("url:kosher-agency.example/restaurant/cafe-noir")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(noir.kosher_category, KosherCategory::Dairy);
        assert!(noir.is_chalav_yisroel);
        assert!(noir.is_pas_yisroel);
        assert_eq!(noir.phone.as_deref(), Some("(718) 555-0101"));
        assert_eq!(
            noir.hours_canonical.as_deref(),
            Some("Sun-Thu 8:00 AM – 10:00 PM, Fri 8:00 AM – 2:00 PM, Sat Closed")
        );
        assert_eq!(noir.address.zip.as_deref(), Some("11230"));

        let bagel = store
            .find_by_natural_key("url:kosher-agency.example/restaurant/bagel-spot")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bagel.kosher_category, KosherCategory::Pareve);
        assert!(!bagel.is_chalav_yisroel);
        assert_eq!(
            bagel.hours_canonical.as_deref(),
            Some("Sun-Sat 6:00 AM – 3:00 PM")
        );
        assert_eq!(bagel.address.state.as_deref(), Some("FL"));

        let sushi = store
            .find_by_natural_key("url:kosher-agency.example/restaurant/sushi-yam")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sushi.kosher_category, KosherCategory::Fish);
        assert_eq!(sushi.hours_canonical, None);
        assert_eq!(sushi.photo_url, None);
    }

    #[tokio::test(start_paused = true)]
    async fn natural_keys_stay_unique_across_repeated_and_resumed_passes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path().join("restaurants.json")).await.unwrap());
        let pipeline = pipeline(agency_fetcher(), store.clone(), OverrideList::default());

        pipeline.run_once().await.unwrap();
        pipeline.run_from(2).await.unwrap();
        pipeline.run_once().await.unwrap();

        let reopened = JsonFileStore::open(dir.path().join("restaurants.json")).await.unwrap();
        let rows = reopened.all().await;
        let mut keys: Vec<_> = rows.iter().map(|r| r.natural_key.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(rows.len(), 4);
        assert_eq!(keys.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_aborts_with_resume_page() {
        let fetcher = FixturePageFetcher::new()
            .with_failure(BASE, 503)
            .with_failure(format!("{BASE}page/2/"), 503)
            .with_failure(format!("{BASE}page/3/"), 503);
        let store = Arc::new(MemoryRestaurantStore::new());
        let summary = pipeline(fetcher, store.clone(), OverrideList::default())
            .run_once()
            .await
            .unwrap();

        assert!(summary.aborted.is_some());
        assert_eq!(summary.resume_page, Some(1));
        assert_eq!(summary.incomplete_pages, vec![1, 2]);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let mut config = PipelineConfig::from_env();
        config.workspace_root = workspace_root();
        config.scheduler_enabled = false;
        config.google_places_api_key = None;
        let file = PipelineFile::load(config.pipeline_file_path()).unwrap();
        let runtime = Arc::new(
            PipelineRuntime::with_store(config, file, Arc::new(MemoryRestaurantStore::new()))
                .unwrap(),
        );
        assert!(runtime.maybe_build_scheduler().await.unwrap().is_none());
        assert!(runtime.refresh_scheduler().is_err());
    }

    #[test]
    fn summaries_serialize_for_operators() {
        let summary = UpsertSummary {
            inserted: 1,
            ..Default::default()
        };
        let json = summary_json(&summary).unwrap();
        assert!(json.contains("\"inserted\": 1"));
    }
}
