//! Quota-aware refresh of stale or missing hours from the places provider.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use kosher_core::{normalize_hours, NormalizedRestaurant};
use kosher_storage::{MinIntervalGate, StorageError};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::provider::{PlacesProvider, ProviderError};
use crate::upsert::UpsertEngine;

/// Remaining provider calls. Decrements are atomic and never go below zero.
#[derive(Debug)]
pub struct QuotaCounter {
    remaining: AtomicU32,
}

impl QuotaCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            remaining: AtomicU32::new(limit),
        }
    }

    /// Takes one unit; `false` once the counter is at zero.
    pub fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Provider budget shared by every run in the process, reset at UTC midnight.
#[derive(Debug)]
pub struct DailyQuota {
    limit: u32,
    current: Mutex<(NaiveDate, Arc<QuotaCounter>)>,
}

impl DailyQuota {
    pub fn new(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            current: Mutex::new((now.date_naive(), Arc::new(QuotaCounter::new(limit)))),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Counter for the UTC day containing `now`.
    pub async fn counter(&self, now: DateTime<Utc>) -> Arc<QuotaCounter> {
        let mut current = self.current.lock().await;
        let today = now.date_naive();
        if current.0 != today {
            *current = (today, Arc::new(QuotaCounter::new(self.limit)));
        }
        current.1.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub staleness: chrono::Duration,
    pub per_run_quota: u32,
    pub provider_delay: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            staleness: chrono::Duration::days(7),
            per_run_quota: 50,
            provider_delay: Duration::from_millis(500),
            max_consecutive_failures: 5,
        }
    }
}

/// Per-record lifecycle within one refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Pending,
    Resolving,
    ResolvedFound,
    ResolvedNotFound,
    Updated,
    UpdateSkippedUnparsed,
    UpdateFailed,
    ProviderFailed,
}

impl RefreshState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Resolving | Self::ResolvedFound)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshRecordOutcome {
    pub restaurant_id: Option<Uuid>,
    pub natural_key: String,
    pub state: RefreshState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub attempted: usize,
    pub updated: usize,
    pub not_found: usize,
    pub skipped_unparsed: usize,
    pub update_failed: usize,
    pub provider_failed: usize,
    pub quota_exhausted: bool,
    /// Set when the run stopped on a sustained provider outage.
    pub aborted: Option<String>,
    pub outcomes: Vec<RefreshRecordOutcome>,
}

impl RefreshRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            selected: 0,
            attempted: 0,
            updated: 0,
            not_found: 0,
            skipped_unparsed: 0,
            update_failed: 0,
            provider_failed: 0,
            quota_exhausted: false,
            aborted: None,
            outcomes: Vec::new(),
        }
    }

    fn count(&mut self, outcome: RefreshRecordOutcome) {
        match outcome.state {
            RefreshState::Updated => self.updated += 1,
            RefreshState::ResolvedNotFound => self.not_found += 1,
            RefreshState::UpdateSkippedUnparsed => self.skipped_unparsed += 1,
            RefreshState::UpdateFailed => self.update_failed += 1,
            RefreshState::ProviderFailed => self.provider_failed += 1,
            RefreshState::Pending | RefreshState::Resolving | RefreshState::ResolvedFound => {}
        }
        self.outcomes.push(outcome);
    }
}

struct RecordRefresh {
    state: RefreshState,
    provider_error: Option<ProviderError>,
    error: Option<String>,
}

impl RecordRefresh {
    fn done(state: RefreshState) -> Self {
        Self {
            state,
            provider_error: None,
            error: None,
        }
    }

    fn provider_failed(err: ProviderError) -> Self {
        Self {
            state: RefreshState::ProviderFailed,
            error: Some(err.to_string()),
            provider_error: Some(err),
        }
    }
}

/// Pulls hours for the stalest records, one provider round-trip pair per record.
pub struct RefreshScheduler {
    engine: Arc<UpsertEngine>,
    provider: Arc<dyn PlacesProvider>,
    daily: Arc<DailyQuota>,
    config: RefreshConfig,
    gate: MinIntervalGate,
}

impl RefreshScheduler {
    pub fn new(
        engine: Arc<UpsertEngine>,
        provider: Arc<dyn PlacesProvider>,
        daily: Arc<DailyQuota>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            gate: MinIntervalGate::new(config.provider_delay),
            engine,
            provider,
            daily,
            config,
        }
    }

    /// One refresh run. Only a failure to list candidates fails the run;
    /// per-record problems are counted in the summary.
    pub async fn run_once(&self) -> Result<RefreshRunSummary, StorageError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RefreshRunSummary, StorageError> {
        let started_at = Utc::now();
        let mut summary = RefreshRunSummary::new(run_id, started_at);
        let daily = self.daily.counter(started_at).await;
        let run_quota = QuotaCounter::new(self.config.per_run_quota);

        let budget = run_quota.remaining().min(daily.remaining());
        if budget == 0 {
            info!("no provider quota left, skipping refresh run");
            summary.quota_exhausted = true;
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let threshold = started_at - self.config.staleness;
        let candidates = self
            .engine
            .store()
            .list_stale_hours(threshold, budget as usize)
            .await?;
        summary.selected = candidates.len();

        let mut consecutive_failures = 0u32;
        for record in &candidates {
            if !run_quota.try_take() || !daily.try_take() {
                summary.quota_exhausted = true;
                break;
            }
            summary.attempted += 1;

            let result = self.refresh_record(record).await;
            let quota_hit = matches!(result.provider_error, Some(ProviderError::QuotaExceeded));
            let retryable_failure = result
                .provider_error
                .as_ref()
                .is_some_and(ProviderError::is_retryable);
            if let Some(error) = &result.error {
                warn!(natural_key = %record.natural_key, state = ?result.state, %error, "refresh incomplete");
            }
            summary.count(RefreshRecordOutcome {
                restaurant_id: record.id,
                natural_key: record.natural_key.clone(),
                state: result.state,
                error: result.error,
            });

            if quota_hit {
                warn!("provider reported quota exceeded, halting run");
                summary.quota_exhausted = true;
                break;
            }
            if retryable_failure {
                consecutive_failures += 1;
                if consecutive_failures >= self.config.max_consecutive_failures.max(1) {
                    let reason = format!("{consecutive_failures} consecutive provider failures");
                    warn!(%reason, "aborting refresh run");
                    summary.aborted = Some(reason);
                    break;
                }
            } else {
                consecutive_failures = 0;
            }
        }

        if run_quota.is_exhausted() || daily.is_exhausted() {
            summary.quota_exhausted = true;
        }
        summary.finished_at = Utc::now();
        info!(
            selected = summary.selected,
            attempted = summary.attempted,
            updated = summary.updated,
            not_found = summary.not_found,
            skipped_unparsed = summary.skipped_unparsed,
            update_failed = summary.update_failed,
            provider_failed = summary.provider_failed,
            quota_exhausted = summary.quota_exhausted,
            "refresh run finished"
        );
        Ok(summary)
    }

    async fn refresh_record(&self, record: &NormalizedRestaurant) -> RecordRefresh {
        self.gate.wait().await;
        let id = match self
            .provider
            .resolve(&record.name, &record.address.one_line())
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => return RecordRefresh::done(RefreshState::ResolvedNotFound),
            Err(err) => return RecordRefresh::provider_failed(err),
        };

        self.gate.wait().await;
        let text = match self.provider.get_hours(&id).await {
            Ok(Some(text)) => text,
            Ok(None) => return RecordRefresh::done(RefreshState::UpdateSkippedUnparsed),
            Err(err) => return RecordRefresh::provider_failed(err),
        };
        let Some(canonical) = normalize_hours(&text) else {
            return RecordRefresh::done(RefreshState::UpdateSkippedUnparsed);
        };

        match self
            .engine
            .apply_provider_hours(record, canonical, Utc::now())
            .await
        {
            Ok(Some(_)) => RecordRefresh::done(RefreshState::Updated),
            Ok(None) => RecordRefresh {
                state: RefreshState::UpdateFailed,
                provider_error: None,
                error: Some("record vanished during refresh".to_string()),
            },
            Err(err) => RecordRefresh {
                state: RefreshState::UpdateFailed,
                provider_error: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use kosher_core::{Address, HoursSource, KosherCategory, RestaurantDraft};
    use kosher_storage::{MemoryRestaurantStore, RestaurantStore};

    use super::*;
    use crate::provider::ProviderEntityId;

    #[derive(Default)]
    struct MockProvider {
        hours: HashMap<String, Option<String>>,
        quota_after: Option<usize>,
        outage: bool,
        resolve_calls: AtomicUsize,
        resolved: std::sync::Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn with_hours(mut self, name: &str, hours: Option<&str>) -> Self {
            self.hours.insert(name.to_string(), hours.map(str::to_string));
            self
        }
    }

    #[async_trait]
    impl PlacesProvider for MockProvider {
        async fn resolve(
            &self,
            name: &str,
            _address: &str,
        ) -> Result<Option<ProviderEntityId>, ProviderError> {
            let calls = self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.resolved.lock().unwrap().push(name.to_string());
            if self.outage {
                return Err(kosher_storage::FetchError::HttpStatus {
                    status: 503,
                    url: "https://places.example".into(),
                }
                .into());
            }
            if self.quota_after.is_some_and(|limit| calls >= limit) {
                return Err(ProviderError::QuotaExceeded);
            }
            Ok(self
                .hours
                .contains_key(name)
                .then(|| ProviderEntityId(name.to_string())))
        }

        async fn get_hours(
            &self,
            id: &ProviderEntityId,
        ) -> Result<Option<String>, ProviderError> {
            Ok(self.hours.get(&id.0).cloned().flatten())
        }
    }

    fn record(name: &str, hours: Option<&str>, hours_age_days: i64) -> NormalizedRestaurant {
        let now = Utc::now();
        let hours_at = hours.map(|_| now - ChronoDuration::days(hours_age_days));
        NormalizedRestaurant {
            id: None,
            natural_key: format!("url:agency.example/{}", name.to_lowercase().replace(' ', "-")),
            composite_key: format!("na:{}|", name.to_lowercase()),
            name: name.to_string(),
            address: Address {
                street: Some("1 Main St".into()),
                city: Some("Brooklyn".into()),
                state: Some("NY".into()),
                zip: None,
            },
            phone: None,
            website: None,
            photo_url: None,
            source_url: None,
            supervision_notes: None,
            kosher_category: KosherCategory::Meat,
            is_chalav_yisroel: false,
            is_pas_yisroel: false,
            certificate_link: None,
            hours_canonical: hours.map(str::to_string),
            hours_source: hours.map(|_| HoursSource::Scraped),
            hours_updated_at: hours_at,
            created_at: now - ChronoDuration::days(60),
            updated_at: now - ChronoDuration::days(60),
        }
    }

    fn scheduler(
        records: Vec<NormalizedRestaurant>,
        provider: MockProvider,
        per_run_quota: u32,
        daily_limit: u32,
    ) -> (Arc<MemoryRestaurantStore>, Arc<MockProvider>, RefreshScheduler) {
        let store = Arc::new(MemoryRestaurantStore::with_records(records).unwrap());
        let provider = Arc::new(provider);
        let engine = Arc::new(UpsertEngine::new(store.clone()));
        let scheduler = RefreshScheduler::new(
            engine,
            provider.clone(),
            Arc::new(DailyQuota::new(daily_limit, Utc::now())),
            RefreshConfig {
                per_run_quota,
                provider_delay: std::time::Duration::from_millis(200),
                max_consecutive_failures: 2,
                ..Default::default()
            },
        );
        (store, provider, scheduler)
    }

    const OLD_HOURS: &str = "Sun-Thu 11:00 AM – 10:00 PM, Fri 11:00 AM – 3:00 PM, Sat Closed";

    #[test]
    fn counter_never_goes_negative() {
        let counter = QuotaCounter::new(2);
        assert!(counter.try_take());
        assert!(counter.try_take());
        assert!(!counter.try_take());
        assert_eq!(counter.remaining(), 0);
    }

    #[tokio::test]
    async fn daily_quota_replenishes_on_utc_rollover() {
        let today = Utc::now();
        let daily = DailyQuota::new(1, today);
        assert!(daily.counter(today).await.try_take());
        assert!(!daily.counter(today).await.try_take());
        let tomorrow = today + ChronoDuration::days(1);
        assert!(daily.counter(tomorrow).await.try_take());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_calls_never_exceed_quota() {
        let records: Vec<_> = ["A", "B", "C", "D", "E"]
            .into_iter()
            .map(|n| record(n, None, 0))
            .collect();
        let mut provider = MockProvider::default();
        for name in ["A", "B", "C", "D", "E"] {
            provider = provider.with_hours(name, Some("Daily 9am-5pm"));
        }
        let (_, provider, scheduler) = scheduler(records, provider, 3, 100);

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.updated, 3);
        assert!(summary.quota_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_hours_go_first_then_oldest() {
        let records = vec![
            record("Fresh", Some(OLD_HOURS), 1),
            record("Old", Some(OLD_HOURS), 30),
            record("Older", Some(OLD_HOURS), 90),
            record("Missing", None, 0),
        ];
        let provider = MockProvider::default();
        let (_, provider, scheduler) = scheduler(records, provider, 10, 100);

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(summary.selected, 3);
        assert_eq!(summary.not_found, 3);
        assert_eq!(
            *provider.resolved.lock().unwrap(),
            vec!["Missing".to_string(), "Older".to_string(), "Old".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn provider_hours_are_normalized_and_stored() {
        let records = vec![record("Grill House", Some(OLD_HOURS), 30)];
        let provider = MockProvider::default().with_hours(
            "Grill House",
            Some("Monday: 9:00 AM – 5:00 PM\nTuesday: 9:00 AM – 5:00 PM"),
        );
        let (store, _, scheduler) = scheduler(records, provider, 10, 100);

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.outcomes[0].state, RefreshState::Updated);

        let row = store.all().await.remove(0);
        assert_eq!(row.hours_canonical.as_deref(), Some("Mon-Tue 9:00 AM – 5:00 PM"));
        assert_eq!(row.hours_source, Some(HoursSource::ExternalProvider));
        assert!(row.hours_updated_at.unwrap() > Utc::now() - ChronoDuration::minutes(1));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_and_unparsed_leave_records_untouched() {
        let records = vec![
            record("Ghost", Some(OLD_HOURS), 30),
            record("Garbled", Some(OLD_HOURS), 20),
        ];
        let provider =
            MockProvider::default().with_hours("Garbled", Some("🔴 Closed • Sunday: Closed"));
        let (store, _, scheduler) = scheduler(records, provider, 10, 100);
        let before = store.all().await;

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.skipped_unparsed, 1);
        assert_eq!(store.all().await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exceeded_halts_and_keeps_processed_records() {
        let records = vec![
            record("A", None, 0),
            record("B", Some(OLD_HOURS), 90),
            record("C", Some(OLD_HOURS), 30),
        ];
        let provider = MockProvider {
            quota_after: Some(1),
            ..MockProvider::default()
                .with_hours("A", Some("Daily 9am-5pm"))
                .with_hours("B", Some("Daily 9am-5pm"))
                .with_hours("C", Some("Daily 9am-5pm"))
        };
        let (store, provider, scheduler) = scheduler(records, provider, 10, 100);

        let summary = scheduler.run_once().await.unwrap();
        assert!(summary.quota_exhausted);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.provider_failed, 1);
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 2);

        let a = store
            .find_by_natural_key("url:agency.example/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.hours_canonical.as_deref(), Some("Sun-Sat 9:00 AM – 5:00 PM"));
    }

    #[tokio::test(start_paused = true)]
    async fn daily_quota_is_shared_across_runs() {
        let records: Vec<_> = ["A", "B", "C", "D"]
            .into_iter()
            .map(|n| record(n, None, 0))
            .collect();
        let (_, provider, scheduler) = scheduler(records, MockProvider::default(), 3, 4);

        let first = scheduler.run_once().await.unwrap();
        assert_eq!(first.attempted, 3);
        let second = scheduler.run_once().await.unwrap();
        assert_eq!(second.attempted, 1);
        let third = scheduler.run_once().await.unwrap();
        assert_eq!(third.attempted, 0);
        assert!(third.quota_exhausted);
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_outage_aborts_run() {
        let records: Vec<_> = ["A", "B", "C", "D"]
            .into_iter()
            .map(|n| record(n, None, 0))
            .collect();
        let provider = MockProvider {
            outage: true,
            ..Default::default()
        };
        let (_, provider, scheduler) = scheduler(records, provider, 10, 100);

        let summary = scheduler.run_once().await.unwrap();
        assert!(summary.aborted.is_some());
        assert_eq!(summary.provider_failed, 2);
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 2);
    }

    /// Lands a scrape write between the refresh snapshot and the hours write.
    struct ScrapeDuringResolve {
        engine: Arc<UpsertEngine>,
        rescraped: RestaurantDraft,
    }

    #[async_trait]
    impl PlacesProvider for ScrapeDuringResolve {
        async fn resolve(
            &self,
            name: &str,
            _address: &str,
        ) -> Result<Option<ProviderEntityId>, ProviderError> {
            let outcome = self.engine.upsert(&self.rescraped, Utc::now()).await.unwrap();
            assert!(matches!(outcome, crate::upsert::UpsertOutcome::Updated(_)));
            Ok(Some(ProviderEntityId(name.to_string())))
        }

        async fn get_hours(
            &self,
            _id: &ProviderEntityId,
        ) -> Result<Option<String>, ProviderError> {
            Ok(Some("Daily 9am-5pm".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_scrape_changes_made_during_the_run() {
        let store = Arc::new(
            MemoryRestaurantStore::with_records(vec![record("Cafe Noir", Some(OLD_HOURS), 30)])
                .unwrap(),
        );
        let engine = Arc::new(UpsertEngine::new(store.clone()));
        let mut rescraped = RestaurantDraft::from_record(&store.all().await[0]);
        rescraped.phone = Some("(212) 555-9999".into());
        rescraped.kosher_category = KosherCategory::Pareve;
        let scheduler = RefreshScheduler::new(
            engine.clone(),
            Arc::new(ScrapeDuringResolve {
                engine: engine.clone(),
                rescraped,
            }),
            Arc::new(DailyQuota::new(10, Utc::now())),
            RefreshConfig::default(),
        );

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(summary.updated, 1);

        let row = store.all().await.remove(0);
        assert_eq!(row.phone.as_deref(), Some("(212) 555-9999"));
        assert_eq!(row.kosher_category, KosherCategory::Pareve);
        assert_eq!(row.hours_canonical.as_deref(), Some("Sun-Sat 9:00 AM – 5:00 PM"));
        assert_eq!(row.hours_source, Some(HoursSource::ExternalProvider));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_calls_are_spaced() {
        let records: Vec<_> = ["A", "B"].into_iter().map(|n| record(n, None, 0)).collect();
        let provider = MockProvider::default()
            .with_hours("A", Some("Daily 9am-5pm"))
            .with_hours("B", Some("Daily 9am-5pm"));
        let (_, _, scheduler) = scheduler(records, provider, 10, 100);

        let started = tokio::time::Instant::now();
        scheduler.run_once().await.unwrap();
        // Two records, two calls each: three gaps of 200ms.
        assert!(started.elapsed() >= std::time::Duration::from_millis(600));
    }
}
