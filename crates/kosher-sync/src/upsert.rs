//! Deduplication and upsert of normalized drafts against the restaurant store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kosher_core::normalize::normalize_phone;
use kosher_core::{
    is_canonical_hours, Address, HoursSource, NormalizedRestaurant, RestaurantDraft,
};
use kosher_storage::{RestaurantStore, StorageError};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Updated(Uuid),
    Skipped(Uuid),
}

impl UpsertOutcome {
    pub fn id(self) -> Uuid {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Skipped(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertFailure {
    pub natural_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<UpsertFailure>,
}

impl UpsertSummary {
    pub fn record(&mut self, natural_key: &str, result: &Result<UpsertOutcome, StorageError>) {
        match result {
            Ok(UpsertOutcome::Inserted(_)) => self.inserted += 1,
            Ok(UpsertOutcome::Updated(_)) => self.updated += 1,
            Ok(UpsertOutcome::Skipped(_)) => self.skipped += 1,
            Err(err) => {
                self.failed += 1;
                self.failures.push(UpsertFailure {
                    natural_key: natural_key.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    pub fn merge(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }
}

/// Resolves drafts to stored records and writes only what changed.
///
/// Writes are serialized per identity key, so two passes racing on the same
/// listing cannot both decide to insert it.
pub struct UpsertEngine {
    store: Arc<dyn RestaurantStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn RestaurantStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RestaurantStore> {
        &self.store
    }

    pub async fn upsert_batch(&self, drafts: Vec<RestaurantDraft>) -> UpsertSummary {
        let mut summary = UpsertSummary::default();
        for draft in drafts {
            let result = self.upsert(&draft, Utc::now()).await;
            if let Err(err) = &result {
                warn!(natural_key = %draft.natural_key, error = %err, "upsert failed");
            }
            summary.record(&draft.natural_key, &result);
        }
        summary
    }

    /// One resolve/merge/write cycle, retried once from the top on failure.
    pub async fn upsert(
        &self,
        draft: &RestaurantDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let keys = [draft.natural_key.as_str(), draft.composite_key.as_str()];
        let guards = self.lock_keys(&keys).await;
        let result = match self.attempt(draft, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                debug!(natural_key = %draft.natural_key, error = %err, "retrying upsert");
                self.attempt(draft, now).await
            }
        };
        drop(guards);
        self.release_keys(&keys).await;
        result
    }

    /// Applies provider hours to the record as currently stored, leaving every
    /// other field alone. `Ok(None)` when the record no longer exists.
    pub async fn apply_provider_hours(
        &self,
        record: &NormalizedRestaurant,
        hours_canonical: String,
        now: DateTime<Utc>,
    ) -> Result<Option<UpsertOutcome>, StorageError> {
        let keys = [record.natural_key.as_str(), record.composite_key.as_str()];
        let guards = self.lock_keys(&keys).await;
        let result = match self.attempt_hours(&record.natural_key, &hours_canonical, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                debug!(natural_key = %record.natural_key, error = %err, "retrying hours write");
                self.attempt_hours(&record.natural_key, &hours_canonical, now)
                    .await
            }
        };
        drop(guards);
        self.release_keys(&keys).await;
        result
    }

    async fn attempt_hours(
        &self,
        natural_key: &str,
        hours_canonical: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UpsertOutcome>, StorageError> {
        let Some(current) = self.store.find_by_natural_key(natural_key).await? else {
            return Ok(None);
        };
        let id = stored_id(&current)?;
        let mut draft = RestaurantDraft::from_record(&current);
        draft.hours_canonical = Some(hours_canonical.to_string());
        draft.hours_source = Some(HoursSource::ExternalProvider);
        match merge(&current, &draft, now) {
            Some(merged) => {
                self.store.upsert(&merged).await?;
                Ok(Some(UpsertOutcome::Updated(id)))
            }
            None => Ok(Some(UpsertOutcome::Skipped(id))),
        }
    }

    async fn attempt(
        &self,
        draft: &RestaurantDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        match self.resolve(draft).await? {
            None => {
                let mut record = NormalizedRestaurant::from_draft(draft.clone(), now);
                if !sanitize_hours(&mut record.hours_canonical) {
                    record.hours_source = None;
                    record.hours_updated_at = None;
                }
                let id = self.store.upsert(&record).await?;
                Ok(UpsertOutcome::Inserted(id))
            }
            Some(existing) => {
                let id = stored_id(&existing)?;
                match merge(&existing, draft, now) {
                    Some(merged) => {
                        self.store.upsert(&merged).await?;
                        Ok(UpsertOutcome::Updated(id))
                    }
                    None => Ok(UpsertOutcome::Skipped(id)),
                }
            }
        }
    }

    async fn resolve(
        &self,
        draft: &RestaurantDraft,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        if let Some(found) = self.store.find_by_natural_key(&draft.natural_key).await? {
            return Ok(Some(found));
        }
        // A composite hit only stands in for a record that never had a detail URL.
        let found = self.store.find_by_composite_key(&draft.composite_key).await?;
        Ok(found.filter(|r| r.natural_key == r.composite_key))
    }

    // Guards are taken in sorted order so overlapping key sets cannot deadlock.
    async fn lock_keys(&self, keys: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<&str> = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let locks: Vec<Arc<Mutex<()>>> = {
            let mut map = self.locks.lock().await;
            keys.iter()
                .map(|key| {
                    map.entry((*key).to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone()
                })
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    // Call after the guards are dropped. An entry some other task still holds
    // or waits on has more than one reference and stays.
    async fn release_keys(&self, keys: &[&str]) {
        let mut map = self.locks.lock().await;
        for key in keys {
            if map.get(*key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                map.remove(*key);
            }
        }
    }

    #[cfg(test)]
    async fn held_lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

fn stored_id(record: &NormalizedRestaurant) -> Result<Uuid, StorageError> {
    record.id.ok_or_else(|| {
        StorageError::Backend(format!("stored restaurant {} has no id", record.natural_key))
    })
}

/// Clears hours that fail the canonical grammar. Returns false when it had to.
fn sanitize_hours(hours: &mut Option<String>) -> bool {
    match hours {
        Some(value) if !is_canonical_hours(value) => {
            warn!(hours = %value, "discarding non-canonical hours");
            *hours = None;
            false
        }
        _ => true,
    }
}

fn prefer_incoming(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    incoming.clone().or_else(|| existing.clone())
}

/// Applies the overwrite-eligible fields of `incoming` onto `existing`.
/// `None` means nothing tracked changed and no write is needed.
///
/// Identity (id, natural and composite keys) and the name stay as stored.
/// Empty incoming structural fields never erase stored values. Phones compare
/// in canonical form, so a reformatted number is not a change.
pub fn merge(
    existing: &NormalizedRestaurant,
    incoming: &RestaurantDraft,
    now: DateTime<Utc>,
) -> Option<NormalizedRestaurant> {
    let mut merged = existing.clone();

    if incoming.address != Address::default() {
        merged.address = incoming.address.clone();
    }
    let stored_phone = existing.phone.as_deref().and_then(normalize_phone);
    let incoming_phone = incoming.phone.as_deref().and_then(normalize_phone);
    if incoming_phone.is_some() && incoming_phone != stored_phone {
        merged.phone = incoming_phone;
    }
    merged.website = prefer_incoming(&existing.website, &incoming.website);
    merged.photo_url = prefer_incoming(&existing.photo_url, &incoming.photo_url);
    merged.source_url = prefer_incoming(&existing.source_url, &incoming.source_url);
    merged.supervision_notes =
        prefer_incoming(&existing.supervision_notes, &incoming.supervision_notes);
    merged.certificate_link =
        prefer_incoming(&existing.certificate_link, &incoming.certificate_link);

    merged.kosher_category = incoming.kosher_category;
    merged.is_chalav_yisroel = incoming.is_chalav_yisroel;
    merged.is_pas_yisroel = incoming.is_pas_yisroel;

    let mut hours_verified = false;
    match incoming.hours_source {
        Some(HoursSource::ExternalProvider) => {
            let mut hours = incoming.hours_canonical.clone();
            if sanitize_hours(&mut hours) {
                merged.hours_canonical = hours;
                merged.hours_source = Some(HoursSource::ExternalProvider);
                hours_verified = merged.hours_canonical.is_some();
            } else {
                merged.hours_canonical = None;
            }
        }
        Some(HoursSource::Scraped) => {
            let replaceable = existing.hours_canonical.is_none()
                || existing.hours_source == Some(HoursSource::Scraped);
            let mut hours = incoming.hours_canonical.clone();
            if !sanitize_hours(&mut hours) {
                if replaceable {
                    merged.hours_canonical = None;
                }
            } else if replaceable && hours.is_some() {
                merged.hours_canonical = hours;
                merged.hours_source = Some(HoursSource::Scraped);
            }
        }
        None => {}
    }

    let hours_changed = merged.hours_canonical != existing.hours_canonical;
    if hours_changed || hours_verified {
        merged.hours_updated_at = merged.hours_canonical.as_ref().map(|_| now);
    }

    if merged == *existing {
        return None;
    }
    merged.updated_at = now;
    Some(merged)
}
