//! Storage interface for normalized restaurants, plus in-memory and JSON-file backends.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kosher_core::NormalizedRestaurant;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("natural key {natural_key} already belongs to another restaurant")]
    Conflict { natural_key: String },
    #[error("restaurant {id} does not exist")]
    NotFound { id: Uuid },
    #[error("natural key of restaurant {id} cannot change")]
    ImmutableKey { id: Uuid },
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

/// Boundary to the persistent restaurant store.
#[async_trait]
pub trait RestaurantStore: Send + Sync {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError>;

    /// Several rows may share a composite key. A row keyed by name and address
    /// alone is preferred, then the oldest.
    async fn find_by_composite_key(
        &self,
        composite_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError>;

    /// Inserts when `record.id` is `None`, otherwise replaces the row with that id.
    /// Returns the surrogate key.
    async fn upsert(&self, record: &NormalizedRestaurant) -> Result<Uuid, StorageError>;

    /// Records with no hours or hours last set before `threshold`, most urgent first.
    async fn list_stale_hours(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NormalizedRestaurant>, StorageError>;
}

/// Refresh priority: missing hours first, then oldest `hours_updated_at`, then oldest row.
pub fn stale_hours_order(a: &NormalizedRestaurant, b: &NormalizedRestaurant) -> Ordering {
    a.hours_canonical
        .is_some()
        .cmp(&b.hours_canonical.is_some())
        .then_with(|| a.hours_updated_at.cmp(&b.hours_updated_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

fn is_stale(record: &NormalizedRestaurant, threshold: DateTime<Utc>) -> bool {
    record.hours_canonical.is_none() || record.hours_updated_at.map_or(true, |at| at < threshold)
}

#[derive(Debug, Clone, Default)]
struct Rows {
    by_id: BTreeMap<Uuid, NormalizedRestaurant>,
    by_natural_key: HashMap<String, Uuid>,
}

impl Rows {
    fn from_records(records: Vec<NormalizedRestaurant>) -> Result<Self, StorageError> {
        let mut rows = Self::default();
        for record in records {
            let id = record.id.unwrap_or_else(Uuid::new_v4);
            if rows.by_natural_key.insert(record.natural_key.clone(), id).is_some() {
                return Err(StorageError::Conflict {
                    natural_key: record.natural_key,
                });
            }
            rows.by_id.insert(id, NormalizedRestaurant { id: Some(id), ..record });
        }
        Ok(rows)
    }

    fn find_natural(&self, natural_key: &str) -> Option<NormalizedRestaurant> {
        self.by_natural_key
            .get(natural_key)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    fn find_composite(&self, composite_key: &str) -> Option<NormalizedRestaurant> {
        self.by_id
            .values()
            .filter(|r| r.composite_key == composite_key)
            .min_by_key(|r| (r.natural_key != r.composite_key, r.created_at, r.id))
            .cloned()
    }

    fn apply(&mut self, record: &NormalizedRestaurant) -> Result<Uuid, StorageError> {
        match record.id {
            None => {
                if self.by_natural_key.contains_key(&record.natural_key) {
                    return Err(StorageError::Conflict {
                        natural_key: record.natural_key.clone(),
                    });
                }
                let id = Uuid::new_v4();
                self.by_natural_key.insert(record.natural_key.clone(), id);
                self.by_id.insert(
                    id,
                    NormalizedRestaurant {
                        id: Some(id),
                        ..record.clone()
                    },
                );
                Ok(id)
            }
            Some(id) => {
                let existing = self.by_id.get_mut(&id).ok_or(StorageError::NotFound { id })?;
                if existing.natural_key != record.natural_key {
                    return Err(StorageError::ImmutableKey { id });
                }
                *existing = record.clone();
                Ok(id)
            }
        }
    }

    fn stale(&self, threshold: DateTime<Utc>, limit: usize) -> Vec<NormalizedRestaurant> {
        let mut stale: Vec<_> = self
            .by_id
            .values()
            .filter(|r| is_stale(r, threshold))
            .cloned()
            .collect();
        stale.sort_by(stale_hours_order);
        stale.truncate(limit);
        stale
    }

    fn all(&self) -> Vec<NormalizedRestaurant> {
        let mut all: Vec<_> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        all
    }
}

/// Process-local store; the reference backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRestaurantStore {
    rows: RwLock<Rows>,
}

impl MemoryRestaurantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<NormalizedRestaurant>) -> Result<Self, StorageError> {
        Ok(Self {
            rows: RwLock::new(Rows::from_records(records)?),
        })
    }

    pub async fn all(&self) -> Vec<NormalizedRestaurant> {
        self.rows.read().await.all()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RestaurantStore for MemoryRestaurantStore {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        Ok(self.rows.read().await.find_natural(natural_key))
    }

    async fn find_by_composite_key(
        &self,
        composite_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        Ok(self.rows.read().await.find_composite(composite_key))
    }

    async fn upsert(&self, record: &NormalizedRestaurant) -> Result<Uuid, StorageError> {
        self.rows.write().await.apply(record)
    }

    async fn list_stale_hours(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NormalizedRestaurant>, StorageError> {
        Ok(self.rows.read().await.stale(threshold, limit))
    }
}

/// Single JSON snapshot on disk, rewritten through a temp file + atomic rename
/// after every upsert so an interrupted run never leaves a torn file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    rows: RwLock<Rows>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let records: Vec<NormalizedRestaurant> = if fs::try_exists(&path).await? {
            let bytes = fs::read(&path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            rows: RwLock::new(Rows::from_records(records)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn all(&self) -> Vec<NormalizedRestaurant> {
        self.rows.read().await.all()
    }

    async fn persist(&self, rows: &Rows) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(&rows.all())?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl RestaurantStore for JsonFileStore {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        Ok(self.rows.read().await.find_natural(natural_key))
    }

    async fn find_by_composite_key(
        &self,
        composite_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        Ok(self.rows.read().await.find_composite(composite_key))
    }

    async fn upsert(&self, record: &NormalizedRestaurant) -> Result<Uuid, StorageError> {
        let mut rows = self.rows.write().await;
        // Apply to a copy so a failed write leaves memory and disk in agreement.
        let mut next = rows.clone();
        let id = next.apply(record)?;
        self.persist(&next).await?;
        *rows = next;
        Ok(id)
    }

    async fn list_stale_hours(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NormalizedRestaurant>, StorageError> {
        Ok(self.rows.read().await.stale(threshold, limit))
    }
}
