//! Postgres backend for [`RestaurantStore`] over the `restaurants` table created
//! by `migrations/0001_create_restaurants.sql`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kosher_core::{Address, HoursSource, KosherCategory, NormalizedRestaurant};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::store::{RestaurantStore, StorageError};

const COLUMNS: &str = "id, natural_key, composite_key, name, street, city, state, zip, phone, \
     website, photo_url, source_url, supervision_notes, kosher_category, is_chalav_yisroel, \
     is_pas_yisroel, certificate_link, hours_canonical, hours_source, hours_updated_at, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgRestaurantStore {
    pool: PgPool,
}

impl PgRestaurantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the workspace migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("running migrations: {e}")))
    }

    async fn find_one(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM restaurants WHERE {column} = $1 \
             ORDER BY (natural_key <> composite_key), created_at, id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(restaurant_from_row).transpose()
    }
}

fn restaurant_from_row(row: &PgRow) -> Result<NormalizedRestaurant, StorageError> {
    let category: String = row.try_get("kosher_category")?;
    let hours_source: Option<String> = row.try_get("hours_source")?;
    Ok(NormalizedRestaurant {
        id: Some(row.try_get::<Uuid, _>("id")?),
        natural_key: row.try_get("natural_key")?,
        composite_key: row.try_get("composite_key")?,
        name: row.try_get("name")?,
        address: Address {
            street: row.try_get("street")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            zip: row.try_get("zip")?,
        },
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        photo_url: row.try_get("photo_url")?,
        source_url: row.try_get("source_url")?,
        supervision_notes: row.try_get("supervision_notes")?,
        kosher_category: KosherCategory::from_db_str(&category),
        is_chalav_yisroel: row.try_get("is_chalav_yisroel")?,
        is_pas_yisroel: row.try_get("is_pas_yisroel")?,
        certificate_link: row.try_get("certificate_link")?,
        hours_canonical: row.try_get("hours_canonical")?,
        hours_source: hours_source.as_deref().and_then(HoursSource::from_db_str),
        hours_updated_at: row.try_get::<Option<DateTime<Utc>>, _>("hours_updated_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RestaurantStore for PgRestaurantStore {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        self.find_one("natural_key", natural_key).await
    }

    async fn find_by_composite_key(
        &self,
        composite_key: &str,
    ) -> Result<Option<NormalizedRestaurant>, StorageError> {
        self.find_one("composite_key", composite_key).await
    }

    async fn upsert(&self, r: &NormalizedRestaurant) -> Result<Uuid, StorageError> {
        match r.id {
            None => {
                let inserted: Option<Uuid> = sqlx::query_scalar(
                    "INSERT INTO restaurants (id, natural_key, composite_key, name, street, city, \
                     state, zip, phone, website, photo_url, source_url, supervision_notes, \
                     kosher_category, is_chalav_yisroel, is_pas_yisroel, certificate_link, \
                     hours_canonical, hours_source, hours_updated_at, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18, $19, $20, $21, $22) \
                     ON CONFLICT (natural_key) DO NOTHING RETURNING id",
                )
                .bind(Uuid::new_v4())
                .bind(&r.natural_key)
                .bind(&r.composite_key)
                .bind(&r.name)
                .bind(&r.address.street)
                .bind(&r.address.city)
                .bind(&r.address.state)
                .bind(&r.address.zip)
                .bind(&r.phone)
                .bind(&r.website)
                .bind(&r.photo_url)
                .bind(&r.source_url)
                .bind(&r.supervision_notes)
                .bind(r.kosher_category.as_str())
                .bind(r.is_chalav_yisroel)
                .bind(r.is_pas_yisroel)
                .bind(&r.certificate_link)
                .bind(&r.hours_canonical)
                .bind(r.hours_source.map(HoursSource::as_str))
                .bind(r.hours_updated_at)
                .bind(r.created_at)
                .bind(r.updated_at)
                .fetch_optional(&self.pool)
                .await?;
                inserted.ok_or_else(|| StorageError::Conflict {
                    natural_key: r.natural_key.clone(),
                })
            }
            Some(id) => {
                // natural_key sits in the WHERE clause: it can never be rewritten.
                let result = sqlx::query(
                    "UPDATE restaurants SET composite_key = $3, name = $4, street = $5, \
                     city = $6, state = $7, zip = $8, phone = $9, website = $10, \
                     photo_url = $11, source_url = $12, supervision_notes = $13, \
                     kosher_category = $14, is_chalav_yisroel = $15, is_pas_yisroel = $16, \
                     certificate_link = $17, hours_canonical = $18, hours_source = $19, \
                     hours_updated_at = $20, updated_at = $21 \
                     WHERE id = $1 AND natural_key = $2",
                )
                .bind(id)
                .bind(&r.natural_key)
                .bind(&r.composite_key)
                .bind(&r.name)
                .bind(&r.address.street)
                .bind(&r.address.city)
                .bind(&r.address.state)
                .bind(&r.address.zip)
                .bind(&r.phone)
                .bind(&r.website)
                .bind(&r.photo_url)
                .bind(&r.source_url)
                .bind(&r.supervision_notes)
                .bind(r.kosher_category.as_str())
                .bind(r.is_chalav_yisroel)
                .bind(r.is_pas_yisroel)
                .bind(&r.certificate_link)
                .bind(&r.hours_canonical)
                .bind(r.hours_source.map(HoursSource::as_str))
                .bind(r.hours_updated_at)
                .bind(r.updated_at)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound { id });
                }
                Ok(id)
            }
        }
    }

    async fn list_stale_hours(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NormalizedRestaurant>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM restaurants \
             WHERE hours_canonical IS NULL OR hours_updated_at IS NULL OR hours_updated_at < $1 \
             ORDER BY (hours_canonical IS NOT NULL), hours_updated_at ASC NULLS FIRST, created_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(threshold)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(restaurant_from_row).collect()
    }
}
