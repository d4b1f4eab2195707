//! Core domain model for the kosher directory ingestion pipeline.

pub mod categorize;
pub mod hours;
pub mod normalize;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use categorize::{categorize, Classification, OverrideList};
pub use hours::{is_canonical_hours, normalize_hours};

pub const CRATE_NAME: &str = "kosher-core";

/// One listing as scraped from the certifying agency, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_name: String,
    pub source_detail_url: Option<String>,
    pub address_text: Option<String>,
    pub phone_text: Option<String>,
    pub website: Option<String>,
    pub photo_url: Option<String>,
    pub kosher_type_label: Option<String>,
    pub certificate_url: Option<String>,
    pub supervision_notes: Option<String>,
    pub hours_text: Option<String>,
    pub listing_page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KosherCategory {
    Dairy,
    Meat,
    Pareve,
    Fish,
    Unknown,
}

impl KosherCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dairy => "dairy",
            Self::Meat => "meat",
            Self::Pareve => "pareve",
            Self::Fish => "fish",
            Self::Unknown => "unknown",
        }
    }

    /// Inverse of [`KosherCategory::as_str`]; anything else is `Unknown`.
    pub fn from_db_str(value: &str) -> Self {
        match value {
            "dairy" => Self::Dairy,
            "meat" => Self::Meat,
            "pareve" => Self::Pareve,
            "fish" => Self::Fish,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for KosherCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the stored hours value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoursSource {
    Scraped,
    ExternalProvider,
}

impl HoursSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scraped => "scraped",
            Self::ExternalProvider => "external_provider",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "scraped" => Some(Self::Scraped),
            "external_provider" => Some(Self::ExternalProvider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

impl Address {
    /// Single-line rendering used for provider lookups.
    pub fn one_line(&self) -> String {
        let state_zip = [self.state.as_deref(), self.zip.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        [self.street.as_deref(), self.city.as_deref(), Some(state_zip.as_str())]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listing has no name (detail url: {detail_url:?})")]
    MissingName { detail_url: Option<String> },
}

/// Normalized candidate: everything the pipeline derives, minus storage-owned fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestaurantDraft {
    pub natural_key: String,
    pub composite_key: String,
    pub name: String,
    pub address: Address,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub photo_url: Option<String>,
    pub source_url: Option<String>,
    pub supervision_notes: Option<String>,
    pub kosher_category: KosherCategory,
    pub is_chalav_yisroel: bool,
    pub is_pas_yisroel: bool,
    pub certificate_link: Option<String>,
    pub hours_canonical: Option<String>,
    pub hours_source: Option<HoursSource>,
}

impl RestaurantDraft {
    /// Runs a scraped listing through categorization, hours and field normalization.
    pub fn from_candidate(
        raw: &RawCandidate,
        overrides: &OverrideList,
    ) -> Result<Self, ValidationError> {
        let name = normalize::clean_text(Some(&raw.source_name)).ok_or_else(|| {
            ValidationError::MissingName {
                detail_url: raw.source_detail_url.clone(),
            }
        })?;
        let address_text = normalize::clean_text(raw.address_text.as_deref());
        let classification = categorize(raw, overrides);
        let hours_canonical = raw.hours_text.as_deref().and_then(normalize_hours);
        let hours_source = hours_canonical.as_ref().map(|_| HoursSource::Scraped);

        Ok(Self {
            natural_key: normalize::natural_key(
                raw.source_detail_url.as_deref(),
                &name,
                address_text.as_deref(),
            ),
            composite_key: normalize::composite_key(&name, address_text.as_deref()),
            address: address_text
                .as_deref()
                .map(normalize::parse_address)
                .unwrap_or_default(),
            phone: raw.phone_text.as_deref().and_then(normalize::normalize_phone),
            website: normalize::clean_text(raw.website.as_deref()),
            photo_url: normalize::clean_text(raw.photo_url.as_deref()),
            source_url: normalize::clean_text(raw.source_detail_url.as_deref()),
            supervision_notes: normalize::clean_text(raw.supervision_notes.as_deref()),
            kosher_category: classification.kosher_category,
            is_chalav_yisroel: classification.is_chalav_yisroel,
            is_pas_yisroel: classification.is_pas_yisroel,
            certificate_link: normalize::clean_text(raw.certificate_url.as_deref()),
            hours_canonical,
            hours_source,
            name,
        })
    }

    /// Draft mirroring a stored record, used when only the hours change.
    pub fn from_record(record: &NormalizedRestaurant) -> Self {
        Self {
            natural_key: record.natural_key.clone(),
            composite_key: record.composite_key.clone(),
            name: record.name.clone(),
            address: record.address.clone(),
            phone: record.phone.clone(),
            website: record.website.clone(),
            photo_url: record.photo_url.clone(),
            source_url: record.source_url.clone(),
            supervision_notes: record.supervision_notes.clone(),
            kosher_category: record.kosher_category,
            is_chalav_yisroel: record.is_chalav_yisroel,
            is_pas_yisroel: record.is_pas_yisroel,
            certificate_link: record.certificate_link.clone(),
            hours_canonical: record.hours_canonical.clone(),
            hours_source: record.hours_source,
        }
    }
}

/// Canonical persisted restaurant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRestaurant {
    pub id: Option<Uuid>,
    pub natural_key: String,
    pub composite_key: String,
    pub name: String,
    pub address: Address,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub photo_url: Option<String>,
    pub source_url: Option<String>,
    pub supervision_notes: Option<String>,
    pub kosher_category: KosherCategory,
    pub is_chalav_yisroel: bool,
    pub is_pas_yisroel: bool,
    pub certificate_link: Option<String>,
    pub hours_canonical: Option<String>,
    pub hours_source: Option<HoursSource>,
    pub hours_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NormalizedRestaurant {
    /// A not-yet-stored record built from a draft at `now`.
    pub fn from_draft(draft: RestaurantDraft, now: DateTime<Utc>) -> Self {
        let hours_updated_at = draft.hours_canonical.as_ref().map(|_| now);
        Self {
            id: None,
            natural_key: draft.natural_key,
            composite_key: draft.composite_key,
            name: draft.name,
            address: draft.address,
            phone: draft.phone,
            website: draft.website,
            photo_url: draft.photo_url,
            source_url: draft.source_url,
            supervision_notes: draft.supervision_notes,
            kosher_category: draft.kosher_category,
            is_chalav_yisroel: draft.is_chalav_yisroel,
            is_pas_yisroel: draft.is_pas_yisroel,
            certificate_link: draft.certificate_link,
            hours_canonical: draft.hours_canonical,
            hours_source: draft.hours_source,
            hours_updated_at,
            created_at: now,
            updated_at: now,
        }
    }
}
