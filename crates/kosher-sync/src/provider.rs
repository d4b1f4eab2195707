//! External places provider: identity resolution and opening-hours lookup.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kosher_core::normalize::fold_name;
use kosher_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderEntityId(pub String);

impl fmt::Display for ProviderEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("provider answered {status}: {message}")]
    Status { status: String, message: String },
    #[error("decoding provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("building provider url: {0}")]
    Url(#[from] url::ParseError),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_retryable(),
            Self::Status { status, .. } => status == "UNKNOWN_ERROR",
            Self::QuotaExceeded | Self::Decode(_) | Self::Url(_) => false,
        }
    }
}

#[async_trait]
pub trait PlacesProvider: Send + Sync {
    /// Finds the provider's entity for a restaurant; `Ok(None)` is a clean not-found.
    async fn resolve(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Option<ProviderEntityId>, ProviderError>;

    /// Free-text opening hours for a resolved entity, if the provider has any.
    async fn get_hours(&self, id: &ProviderEntityId) -> Result<Option<String>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GooglePlacesConfig {
    pub api_key: String,
    pub base_url: String,
    pub min_name_similarity: f64,
}

impl GooglePlacesConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://maps.googleapis.com/maps/api/place".to_string(),
            min_name_similarity: 0.85,
        }
    }
}

/// Places API client over the shared throttled fetcher.
pub struct GooglePlacesClient {
    http: Arc<HttpFetcher>,
    config: GooglePlacesConfig,
    run_id: Uuid,
}

const SOURCE_ID: &str = "google-places";

impl GooglePlacesClient {
    pub fn new(http: Arc<HttpFetcher>, config: GooglePlacesConfig) -> Self {
        Self {
            http,
            config,
            run_id: Uuid::new_v4(),
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, ProviderError> {
        let base = format!("{}/{path}", self.config.base_url.trim_end_matches('/'));
        let params = params
            .iter()
            .copied()
            .chain(std::iter::once(("key", self.config.api_key.as_str())));
        Ok(Url::parse_with_params(&base, params)?)
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .http
            .fetch_bytes(self.run_id, SOURCE_ID, url.as_str())
            .await?;
        Ok(response.body)
    }
}

#[async_trait]
impl PlacesProvider for GooglePlacesClient {
    async fn resolve(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Option<ProviderEntityId>, ProviderError> {
        let query = if address.is_empty() {
            name.to_string()
        } else {
            format!("{name}, {address}")
        };
        let url = self.endpoint(
            "findplacefromtext/json",
            &[
                ("input", query.as_str()),
                ("inputtype", "textquery"),
                ("fields", "place_id,name"),
            ],
        )?;
        let body = self.get(url).await?;
        parse_find_place(&body, name, self.config.min_name_similarity)
    }

    async fn get_hours(&self, id: &ProviderEntityId) -> Result<Option<String>, ProviderError> {
        let url = self.endpoint(
            "details/json",
            &[("place_id", id.0.as_str()), ("fields", "opening_hours")],
        )?;
        let body = self.get(url).await?;
        parse_place_details(&body)
    }
}

#[derive(Debug, Deserialize)]
struct FindPlaceResponse {
    status: String,
    #[serde(default)]
    candidates: Vec<PlaceCandidate>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceCandidate {
    place_id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<PlaceDetails>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceDetails {
    opening_hours: Option<OpeningHours>,
}

#[derive(Debug, Deserialize)]
struct OpeningHours {
    #[serde(default)]
    weekday_text: Vec<String>,
}

/// `Ok(false)` for the statuses that mean "nothing here".
fn check_status(status: &str, message: Option<String>) -> Result<bool, ProviderError> {
    match status {
        "OK" => Ok(true),
        "ZERO_RESULTS" | "NOT_FOUND" => Ok(false),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => Err(ProviderError::QuotaExceeded),
        other => Err(ProviderError::Status {
            status: other.to_string(),
            message: message.unwrap_or_default(),
        }),
    }
}

/// Best-named candidate, accepted only above `min_similarity`.
pub fn parse_find_place(
    body: &[u8],
    query_name: &str,
    min_similarity: f64,
) -> Result<Option<ProviderEntityId>, ProviderError> {
    let response: FindPlaceResponse = serde_json::from_slice(body)?;
    if !check_status(&response.status, response.error_message)? {
        return Ok(None);
    }
    let wanted = fold_name(query_name);
    let best = response
        .candidates
        .into_iter()
        .filter_map(|c| {
            let score = jaro_winkler(&wanted, &fold_name(c.name.as_deref()?));
            Some((score, c.place_id))
        })
        .max_by(|a, b| a.0.total_cmp(&b.0));

    match best {
        Some((score, place_id)) if score >= min_similarity => Ok(Some(ProviderEntityId(place_id))),
        Some((score, place_id)) => {
            debug!(%place_id, score, query_name, "closest place name below threshold");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Weekday lines joined by newlines, as the hours normalizer expects.
pub fn parse_place_details(body: &[u8]) -> Result<Option<String>, ProviderError> {
    let response: DetailsResponse = serde_json::from_slice(body)?;
    if !check_status(&response.status, response.error_message)? {
        return Ok(None);
    }
    let lines = response
        .result
        .and_then(|r| r.opening_hours)
        .map(|h| h.weekday_text)
        .unwrap_or_default();
    if lines.is_empty() {
        Ok(None)
    } else {
        Ok(Some(lines.join("\n")))
    }
}
