//! Pipeline configuration: `pipeline.yaml`, `rules/overrides.yaml` and env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kosher_adapters::{ExtractorConfig, SelectorSet};
use kosher_core::OverrideList;
use serde::Deserialize;

use crate::refresh::RefreshConfig;

/// Process-level settings, read from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub database_url: Option<String>,
    pub google_places_api_key: Option<String>,
    pub store_path: PathBuf,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub refresh_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("KOSHER_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            database_url: non_empty_var("DATABASE_URL"),
            google_places_api_key: non_empty_var("GOOGLE_PLACES_API_KEY"),
            store_path: std::env::var("KOSHER_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/restaurants.json")),
            scheduler_enabled: std::env::var("KOSHER_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            scrape_cron: std::env::var("SCRAPE_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            refresh_cron: std::env::var("REFRESH_CRON")
                .unwrap_or_else(|_| "0 30 7 * * *".to_string()),
            user_agent: std::env::var("KOSHER_USER_AGENT")
                .unwrap_or_else(|_| "kosher-directory-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("KOSHER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn pipeline_file_path(&self) -> PathBuf {
        self.workspace_root.join("pipeline.yaml")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

/// `pipeline.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    pub source: SourceSection,
    #[serde(default)]
    pub refresh: RefreshSection,
    #[serde(default = "default_overrides_path")]
    pub overrides_path: PathBuf,
}

fn default_overrides_path() -> PathBuf {
    PathBuf::from("rules/overrides.yaml")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    pub source_id: String,
    pub category_url: String,
    #[serde(default)]
    pub page_url_template: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: Option<u32>,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_detail_delay_ms")]
    pub detail_delay_ms: u64,
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_page_failures: u32,
    #[serde(default = "default_true")]
    pub fetch_details: bool,
    #[serde(default)]
    pub selectors: SelectorSet,
}

fn default_max_pages() -> Option<u32> {
    Some(100)
}

fn default_page_delay_ms() -> u64 {
    3_000
}

fn default_detail_delay_ms() -> u64 {
    1_000
}

fn default_detail_concurrency() -> usize {
    2
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    pub staleness_days: i64,
    pub per_run_quota: u32,
    pub daily_quota: u32,
    pub provider_delay_ms: u64,
    pub max_consecutive_failures: u32,
    pub min_name_similarity: f64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            staleness_days: 7,
            per_run_quota: 50,
            daily_quota: 500,
            provider_delay_ms: 500,
            max_consecutive_failures: 5,
            min_name_similarity: 0.85,
        }
    }
}

impl PipelineFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: Self = serde_yaml::from_str(text)?;
        anyhow::ensure!(
            file.source.page_url_template
                .as_deref()
                .map_or(true, |t| t.contains("{page}")),
            "page_url_template must contain {{page}}"
        );
        anyhow::ensure!(
            file.source.page_delay_ms >= file.source.detail_delay_ms,
            "page_delay_ms must be at least detail_delay_ms"
        );
        Ok(file)
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        let source = &self.source;
        ExtractorConfig {
            source_id: source.source_id.clone(),
            category_url: source.category_url.clone(),
            page_url_template: source.page_url_template.clone(),
            max_pages: source.max_pages,
            page_delay: Duration::from_millis(source.page_delay_ms),
            detail_delay: Duration::from_millis(source.detail_delay_ms),
            detail_concurrency: source.detail_concurrency.max(1),
            max_consecutive_page_failures: source.max_consecutive_page_failures,
            fetch_details: source.fetch_details,
            selectors: source.selectors.clone(),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            staleness: chrono::Duration::days(self.refresh.staleness_days),
            per_run_quota: self.refresh.per_run_quota,
            provider_delay: Duration::from_millis(self.refresh.provider_delay_ms),
            max_consecutive_failures: self.refresh.max_consecutive_failures,
        }
    }

    pub fn overrides_path(&self, workspace_root: &Path) -> PathBuf {
        if self.overrides_path.is_absolute() {
            self.overrides_path.clone()
        } else {
            workspace_root.join(&self.overrides_path)
        }
    }
}

pub fn load_overrides(path: impl AsRef<Path>) -> Result<OverrideList> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
