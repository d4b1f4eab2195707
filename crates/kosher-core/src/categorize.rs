//! Kosher supervision categorization from the listing label plus curated overrides.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::normalize::{clean_text, fold_name, natural_key, url_key};
use crate::{KosherCategory, RawCandidate};

/// Curated exceptions maintained outside the scrape. Entries are natural keys,
/// detail URLs, or exact restaurant names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideList {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub chalav_stam: BTreeSet<String>,
    #[serde(default)]
    pub pas_yisroel: BTreeSet<String>,
}

impl OverrideList {
    pub fn is_chalav_stam(&self, natural_key: &str, name: &str) -> bool {
        Self::contains(&self.chalav_stam, natural_key, name)
    }

    pub fn is_pas_yisroel(&self, natural_key: &str, name: &str) -> bool {
        Self::contains(&self.pas_yisroel, natural_key, name)
    }

    // Whole-value equality only; "Pizza" must not match "Pizza Palace".
    fn contains(entries: &BTreeSet<String>, natural_key: &str, name: &str) -> bool {
        let name = fold_name(name);
        entries.iter().any(|entry| {
            let entry = entry.trim();
            entry == natural_key
                || (entry.contains("://") && url_key(entry) == natural_key)
                || fold_name(entry) == name
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kosher_category: KosherCategory,
    pub is_chalav_yisroel: bool,
    pub is_pas_yisroel: bool,
}

impl KosherCategory {
    /// Fixed label lookup; anything unlisted is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let label = fold_name(label);
        match label.trim_end_matches(['.', ':', ';']) {
            "dairy" | "milchig" | "milchik" | "chalav yisroel" | "cholov yisroel"
            | "chalav yisrael" => Self::Dairy,
            "meat" | "fleishig" | "fleishik" | "glatt" | "glatt kosher" => Self::Meat,
            "parve" | "pareve" | "parev" => Self::Pareve,
            "fish" => Self::Fish,
            _ => Self::Unknown,
        }
    }
}

/// Derives the supervision flags for a candidate. Pure and deterministic, so it
/// is safe to re-apply on every scrape pass.
pub fn categorize(candidate: &RawCandidate, overrides: &OverrideList) -> Classification {
    let name = clean_text(Some(&candidate.source_name)).unwrap_or_default();
    let address = clean_text(candidate.address_text.as_deref());
    let key = natural_key(
        candidate.source_detail_url.as_deref(),
        &name,
        address.as_deref(),
    );

    let kosher_category = candidate
        .kosher_type_label
        .as_deref()
        .map(KosherCategory::from_label)
        .unwrap_or(KosherCategory::Unknown);
    let is_chalav_yisroel =
        kosher_category == KosherCategory::Dairy && !overrides.is_chalav_stam(&key, &name);

    Classification {
        kosher_category,
        is_chalav_yisroel,
        is_pas_yisroel: overrides.is_pas_yisroel(&key, &name),
    }
}
