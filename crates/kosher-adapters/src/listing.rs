use kosher_core::normalize::clean_text;
use kosher_core::RawCandidate;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{AdapterError, SelectorSet};

/// A [`SelectorSet`] parsed once per pass, so a bad selector fails before any fetch.
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    listing_item: Selector,
    name: Selector,
    detail_link: Selector,
    address: Selector,
    phone: Selector,
    website: Selector,
    kosher_type: Selector,
    hours: Selector,
    pagination_link: Selector,
    photo: Selector,
    certificate_link: Selector,
    supervision_notes: Selector,
    detail_hours: Selector,
}

impl CompiledSelectors {
    pub fn compile(set: &SelectorSet) -> Result<Self, AdapterError> {
        Ok(Self {
            listing_item: parse_selector(&set.listing_item)?,
            name: parse_selector(&set.name)?,
            detail_link: parse_selector(&set.detail_link)?,
            address: parse_selector(&set.address)?,
            phone: parse_selector(&set.phone)?,
            website: parse_selector(&set.website)?,
            kosher_type: parse_selector(&set.kosher_type)?,
            hours: parse_selector(&set.hours)?,
            pagination_link: parse_selector(&set.pagination_link)?,
            photo: parse_selector(&set.photo)?,
            certificate_link: parse_selector(&set.certificate_link)?,
            supervision_notes: parse_selector(&set.supervision_notes)?,
            detail_hours: parse_selector(&set.detail_hours)?,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedListing {
    /// Zero-based position of the item on its page.
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub page: u32,
    pub url: String,
    pub candidates: Vec<RawCandidate>,
    pub skipped: Vec<SkippedListing>,
    /// Highest page number advertised by the pagination links, if any.
    pub last_page: Option<u32>,
}

pub fn parse_listing_page(
    html: &str,
    page_url: &str,
    page: u32,
    selectors: &CompiledSelectors,
) -> ListingPage {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let mut candidates = Vec::new();
    let mut skipped = Vec::new();

    for (position, item) in document.select(&selectors.listing_item).enumerate() {
        let Some(name) = first_text(item, &selectors.name) else {
            skipped.push(SkippedListing {
                position,
                reason: "listing item has no name".to_string(),
            });
            continue;
        };
        candidates.push(RawCandidate {
            source_name: name,
            source_detail_url: first_link(item, &selectors.detail_link, "href", base.as_ref()),
            address_text: first_text(item, &selectors.address),
            phone_text: first_text(item, &selectors.phone),
            website: first_link(item, &selectors.website, "href", base.as_ref()),
            kosher_type_label: first_text(item, &selectors.kosher_type),
            hours_text: first_lines(item, &selectors.hours),
            listing_page: page,
            ..Default::default()
        });
    }

    let last_page = document
        .select(&selectors.pagination_link)
        .filter_map(page_number)
        .max();

    ListingPage {
        page,
        url: page_url.to_string(),
        candidates,
        skipped,
        last_page,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub photo_url: Option<String>,
    pub certificate_url: Option<String>,
    pub supervision_notes: Option<String>,
    pub hours_text: Option<String>,
}

impl DetailFields {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Fills detail-only fields; listing-page hours win over detail-page hours.
    pub fn apply_to(self, candidate: &mut RawCandidate) {
        candidate.photo_url = self.photo_url;
        candidate.certificate_url = self.certificate_url;
        candidate.supervision_notes = self.supervision_notes;
        if candidate.hours_text.is_none() {
            candidate.hours_text = self.hours_text;
        }
    }
}

pub fn parse_detail_page(html: &str, page_url: &str, selectors: &CompiledSelectors) -> DetailFields {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let base = Url::parse(page_url).ok();
    DetailFields {
        photo_url: first_link(root, &selectors.photo, "src", base.as_ref()),
        certificate_url: first_link(root, &selectors.certificate_link, "href", base.as_ref()),
        supervision_notes: first_text(root, &selectors.supervision_notes),
        hours_text: first_lines(root, &selectors.detail_hours),
    }
}

fn text_or_none(value: String) -> Option<String> {
    clean_text(Some(&value))
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

// Hours keep their line structure: "<br>"-separated rows are distinct segments.
fn first_lines(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let node = scope.select(selector).next()?;
    let lines: Vec<String> = node
        .text()
        .filter_map(|t| text_or_none(t.to_string()))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn first_link(
    scope: ElementRef<'_>,
    selector: &Selector,
    attr: &str,
    base: Option<&Url>,
) -> Option<String> {
    scope
        .select(selector)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|href| resolve_link(base, href))
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let resolved = match base {
        Some(base) => base.join(href),
        None => Url::parse(href),
    };
    resolved.ok().map(String::from)
}

fn page_number(link: ElementRef<'_>) -> Option<u32> {
    let text = link.text().collect::<String>();
    if let Ok(n) = text.trim().parse::<u32>() {
        return Some(n);
    }
    let href = link.value().attr("href")?;
    let (_, tail) = href
        .rsplit_once("page/")
        .or_else(|| href.rsplit_once("page="))?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
