//! Field-level normalization: text cleanup, phones, addresses and identity keys.

use std::sync::LazyLock;

use regex::Regex;

use crate::Address;

static ADDRESS_COMMA_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<street>.+?),\s*(?P<city>[^,]+?),\s*(?P<state>[A-Za-z]{2})\.?(?:\s+(?P<zip>\d{5}(?:-\d{4})?))?$")
        .expect("valid address regex")
});

static ADDRESS_SPACE_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<street>.+?),\s*(?P<city>[^,]+?)\s+(?P<state>[A-Za-z]{2})\.?\s+(?P<zip>\d{5}(?:-\d{4})?)$")
        .expect("valid address regex")
});

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trimmed, whitespace-collapsed text, or `None` when nothing is left.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let collapsed = collapse_whitespace(value?);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Lowercased alphanumeric words joined by single spaces.
pub fn key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case- and whitespace-folded text used for exact name comparisons.
pub fn fold_name(input: &str) -> String {
    collapse_whitespace(input).to_lowercase()
}

/// Canonical phone: `(NNN) NNN-NNNN` for North American numbers, cleaned text otherwise.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let cleaned = clean_text(Some(raw))?;
    let digits: String = cleaned.chars().filter(char::is_ascii_digit).collect();
    let national = match digits.len() {
        10 => Some(digits.as_str()),
        11 if digits.starts_with('1') => Some(&digits[1..]),
        _ => None,
    };
    match national {
        Some(d) => Some(format!("({}) {}-{}", &d[0..3], &d[3..6], &d[6..10])),
        None if digits.is_empty() => None,
        None => Some(cleaned),
    }
}

/// Splits a one-line US address into parts; unrecognized shapes keep everything in `street`.
pub fn parse_address(text: &str) -> Address {
    let text = collapse_whitespace(text);
    for pattern in [&*ADDRESS_COMMA_STATE, &*ADDRESS_SPACE_STATE] {
        if let Some(caps) = pattern.captures(&text) {
            let part = |name: &str| caps.name(name).map(|m| m.as_str().trim().to_string());
            return Address {
                street: part("street"),
                city: part("city"),
                state: part("state").map(|s| s.to_ascii_uppercase()),
                zip: part("zip"),
            };
        }
    }
    Address {
        street: clean_text(Some(&text)),
        ..Address::default()
    }
}

/// Identity form of a detail URL: scheme, fragment and trailing slashes dropped, host lowercased.
pub fn url_key(url: &str) -> String {
    let url = url.trim();
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_scheme = without_fragment
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_fragment);
    let (host, path) = match without_scheme.find('/') {
        Some(idx) => without_scheme.split_at(idx),
        None => (without_scheme, ""),
    };
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    format!("url:{}{}", host, path.trim_end_matches('/'))
}

/// Name + address identity, used when no detail URL exists and as a fallback lookup.
pub fn composite_key(name: &str, address_text: Option<&str>) -> String {
    format!(
        "na:{}|{}",
        key_fragment(name),
        address_text.map(key_fragment).unwrap_or_default()
    )
}

pub fn natural_key(detail_url: Option<&str>, name: &str, address_text: Option<&str>) -> String {
    match detail_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => url_key(url),
        None => composite_key(name, address_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_formats_converge() {
        for raw in ["718-555-0101", "(718) 555 0101", "+1 718.555.0101", "7185550101"] {
            assert_eq!(normalize_phone(raw).as_deref(), Some("(718) 555-0101"), "{raw}");
        }
        assert_eq!(normalize_phone("  ext 12  ").as_deref(), Some("ext 12"));
        assert_eq!(normalize_phone("   "), None);
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn addresses_split_with_and_without_state_comma() {
        let a = parse_address("4907 13th Ave, Brooklyn, NY 11219");
        assert_eq!(a.street.as_deref(), Some("4907 13th Ave"));
        assert_eq!(a.city.as_deref(), Some("Brooklyn"));
        assert_eq!(a.state.as_deref(), Some("NY"));
        assert_eq!(a.zip.as_deref(), Some("11219"));

        let b = parse_address("18090 Collins Ave, Sunny Isles Beach FL 33160");
        assert_eq!(b.city.as_deref(), Some("Sunny Isles Beach"));
        assert_eq!(b.state.as_deref(), Some("FL"));

        let c = parse_address("Inside the Aventura Mall");
        assert_eq!(c.street.as_deref(), Some("Inside the Aventura Mall"));
        assert_eq!(c.city, None);
    }

    #[test]
    fn url_keys_ignore_cosmetic_differences() {
        assert_eq!(
            url_key("https://WWW.Example.org/listing/cafe-noir/#top"),
            url_key("http://example.org/listing/cafe-noir")
        );
        assert_ne!(
            url_key("https://example.org/listing/cafe-noir"),
            url_key("https://example.org/listing/cafe-noir-2")
        );
    }

    #[test]
    fn natural_key_falls_back_to_name_and_address() {
        assert_eq!(
            natural_key(None, "Cafe Noir!", Some("123 Main St.")),
            "na:cafe noir|123 main st"
        );
        assert_eq!(natural_key(Some("  "), "Cafe Noir", None), "na:cafe noir|");
    }
}
