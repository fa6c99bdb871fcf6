//! Raw card fields -> typed [`Listing`] values.

use thiserror::Error;

use crate::{Listing, RawListing, VehicleSpec};

pub const PLACEHOLDER: &str = "N/A";

const MILEAGE_UNITS: [&str; 4] = ["miles", "mile", "mi.", "mi"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("title `{0}` has fewer than three tokens")]
    ShortTitle(String),
    #[error("trim `{listing}` does not contain requested trim `{requested}`")]
    TrimMismatch { requested: String, listing: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleParts {
    pub year: String,
    pub make: String,
    pub model: String,
    pub trim: String,
}

/// "$19,999" -> 19999. Anything that is not a positive integer is `None`;
/// marketplaces print `$0` on call-for-price cards.
pub fn parse_price(raw: &str) -> Option<i64> {
    raw.replace(['$', ','], "")
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|p| *p > 0)
}

/// "45,123 mi." -> "45123". Display-only; never parsed numerically.
pub fn clean_mileage(raw: &str) -> String {
    let compact = raw.replace(',', "");
    let trimmed = compact.trim();
    let lower = trimmed.to_ascii_lowercase();
    let stripped = MILEAGE_UNITS
        .iter()
        .find(|unit| lower.ends_with(*unit))
        .map(|unit| trimmed[..trimmed.len() - unit.len()].trim_end())
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        stripped.to_string()
    }
}

/// Positional split: year, make, model, then everything else is the trim.
pub fn split_title(title: &str) -> Option<TitleParts> {
    let tokens: Vec<&str> = title.split_whitespace().collect();
    if tokens.len() < 3 {
        return None;
    }
    let trim = if tokens.len() > 3 {
        tokens[3..].join(" ")
    } else {
        PLACEHOLDER.to_string()
    };
    Some(TitleParts {
        year: tokens[0].to_string(),
        make: tokens[1].to_string(),
        model: tokens[2].to_string(),
        trim,
    })
}

pub fn trim_matches(requested: Option<&str>, listing_trim: &str) -> bool {
    match requested {
        Some(wanted) => listing_trim
            .to_lowercase()
            .contains(&wanted.to_lowercase()),
        None => true,
    }
}

pub fn normalize_listing(raw: &RawListing, spec: &VehicleSpec) -> Result<Listing, SkipReason> {
    let title = raw.title.trim();
    let parts = split_title(title).ok_or_else(|| SkipReason::ShortTitle(title.to_string()))?;

    if !trim_matches(spec.trim.as_deref(), &parts.trim) {
        return Err(SkipReason::TrimMismatch {
            requested: spec.trim.clone().unwrap_or_default(),
            listing: parts.trim,
        });
    }

    Ok(Listing {
        source: raw.source.clone(),
        title: title.to_string(),
        year: parts.year,
        make: parts.make,
        model: parts.model,
        trim: parts.trim,
        mileage: raw
            .mileage
            .as_deref()
            .map(clean_mileage)
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        price: raw.price.as_deref().and_then(parse_price),
        location: raw
            .location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(PLACEHOLDER)
            .to_string(),
        url: raw.url.clone(),
    })
}
