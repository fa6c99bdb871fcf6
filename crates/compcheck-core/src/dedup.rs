//! Cross-source deduplication of normalized listings.

use std::collections::HashSet;

use strsim::jaro_winkler;

use crate::Listing;

pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.95;

/// (title, mileage, price, location). Compared verbatim; no case or spacing folding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub title: String,
    pub mileage: String,
    pub price: i64,
    pub location: String,
}

impl DedupKey {
    pub fn for_listing(listing: &Listing) -> Option<Self> {
        Some(Self {
            title: listing.title.clone(),
            mileage: listing.mileage.clone(),
            price: listing.price?,
            location: listing.location.clone(),
        })
    }
}

/// Keeps the first occurrence of each key in input order. Unpriced listings are
/// always dropped, even when their key would be unique.
pub fn dedupe(listings: Vec<Listing>) -> Vec<Listing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| match DedupKey::for_listing(listing) {
            Some(key) => seen.insert(key),
            None => false,
        })
        .collect()
}

/// Pair of kept listings from different sources that look like the same car
/// but did not share a key.
#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicate {
    pub first: usize,
    pub second: usize,
    pub score: f64,
}

pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn near_duplicates(listings: &[Listing], threshold: f64) -> Vec<NearDuplicate> {
    let titles: Vec<String> = listings.iter().map(|l| normalize_title(&l.title)).collect();
    let mut out = Vec::new();
    for i in 0..listings.len() {
        for j in (i + 1)..listings.len() {
            let (a, b) = (&listings[i], &listings[j]);
            if a.source == b.source || a.price != b.price {
                continue;
            }
            let score = jaro_winkler(&titles[i], &titles[j]);
            if score >= threshold {
                out.push(NearDuplicate {
                    first: i,
                    second: j,
                    score,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::listing;

    #[test]
    fn identical_cross_source_listings_collapse_to_first() {
        let items = vec![
            listing("cars-com", "2019 Ford F-150 XL", Some(25_000)),
            listing("cargurus", "2019 Ford F-150 XL", Some(25_000)),
            listing("autotrader", "2019 Ford F-150 XL", Some(26_000)),
        ];
        let kept = dedupe(items);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].source, "cars-com");
        assert_eq!(kept[1].source, "autotrader");
    }

    #[test]
    fn unpriced_listing_is_dropped_even_when_unique() {
        let kept = dedupe(vec![
            listing("cars-com", "2019 Ford F-150 XL", None),
            listing("cars-com", "2019 Ford F-150 XLT", Some(30_000)),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].price, Some(30_000));
    }

    #[test]
    fn formatting_differences_are_not_merged_but_reported() {
        let kept = dedupe(vec![
            listing("cars-com", "2019 Ford F-150 XL", Some(25_000)),
            listing("cargurus", "2019 FORD  F-150 XL", Some(25_000)),
        ]);
        assert_eq!(kept.len(), 2);

        let pairs = near_duplicates(&kept, NEAR_DUPLICATE_THRESHOLD);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].first, pairs[0].second), (0, 1));
        assert!(pairs[0].score >= NEAR_DUPLICATE_THRESHOLD);
    }

    #[test]
    fn same_source_pairs_are_not_reported() {
        let kept = vec![
            listing("cars-com", "2019 Ford F-150 XL", Some(25_000)),
            listing("cars-com", "2019 Ford F-150 XL ", Some(25_000)),
        ];
        assert!(near_duplicates(&kept, NEAR_DUPLICATE_THRESHOLD).is_empty());
    }
}
