//! Percentile trimming over listing prices.

use std::collections::BTreeSet;

use crate::Listing;

pub const DEFAULT_TRIM_PERCENT: f64 = 0.10;

/// Drops the lowest and highest `percent` of prices.
///
/// The retained band is a set of price *values*: every listing whose price
/// equals a value inside `prices[lower..upper]` survives, so duplicates that
/// straddle a boundary pass or fail together. With no priced listings the
/// input is returned untouched.
pub fn remove_outliers(listings: Vec<Listing>, percent: f64) -> Vec<Listing> {
    let mut prices: Vec<i64> = listings.iter().filter_map(|l| l.price).collect();
    if prices.is_empty() {
        return listings;
    }
    prices.sort_unstable();

    let n = prices.len();
    let lower = ((n as f64 * percent).floor() as usize).min(n / 2);
    let upper = n - lower;
    let band: BTreeSet<i64> = prices[lower..upper].iter().copied().collect();

    listings
        .into_iter()
        .filter(|l| l.price.is_some_and(|p| band.contains(&p)))
        .collect()
}
