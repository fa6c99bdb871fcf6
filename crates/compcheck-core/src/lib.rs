//! Core domain model for comp aggregation: vehicle specs, listings, reports and
//! the pure cleaning stages (normalize, dedupe, trim) that turn raw marketplace
//! cards into market statistics.

pub mod dedup;
pub mod normalize;
pub mod outliers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "compcheck-core";

pub const DEFAULT_ZIPCODE: &str = "76504";
pub const DEFAULT_RADIUS: u32 = 200;

/// Search input for one comp lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSpec {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub zipcode: String,
    pub radius: u32,
}

impl VehicleSpec {
    pub fn new(year: i32, make: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            year,
            make: make.into(),
            model: model.into(),
            trim: None,
            zipcode: DEFAULT_ZIPCODE.to_string(),
            radius: DEFAULT_RADIUS,
        }
    }

    /// Blank trims are treated as "no trim requested".
    pub fn with_trim(mut self, trim: Option<String>) -> Self {
        self.trim = trim
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    pub fn with_location(mut self, zipcode: impl Into<String>, radius: u32) -> Self {
        self.zipcode = zipcode.into();
        self.radius = radius;
        self
    }

    pub fn label(&self) -> String {
        match &self.trim {
            Some(trim) => format!("{} {} {} {}", self.year, self.make, self.model, trim),
            None => format!("{} {} {}", self.year, self.make, self.model),
        }
    }
}

/// Unparsed card fields as scraped by a source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: String,
    pub title: String,
    pub price: Option<String>,
    pub mileage: Option<String>,
    pub location: Option<String>,
    pub url: String,
}

/// Normalized comparable listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub source: String,
    #[serde(rename = "year_make_model")]
    pub title: String,
    pub year: String,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub mileage: String,
    pub price: Option<i64>,
    pub location: String,
    pub url: String,
}

/// Aggregated, deduplicated, outlier-trimmed comps for one vehicle spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MarketReport {
    pub comps: Vec<Listing>,
    pub market_avg: i64,
    pub market_low: i64,
    pub market_high: i64,
}

impl MarketReport {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the report from already-trimmed comps. Statistics only consider
    /// priced listings; the mean is truncated to a whole dollar amount.
    pub fn from_comps(comps: Vec<Listing>) -> Self {
        let prices: Vec<i64> = comps.iter().filter_map(|c| c.price).collect();
        if prices.is_empty() {
            return Self {
                comps,
                ..Self::default()
            };
        }
        let sum: i64 = prices.iter().sum();
        let market_avg = sum / prices.len() as i64;
        let market_low = prices.iter().copied().min().unwrap_or_default();
        let market_high = prices.iter().copied().max().unwrap_or_default();
        Self {
            comps,
            market_avg,
            market_low,
            market_high,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Fetch,
    BotChallenge,
    Parse,
    NoResults,
    Normalize,
    NearDuplicate,
}

/// A contained failure or observation recorded alongside kept results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub source: String,
    pub kind: DiagnosticKind,
    pub detail: String,
    pub url: Option<String>,
}

impl Diagnostic {
    pub fn new(source: impl Into<String>, kind: DiagnosticKind, detail: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            detail: detail.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Persisted comp row owned by the refresh job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompRecord {
    pub inventory_id: i64,
    pub source: String,
    pub year: String,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub mileage: String,
    pub price: i64,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl CompRecord {
    /// Unpriced listings never become records.
    pub fn from_listing(
        inventory_id: i64,
        listing: &Listing,
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        Some(Self {
            inventory_id,
            source: listing.source.clone(),
            year: listing.year.clone(),
            make: listing.make.clone(),
            model: listing.model.clone(),
            trim: listing.trim.clone(),
            mileage: listing.mileage.clone(),
            price: listing.price?,
            url: listing.url.clone(),
            created_at,
        })
    }
}

/// Inventory row supplied by the dealership inventory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryVehicle {
    pub id: i64,
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub zipcode: Option<String>,
    pub price: Option<i64>,
}

impl InventoryVehicle {
    pub fn spec(&self, fallback_zipcode: &str, radius: u32) -> VehicleSpec {
        let zipcode = self
            .zipcode
            .as_deref()
            .map(str::trim)
            .filter(|z| !z.is_empty())
            .unwrap_or(fallback_zipcode);
        VehicleSpec::new(self.year, self.make.clone(), self.model.clone())
            .with_trim(self.trim.clone())
            .with_location(zipcode, radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn listing(source: &str, title: &str, price: Option<i64>) -> Listing {
        Listing {
            source: source.to_string(),
            title: title.to_string(),
            year: "2019".into(),
            make: "Ford".into(),
            model: "F-150".into(),
            trim: "XL".into(),
            mileage: "45123".into(),
            price,
            location: "Temple, TX".into(),
            url: format!("https://example.test/{source}/{}", price.unwrap_or_default()),
        }
    }

    #[test]
    fn empty_report_is_zeroed() {
        let report = MarketReport::from_comps(vec![]);
        assert!(report.is_empty());
        assert_eq!((report.market_avg, report.market_low, report.market_high), (0, 0, 0));
    }

    #[test]
    fn report_stats_truncate_the_mean() {
        let comps = vec![
            listing("cars-com", "2019 Ford F-150 XL", Some(100)),
            listing("cars-com", "2019 Ford F-150 XL", Some(200)),
            listing("cars-com", "2019 Ford F-150 XL", Some(300)),
            listing("cars-com", "2019 Ford F-150 XL", Some(900)),
        ];
        let report = MarketReport::from_comps(comps);
        assert_eq!(report.market_avg, 375);
        assert_eq!(report.market_low, 100);
        assert_eq!(report.market_high, 900);

        let report = MarketReport::from_comps(vec![
            listing("cars-com", "2019 Ford F-150 XL", Some(10)),
            listing("cars-com", "2019 Ford F-150 XL", Some(11)),
        ]);
        assert_eq!(report.market_avg, 10);
    }

    #[test]
    fn unpriced_listings_do_not_move_stats() {
        let report = MarketReport::from_comps(vec![
            listing("cars-com", "2019 Ford F-150 XL", Some(20_000)),
            listing("cargurus", "2019 Ford F-150 XL", None),
        ]);
        assert_eq!(report.market_avg, 20_000);
        assert_eq!(report.market_low, 20_000);
        assert_eq!(report.market_high, 20_000);
    }

    #[test]
    fn listing_serializes_title_under_legacy_key() {
        let value = serde_json::to_value(listing("cars-com", "2019 Ford F-150 XL", Some(1))).unwrap();
        assert_eq!(value["year_make_model"], "2019 Ford F-150 XL");
        assert!(value.get("title").is_none());
    }

    #[test]
    fn comp_record_requires_price() {
        let now = Utc::now();
        assert!(CompRecord::from_listing(7, &listing("cars-com", "t", None), now).is_none());
        let record = CompRecord::from_listing(7, &listing("cars-com", "t", Some(5)), now).unwrap();
        assert_eq!(record.inventory_id, 7);
        assert_eq!(record.price, 5);
    }

    #[test]
    fn inventory_spec_falls_back_to_default_zipcode() {
        let vehicle = InventoryVehicle {
            id: 1,
            year: 2020,
            make: "Toyota".into(),
            model: "Camry".into(),
            trim: Some("  ".into()),
            zipcode: None,
            price: None,
        };
        let spec = vehicle.spec("76502", 200);
        assert_eq!(spec.zipcode, "76502");
        assert_eq!(spec.trim, None);
        assert_eq!(spec.label(), "2020 Toyota Camry");
    }
}
