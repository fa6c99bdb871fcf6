//! Plain-text renderings of a [`MarketReport`] for sales managers and customers.

use askama::Template;
use compcheck_core::{Listing, MarketReport, VehicleSpec};

pub const SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceStatus {
    Overpriced,
    Underpriced,
    InMarketRange,
    NoMarketData,
}

impl PriceStatus {
    pub fn classify(asking_price: Option<i64>, report: &MarketReport) -> Self {
        if report.is_empty() {
            return Self::NoMarketData;
        }
        match asking_price {
            Some(price) if price > report.market_high => Self::Overpriced,
            Some(price) if price < report.market_low => Self::Underpriced,
            _ => Self::InMarketRange,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Overpriced => "OVERPRICED",
            Self::Underpriced => "UNDERPRICED",
            Self::InMarketRange => "IN MARKET RANGE",
            Self::NoMarketData => "NO MARKET DATA",
        }
    }
}

/// `1234567` -> `$1,234,567`.
pub fn dollars(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

struct CompRow<'a> {
    title: &'a str,
    year: &'a str,
    make: &'a str,
    model: &'a str,
    trim: &'a str,
    mileage: &'a str,
    price: String,
    location: &'a str,
    source: &'a str,
    url: &'a str,
}

impl<'a> CompRow<'a> {
    fn from_listing(listing: &'a Listing) -> Self {
        Self {
            title: &listing.title,
            year: &listing.year,
            make: &listing.make,
            model: &listing.model,
            trim: &listing.trim,
            mileage: &listing.mileage,
            price: listing.price.map(dollars).unwrap_or_else(|| "N/A".into()),
            location: &listing.location,
            source: &listing.source,
            url: &listing.url,
        }
    }
}

fn sample_rows(report: &MarketReport) -> Vec<CompRow<'_>> {
    report
        .comps
        .iter()
        .take(SAMPLE_SIZE)
        .map(CompRow::from_listing)
        .collect()
}

#[derive(Template)]
#[template(path = "manager_report.txt")]
struct ManagerReportTemplate<'a> {
    vehicle: String,
    your_price: String,
    market_avg: String,
    band: String,
    status: &'static str,
    rows: Vec<CompRow<'a>>,
}

#[derive(Template)]
#[template(path = "customer_report.txt")]
struct CustomerReportTemplate<'a> {
    rows: Vec<CompRow<'a>>,
}

pub fn format_for_manager(
    spec: &VehicleSpec,
    asking_price: Option<i64>,
    report: &MarketReport,
) -> Result<String, askama::Error> {
    let tpl = ManagerReportTemplate {
        vehicle: spec.label(),
        your_price: asking_price.map(dollars).unwrap_or_else(|| "N/A".into()),
        market_avg: dollars(report.market_avg),
        band: format!("{}–{}", dollars(report.market_low), dollars(report.market_high)),
        status: PriceStatus::classify(asking_price, report).label(),
        rows: sample_rows(report),
    };
    Ok(tpl.render()?.trim_end().to_string())
}

pub fn format_for_customer(report: &MarketReport) -> Result<String, askama::Error> {
    let tpl = CustomerReportTemplate {
        rows: sample_rows(report),
    };
    Ok(tpl.render()?.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(n: i64) -> Listing {
        Listing {
            source: "cars-com".into(),
            title: "2019 Ford F-150 XLT".into(),
            year: "2019".into(),
            make: "Ford".into(),
            model: "F-150".into(),
            trim: "XLT".into(),
            mileage: "45123".into(),
            price: Some(20_000 + n * 1_000),
            location: "Temple Ford".into(),
            url: format!("https://www.cars.com/vehicledetail/{n}/"),
        }
    }

    fn report(count: i64) -> MarketReport {
        MarketReport::from_comps((0..count).map(listing).collect())
    }

    #[test]
    fn dollars_groups_thousands() {
        assert_eq!(dollars(0), "$0");
        assert_eq!(dollars(950), "$950");
        assert_eq!(dollars(31_995), "$31,995");
        assert_eq!(dollars(1_234_567), "$1,234,567");
        assert_eq!(dollars(-4_500), "-$4,500");
    }

    #[test]
    fn status_compares_against_the_band() {
        let r = report(3);
        assert_eq!(PriceStatus::classify(Some(30_000), &r), PriceStatus::Overpriced);
        assert_eq!(PriceStatus::classify(Some(10_000), &r), PriceStatus::Underpriced);
        assert_eq!(PriceStatus::classify(Some(21_000), &r), PriceStatus::InMarketRange);
        assert_eq!(PriceStatus::classify(None, &r), PriceStatus::InMarketRange);
        assert_eq!(
            PriceStatus::classify(Some(21_000), &MarketReport::empty()),
            PriceStatus::NoMarketData
        );
    }

    #[test]
    fn manager_report_shows_band_status_and_five_comps() {
        let spec = VehicleSpec::new(2019, "Ford", "F-150").with_trim(Some("XLT".into()));
        let text = format_for_manager(&spec, Some(35_000), &report(7)).unwrap();

        assert!(text.starts_with("Market comps for 2019 Ford F-150 XLT:"));
        assert!(text.contains("Your price: $35,000"));
        assert!(text.contains("Market avg: $23,000"));
        assert!(text.contains("Most comps: $20,000–$26,000"));
        assert!(text.contains("Status: OVERPRICED"));
        let rows = text.lines().filter(|l| l.contains("[cars-com](")).count();
        assert_eq!(rows, SAMPLE_SIZE);
        assert!(text.contains("2019 Ford F-150 XLT | XLT | 45123 mi | $20,000 | Temple Ford"));
    }

    #[test]
    fn customer_report_is_a_markdown_table() {
        let text = format_for_customer(&report(2)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Why Our Price is a Smart Deal");
        assert!(lines.iter().any(|l| l.starts_with("| Year | Make | Model |")));
        assert!(text.contains(
            "| 2019 | Ford | F-150 | XLT | 45123 | $21,000 | Temple Ford | [cars-com](https://www.cars.com/vehicledetail/1/) |"
        ));
        assert_eq!(lines.iter().filter(|l| l.contains("[cars-com](")).count(), 2);
    }

    #[test]
    fn empty_report_renders_without_rows() {
        let spec = VehicleSpec::new(2019, "Ford", "F-150");
        let text = format_for_manager(&spec, None, &MarketReport::empty()).unwrap();
        assert!(text.contains("Your price: N/A"));
        assert!(text.contains("Status: NO MARKET DATA"));
        assert!(text.ends_with("Sample comps:"));
    }
}
