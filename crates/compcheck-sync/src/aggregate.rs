//! Adapters -> normalize -> dedupe -> trim -> statistics.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use compcheck_adapters::{default_adapters, AdapterContext, SourceAdapter};
use compcheck_core::dedup::{dedupe, near_duplicates, NEAR_DUPLICATE_THRESHOLD};
use compcheck_core::normalize::{normalize_listing, SkipReason};
use compcheck_core::outliers::{remove_outliers, DEFAULT_TRIM_PERCENT};
use compcheck_core::{Diagnostic, DiagnosticKind, MarketReport, VehicleSpec, DEFAULT_ZIPCODE, DEFAULT_RADIUS};
use compcheck_storage::{HttpClientConfig, HttpFetcher};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateOptions {
    pub trim_percent: f64,
    pub near_duplicate_threshold: f64,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            trim_percent: DEFAULT_TRIM_PERCENT,
            near_duplicate_threshold: NEAR_DUPLICATE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Aggregation {
    pub report: MarketReport,
    pub diagnostics: Vec<Diagnostic>,
}

impl Aggregation {
    /// At least one source served an anti-bot challenge.
    pub fn blocked(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::BotChallenge)
    }
}

pub struct Aggregator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    ctx: AdapterContext,
    options: AggregateOptions,
}

impl Aggregator {
    /// `ctx` is a template: each call gets a fresh run id and fetch timestamp.
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        ctx: AdapterContext,
        options: AggregateOptions,
    ) -> Self {
        Self {
            adapters,
            ctx,
            options,
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.adapters
            .iter()
            .map(|a| a.source_id().to_string())
            .collect()
    }

    pub async fn aggregate(&self, spec: &VehicleSpec) -> Aggregation {
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            ..self.ctx.clone()
        };
        let span = info_span!("aggregate", run_id = %ctx.run_id, vehicle = %spec.label());
        self.aggregate_with(&ctx, spec).instrument(span).await
    }

    async fn aggregate_with(&self, ctx: &AdapterContext, spec: &VehicleSpec) -> Aggregation {
        // join_all keeps input order, so dedupe still sees sources in registry order.
        let fetches = join_all(self.adapters.iter().map(|adapter| adapter.fetch(ctx, spec))).await;

        let mut diagnostics = Vec::new();
        let mut listings = Vec::new();
        for fetch in fetches {
            diagnostics.extend(fetch.diagnostics);
            for raw in &fetch.listings {
                match normalize_listing(raw, spec) {
                    Ok(listing) => listings.push(listing),
                    Err(SkipReason::TrimMismatch { requested, listing }) => {
                        debug!(source = %raw.source, %requested, %listing, "trim filtered");
                    }
                    Err(reason) => diagnostics.push(
                        Diagnostic::new(raw.source.as_str(), DiagnosticKind::Normalize, reason.to_string())
                            .with_url(raw.url.as_str()),
                    ),
                }
            }
        }

        let normalized = listings.len();
        let unique = dedupe(listings);
        for pair in near_duplicates(&unique, self.options.near_duplicate_threshold) {
            let (a, b) = (&unique[pair.first], &unique[pair.second]);
            diagnostics.push(Diagnostic::new(
                format!("{}+{}", a.source, b.source),
                DiagnosticKind::NearDuplicate,
                format!(
                    "`{}` and `{}` at ${} look alike (score {:.3})",
                    a.title,
                    b.title,
                    a.price.unwrap_or_default(),
                    pair.score
                ),
            ));
        }
        let unique_count = unique.len();
        let trimmed = remove_outliers(unique, self.options.trim_percent);
        let report = MarketReport::from_comps(trimmed);

        info!(
            normalized,
            unique = unique_count,
            comps = report.comps.len(),
            market_avg = report.market_avg,
            diagnostics = diagnostics.len(),
            "aggregation complete"
        );
        Aggregation {
            report,
            diagnostics,
        }
    }
}

/// One-shot lookup against every marketplace with default HTTP settings.
pub async fn aggregate_comps(
    year: i32,
    make: &str,
    model: &str,
    trim: Option<&str>,
    zipcode: Option<&str>,
    radius: Option<u32>,
) -> Result<MarketReport> {
    let spec = VehicleSpec::new(year, make, model)
        .with_trim(trim.map(str::to_string))
        .with_location(
            zipcode.unwrap_or(DEFAULT_ZIPCODE),
            radius.unwrap_or(DEFAULT_RADIUS),
        );
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);
    let aggregator = Aggregator::new(
        default_adapters(),
        AdapterContext::new(http, None),
        AggregateOptions::default(),
    );
    Ok(aggregator.aggregate(&spec).await.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw, test_context, CannedAdapter};

    fn aggregator(adapters: Vec<Arc<dyn SourceAdapter>>) -> Aggregator {
        Aggregator::new(adapters, test_context(), AggregateOptions::default())
    }

    fn spec() -> VehicleSpec {
        VehicleSpec::new(2019, "Ford", "F-150")
    }

    #[tokio::test]
    async fn all_sources_failing_gives_zeroed_report() {
        let agg = aggregator(vec![
            CannedAdapter::fetch_error("cars-com"),
            CannedAdapter::fetch_error("cargurus"),
        ]);
        let result = agg.aggregate(&spec()).await;
        assert_eq!(result.report, MarketReport::empty());
        assert_eq!(result.diagnostics.len(), 2);
        assert!(!result.blocked());
    }

    #[tokio::test]
    async fn cross_source_duplicate_collapses_to_first_source() {
        let agg = aggregator(vec![
            CannedAdapter::listings("cars-com", vec![raw("cars-com", "2019 Ford F-150 XL", "$25,000")]),
            CannedAdapter::listings("cargurus", vec![raw("cargurus", "2019 Ford F-150 XL", "25000")]),
        ]);
        let result = agg.aggregate(&spec()).await;
        assert_eq!(result.report.comps.len(), 1);
        assert_eq!(result.report.comps[0].source, "cars-com");
        assert_eq!(result.report.market_avg, 25_000);
    }

    #[tokio::test]
    async fn trim_filter_and_unpriced_listings() {
        let adapters = vec![CannedAdapter::listings(
            "cars-com",
            vec![
                raw("cars-com", "2019 Ford F-150 XL", "$20,000"),
                raw("cars-com", "2019 Ford F-150 Sport", "$30,000"),
                raw("cars-com", "2019 Ford F-150 Sport 4WD", "Call for price"),
            ],
        )];
        let sport = spec().with_trim(Some("Sport".into()));
        let result = aggregator(adapters.clone()).aggregate(&sport).await;
        assert_eq!(result.report.comps.len(), 1);
        assert_eq!(result.report.comps[0].trim, "Sport");
        assert_eq!(result.report.market_low, 30_000);

        let result = aggregator(adapters).aggregate(&spec()).await;
        assert_eq!(result.report.comps.len(), 2);
        assert_eq!(result.report.market_avg, 25_000);
    }

    #[tokio::test]
    async fn zero_priced_cards_stay_out_of_the_band() {
        let agg = aggregator(vec![CannedAdapter::listings(
            "cars-com",
            vec![
                raw("cars-com", "2019 Ford F-150 XL", "$0"),
                raw("cars-com", "2019 Ford F-150 XLT", "$20,000"),
                raw("cars-com", "2019 Ford F-150 Lariat", "$22,000"),
                raw("cars-com", "2019 Ford F-150 Raptor", "$24,000"),
            ],
        )]);
        let result = agg.aggregate(&spec()).await;
        assert_eq!(result.report.comps.len(), 3);
        assert_eq!(result.report.market_low, 20_000);
        assert_eq!(result.report.market_avg, 22_000);
        assert_eq!(result.report.market_high, 24_000);
    }

    #[tokio::test]
    async fn short_titles_become_normalize_diagnostics() {
        let agg = aggregator(vec![CannedAdapter::listings(
            "autotrader",
            vec![raw("autotrader", "Ford", "$1,000")],
        )]);
        let result = agg.aggregate(&spec()).await;
        assert!(result.report.is_empty());
        assert_eq!(result.diagnostics[0].kind, DiagnosticKind::Normalize);
    }

    #[tokio::test]
    async fn challenge_from_any_source_marks_blocked() {
        let agg = aggregator(vec![
            CannedAdapter::listings("cars-com", vec![raw("cars-com", "2019 Ford F-150 XL", "$25,000")]),
            CannedAdapter::challenge("cargurus"),
        ]);
        let result = agg.aggregate(&spec()).await;
        assert!(result.blocked());
        assert_eq!(result.report.comps.len(), 1);
    }

    #[tokio::test]
    async fn near_duplicates_are_reported_not_merged() {
        let agg = aggregator(vec![
            CannedAdapter::listings("cars-com", vec![raw("cars-com", "2019 Ford F-150 XL", "$25,000")]),
            CannedAdapter::listings("cargurus", vec![raw("cargurus", "2019 FORD F-150 XL", "$25,000")]),
        ]);
        let result = agg.aggregate(&spec()).await;
        assert_eq!(result.report.comps.len(), 2);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::NearDuplicate && d.source == "cars-com+cargurus"));
    }
}
