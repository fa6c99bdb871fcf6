use std::sync::Arc;

use compcheck_adapters::{
    autotrader_adapter, cargurus_adapter, cars_com_adapter, AdapterContext, AdapterError,
    ParsedPage, SourceAdapter,
};
use compcheck_core::{DiagnosticKind, VehicleSpec};
use compcheck_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, Url};

const CARS_COM_PAGE: &str = r#"
<html><body>
  <div class="vehicle-card" data-test="vehicleCard">
    <a class="vehicle-card-link" href="/vehicledetail/abc123/">
      <h2 class="title">2019 Ford
        F-150 XLT</h2>
    </a>
    <span class="primary-price">$31,995</span>
    <div class="mileage">45,123 mi.</div>
    <div class="dealer-name">Temple Ford</div>
  </div>
  <div class="vehicle-card">
    <a class="vehicle-card-link" href="https://www.cars.com/vehicledetail/def456/">
      <h2 class="title">2019 Ford F-150 XL</h2>
    </a>
    <span class="primary-price">Not Priced</span>
  </div>
  <div class="vehicle-card">
    <span class="primary-price">$12,000</span>
  </div>
</body></html>
"#;

const CARS_COM_CURRENT_PAGE: &str = r#"
<html><body>
  <div class="vehicle-card-main" data-test="vehicleCard">
    <a href="/vehicledetail/ghi789/" data-test="vehicleCardLink">
      <h2>2019 Ford F-150 Lariat</h2>
    </a>
    <div data-test="vehicleMileage">38,410 mi.</div>
    <span data-test="vehicleCardPricingBlockPrice">$36,250</span>
  </div>
</body></html>
"#;

const CARGURUS_PAGE: &str = r#"
<div class="ListingListing__listingCard">
  <a href="/Cars/link/111"><h4 class="listingTitle">2019 Ford F-150 Lariat</h4></a>
  <span class="price">$38,400</span>
  <div class="Mileage">22,000 mi</div>
  <div class="Location">Waco, TX</div>
</div>
"#;

const AUTOTRADER_PAGE: &str = r#"
<div class="inventory-listing">
  <h2 class="title">2019 Ford F-150 Raptor</h2>
  <span class="first-price">54,000</span>
  <div class="text-bold text-size-200">18,250 miles</div>
  <div class="text-bold text-size-100">Austin, TX</div>
  <a href="/cars-for-sale/vehicledetails.xhtml?listingId=9">details</a>
</div>
<div class="inventory-listing">
  <h2 class="title">2019 Ford F-150 XL</h2>
  <span class="first-price">29,000</span>
</div>
"#;

#[test]
fn cars_com_cards_parse_with_optional_fields() {
    let page = cars_com_adapter().parse_page(CARS_COM_PAGE).expect("parse");
    assert_eq!(page.cards_seen, 3);
    assert_eq!(page.listings.len(), 2);

    let first = &page.listings[0];
    assert_eq!(first.source, "cars-com");
    assert_eq!(first.title, "2019 Ford F-150 XLT");
    assert_eq!(first.price.as_deref(), Some("$31,995"));
    assert_eq!(first.mileage.as_deref(), Some("45,123 mi."));
    assert_eq!(first.location.as_deref(), Some("Temple Ford"));
    assert_eq!(first.url, "https://www.cars.com/vehicledetail/abc123/");

    let second = &page.listings[1];
    assert_eq!(second.mileage, None);
    assert_eq!(second.location, None);
    assert_eq!(second.url, "https://www.cars.com/vehicledetail/def456/");

    assert_eq!(page.diagnostics.len(), 1);
    assert_eq!(page.diagnostics[0].kind, DiagnosticKind::Parse);
}

#[test]
fn cars_com_current_card_layout_parses() {
    let page = cars_com_adapter().parse_page(CARS_COM_CURRENT_PAGE).expect("parse");
    assert_eq!(page.cards_seen, 1);
    assert!(page.diagnostics.is_empty(), "{:?}", page.diagnostics);
    assert_eq!(page.listings.len(), 1);

    let listing = &page.listings[0];
    assert_eq!(listing.title, "2019 Ford F-150 Lariat");
    assert_eq!(listing.price.as_deref(), Some("$36,250"));
    assert_eq!(listing.mileage.as_deref(), Some("38,410 mi."));
    assert_eq!(listing.location, None);
    assert_eq!(listing.url, "https://www.cars.com/vehicledetail/ghi789/");
}

#[test]
fn cargurus_links_resolve_against_origin() {
    let page = cargurus_adapter().parse_page(CARGURUS_PAGE).expect("parse");
    assert_eq!(page.listings.len(), 1);
    assert_eq!(page.listings[0].url, "https://www.cargurus.com/Cars/link/111");
    assert_eq!(page.listings[0].location.as_deref(), Some("Waco, TX"));
}

#[test]
fn autotrader_card_without_link_is_skipped_not_fatal() {
    let ParsedPage {
        cards_seen,
        listings,
        diagnostics,
    } = autotrader_adapter().parse_page(AUTOTRADER_PAGE).expect("parse");
    assert_eq!(cards_seen, 2);
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].title, "2019 Ford F-150 Raptor");
    assert_eq!(listings[0].mileage.as_deref(), Some("18,250 miles"));
    assert!(diagnostics[0].detail.contains("missing or invalid link"));
}

/// Points at a closed local port so the fetch fails without touching the network.
struct UnreachableMarketplace;

#[async_trait::async_trait]
impl SourceAdapter for UnreachableMarketplace {
    fn source_id(&self) -> &str {
        "unreachable"
    }

    fn display_name(&self) -> &str {
        "Unreachable"
    }

    fn search_url(&self, _spec: &VehicleSpec) -> Result<Url, AdapterError> {
        Url::parse("http://127.0.0.1:9/results").map_err(|e| AdapterError::SearchUrl(e.to_string()))
    }

    fn parse_page(&self, html: &str) -> Result<ParsedPage, AdapterError> {
        cars_com_adapter().parse_page(html)
    }
}

#[tokio::test]
async fn unreachable_marketplace_yields_fetch_diagnostic() {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: std::time::Duration::from_secs(2),
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    })
    .expect("fetcher");
    let ctx = AdapterContext::new(Arc::new(http), None);

    let result = UnreachableMarketplace
        .fetch(&ctx, &VehicleSpec::new(2019, "Ford", "F-150"))
        .await;

    assert!(result.listings.is_empty());
    assert_eq!(result.diagnostics.len(), 1);
    assert_eq!(result.diagnostics[0].kind, DiagnosticKind::Fetch);
    assert_eq!(result.diagnostics[0].source, "unreachable");
    assert!(!result.blocked());
}
