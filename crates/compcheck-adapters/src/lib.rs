//! Source adapter contract and the marketplace adapters (Cars.com, CarGurus,
//! Autotrader).
//!
//! An adapter turns a [`VehicleSpec`] into a search URL, fetches it through the
//! shared [`HttpFetcher`] and parses listing cards into [`RawListing`]s. Page
//! level failures never escape an adapter: they come back as [`Diagnostic`]s
//! next to whatever listings could be recovered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compcheck_core::{Diagnostic, DiagnosticKind, RawListing, VehicleSpec};
use compcheck_storage::{ArtifactStore, HttpFetcher, Url};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "compcheck-adapters";

pub const CARS_COM: &str = "cars-com";
pub const CARGURUS: &str = "cargurus";
pub const AUTOTRADER: &str = "autotrader";

pub const DEFAULT_PAGE_SIZE: u32 = 15;

/// Case-insensitive phrases that mark an anti-bot interstitial.
pub const BOT_CHALLENGE_PHRASES: [&str; 5] = [
    "are you a robot",
    "captcha",
    "unusual traffic",
    "access denied",
    "verify you are human",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("cannot build search url: {0}")]
    SearchUrl(String),
}

/// Per-run collaborators handed to every adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub http: Arc<HttpFetcher>,
    pub artifacts: Option<ArtifactStore>,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(http: Arc<HttpFetcher>, artifacts: Option<ArtifactStore>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            http,
            artifacts,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Number of card containers matched, including ones that failed to parse.
    pub cards_seen: usize,
    pub listings: Vec<RawListing>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Outcome of one adapter call. Empty `listings` plus diagnostics is the
/// failure shape; there is no error variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterFetch {
    pub listings: Vec<RawListing>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AdapterFetch {
    pub fn failed(diagnostic: Diagnostic) -> Self {
        Self {
            listings: Vec::new(),
            diagnostics: vec![diagnostic],
        }
    }

    pub fn blocked(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::BotChallenge)
    }
}

/// Result of reading a fetched body, before any artifact is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    pub fetch: AdapterFetch,
    /// Parsed cleanly but matched no cards; worth keeping for selector debugging.
    pub empty_page: bool,
}

pub fn detect_bot_challenge(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    BOT_CHALLENGE_PHRASES
        .iter()
        .copied()
        .find(|phrase| lower.contains(phrase))
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;

    fn search_url(&self, spec: &VehicleSpec) -> Result<Url, AdapterError>;

    fn parse_page(&self, html: &str) -> Result<ParsedPage, AdapterError>;

    fn interpret_body(&self, url: &str, body: &str) -> PageOutcome {
        let source = self.source_id();
        if let Some(phrase) = detect_bot_challenge(body) {
            warn!(source, url, phrase, "bot challenge page");
            return PageOutcome {
                fetch: AdapterFetch::failed(
                    Diagnostic::new(
                        source,
                        DiagnosticKind::BotChallenge,
                        format!("challenge page (matched `{phrase}`)"),
                    )
                    .with_url(url),
                ),
                empty_page: false,
            };
        }

        match self.parse_page(body) {
            Ok(page) if page.cards_seen == 0 => {
                info!(source, url, "no listing cards on page");
                PageOutcome {
                    fetch: AdapterFetch::failed(
                        Diagnostic::new(source, DiagnosticKind::NoResults, "no listing cards matched")
                            .with_url(url),
                    ),
                    empty_page: true,
                }
            }
            Ok(page) => {
                debug!(
                    source,
                    cards = page.cards_seen,
                    listings = page.listings.len(),
                    skipped = page.diagnostics.len(),
                    "parsed listing page"
                );
                PageOutcome {
                    fetch: AdapterFetch {
                        listings: page.listings,
                        diagnostics: page.diagnostics,
                    },
                    empty_page: false,
                }
            }
            Err(err) => PageOutcome {
                fetch: AdapterFetch::failed(
                    Diagnostic::new(source, DiagnosticKind::Parse, err.to_string()).with_url(url),
                ),
                empty_page: false,
            },
        }
    }

    /// Fetch and parse the first results page for `spec`.
    async fn fetch(&self, ctx: &AdapterContext, spec: &VehicleSpec) -> AdapterFetch {
        let source = self.source_id();
        let url = match self.search_url(spec) {
            Ok(url) => url,
            Err(err) => {
                return AdapterFetch::failed(Diagnostic::new(
                    source,
                    DiagnosticKind::Fetch,
                    err.to_string(),
                ))
            }
        };

        let response = match ctx.http.fetch_text(ctx.run_id, source, &url).await {
            Ok(response) => response,
            Err(err) => {
                if let Some(phrase) = err.body().and_then(detect_bot_challenge) {
                    warn!(source, url = %url, phrase, "bot challenge on error response");
                    return AdapterFetch::failed(
                        Diagnostic::new(
                            source,
                            DiagnosticKind::BotChallenge,
                            format!("{err} (matched `{phrase}`)"),
                        )
                        .with_url(url.as_str()),
                    );
                }
                warn!(source, url = %url, error = %err, "marketplace fetch failed");
                return AdapterFetch::failed(
                    Diagnostic::new(source, DiagnosticKind::Fetch, err.to_string())
                        .with_url(url.as_str()),
                );
            }
        };

        let outcome = self.interpret_body(&response.final_url, &response.body);
        if outcome.empty_page {
            if let Some(store) = &ctx.artifacts {
                match store.store_page(ctx.fetched_at, source, &response.body).await {
                    Ok(stored) => {
                        info!(source, path = %stored.absolute_path.display(), "stored empty results page")
                    }
                    Err(err) => warn!(source, error = %err, "could not store empty results page"),
                }
            }
        }
        outcome.fetch
    }
}

/// CSS selectors for one marketplace's result cards. Title and link are
/// required per card; the rest are optional. A comma-separated group matches
/// whichever element comes first in the card, so legacy and current markup
/// can share one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardSelectors {
    pub card: &'static str,
    pub title: &'static str,
    pub price: &'static str,
    pub mileage: &'static str,
    pub location: &'static str,
    pub link: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchLayout {
    CarsCom,
    CarGurus,
    Autotrader,
}

#[derive(Debug, Clone)]
pub struct MarketplaceAdapter {
    source_id: &'static str,
    display_name: &'static str,
    origin: &'static str,
    layout: SearchLayout,
    selectors: CardSelectors,
    page_size: u32,
}

impl MarketplaceAdapter {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    fn origin_url(&self) -> Result<Url, AdapterError> {
        Url::parse(self.origin).map_err(|e| AdapterError::SearchUrl(e.to_string()))
    }
}

pub fn cars_com_adapter() -> MarketplaceAdapter {
    MarketplaceAdapter {
        source_id: CARS_COM,
        display_name: "Cars.com",
        origin: "https://www.cars.com/",
        layout: SearchLayout::CarsCom,
        selectors: CardSelectors {
            card: "[data-test='vehicleCard'], div.vehicle-card",
            title: "h2.title, h2",
            price: "span.primary-price, [data-test='vehicleCardPricingBlockPrice']",
            mileage: "div.mileage, [data-test='vehicleMileage']",
            location: "div.dealer-name",
            link: "a.vehicle-card-link, a[href]",
        },
        page_size: DEFAULT_PAGE_SIZE,
    }
}

pub fn cargurus_adapter() -> MarketplaceAdapter {
    MarketplaceAdapter {
        source_id: CARGURUS,
        display_name: "CarGurus",
        origin: "https://www.cargurus.com/",
        layout: SearchLayout::CarGurus,
        selectors: CardSelectors {
            card: "div.ListingListing__listingCard",
            title: "h4.listingTitle",
            price: "span.price",
            mileage: "div.Mileage",
            location: "div.Location",
            link: "a",
        },
        page_size: DEFAULT_PAGE_SIZE,
    }
}

pub fn autotrader_adapter() -> MarketplaceAdapter {
    MarketplaceAdapter {
        source_id: AUTOTRADER,
        display_name: "Autotrader",
        origin: "https://www.autotrader.com/",
        layout: SearchLayout::Autotrader,
        selectors: CardSelectors {
            card: "div.inventory-listing",
            title: "h2.title",
            price: "span.first-price",
            mileage: "div.text-bold.text-size-200",
            location: "div.text-bold.text-size-100",
            link: "a",
        },
        page_size: DEFAULT_PAGE_SIZE,
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<MarketplaceAdapter> {
    match source_id {
        CARS_COM => Some(cars_com_adapter()),
        CARGURUS => Some(cargurus_adapter()),
        AUTOTRADER => Some(autotrader_adapter()),
        _ => None,
    }
}

/// Fixed aggregation order; dedupe keeps the first occurrence, so this order
/// decides which source wins a tie.
pub fn default_adapters() -> Vec<Arc<dyn SourceAdapter>> {
    vec![
        Arc::new(cars_com_adapter()),
        Arc::new(cargurus_adapter()),
        Arc::new(autotrader_adapter()),
    ]
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(card: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

struct CompiledSelectors {
    card: Selector,
    title: Selector,
    price: Selector,
    mileage: Selector,
    location: Selector,
    link: Selector,
}

impl CompiledSelectors {
    fn new(selectors: &CardSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile(selectors.card)?,
            title: compile(selectors.title)?,
            price: compile(selectors.price)?,
            mileage: compile(selectors.mileage)?,
            location: compile(selectors.location)?,
            link: compile(selectors.link)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for MarketplaceAdapter {
    fn source_id(&self) -> &str {
        self.source_id
    }

    fn display_name(&self) -> &str {
        self.display_name
    }

    fn search_url(&self, spec: &VehicleSpec) -> Result<Url, AdapterError> {
        let origin = self.origin_url()?;
        let year = spec.year.to_string();
        let radius = spec.radius.to_string();
        let page_size = self.page_size.to_string();

        let mut url = match self.layout {
            SearchLayout::CarsCom => origin
                .join("shopping/results/")
                .map_err(|e| AdapterError::SearchUrl(e.to_string()))?,
            SearchLayout::CarGurus => origin
                .join("Cars/inventorylisting/viewDetailsFilterViewInventoryListing.action")
                .map_err(|e| AdapterError::SearchUrl(e.to_string()))?,
            SearchLayout::Autotrader => {
                let mut url = origin;
                url.path_segments_mut()
                    .map_err(|_| AdapterError::SearchUrl("origin cannot be a base".into()))?
                    .clear()
                    .extend([
                        "cars-for-sale",
                        spec.make.as_str(),
                        spec.model.as_str(),
                        spec.zipcode.as_str(),
                    ]);
                url
            }
        };

        {
            let mut query = url.query_pairs_mut();
            match self.layout {
                SearchLayout::CarsCom => {
                    query
                        .append_pair("stock_type", "used")
                        .append_pair("makes[]", &spec.make.to_lowercase())
                        .append_pair("models[]", &spec.model.to_lowercase())
                        .append_pair("maximum_distance", &radius)
                        .append_pair("zip", &spec.zipcode)
                        .append_pair("year_min", &year)
                        .append_pair("year_max", &year)
                        .append_pair("page_size", &page_size)
                        .append_pair("sort", "best_match_desc");
                }
                SearchLayout::CarGurus => {
                    query
                        .append_pair("zip", &spec.zipcode)
                        .append_pair("distance", &radius)
                        .append_pair(
                            "entitySelectingHelper.selectedEntity",
                            &format!("{}_{}_{}", spec.year, spec.make, spec.model),
                        );
                }
                SearchLayout::Autotrader => {
                    query
                        .append_pair("searchRadius", &radius)
                        .append_pair("startYear", &year)
                        .append_pair("endYear", &year)
                        .append_pair("numRecords", &page_size);
                }
            }
        }
        Ok(url)
    }

    fn parse_page(&self, html: &str) -> Result<ParsedPage, AdapterError> {
        let selectors = CompiledSelectors::new(&self.selectors)?;
        let origin = self.origin_url()?;
        let document = Html::parse_document(html);

        let mut page = ParsedPage::default();
        for (index, card) in document.select(&selectors.card).enumerate() {
            page.cards_seen += 1;

            let Some(title) = select_first_text(&card, &selectors.title) else {
                page.diagnostics.push(Diagnostic::new(
                    self.source_id,
                    DiagnosticKind::Parse,
                    format!("card {index}: missing title"),
                ));
                continue;
            };
            let link = select_first_attr(&card, &selectors.link, "href")
                .and_then(|href| origin.join(&href).ok());
            let Some(link) = link else {
                page.diagnostics.push(Diagnostic::new(
                    self.source_id,
                    DiagnosticKind::Parse,
                    format!("card {index} ({title}): missing or invalid link"),
                ));
                continue;
            };

            page.listings.push(RawListing {
                source: self.source_id.to_string(),
                title,
                price: select_first_text(&card, &selectors.price),
                mileage: select_first_text(&card, &selectors.mileage),
                location: select_first_text(&card, &selectors.location),
                url: link.to_string(),
            });
        }
        Ok(page)
    }
}
