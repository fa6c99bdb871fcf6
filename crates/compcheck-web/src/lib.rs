//! Axum surface for comp lookups, formatted reports and stored comps.

pub mod report;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use compcheck_core::{VehicleSpec, DEFAULT_RADIUS, DEFAULT_ZIPCODE};
use compcheck_storage::{connect_pool, CompStore, PgCompStore};
use compcheck_sync::{Aggregator, CompConfig, CompServices};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub use report::{dollars, format_for_customer, format_for_manager, PriceStatus};

pub const CRATE_NAME: &str = "compcheck-web";

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    /// Absent when no database is configured; `/comps/inventory` then answers 503.
    pub store: Option<Arc<dyn CompStore>>,
}

impl AppState {
    pub fn new(aggregator: Arc<Aggregator>, store: Option<Arc<dyn CompStore>>) -> Self {
        Self { aggregator, store }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub zipcode: Option<String>,
    pub radius: Option<u32>,
}

impl SearchQuery {
    pub fn spec(&self) -> VehicleSpec {
        VehicleSpec::new(self.year, self.make.trim(), self.model.trim())
            .with_trim(self.trim.clone())
            .with_location(
                self.zipcode
                    .as_deref()
                    .map(str::trim)
                    .filter(|z| !z.is_empty())
                    .unwrap_or(DEFAULT_ZIPCODE),
                self.radius.unwrap_or(DEFAULT_RADIUS),
            )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    Manager,
    Customer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportQuery {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub zipcode: Option<String>,
    pub radius: Option<u32>,
    #[serde(default)]
    pub audience: Audience,
    pub price: Option<i64>,
}

impl ReportQuery {
    fn search(&self) -> SearchQuery {
        SearchQuery {
            year: self.year,
            make: self.make.clone(),
            model: self.model.clone(),
            trim: self.trim.clone(),
            zipcode: self.zipcode.clone(),
            radius: self.radius,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/comps/search", get(search_handler))
        .route("/comps/report", get(report_handler))
        .route("/comps/inventory/{inventory_id}", get(inventory_comps_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "comp web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = CompConfig::from_env();
    let services = CompServices::new(config.clone())?;
    let store: Option<Arc<dyn CompStore>> = match config.database_url.as_deref() {
        Some(url) => Some(Arc::new(PgCompStore::new(connect_pool(url).await?))),
        None => {
            warn!("DATABASE_URL not set; stored comps endpoint disabled");
            None
        }
    };
    let state = AppState::new(Arc::new(services.search_aggregator()), store);
    serve(state, config.web_port).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let aggregation = state.aggregator.aggregate(&query.spec()).await;
    if !aggregation.diagnostics.is_empty() {
        info!(diagnostics = aggregation.diagnostics.len(), "search completed with diagnostics");
    }
    Json(aggregation.report).into_response()
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let spec = query.search().spec();
    let report = state.aggregator.aggregate(&spec).await.report;
    let rendered = match query.audience {
        Audience::Manager => format_for_manager(&spec, query.price, &report),
        Audience::Customer => format_for_customer(&report),
    };
    match rendered {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "report render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("render error: {err}")).into_response()
        }
    }
}

async fn inventory_comps_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<i64>,
) -> Response {
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "comp store not configured" })),
        )
            .into_response();
    };
    match store.comps_for(inventory_id).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            error!(inventory_id, error = %err, "loading stored comps failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
