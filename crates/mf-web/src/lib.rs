//! Read-only JSON API over stored fundamentals and Magic Formula rankings.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Datelike, Utc};
use mf_core::{PeriodCompletion, PeriodSummary, RankedStock, ScreeningCriteria};
use mf_query::{CompletionSummary, RankCriteria, RankingOutcome, StockQueryService, TopStocksQuery, MAX_TOP_N};
use mf_storage::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod auth;

pub use auth::{bearer_token, AnyOf, AuthError, AuthProvider, CallerIdentity, JwtAuth, StaticTokenAuth};

pub const CRATE_NAME: &str = "mf-web";
pub const MIN_YEAR: i32 = 2000;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub api_tokens: Vec<String>,
    pub jwt_public_key: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("MF_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            api_tokens: std::env::var("MF_API_TOKENS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            jwt_public_key: std::env::var("MF_JWT_PUBLIC_KEY").ok().filter(|v| !v.trim().is_empty()),
        }
    }

    /// Static tokens and the JWT key when configured. With neither, every
    /// protected request is refused.
    pub fn auth_provider(&self) -> Result<Arc<dyn AuthProvider>, AuthError> {
        let mut providers: Vec<Box<dyn AuthProvider>> = Vec::new();
        if !self.api_tokens.is_empty() {
            providers.push(Box::new(StaticTokenAuth::new(self.api_tokens.iter().cloned())));
        }
        if let Some(key) = &self.jwt_public_key {
            providers.push(Box::new(JwtAuth::rs256(key)?));
        }
        if providers.is_empty() {
            warn!("no api tokens or jwt key configured, protected routes will reject every request");
        }
        Ok(Arc::new(AnyOf::new(providers)))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub query: StockQueryService,
    pub auth: Arc<dyn AuthProvider>,
    /// Defaults for market cap and excluded sectors.
    pub screening: ScreeningCriteria,
}

impl AppState {
    pub fn new(query: StockQueryService, auth: Arc<dyn AuthProvider>, screening: ScreeningCriteria) -> Self {
        Self { query, auth, screening }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store error while serving request");
        Self::Internal("storage unavailable".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::BadRequest(d) => (StatusCode::BAD_REQUEST, d),
            Self::Unauthorized(d) => {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    Json(json!({ "detail": d })),
                )
                    .into_response();
            }
            Self::NotFound(d) => (StatusCode::NOT_FOUND, d),
            Self::Internal(d) => (StatusCode::INTERNAL_SERVER_ERROR, d),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl FromRequestParts<Arc<AppState>> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = bearer_token(header).map_err(|e| ApiError::Unauthorized(e.to_string()))?;
        state
            .auth
            .verify(token)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stocks/top/year/{year}", get(top_by_year_handler))
        .route("/api/stocks/top/monthly/{year}/{month}", get(top_by_month_handler))
        .route("/api/stocks/count/{year}", get(count_handler))
        .route("/api/stocks/periods", get(periods_handler))
        .route("/api/stocks/completion", get(completion_handler))
        .route("/api/admin/warm-cache/{year}", post(warm_cache_handler))
        .route("/api/admin/cache/stats", get(cache_stats_handler))
        .route("/api/admin/cache/invalidate/{year}", delete(invalidate_cache_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn validate_year(year: i32) -> Result<(), ApiError> {
    let current = Utc::now().year();
    if !(MIN_YEAR..=current).contains(&year) {
        return Err(ApiError::BadRequest(format!("Year must be between {MIN_YEAR} and {current}")));
    }
    Ok(())
}

fn validate_month(month: u32) -> Result<(), ApiError> {
    if !(1..=12).contains(&month) {
        return Err(ApiError::BadRequest("Month must be between 1 and 12".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct TopStocksParams {
    top_n: Option<usize>,
    min_earnings_yield: Option<f64>,
    min_return_on_capital: Option<f64>,
    min_market_cap: Option<f64>,
}

impl TopStocksParams {
    fn criteria(&self, defaults: &ScreeningCriteria) -> Result<RankCriteria, ApiError> {
        let base = RankCriteria::default();
        let top_n = self.top_n.unwrap_or(base.top_n);
        if !(1..=MAX_TOP_N).contains(&top_n) {
            return Err(ApiError::BadRequest(format!("top_n must be between 1 and {MAX_TOP_N}")));
        }
        let mut screening = defaults.clone();
        if let Some(min_market_cap) = self.min_market_cap {
            screening.min_market_cap = min_market_cap;
        }
        Ok(RankCriteria {
            top_n,
            min_earnings_yield: self.min_earnings_yield.unwrap_or(base.min_earnings_yield),
            min_return_on_capital: self.min_return_on_capital.unwrap_or(base.min_return_on_capital),
            screening,
        })
    }
}

#[derive(Debug, Serialize)]
struct FiltersApplied {
    min_earnings_yield: f64,
    min_return_on_capital: f64,
    min_market_cap: f64,
}

#[derive(Debug, Serialize)]
struct TopStocksResponse {
    year: i32,
    month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requested_month: Option<u32>,
    fallback_to_yearly: bool,
    top_n: usize,
    total_in_database: u64,
    total_after_filter: usize,
    stocks: Vec<RankedStock>,
    filters_applied: FiltersApplied,
    generated_at: DateTime<Utc>,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": CRATE_NAME }))
}

async fn top_by_year_handler(
    caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(year): Path<i32>,
    Query(params): Query<TopStocksParams>,
) -> Result<Json<TopStocksResponse>, ApiError> {
    validate_year(year)?;
    top_stocks(&state, &caller, year, None, &params).await
}

async fn top_by_month_handler(
    caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
    Query(params): Query<TopStocksParams>,
) -> Result<Json<TopStocksResponse>, ApiError> {
    validate_month(month)?;
    validate_year(year)?;
    top_stocks(&state, &caller, year, Some(month), &params).await
}

async fn top_stocks(
    state: &AppState,
    caller: &CallerIdentity,
    year: i32,
    month: Option<u32>,
    params: &TopStocksParams,
) -> Result<Json<TopStocksResponse>, ApiError> {
    let criteria = params.criteria(&state.screening)?;
    info!(user = %caller.username, year, month, top_n = criteria.top_n, "top stocks requested");
    let query = TopStocksQuery {
        year,
        month,
        fallback_to_yearly: month.is_some(),
        criteria,
    };
    let label = match month {
        Some(m) => format!("{year}-{m:02}"),
        None => year.to_string(),
    };

    match state.query.get_top_stocks(&query).await? {
        RankingOutcome::NoDataForPeriod => Err(ApiError::NotFound(format!(
            "No data available for {year}. Background job may still be processing. Check /periods for available data."
        ))),
        RankingOutcome::NoMatches { .. } => Err(ApiError::NotFound(format!(
            "No stocks match the criteria for {label}. Try relaxing filters."
        ))),
        RankingOutcome::Ranked(result) => Ok(Json(TopStocksResponse {
            year: result.year,
            month: result.month,
            requested_month: result.requested_month,
            fallback_to_yearly: result.fallback_to_yearly,
            top_n: query.criteria.top_n,
            total_in_database: result.total_in_database,
            total_after_filter: result.total_after_filter,
            stocks: result.stocks,
            filters_applied: FiltersApplied {
                min_earnings_yield: query.criteria.min_earnings_yield,
                min_return_on_capital: query.criteria.min_return_on_capital,
                min_market_cap: query.criteria.screening.min_market_cap,
            },
            generated_at: Utc::now(),
        })),
    }
}

#[derive(Debug, Deserialize)]
struct CountParams {
    month: Option<u32>,
}

async fn count_handler(
    _caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(year): Path<i32>,
    Query(params): Query<CountParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_year(year)?;
    if let Some(month) = params.month {
        validate_month(month)?;
    }
    let count = state.query.get_stock_count(year, params.month).await?;
    Ok(Json(json!({ "year": year, "month": params.month, "count": count })))
}

#[derive(Debug, Serialize)]
struct PeriodView {
    year: i32,
    month: Option<u32>,
    period: String,
    stock_count: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl From<PeriodSummary> for PeriodView {
    fn from(summary: PeriodSummary) -> Self {
        Self {
            year: summary.period.year,
            month: summary.period.month,
            period: summary.period.to_string(),
            stock_count: summary.stock_count,
            last_updated: summary.last_updated,
        }
    }
}

async fn periods_handler(
    _caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let periods = state
        .query
        .get_available_periods()
        .await?
        .into_iter()
        .map(PeriodView::from)
        .collect::<Vec<_>>();
    Ok(Json(json!({
        "total_periods": periods.len(),
        "available_periods": periods,
        "generated_at": Utc::now(),
    })))
}

#[derive(Debug, Serialize)]
struct CompletionView {
    year: i32,
    month: Option<u32>,
    period: String,
    status: &'static str,
    total_symbols: u64,
    successful_fetches: u64,
    pending_retries: u64,
    permanently_failed: u64,
    completion_percentage: f64,
    is_complete: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<PeriodCompletion> for CompletionView {
    fn from(c: PeriodCompletion) -> Self {
        Self {
            year: c.period.year,
            month: c.period.month,
            period: c.period.to_string(),
            status: c.status.as_str(),
            total_symbols: c.total_symbols,
            successful_fetches: c.successful_fetches,
            pending_retries: c.pending_retries,
            permanently_failed: c.permanently_failed,
            completion_percentage: (c.completion_percentage * 100.0).round() / 100.0,
            is_complete: c.is_complete(),
            started_at: c.started_at,
            completed_at: c.completed_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionResponse {
    periods: Vec<CompletionView>,
    summary: CompletionSummary,
    generated_at: DateTime<Utc>,
}

async fn completion_handler(
    _caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let report = state.query.get_completion_status().await?;
    Ok(Json(CompletionResponse {
        periods: report.periods.into_iter().map(CompletionView::from).collect(),
        summary: report.summary,
        generated_at: report.generated_at,
    }))
}

async fn warm_cache_handler(
    caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(year): Path<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_year(year)?;
    info!(user = %caller.username, year, "cache warm-up requested");
    let report = state.query.warm_cache(year).await?;
    if report.record_sets == 0 {
        return Err(ApiError::NotFound(format!("No data available for {year}. Nothing to cache.")));
    }
    Ok(Json(json!({
        "message": format!("Cache warmed for {year}"),
        "year": report.year,
        "record_sets": report.record_sets,
        "stocks": report.stocks,
    })))
}

async fn cache_stats_handler(
    _caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let stats = state.query.cache_stats().await;
    Json(json!({ "healthy": stats.healthy, "cache": stats }))
}

async fn invalidate_cache_handler(
    caller: CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(year): Path<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_year(year)?;
    info!(user = %caller.username, year, "cache invalidation requested");
    state.query.invalidate_year(year).await;
    Ok(Json(json!({ "message": format!("Cache invalidated for {year}"), "year": year })))
}
