//! Control-plane HTTP surface.
//!
//! Thin projections over the components; no business logic lives here.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::context::AppContext;
use crate::models::{Market, SymbolMeta};
use crate::policy::{CapabilityProfile, CredentialRejected, Credentials};

/// Create the API router
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/user/set_bitget_api", post(set_api_credentials))
        .route("/user/reset_bitget_api", delete(reset_api_credentials))
        .route("/user/test_connection", post(test_connection))
        .route("/user/limits", get(get_limits))
        .route("/user/status", get(get_status))
        .route("/symbols/all", get(get_all_symbols))
        .route("/symbols/top", get(get_top_symbols))
        .route("/symbols/:symbol/info", get(get_symbol_info))
        .route("/ws/:symbol", get(crate::api::ws::ws_handler))
        .with_state(ctx)
}

// ===== Route Handlers =====

async fn health_check(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let snapshot = ctx.health.snapshot();
    Json(json!({
        "status": snapshot.status,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn set_api_credentials(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<ApiSettingsRequest>,
) -> Result<Json<ApiStatusResponse>, ApiError> {
    if req.api_key.len() < 10 || req.secret_key.len() < 10 {
        return Err(ApiError::BadRequest(
            "api_key and secret_key must be at least 10 characters".to_string(),
        ));
    }
    if req.passphrase.len() < 3 {
        return Err(ApiError::BadRequest(
            "passphrase must be at least 3 characters".to_string(),
        ));
    }

    let credentials = Credentials {
        api_key: req.api_key,
        secret_key: req.secret_key,
        passphrase: req.passphrase,
    };
    let profile = ctx.policy.apply_credentials(credentials).await?;
    let privileged = profile.book_channel;

    Ok(Json(ApiStatusResponse {
        status: "success".to_string(),
        privileged_features: privileged,
        message: if privileged {
            "API credentials updated - privileged features activated".to_string()
        } else {
            "API credentials updated - using public tier".to_string()
        },
        limits: limits_of(&profile),
    }))
}

async fn reset_api_credentials(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let profile = ctx.policy.reset().await?;
    Ok(Json(json!({
        "status": "success",
        "message": "API configuration reset to public tier",
        "tier": profile.tier,
    })))
}

async fn test_connection(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (symbols_count, tickers_count) = ctx
        .policy
        .test_connection()
        .await
        .map_err(|e| ApiError::BadRequest(format!("connection test failed: {e}")))?;
    Ok(Json(json!({
        "status": "success",
        "message": "API connection test successful",
        "symbols_count": symbols_count,
        "tickers_count": tickers_count,
        "tier": ctx.policy.profile().tier,
    })))
}

async fn get_limits(State(ctx): State<Arc<AppContext>>) -> Json<ApiLimitsResponse> {
    Json(limits_of(&ctx.policy.profile()))
}

async fn get_status(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let profile = ctx.policy.profile();
    let health = ctx.health.snapshot();
    Json(json!({
        "api_configured": ctx.policy.is_configured(),
        "tier": profile.tier,
        "system_health": health,
        "limits": limits_of(&profile),
        "active_markets": profile.markets,
        "total_symbols": ctx.symbols.total_symbols(),
        "broker": ctx.broker.metrics(),
    }))
}

async fn get_all_symbols(State(ctx): State<Arc<AppContext>>) -> Json<SymbolsResponse> {
    let symbols = ctx.symbols.all_symbols();
    Json(SymbolsResponse {
        count: symbols.len(),
        symbols,
    })
}

async fn get_top_symbols(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<TopQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let market = match &params.market {
        Some(raw) => Some(
            Market::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown market '{raw}'")))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(50).min(500);
    let symbols = ctx.symbols.top(market, limit);
    Ok(Json(json!({
        "market": market.map(|m| m.to_string()).unwrap_or_else(|| "all".to_string()),
        "count": symbols.len(),
        "symbols": symbols,
    })))
}

async fn get_symbol_info(
    State(ctx): State<Arc<AppContext>>,
    Path(symbol): Path<String>,
    Query(params): Query<InfoQuery>,
) -> Result<Json<SymbolMeta>, ApiError> {
    let market = Market::parse(&params.market)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown market '{}'", params.market)))?;
    ctx.symbols
        .symbol_info(&symbol, market)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("symbol {symbol} not found in {market}")))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct ApiSettingsRequest {
    api_key: String,
    secret_key: String,
    passphrase: String,
}

#[derive(Deserialize)]
struct TopQuery {
    market: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct InfoQuery {
    market: String,
}

#[derive(Serialize)]
struct ApiStatusResponse {
    status: String,
    privileged_features: bool,
    message: String,
    limits: ApiLimitsResponse,
}

#[derive(Serialize)]
struct ApiLimitsResponse {
    tier: crate::policy::Tier,
    max_rps: f64,
    max_symbols_per_group: usize,
    available_resolutions: Vec<u32>,
    max_historical_days: u32,
    markets: Vec<Market>,
    book_channel: bool,
}

fn limits_of(profile: &CapabilityProfile) -> ApiLimitsResponse {
    ApiLimitsResponse {
        tier: profile.tier,
        max_rps: profile.max_rps,
        max_symbols_per_group: profile.max_symbols_per_group,
        available_resolutions: profile.resolutions.clone(),
        max_historical_days: profile.max_historical_days,
        markets: profile.markets.clone(),
        book_channel: profile.book_channel,
    }
}

#[derive(Serialize)]
struct SymbolsResponse {
    count: usize,
    symbols: Vec<SymbolMeta>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        // a rejected credential update surfaces as a client error
        if err.downcast_ref::<CredentialRejected>().is_some() {
            ApiError::BadRequest(err.to_string())
        } else {
            ApiError::Internal(err)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_rejection_maps_to_bad_request() {
        let err: anyhow::Error = CredentialRejected("validation call failed".to_string()).into();
        let api_err: ApiError = err.into();
        match api_err {
            ApiError::BadRequest(msg) => assert!(msg.contains("invalid API credentials")),
            _ => panic!("Expected BadRequest"),
        }
    }

    #[test]
    fn test_other_errors_map_to_internal() {
        let err = anyhow::anyhow!("boom");
        let api_err: ApiError = err.into();
        match api_err {
            ApiError::Internal(_) => {}
            _ => panic!("Expected Internal"),
        }
    }
}
