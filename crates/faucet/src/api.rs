//! HTTP API for the faucet

use crate::admission::{Admission, ClaimRequest};
use crate::error::{FaucetError, FaucetResult};
use crate::service::{ClaimStatus, FaucetService};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

/// Body of `POST /send`. Both the legacy and the camel-case field names
/// are accepted.
#[derive(Debug, Default, Deserialize)]
pub struct SendRequest {
    #[serde(alias = "network")]
    pub chain: Option<String>,
    pub address: Option<String>,
    #[serde(alias = "captchaToken")]
    pub recapcha_token: Option<String>,
}

/// Success response for `POST /send`
#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub code: u8,
    pub message: String,
}

/// Build the faucet router
pub fn router(service: Arc<FaucetService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    Router::new()
        .route("/", get(root_handler))
        .route("/config.json", get(config_handler))
        .route("/balance/:network", get(balance_handler))
        .route("/send", post(send_handler))
        .route("/status/:network/:address", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(log_requests))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors)
        .with_state(service)
}

/// Caller origin: `X-Real-IP`, then the first `X-Forwarded-For` hop, then
/// the peer address
pub fn client_origin(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = header_value("x-real-ip") {
        return ip.to_string();
    }
    if let Some(hop) = header_value("x-forwarded-for").and_then(|v| v.split(',').next()) {
        let hop = hop.trim();
        if !hop.is_empty() {
            return hop.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn log_requests(req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let origin = client_origin(req.headers(), peer);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("Received {} request at {} from {}", method, path, origin);

    let response = next.run(req).await;
    let status = response.status();
    if status.is_server_error() {
        warn!("{} {} -> {}", method, path, status);
    } else {
        debug!("{} {} -> {}", method, path, status);
    }
    response
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);
    FaucetError::InternalError(detail.to_string()).into_response()
}

/// Request tokens
pub async fn send_handler(
    State(service): State<Arc<FaucetService>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> FaucetResult<(StatusCode, Json<SendResponse>)> {
    let origin = client_origin(&headers, connect_info.map(|ci| ci.0));
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("Unreadable send request from {}: {}", origin, rejection);
            SendRequest::default()
        }
    };

    service
        .verify_captcha(request.recapcha_token.as_deref().unwrap_or_default(), &origin)
        .await?;

    let network = request
        .chain
        .filter(|c| !c.is_empty())
        .ok_or(FaucetError::MissingField("chain"))?;
    let address = request
        .address
        .filter(|a| !a.is_empty())
        .ok_or(FaucetError::MissingField("address"))?;

    let admission = service
        .admit(&ClaimRequest {
            network,
            address,
            origin,
        })
        .await?;

    let status = match admission {
        Admission::AlreadyQueued => StatusCode::OK,
        Admission::Enqueued | Admission::Resubmit => StatusCode::CREATED,
    };
    Ok((
        status,
        Json(SendResponse {
            code: 0,
            message: admission.message().to_string(),
        }),
    ))
}

/// Sender balance on a network, `{}` when it cannot be determined
pub async fn balance_handler(
    State(service): State<Arc<FaucetService>>,
    Path(network): Path<String>,
) -> Response {
    match service.sender_balance(&network).await {
        Ok(coin) => Json(coin).into_response(),
        Err(e) => {
            warn!("Balance lookup for {} failed: {}", network, e);
            Json(serde_json::json!({})).into_response()
        }
    }
}

/// Frontend configuration
pub async fn config_handler(State(service): State<Arc<FaucetService>>) -> impl IntoResponse {
    let config = service.config();
    let blockchains: Vec<&str> = config.blockchains.iter().map(|n| n.name.as_str()).collect();

    Json(serde_json::json!({
        "name": config.project.name,
        "logo": config.project.logo,
        "deployer": config.project.deployer,
        "sample": service.sample_addresses(),
        "blockchains": blockchains,
        "addressPrefix": config.address_prefix(),
        "reCaptchaSiteKey": config.recaptcha.site_key,
    }))
}

/// Queue state of one claimant
pub async fn status_handler(
    State(service): State<Arc<FaucetService>>,
    Path((network, address)): Path<(String, String)>,
) -> FaucetResult<Json<ClaimStatus>> {
    Ok(Json(service.claim_status(&network, &address)?))
}

/// Prometheus text exposition
pub async fn metrics_handler(State(service): State<Arc<FaucetService>>) -> Response {
    match service.metrics().gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => FaucetError::InternalError(e.to_string()).into_response(),
    }
}

/// Health check handler
pub async fn health_handler(State(service): State<Arc<FaucetService>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "blocked_prefixes": service.blocked_prefixes(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Root handler with info
pub async fn root_handler(State(service): State<Arc<FaucetService>>) -> impl IntoResponse {
    let project = &service.config().project;
    Json(serde_json::json!({
        "name": project.name,
        "logo": project.logo,
        "deployer": project.deployer,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /config.json": "Frontend configuration",
            "GET /balance/:network": "Faucet balance on a network",
            "POST /send": "Request tokens",
            "GET /status/:network/:address": "Queue status of an address",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}
