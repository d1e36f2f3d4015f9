//! HTTP and WebSocket API
//!
//! REST endpoints over the engine, registry and router, plus a
//! WebSocket feed of market events. Handlers stay thin: decode, call
//! the owning component, map its error to a status code.

use crate::engine::{EngineError, MatchingEngine};
use crate::events::EventHub;
use crate::order::{CancelOrderRequest, Order, PlaceOrderRequest};
use crate::provider::{MarketSummary, Provider, ProviderRegistry};
use crate::router::{ChatMessage, ClusterRouter, InferenceRequest, RouterError};
use crate::selector::SelectionStrategy;
use crate::types::{OrderId, OwnerId, Price, Timestamp, Trade};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Token budget applied when an inference request leaves it unset
const DEFAULT_MAX_TOKENS: u32 = 1024;
/// Book levels returned when no depth is requested
const DEFAULT_DEPTH: usize = 20;
/// Trades returned when no limit is requested
const DEFAULT_TRADE_LIMIT: usize = 100;

/// Shared state handed to every handler
pub struct ApiState {
    pub engine: Arc<MatchingEngine>,
    pub registry: Arc<ProviderRegistry>,
    pub router: Arc<ClusterRouter>,
    pub events: EventHub,
    pub started_at: Instant,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/orders", post(place_order))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/cancel", post(cancel_order))
        .route("/orderbook", get(get_orderbook))
        .route("/trades", get(get_trades))
        .route("/spread", get(get_spread))
        .route("/positions/:owner_id", get(get_position))
        .route("/stats", get(get_stats))
        .route("/providers", get(get_providers))
        .route("/cluster/status", get(cluster_status))
        .route("/inference", post(run_inference))
        .route("/ws", get(websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn engine_error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidQuantity | EngineError::InvalidPrice => StatusCode::BAD_REQUEST,
        EngineError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::NotOrderOwner(_) | EngineError::ProviderQuoteImmutable(_) => {
            StatusCode::FORBIDDEN
        }
        EngineError::NotCancellable { .. } => StatusCode::CONFLICT,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "service": "compute-dex-core",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

#[derive(Debug, Serialize)]
struct PlaceOrderResponse {
    order: Order,
    trades: Vec<Trade>,
}

async fn place_order(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PlaceOrderRequest>,
) -> Response {
    match state.engine.place_order(request) {
        Ok((order, trades)) => Json(PlaceOrderResponse { order, trades }).into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

async fn get_order(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<u64>,
) -> Response {
    match state.engine.order(OrderId(order_id)) {
        Ok(Some(order)) => Json(order).into_response(),
        Ok(None) => error_body(
            StatusCode::NOT_FOUND,
            EngineError::OrderNotFound(OrderId(order_id)),
        ),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

async fn cancel_order(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<u64>,
    Json(request): Json<CancelOrderRequest>,
) -> Response {
    let owner = OwnerId::new(request.owner_id);
    match state.engine.cancel_order(OrderId(order_id), &owner) {
        Ok(order) => Json(json!({ "cancelled": true, "status": order.status })).into_response(),
        // Terminal orders report their true status rather than a bare error
        Err(e @ EngineError::NotCancellable { status, .. }) => (
            StatusCode::CONFLICT,
            Json(json!({ "cancelled": false, "status": status, "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

#[derive(Debug, Deserialize)]
struct DepthParams {
    depth: Option<usize>,
}

async fn get_orderbook(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<DepthParams>,
) -> Response {
    match state.engine.depth(params.depth.unwrap_or(DEFAULT_DEPTH)) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

#[derive(Debug, Deserialize)]
struct TradesParams {
    limit: Option<usize>,
}

async fn get_trades(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TradesParams>,
) -> Response {
    match state
        .engine
        .recent_trades(params.limit.unwrap_or(DEFAULT_TRADE_LIMIT))
    {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

#[derive(Debug, Serialize)]
struct SpreadResponse {
    best_bid: Option<Price>,
    best_ask: Option<Price>,
    spread: Price,
}

async fn get_spread(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.depth(1) {
        Ok(snapshot) => Json(SpreadResponse {
            best_bid: snapshot.bids.first().map(|level| level.price),
            best_ask: snapshot.asks.first().map(|level| level.price),
            spread: snapshot.spread,
        })
        .into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

async fn get_position(
    State(state): State<Arc<ApiState>>,
    Path(owner_id): Path<String>,
) -> Response {
    match state.engine.position(&OwnerId::new(owner_id)) {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

async fn get_stats(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_body(engine_error_status(&e), e),
    }
}

async fn get_providers(State(state): State<Arc<ApiState>>) -> Response {
    match state.registry.snapshot() {
        Ok(providers) => Json(providers).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Serialize)]
struct ClusterStatusResponse {
    providers: Vec<Provider>,
    summary: MarketSummary,
    timestamp: Timestamp,
}

async fn cluster_status(State(state): State<Arc<ApiState>>) -> Response {
    let providers = match state.registry.snapshot() {
        Ok(providers) => providers,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    match state.registry.market_summary() {
        Ok(summary) => Json(ClusterStatusResponse {
            providers,
            summary,
            timestamp: Timestamp::now(),
        })
        .into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Deserialize)]
struct InferenceApiRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    strategy: Option<SelectionStrategy>,
}

async fn run_inference(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<InferenceApiRequest>,
) -> Response {
    let inference = InferenceRequest {
        messages: request.messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: request.temperature,
    };
    match state.router.call(inference, request.strategy).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            let status = match &e {
                RouterError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
                // Nothing was even eligible vs. everything tried failed
                RouterError::Exhausted { attempts: 0, .. } => StatusCode::SERVICE_UNAVAILABLE,
                RouterError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
                RouterError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_body(status, e)
        }
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();
    info!("🔌 WebSocket subscriber connected");

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "websocket receive error");
                    break;
                }
                // The feed is outbound only; other inbound frames are ignored
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                // A slow subscriber skips what it missed and catches up
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket subscriber lagged, skipping events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("🔌 WebSocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderRegistry;
    use crate::router::{
        InferenceTransport, RouterConfig, TransportError, TransportReply,
    };
    use crate::selector::ProviderSelector;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    struct NoTransport;

    #[async_trait]
    impl InferenceTransport for NoTransport {
        async fn call(
            &self,
            _provider: &Provider,
            _request: &InferenceRequest,
        ) -> Result<TransportReply, TransportError> {
            Err(TransportError::Network("no transport in tests".into()))
        }
    }

    fn test_state() -> Arc<ApiState> {
        let events = EventHub::new(64);
        let engine = Arc::new(MatchingEngine::new(events.clone()));
        let registry = Arc::new(ProviderRegistry::new(3));
        let router = Arc::new(ClusterRouter::new(
            registry.clone(),
            Arc::new(ProviderSelector::new()),
            Arc::new(NoTransport),
            RouterConfig::default(),
        ));
        Arc::new(ApiState {
            engine,
            registry,
            router,
            events,
            started_at: Instant::now(),
        })
    }

    fn app() -> Router {
        create_router(test_state())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = app().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "compute-dex-core");
    }

    #[tokio::test]
    async fn test_place_then_cancel_roundtrip() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/orders",
                json!({
                    "owner_id": "alice",
                    "side": "sell",
                    "order_type": "limit",
                    "quantity": 1000.0,
                    "price": 0.002,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let order_id = body["order"]["id"].as_u64().unwrap();
        assert_eq!(body["order"]["status"], "open");
        assert!(body["trades"].as_array().unwrap().is_empty());

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/orders/{order_id}/cancel"),
                json!({ "owner_id": "alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], true);
        assert_eq!(body["status"], "cancelled");

        // A second cancel hits the terminal state
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/orders/{order_id}/cancel"),
                json!({ "owner_id": "alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], false);
        assert_eq!(body["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected() {
        let response = app()
            .oneshot(post_json(
                "/orders",
                json!({
                    "owner_id": "alice",
                    "side": "buy",
                    "order_type": "limit",
                    "quantity": 0.0,
                    "price": 0.002,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_by_wrong_owner_forbidden() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/orders",
                json!({
                    "owner_id": "alice",
                    "side": "sell",
                    "order_type": "limit",
                    "quantity": 500.0,
                    "price": 0.002,
                }),
            ))
            .await
            .unwrap();
        let order_id = body_json(response).await["order"]["id"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/orders/{order_id}/cancel"),
                json!({ "owner_id": "mallory" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_order_not_found() {
        let response = app().oneshot(get_request("/orders/999999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_orderbook_depth_param_caps_levels() {
        let app = app();
        for price in [0.002, 0.003] {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/orders",
                    json!({
                        "owner_id": "alice",
                        "side": "sell",
                        "order_type": "limit",
                        "quantity": 100.0,
                        "price": price,
                    }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(get_request("/orderbook?depth=1"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["asks"].as_array().unwrap().len(), 1);

        let response = app.clone().oneshot(get_request("/orderbook")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["asks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inference_empty_messages_unprocessable() {
        let response = app()
            .oneshot(post_json("/inference", json!({ "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_inference_without_providers_unavailable() {
        let response = app()
            .oneshot(post_json(
                "/inference",
                json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
