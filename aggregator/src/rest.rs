use crate::errors::ApiError;
use crate::metrics::{REGISTRATIONS_TOTAL, UNAUTHORIZED_TOTAL};
use crate::model::{
    AckResponse, AlertsResponse, GatewayInfo, HealthResponse, PingQuery, RegisterRequest,
    RegisterResponse, StatusResponse,
};
use crate::store::TelemetryStore;
use crate::stream;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Query, State},
    http::request::Parts,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::sync::Arc;
use telemetry::Sample;
use tracing::{debug, warn};

pub const SECRET_HEADER: &str = "x-gateway-secret";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TelemetryStore>,
    secret: Arc<str>,
}

pub fn create_router(store: Arc<TelemetryStore>, secret: &str) -> Router {
    let state = AppState {
        store,
        secret: Arc::from(secret),
    };

    Router::new()
        .route("/api/gateway/register", post(gateway_register))
        .route("/api/gateway/ping", get(gateway_ping))
        .route("/api/gateway/data", post(gateway_data))
        .route("/api/status", get(get_status))
        .route("/api/alerts", get(get_alerts))
        .route("/api/stream", get(stream::subscribe))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Proof that the request carried the shared gateway secret.
///
/// Listed before any body extractor, so a bad secret is rejected before the
/// payload is even parsed.
pub struct GatewayAuth;

#[async_trait]
impl FromRequestParts<AppState> for GatewayAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok());

        match presented {
            Some(secret) if secret == &*state.secret => Ok(GatewayAuth),
            _ => {
                UNAUTHORIZED_TOTAL.inc();
                warn!("Unauthorized gateway call to {}", parts.uri.path());
                Err(ApiError::Unauthorized)
            }
        }
    }
}

async fn gateway_register(
    _auth: GatewayAuth,
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let gateway_id = request
        .gateway_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("gateway_id is required".to_string()))?;

    let info = GatewayInfo {
        transport_type: request.transport_type,
        device_name: request.device_name,
        registered_at: request.registered_at,
    };
    let now = Utc::now();
    if state.store.gateway(&gateway_id).is_some() {
        debug!("Gateway {} re-registered", gateway_id);
    }
    state.store.register_gateway(&gateway_id, info, now);
    REGISTRATIONS_TOTAL.inc();

    Ok(Json(RegisterResponse {
        success: true,
        message: format!("Gateway {} registered", gateway_id),
        timestamp: now,
    }))
}

async fn gateway_ping(
    _auth: GatewayAuth,
    State(state): State<AppState>,
    Query(params): Query<PingQuery>,
) -> Json<AckResponse> {
    let now = Utc::now();
    if let Some(gateway_id) = params.gateway_id.filter(|id| !id.is_empty()) {
        debug!("Heartbeat from {}", gateway_id);
        state.store.heartbeat(&gateway_id, now);
    }

    Json(AckResponse {
        success: true,
        timestamp: now,
    })
}

async fn gateway_data(
    _auth: GatewayAuth,
    State(state): State<AppState>,
    payload: Result<Json<Sample>, JsonRejection>,
) -> Result<Json<AckResponse>, ApiError> {
    let Json(sample) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    debug!(
        "Sample from {}: fc={} spo2={} state={}",
        sample.gateway_id.as_deref().unwrap_or("unknown"),
        sample.heart_rate,
        sample.spo2,
        sample.state
    );
    let outcome = state.store.ingest(sample);
    if let Some(alert) = &outcome.alert {
        debug!(
            "Sample raised {:?} alert, state now {}",
            alert.kind, outcome.snapshot.state
        );
    }

    Ok(Json(AckResponse {
        success: true,
        timestamp: Utc::now(),
    }))
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let gateways_connected = state.store.connected_gateways(Utc::now());

    Json(StatusResponse {
        success: true,
        connected: gateways_connected > 0,
        gateways_connected,
        snapshot: state.store.snapshot(),
    })
}

async fn get_alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    Json(AlertsResponse {
        success: true,
        alerts: state.store.alerts(),
    })
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        gateways: state.store.gateway_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn setup() -> (Arc<TelemetryStore>, Router) {
        let store = Arc::new(TelemetryStore::new(StoreConfig::default()));
        let router = create_router(store.clone(), SECRET);
        (store, router)
    }

    fn post_json(uri: &str, secret: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected_without_mutation() {
        let (store, router) = setup();
        store.ingest(Sample {
            heart_rate: 70,
            spo2: 98,
            ..Sample::default()
        });
        let before = serde_json::to_string(&store.snapshot()).unwrap();

        let calls = vec![
            post_json("/api/gateway/data", Some("wrong"), r#"{"fc": 150, "spo2": 80}"#),
            post_json("/api/gateway/data", None, r#"{"fc": 150}"#),
            post_json("/api/gateway/data", Some("wrong"), "not json"),
            post_json("/api/gateway/register", Some("wrong"), r#"{"gateway_id": "gw-x"}"#),
            Request::builder()
                .uri("/api/gateway/ping?gateway_id=gw-y")
                .header(SECRET_HEADER, "wrong")
                .body(Body::empty())
                .unwrap(),
        ];

        for request in calls {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let body = body_json(response).await;
            assert_eq!(body["success"], false);
        }

        assert_eq!(serde_json::to_string(&store.snapshot()).unwrap(), before);
        assert!(store.alerts().is_empty());
        assert_eq!(store.gateway_count(), 0);
    }

    #[tokio::test]
    async fn test_register_then_status_reports_connected() {
        let (store, router) = setup();

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/gateway/register",
                Some(SECRET),
                r#"{"gateway_id": "gw-1", "transport_type": "SPP", "device_name": "wearable"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Gateway gw-1 registered");

        let record = store.gateway("gw-1").unwrap();
        assert_eq!(record.info.transport_type.as_deref(), Some("SPP"));

        let response = router
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["connected"], true);
        assert_eq!(body["gateways_connected"], 1);
        assert_eq!(body["snapshot"]["state"], "SIN_DEDO");
    }

    #[tokio::test]
    async fn test_reregistration_replaces_metadata() {
        let (store, router) = setup();

        for transport in ["SPP", "BLE"] {
            let body = format!(r#"{{"gateway_id": "gw-1", "transport_type": "{}"}}"#, transport);
            let response = router
                .clone()
                .oneshot(post_json("/api/gateway/register", Some(SECRET), &body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(store.gateway_count(), 1);
        let record = store.gateway("gw-1").unwrap();
        assert_eq!(record.info.transport_type.as_deref(), Some("BLE"));
    }

    #[tokio::test]
    async fn test_register_requires_gateway_id() {
        let (store, router) = setup();
        let response = router
            .oneshot(post_json("/api/gateway/register", Some(SECRET), r#"{"gateway_id": ""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.gateway_count(), 0);
    }

    #[tokio::test]
    async fn test_data_ingests_and_records_alert() {
        let (store, router) = setup();

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/gateway/data",
                Some(SECRET),
                r#"{"fc": 130, "spo2": 88, "temp": 36.9, "gateway_id": "gw-1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.snapshot().fc, 130);

        let response = router
            .oneshot(Request::builder().uri("/api/alerts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["alerts"][0]["type"], "low_spo2");
        assert_eq!(body["alerts"][0]["severity"], "danger");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let (store, router) = setup();
        let response = router
            .oneshot(post_json("/api/gateway/data", Some(SECRET), r#"{"fc": "fast"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.snapshot().buffers.fc.is_empty());
    }

    #[tokio::test]
    async fn test_ping_updates_last_seen() {
        let (store, router) = setup();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/gateway/ping?gateway_id=gw-2")
                    .header(SECRET_HEADER, SECRET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.connected_gateways(Utc::now()), 1);
    }
}
