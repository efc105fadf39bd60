// Guardian Server - HTTP routes and admission middleware
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Router assembly.
//!
//! Guardian's own endpoints (health contract, operator lockdown, metrics)
//! are mounted next to the protected pipeline and never pass through the
//! admission middleware. Every pipeline request is checked by the gate
//! first.
//!
//! When the gate reads a remote publisher, the health contract is proxied
//! from it so the server never advertises a state it does not gate on, and
//! operator lockdown is refused with 409 (it belongs to the remote side).

use crate::metrics::{self, encode_metrics};
use crate::remote::GateSource;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use guardian::{
    AdmissionDecision, AdmissionGate, GateConfig, HealthPublisher, HealthReport, HealthSource,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<HealthPublisher>,
    pub gate: Arc<AdmissionGate<GateSource>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(publisher: Arc<HealthPublisher>, source: GateSource, config: GateConfig) -> Self {
        Self {
            publisher,
            gate: Arc::new(AdmissionGate::with_config(source, config)),
            start_time: Instant::now(),
        }
    }

    /// Whether the gate reads a publisher in another process
    pub fn is_remote(&self) -> bool {
        matches!(self.gate.source(), GateSource::Remote(_))
    }
}

/// Mount Guardian's endpoints and wrap `pipeline` in the admission gate.
pub fn router(state: AppState, pipeline: Router) -> Router {
    let gated = pipeline.layer(middleware::from_fn_with_state(state.clone(), admission));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/guardian/health", get(guardian_health_handler))
        .route("/health/guardian", get(guardian_health_handler))
        .route(
            "/guardian/lockdown",
            axum::routing::post(lockdown_handler).delete(release_handler),
        )
        .with_state(state)
        .merge(gated)
}

/// Admission middleware: one gate check per request.
async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    let decision = state.gate.check(&path).await;
    metrics::record_admission(decision.outcome(), state.gate.unknown_streak());

    if let Some(body) = decision.body() {
        debug!(
            "Blocked {} (state={}, retry_after={})",
            path, body.guardian_state, body.retry_after
        );
        let status =
            StatusCode::from_u16(decision.status_code).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        let mut response = (status, Json(body)).into_response();
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    for (name, value) in &decision.headers {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(_) => continue,
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => warn!("Dropping unrepresentable header value for {}", name),
        }
    }
}

/// Run a publisher call off the async workers; the sampler may block.
async fn run_blocking<T, F>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("Publisher task failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Health contract: samples once and reports the resulting state, or
/// relays the remote publisher's report.
async fn guardian_health_handler(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, StatusCode> {
    let report = match state.gate.source() {
        GateSource::Remote(remote) => remote.fetch().await.map_err(|e| {
            warn!("Remote health fetch from {} failed: {}", remote.url(), e);
            StatusCode::BAD_GATEWAY
        })?,
        GateSource::Local(_) => {
            let publisher = Arc::clone(&state.publisher);
            run_blocking(move || publisher.query()).await?
        }
    };
    metrics::update_health_metrics(&report);
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
struct LockdownRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn lockdown_handler(
    State(state): State<AppState>,
    body: Option<Json<LockdownRequest>>,
) -> Result<Json<HealthReport>, StatusCode> {
    if state.is_remote() {
        warn!("Refusing lockdown: health is owned by the remote publisher");
        return Err(StatusCode::CONFLICT);
    }
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "unspecified".to_string());
    warn!("Operator lockdown requested: {}", reason);

    let publisher = Arc::clone(&state.publisher);
    let report = run_blocking(move || publisher.force_lockdown()).await?;
    metrics::update_health_metrics(&report);
    Ok(Json(report))
}

async fn release_handler(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, StatusCode> {
    if state.is_remote() {
        return Err(StatusCode::CONFLICT);
    }
    let publisher = Arc::clone(&state.publisher);
    let report = run_blocking(move || publisher.release_lockdown()).await?;
    info!("Operator lockdown released, state now {}", report.state);
    metrics::update_health_metrics(&report);
    Ok(Json(report))
}

/// Liveness only; says nothing about resource state.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    health_source: &'static str,
    state: String,
    unknown_streak: u32,
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    // Remote mode reports what the gate last saw rather than polling again.
    let (health_source, current) = if state.is_remote() {
        let cached = state.gate.cached();
        let current = cached
            .snapshot()
            .map_or_else(|| "unknown".to_string(), |r| r.state.clone());
        ("remote", current)
    } else {
        let publisher = Arc::clone(&state.publisher);
        ("local", run_blocking(move || publisher.current()).await?.state)
    };
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        health_source,
        state: current,
        unknown_streak: state.gate.unknown_streak(),
    }))
}

async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Guardian</title></head>
<body>
    <h1>Guardian</h1>
    <p>Resource-health admission control.</p>
    <ul>
        <li><a href="/guardian/health">/guardian/health</a> - Health contract (JSON)</li>
        <li><a href="/status">/status</a> - Server status (JSON)</li>
        <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
        <li><a href="/health">/health</a> - Liveness check</li>
        <li><code>POST /guardian/lockdown</code> / <code>DELETE /guardian/lockdown</code> - Operator lockdown</li>
    </ul>
</body>
</html>"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use crate::remote::RemoteHealthSource;
    use guardian::{FixedSampler, PublisherSource, SensorReadings, Thresholds};
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(readings: SensorReadings) -> Router {
        let publisher = Arc::new(HealthPublisher::new(
            FixedSampler::new(readings),
            Thresholds::default(),
        ));
        let source = GateSource::Local(PublisherSource::new(Arc::clone(&publisher)));
        let state = AppState::new(publisher, source, GateConfig::default());
        let pipeline = Router::new().route("/v1/ping", get(|| async { "pong" }));
        router(state, pipeline)
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_normal_request_passes() {
        let response = app(SensorReadings::basic(0.3, 0.2))
            .oneshot(get_request("/v1/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("X-Guardian-State").is_none());
    }

    #[tokio::test]
    async fn test_emergency_blocks_pipeline() {
        let response = app(SensorReadings::basic(0.95, 0.2))
            .oneshot(get_request("/v1/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["Retry-After"], "15");
        assert_eq!(response.headers()["X-Guardian-State"], "emergency");

        let body = body_json(response).await;
        assert_eq!(body["guardian_state"], "emergency");
        assert_eq!(body["retry_after"], 15);
    }

    #[tokio::test]
    async fn test_guardian_endpoints_bypass_gate() {
        let app = app(SensorReadings::basic(0.95, 0.2));

        let response = app.clone().oneshot(get_request("/guardian/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["v"], "1");
        assert_eq!(body["state"], "EMERGENCY");
        assert_eq!(body["brownout_level"], "HEAVY");

        let response = app.clone().oneshot(get_request("/health/guardian")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_lockdown_round_trip() {
        let app = app(SensorReadings::basic(0.3, 0.2));

        let request = Request::builder()
            .method("POST")
            .uri("/guardian/lockdown")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"reason":"maintenance"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "LOCKDOWN");

        let response = app.clone().oneshot(get_request("/v1/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["Retry-After"], "60");

        let request = Request::builder()
            .method("DELETE")
            .uri("/guardian/lockdown")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "NORMAL");
    }

    async fn remote_app(server: &MockServer) -> Router {
        Mock::given(method("GET"))
            .and(path("/guardian/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"v":"1","state":"BROWNOUT","brownout_level":"LIGHT","reason":"SOFT_TRIGGER",
                   "since_s":12.0,"ram_pct":84.0,"cpu_pct":30.0,"temp_c":null,"battery_pct":null}"#,
            ))
            .mount(server)
            .await;

        // The local publisher reads nominal values; it must not leak out.
        let publisher = Arc::new(HealthPublisher::new(
            FixedSampler::nominal(),
            Thresholds::default(),
        ));
        let remote = RemoteHealthSource::new(
            format!("{}/guardian/health", server.uri()),
            Duration::from_millis(200),
        )
        .unwrap();
        let state = AppState::new(publisher, GateSource::Remote(remote), GateConfig::default());
        let pipeline = Router::new().route("/v1/ping", get(|| async { "pong" }));
        router(state, pipeline)
    }

    #[tokio::test]
    async fn test_remote_mode_relays_remote_health() {
        let server = MockServer::start().await;
        let app = remote_app(&server).await;

        let response = app.clone().oneshot(get_request("/guardian/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "BROWNOUT");
        assert_eq!(body["ram_pct"], 84.0);

        let response = app.clone().oneshot(get_request("/v1/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-Guardian-State"], "brownout");

        let response = app.oneshot(get_request("/status")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["health_source"], "remote");
        assert_eq!(body["state"], "BROWNOUT");
    }

    #[tokio::test]
    async fn test_remote_mode_refuses_lockdown() {
        let server = MockServer::start().await;
        let app = remote_app(&server).await;

        let request = Request::builder()
            .method("POST")
            .uri("/guardian/lockdown")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_remote_unreachable_is_bad_gateway() {
        let server = MockServer::start().await;
        let publisher = Arc::new(HealthPublisher::new(
            FixedSampler::nominal(),
            Thresholds::default(),
        ));
        let remote = RemoteHealthSource::new(
            format!("{}/guardian/health", server.uri()),
            Duration::from_millis(200),
        )
        .unwrap();
        let state = AppState::new(publisher, GateSource::Remote(remote), GateConfig::default());
        let app = router(state, Router::new());

        // No mock mounted: wiremock answers 404.
        let response = app.oneshot(get_request("/guardian/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = app(SensorReadings::basic(0.3, 0.2));
        app.clone().oneshot(get_request("/v1/ping")).await.unwrap();

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("guardian_admission_total"));
    }
}
