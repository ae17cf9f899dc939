use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use polar_bridge_client::PolarClient;
use polar_bridge_storage::Database;

use crate::signature::WebhookVerifier;
use crate::{api, telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    verifier: Arc<WebhookVerifier>,
    polar: Option<PolarClient>,
    api_token: Option<Arc<str>>,
    frontend_url: Arc<str>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        verifier: WebhookVerifier,
        polar: Option<PolarClient>,
        api_token: Option<String>,
        frontend_url: String,
    ) -> Self {
        Self {
            metrics,
            storage,
            verifier: Arc::new(verifier),
            polar,
            api_token: api_token.map(Into::into),
            frontend_url: frontend_url.into(),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    /// `None` when no provider access token was configured; provider-backed
    /// routes answer 503 in that case.
    pub fn polar(&self) -> Option<&PolarClient> {
        self.polar.as_ref()
    }

    /// The shared bearer token protecting the session routes. `None` means
    /// the deployment is misconfigured; those routes answer 500.
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn frontend_url(&self) -> &str {
        &self.frontend_url
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/polar-webhook", post(webhook::handle))
        .route("/api/products", get(api::list_products))
        .route("/api/checkout", post(api::create_checkout))
        .route("/api/customer-portal", post(api::create_customer_portal))
        .route("/api/users", post(api::create_user))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
