use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use polar_bridge_core::WebhookEvent;

use crate::error::ApiError;
use crate::reconcile::Reconciler;
use crate::router::AppState;
use crate::signature::SignatureError;

const HEADER_MESSAGE_ID: &str = "webhook-id";
const HEADER_TIMESTAMP: &str = "webhook-timestamp";
const HEADER_SIGNATURE: &str = "webhook-signature";

/// Ingress for Polar webhook deliveries.
///
/// Verification runs before any body parsing; nothing in the payload is
/// trusted until the signature and freshness window check out. A 2xx tells
/// the sender the delivery is settled, including permanent no-ops; non-2xx
/// answers trigger redelivery.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    // Rejected deliveries share one latency bucket; their kind is unknown or
    // untrusted at the point of rejection.
    let record_latency = |label: &'static str| {
        histogram!("webhook_ack_latency_seconds", "kind" => label)
            .record(start.elapsed().as_secs_f64());
    };

    let (message_id, timestamp, signature) = required_headers(&headers).map_err(|err| {
        record_latency("rejected");
        err
    })?;

    let now = state.now();
    state
        .verifier()
        .verify(message_id, timestamp, signature, &body, now)
        .map_err(|err| {
            record_latency("rejected");
            match err {
                SignatureError::MissingSecret => {
                    error!(stage = "ingress", "webhook secret is not configured");
                    ApiError::internal("webhook secret is not configured")
                }
                err => {
                    warn!(stage = "ingress", message_id, timestamp, %err, "rejected delivery");
                    counter!("webhook_invalid_signature_total").increment(1);
                    ApiError::unauthorized("invalid signature")
                }
            }
        })?;

    let event = WebhookEvent::decode(&body).map_err(|err| {
        warn!(stage = "ingress", message_id, %err, "undecodable payload");
        record_latency("rejected");
        ApiError::bad_request("invalid JSON payload")
    })?;

    let kind_label = event.metric_label();
    counter!("webhook_ingress_total", "kind" => kind_label).increment(1);

    if let WebhookEvent::Unhandled(kind) = &event {
        info!(stage = "ingress", message_id, kind = %kind, "event type not handled");
        counter!("webhook_unhandled_total").increment(1);
        record_latency(kind_label);
        return Ok(message_response("event type not handled"));
    }

    let reconciler = Reconciler::new(state.storage().clone());
    let outcome = reconciler.apply(&event, now).await.map_err(|err| {
        error!(stage = "reconcile", message_id, kind = %event.kind(), %err, "failed to process webhook");
        record_latency(kind_label);
        ApiError::internal("failed to process webhook")
    })?;

    counter!(
        "reconcile_outcomes_total",
        "kind" => kind_label,
        "result" => outcome.metric_label()
    )
    .increment(1);
    record_latency(kind_label);

    Ok(message_response("webhook processed successfully"))
}

fn required_headers(headers: &HeaderMap) -> Result<(&str, &str, &str), ApiError> {
    Ok((
        required_header(headers, HEADER_MESSAGE_ID)?,
        required_header(headers, HEADER_TIMESTAMP)?,
        required_header(headers, HEADER_SIGNATURE)?,
    ))
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing header {name}")))
}

fn message_response(message: &str) -> Response {
    (StatusCode::OK, Json(json!({ "message": message }))).into_response()
}
