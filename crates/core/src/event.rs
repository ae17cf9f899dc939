use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while decoding an inbound webhook payload.
///
/// Every variant is terminal for the delivery: retrying a malformed body can
/// never succeed, so callers map these to a 400 response.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("request body is not valid JSON: {0}")]
    Envelope(serde_json::Error),
    #[error("failed to parse {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// The outer wrapper every Polar webhook delivery carries.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    data: Value,
}

/// A decoded webhook delivery, one variant per recognized event kind.
///
/// The discriminant picks the decode path, so each payload is parsed exactly
/// once and the set of consumed fields is explicit in the payload structs.
/// Unrecognized kinds decode to [`WebhookEvent::Unhandled`] and are
/// acknowledged without running a handler.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    SubscriptionCreated(SubscriptionEvent),
    SubscriptionUpdated(SubscriptionEvent),
    SubscriptionActive(SubscriptionEvent),
    SubscriptionCanceled(SubscriptionEvent),
    SubscriptionRevoked(SubscriptionEvent),
    OrderCreated(OrderEvent),
    OrderPaid(OrderEvent),
    ProductCreated(ProductEvent),
    ProductUpdated(ProductEvent),
    Unhandled(String),
}

impl WebhookEvent {
    /// Decodes a raw request body into a typed event.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(body).map_err(DecodeError::Envelope)?;
        Self::from_envelope(&envelope.event_type, envelope.data)
    }

    fn from_envelope(event_type: &str, data: Value) -> Result<Self, DecodeError> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &'static str,
            data: Value,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(data).map_err(|source| DecodeError::Payload { kind, source })
        }

        Ok(match event_type {
            "subscription.created" => {
                Self::SubscriptionCreated(payload("subscription.created", data)?)
            }
            "subscription.updated" => {
                Self::SubscriptionUpdated(payload("subscription.updated", data)?)
            }
            "subscription.active" => {
                Self::SubscriptionActive(payload("subscription.active", data)?)
            }
            "subscription.canceled" => {
                Self::SubscriptionCanceled(payload("subscription.canceled", data)?)
            }
            "subscription.revoked" => {
                Self::SubscriptionRevoked(payload("subscription.revoked", data)?)
            }
            "order.created" => Self::OrderCreated(payload("order.created", data)?),
            "order.paid" => Self::OrderPaid(payload("order.paid", data)?),
            "product.created" => Self::ProductCreated(payload("product.created", data)?),
            "product.updated" => Self::ProductUpdated(payload("product.updated", data)?),
            other => Self::Unhandled(other.to_string()),
        })
    }

    /// Returns the wire-format event kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::SubscriptionCreated(_) => "subscription.created",
            Self::SubscriptionUpdated(_) => "subscription.updated",
            Self::SubscriptionActive(_) => "subscription.active",
            Self::SubscriptionCanceled(_) => "subscription.canceled",
            Self::SubscriptionRevoked(_) => "subscription.revoked",
            Self::OrderCreated(_) => "order.created",
            Self::OrderPaid(_) => "order.paid",
            Self::ProductCreated(_) => "product.created",
            Self::ProductUpdated(_) => "product.updated",
            Self::Unhandled(kind) => kind,
        }
    }

    /// Static label for metrics, bucketing unrecognized kinds together.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated(_) => "subscription.created",
            Self::SubscriptionUpdated(_) => "subscription.updated",
            Self::SubscriptionActive(_) => "subscription.active",
            Self::SubscriptionCanceled(_) => "subscription.canceled",
            Self::SubscriptionRevoked(_) => "subscription.revoked",
            Self::OrderCreated(_) => "order.created",
            Self::OrderPaid(_) => "order.paid",
            Self::ProductCreated(_) => "product.created",
            Self::ProductUpdated(_) => "product.updated",
            Self::Unhandled(_) => "unhandled",
        }
    }
}

/// Customer reference embedded in subscription and order payloads.
///
/// `external_id` carries the local user id the customer was provisioned with;
/// it is the only link between a delivery and a local subject.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// Payload of the five `subscription.*` event kinds.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEvent {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub customer: CustomerRef,
}

/// Payload of `order.created` and `order.paid`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderEvent {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub billing_reason: String,
    #[serde(default)]
    pub total_amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub customer: CustomerRef,
}

/// Payload of `product.created` and `product.updated`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductEvent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recurring_interval: String,
    #[serde(default)]
    pub recurring_interval_count: i64,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub trial_interval: Option<String>,
    #[serde(default)]
    pub trial_interval_count: Option<i64>,
    #[serde(default)]
    pub prices: Vec<ProductPrice>,
}

impl ProductEvent {
    /// Returns the first listed price.
    ///
    /// Products carrying multiple simultaneous prices are not modeled; only
    /// `prices[0]` is consulted.
    pub fn primary_price(&self) -> Option<&ProductPrice> {
        self.prices.first()
    }
}

/// A single price entry inside a product payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductPrice {
    pub id: String,
    #[serde(default)]
    pub price_amount: i64,
    #[serde(default)]
    pub price_currency: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_subscription_event() {
        let body = json!({
            "type": "subscription.active",
            "timestamp": "2025-01-01T00:00:00Z",
            "data": {
                "id": "sub_1",
                "status": "trialing",
                "customer": {"id": "cus_1", "external_id": "user_42"},
                "product_id": "prod_9",
                "current_period_end": "2025-01-01T00:00:00Z",
                "cancel_at_period_end": false,
                "metadata": {"ignored": true}
            }
        })
        .to_string();

        let event = WebhookEvent::decode(body.as_bytes()).expect("decode");
        let WebhookEvent::SubscriptionActive(sub) = event else {
            panic!("expected subscription.active");
        };
        assert_eq!(sub.id, "sub_1");
        assert_eq!(sub.status, "trialing");
        assert_eq!(sub.product_id, "prod_9");
        assert_eq!(sub.customer.external_id.as_deref(), Some("user_42"));
        assert!(!sub.cancel_at_period_end);
    }

    #[test]
    fn decodes_order_event_with_optional_subscription() {
        let body = json!({
            "type": "order.paid",
            "data": {
                "id": "ord_1",
                "status": "paid",
                "billing_reason": "subscription_create",
                "total_amount": 1500,
                "currency": "usd",
                "subscription_id": "sub_1",
                "product_id": "prod_9",
                "customer": {"id": "cus_1", "external_id": "user_42"}
            }
        })
        .to_string();

        let event = WebhookEvent::decode(body.as_bytes()).expect("decode");
        let WebhookEvent::OrderPaid(order) = event else {
            panic!("expected order.paid");
        };
        assert_eq!(order.billing_reason, "subscription_create");
        assert_eq!(order.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(order.total_amount, 1500);
    }

    #[test]
    fn decodes_product_event_and_reads_first_price_only() {
        let body = json!({
            "type": "product.created",
            "data": {
                "id": "prod_9",
                "name": "Pro Plan",
                "recurring_interval": "month",
                "recurring_interval_count": 1,
                "is_recurring": true,
                "is_archived": false,
                "prices": [
                    {"id": "price_1", "price_amount": 990, "price_currency": "usd"},
                    {"id": "price_2", "price_amount": 9900, "price_currency": "usd"}
                ]
            }
        })
        .to_string();

        let event = WebhookEvent::decode(body.as_bytes()).expect("decode");
        let WebhookEvent::ProductCreated(product) = event else {
            panic!("expected product.created");
        };
        let price = product.primary_price().expect("price");
        assert_eq!(price.id, "price_1");
        assert_eq!(price.price_amount, 990);
    }

    #[test]
    fn unknown_kind_is_unhandled_not_an_error() {
        let body = json!({
            "type": "benefit.granted",
            "data": {"anything": "goes"}
        })
        .to_string();

        let event = WebhookEvent::decode(body.as_bytes()).expect("decode");
        assert!(matches!(event, WebhookEvent::Unhandled(kind) if kind == "benefit.granted"));
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        let err = WebhookEvent::decode(b"not json").expect_err("should fail");
        assert!(matches!(err, DecodeError::Envelope(_)));
    }

    #[test]
    fn malformed_payload_for_known_kind_is_an_error() {
        // subscription payloads require a string id
        let body = json!({
            "type": "subscription.updated",
            "data": {"id": 42}
        })
        .to_string();

        let err = WebhookEvent::decode(body.as_bytes()).expect_err("should fail");
        assert!(matches!(
            err,
            DecodeError::Payload {
                kind: "subscription.updated",
                ..
            }
        ));
    }

    #[test]
    fn missing_external_id_decodes_to_none() {
        let body = json!({
            "type": "subscription.created",
            "data": {
                "id": "sub_2",
                "status": "incomplete",
                "product_id": "prod_9",
                "customer": {"id": "cus_2", "external_id": null}
            }
        })
        .to_string();

        let event = WebhookEvent::decode(body.as_bytes()).expect("decode");
        let WebhookEvent::SubscriptionCreated(sub) = event else {
            panic!("expected subscription.created");
        };
        assert!(sub.customer.external_id.is_none());
    }
}
