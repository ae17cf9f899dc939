use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use polar_bridge_core::{CustomerRef, OrderEvent, ProductEvent, SubscriptionEvent, WebhookEvent};
use polar_bridge_storage::{
    Database, OrderActivation, ProductError, ProductFields, SubscriptionFields, UserError,
    UserRecord,
};

/// First-payment orders carry this billing reason; they double as the
/// activation signal when the corresponding subscription event races behind.
const BILLING_REASON_SUBSCRIPTION_CREATE: &str = "subscription_create";

/// How a delivery was resolved against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The handler ran against a resolved subject or product record.
    Applied,
    /// No local subject matched the event; logged and acknowledged as a
    /// no-op. Treated as permanent, so the sender must not retry.
    SkippedMissingSubject,
    /// No handler exists for the event kind. The ingress path acknowledges
    /// these before dispatch; this is the answer if one is dispatched anyway.
    Unhandled,
}

impl ReconcileOutcome {
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::SkippedMissingSubject => "skipped",
            Self::Unhandled => "unhandled",
        }
    }
}

/// Errors that escape a handler and should trigger sender redelivery.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("user store error: {0}")]
    User(#[from] UserError),
    #[error("product store error: {0}")]
    Product(#[from] ProductError),
}

/// Applies event-derived field updates to user and product records.
///
/// Every mutation overwrites its full named field group, so redelivering the
/// same event is idempotent. Status strings are stored verbatim with no
/// transition table; out-of-order deliveries resolve last-write-wins. No lock
/// spans find-then-update, so concurrent deliveries for the same subject race
/// the same way (accepted property of the design).
pub struct Reconciler {
    storage: Database,
}

impl Reconciler {
    pub fn new(storage: Database) -> Self {
        Self { storage }
    }

    /// Dispatches one decoded event to its handler.
    pub async fn apply(
        &self,
        event: &WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match event {
            WebhookEvent::SubscriptionCreated(sub) | WebhookEvent::SubscriptionUpdated(sub) => {
                self.upsert_subscription(event.kind(), sub, None, now).await
            }
            WebhookEvent::SubscriptionActive(sub) => {
                self.upsert_subscription(event.kind(), sub, Some("active"), now)
                    .await
            }
            WebhookEvent::SubscriptionCanceled(sub) => {
                self.cancel_subscription(event.kind(), sub, "canceled", sub.cancel_at_period_end, now)
                    .await
            }
            WebhookEvent::SubscriptionRevoked(sub) => {
                // Revocation is immediate access loss; the pending-cancel flag
                // no longer means anything and is cleared.
                self.cancel_subscription(event.kind(), sub, "revoked", false, now)
                    .await
            }
            WebhookEvent::OrderCreated(order) => self.note_order_created(order),
            WebhookEvent::OrderPaid(order) => self.record_order_paid(order, now).await,
            WebhookEvent::ProductCreated(product) => self.upsert_product(product, now).await,
            WebhookEvent::ProductUpdated(product) => self.update_product(product, now).await,
            WebhookEvent::Unhandled(kind) => {
                warn!(stage = "reconcile", kind = %kind, "unhandled event reached the reconciler");
                Ok(ReconcileOutcome::Unhandled)
            }
        }
    }

    /// Resolves the local subject for a customer reference.
    ///
    /// A missing external id or a vanished subject is a warning, never an
    /// error: retrying the delivery could not change the outcome.
    async fn resolve_subject(
        &self,
        kind: &str,
        event_id: &str,
        customer: &CustomerRef,
    ) -> Result<Option<UserRecord>, ReconcileError> {
        let Some(external_id) = customer.external_id.as_deref().filter(|id| !id.is_empty())
        else {
            warn!(stage = "reconcile", kind, event_id, "event has no external_id");
            return Ok(None);
        };

        let user = self.storage.users().find_by_external_id(external_id).await?;
        if user.is_none() {
            warn!(stage = "reconcile", kind, event_id, external_id, "no user found for external_id");
        }
        Ok(user)
    }

    async fn upsert_subscription(
        &self,
        kind: &str,
        sub: &SubscriptionEvent,
        status_override: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(user) = self.resolve_subject(kind, &sub.id, &sub.customer).await? else {
            return Ok(ReconcileOutcome::SkippedMissingSubject);
        };

        let status = status_override.unwrap_or(&sub.status);
        self.storage
            .users()
            .set_subscription(
                &user.id,
                &SubscriptionFields {
                    subscription_id: &sub.id,
                    status,
                    product_id: &sub.product_id,
                    current_period_end: sub.current_period_end,
                    cancel_at_period_end: sub.cancel_at_period_end,
                },
                now,
            )
            .await?;

        info!(
            stage = "reconcile",
            kind,
            user_id = %user.id,
            subscription_id = %sub.id,
            status,
            "subscription fields updated"
        );
        Ok(ReconcileOutcome::Applied)
    }

    async fn cancel_subscription(
        &self,
        kind: &str,
        sub: &SubscriptionEvent,
        status: &str,
        cancel_at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(user) = self.resolve_subject(kind, &sub.id, &sub.customer).await? else {
            return Ok(ReconcileOutcome::SkippedMissingSubject);
        };

        self.storage
            .users()
            .set_cancellation(&user.id, status, cancel_at_period_end, now)
            .await?;

        info!(
            stage = "reconcile",
            kind,
            user_id = %user.id,
            subscription_id = %sub.id,
            cancel_at_period_end,
            "subscription marked {status}"
        );
        Ok(ReconcileOutcome::Applied)
    }

    /// `order.created` is informational; the money has not moved yet.
    fn note_order_created(&self, order: &OrderEvent) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(external_id) = order.customer.external_id.as_deref().filter(|id| !id.is_empty())
        else {
            warn!(stage = "reconcile", kind = "order.created", order_id = %order.id, "event has no external_id");
            return Ok(ReconcileOutcome::SkippedMissingSubject);
        };

        info!(
            stage = "reconcile",
            kind = "order.created",
            order_id = %order.id,
            external_id,
            status = %order.status,
            billing_reason = %order.billing_reason,
            "order created"
        );
        Ok(ReconcileOutcome::Applied)
    }

    async fn record_order_paid(
        &self,
        order: &OrderEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(user) = self
            .resolve_subject("order.paid", &order.id, &order.customer)
            .await?
        else {
            return Ok(ReconcileOutcome::SkippedMissingSubject);
        };

        // First payment of a new subscription: the order.paid delivery can
        // arrive before subscription.active, so activate here as well.
        let activation = order
            .subscription_id
            .as_deref()
            .filter(|_| order.billing_reason == BILLING_REASON_SUBSCRIPTION_CREATE)
            .map(|subscription_id| OrderActivation {
                subscription_id,
                product_id: &order.product_id,
            });

        self.storage
            .users()
            .record_paid_order(&user.id, activation.as_ref(), now)
            .await?;

        info!(
            stage = "reconcile",
            kind = "order.paid",
            user_id = %user.id,
            order_id = %order.id,
            amount = order.total_amount,
            currency = %order.currency,
            billing_reason = %order.billing_reason,
            "order payment recorded"
        );
        Ok(ReconcileOutcome::Applied)
    }

    async fn upsert_product(
        &self,
        product: &ProductEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        // Only the first price is modeled; products with several simultaneous
        // prices store the rest nowhere.
        let price = product.primary_price();
        let fields = ProductFields {
            id: &product.id,
            name: &product.name,
            description: product.description.as_deref(),
            price_amount: price.map(|p| p.price_amount).unwrap_or_default(),
            price_currency: price.map(|p| p.price_currency.as_str()).unwrap_or_default(),
            recurring_interval: &product.recurring_interval,
            recurring_interval_count: product.recurring_interval_count,
            is_recurring: product.is_recurring,
            is_archived: product.is_archived,
            trial_interval: product.trial_interval.as_deref(),
            trial_interval_count: product.trial_interval_count,
            polar_price_id: price.map(|p| p.id.as_str()).unwrap_or_default(),
        };

        self.storage.products().upsert(&fields, now).await?;

        info!(
            stage = "reconcile",
            kind = "product",
            product_id = %product.id,
            name = %product.name,
            price = fields.price_amount,
            currency = fields.price_currency,
            archived = product.is_archived,
            "product record stored"
        );
        Ok(ReconcileOutcome::Applied)
    }

    async fn update_product(
        &self,
        product: &ProductEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self.storage.products().find_by_id(&product.id).await?.is_none() {
            info!(
                stage = "reconcile",
                kind = "product.updated",
                product_id = %product.id,
                "product not found locally, creating"
            );
        }
        // The store write is a wholesale upsert either way; the lookup only
        // shapes the log line, mirroring the create fallback.
        self.upsert_product(product, now).await
    }
}
