pub mod event;

pub use event::{
    CustomerRef, DecodeError, OrderEvent, ProductEvent, ProductPrice, SubscriptionEvent,
    WebhookEvent,
};
