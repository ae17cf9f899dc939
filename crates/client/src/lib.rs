//! Outbound client for the Polar REST API.
//!
//! Covers the three operations the service performs against Polar: customer
//! provisioning, checkout session creation, and customer-portal session
//! creation. Webhook ingestion is inbound and lives in the app crate.

mod polar;

pub use polar::{
    Checkout, CheckoutCreate, Customer, CustomerCreate, CustomerSession, CustomerSessionCreate,
    PolarClient, PolarError, PRODUCTION_API_URL, SANDBOX_API_URL,
};
