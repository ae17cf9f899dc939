use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const SANDBOX_API_URL: &str = "https://sandbox-api.polar.sh/v1/";
pub const PRODUCTION_API_URL: &str = "https://api.polar.sh/v1/";

/// Client for the Polar REST API operations this service depends on.
#[derive(Clone)]
pub struct PolarClient {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl PolarClient {
    /// Creates a new Polar client with the provided configuration.
    pub fn new(access_token: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            access_token: access_token.into(),
        }
    }

    /// Creates a Polar customer linked to a local user via `external_id`.
    pub async fn create_customer(
        &self,
        request: &CustomerCreate<'_>,
    ) -> Result<Customer, PolarError> {
        let url = self.base_url.join("customers/")?;
        let response = self
            .authorized_request(Method::POST, url)
            .json(request)
            .send()
            .await?;

        parse_json(response).await
    }

    /// Creates a checkout session and returns it, including the hosted URL.
    pub async fn create_checkout(
        &self,
        request: &CheckoutCreate<'_>,
    ) -> Result<Checkout, PolarError> {
        let url = self.base_url.join("checkouts/")?;
        let response = self
            .authorized_request(Method::POST, url)
            .json(request)
            .send()
            .await?;

        parse_json(response).await
    }

    /// Creates a customer-portal session for the customer provisioned with
    /// the given external id.
    pub async fn create_customer_session(
        &self,
        request: &CustomerSessionCreate<'_>,
    ) -> Result<CustomerSession, PolarError> {
        let url = self.base_url.join("customer-sessions/")?;
        let response = self
            .authorized_request(Method::POST, url)
            .json(request)
            .send()
            .await?;

        parse_json(response).await
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.access_token))
    }
}

/// Request body for customer creation.
#[derive(Debug, Serialize)]
pub struct CustomerCreate<'a> {
    pub external_id: &'a str,
    pub email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
}

/// A Polar customer as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub external_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Request body for checkout session creation.
#[derive(Debug, Serialize)]
pub struct CheckoutCreate<'a> {
    pub products: &'a [String],
    pub external_customer_id: &'a str,
    pub customer_email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<&'a str>,
    pub success_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_url: Option<&'a str>,
}

/// A checkout session as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Checkout {
    pub id: String,
    pub url: String,
}

/// Request body for customer-portal session creation.
#[derive(Debug, Serialize)]
pub struct CustomerSessionCreate<'a> {
    pub external_customer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_url: Option<&'a str>,
}

/// A customer-portal session as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerSession {
    pub id: String,
    pub customer_portal_url: String,
}

/// Errors produced by the Polar client.
#[derive(Debug, Error)]
pub enum PolarError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, PolarError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(PolarError::Status { status, body });
    }

    Ok(response.json().await?)
}
