use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use polar_bridge_client::{CheckoutCreate, CustomerSessionCreate, PolarClient};
use polar_bridge_storage::{NewUser, ProductRecord, UserError, UserRecord};

use crate::error::ApiError;
use crate::hooks;
use crate::router::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct ProductResponse {
    id: String,
    name: String,
    description: String,
    price_amount: i64,
    price_currency: String,
    recurring_interval: String,
    recurring_interval_count: i64,
    is_recurring: bool,
    trial_interval: String,
    trial_interval_count: i64,
    polar_price_id: String,
}

impl From<ProductRecord> for ProductResponse {
    fn from(record: ProductRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            description: record.description.unwrap_or_default(),
            price_amount: record.price_amount,
            price_currency: record.price_currency,
            recurring_interval: record.recurring_interval,
            recurring_interval_count: record.recurring_interval_count,
            is_recurring: record.is_recurring,
            trial_interval: record.trial_interval.unwrap_or_default(),
            trial_interval_count: record.trial_interval_count.unwrap_or_default(),
            polar_price_id: record.polar_price_id,
        }
    }
}

pub async fn list_products(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProductResponse>>, ApiError> {
    let records = state
        .storage()
        .products()
        .list_unarchived()
        .await
        .map_err(|err| {
            error!(stage = "api", %err, "failed to fetch products");
            ApiError::internal("failed to fetch products")
        })?;

    Ok(Json(records.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    id: Option<String>,
    email: String,
    #[serde(default)]
    name: String,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.email.is_empty() {
        return Err(ApiError::bad_request("email is required"));
    }

    let user = state
        .storage()
        .users()
        .create(
            NewUser {
                id: request.id,
                email: request.email,
                name: request.name,
            },
            state.now(),
        )
        .await
        .map_err(|err| match err {
            UserError::DuplicateId(id) => {
                ApiError::bad_request(format!("user id already exists: {id}"))
            }
            err => {
                error!(stage = "api", %err, "failed to create user");
                ApiError::internal("failed to create user")
            }
        })?;

    info!(stage = "api", user_id = %user.id, "user created");
    hooks::spawn_customer_provisioning(&state, user.clone());

    Ok((StatusCode::CREATED, Json(json!({ "id": user.id }))))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    user_id: String,
    products: Vec<String>,
    #[serde(default)]
    workspace_slug: Option<String>,
    #[serde(default)]
    return_path: Option<String>,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;

    if request.products.is_empty() {
        return Err(ApiError::bad_request(
            "products field is required and must contain at least one product ID",
        ));
    }

    let polar = require_polar(&state)?;
    let user = require_user(&state, &request.user_id).await?;

    let success_url = checkout_success_url(
        state.frontend_url(),
        request.workspace_slug.as_deref(),
        request.return_path.as_deref(),
    );
    let return_url = workspace_return_url(
        state.frontend_url(),
        request.workspace_slug.as_deref(),
        request.return_path.as_deref(),
        "/dashboard",
    );

    let checkout = polar
        .create_checkout(&CheckoutCreate {
            products: &request.products,
            external_customer_id: &user.id,
            customer_email: &user.email,
            customer_name: (!user.name.is_empty()).then_some(user.name.as_str()),
            success_url: &success_url,
            return_url: Some(&return_url),
        })
        .await
        .map_err(|err| {
            error!(stage = "api", user_id = %user.id, %err, "failed to create checkout session");
            ApiError::internal("failed to create checkout session")
        })?;

    info!(stage = "api", user_id = %user.id, checkout_id = %checkout.id, "checkout session created");
    Ok(Json(json!({ "url": checkout.url })))
}

#[derive(Debug, Deserialize)]
pub struct CustomerPortalRequest {
    user_id: String,
    #[serde(default)]
    workspace_slug: Option<String>,
    #[serde(default)]
    return_path: Option<String>,
}

pub async fn create_customer_portal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CustomerPortalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;

    let polar = require_polar(&state)?;
    let user = require_user(&state, &request.user_id).await?;

    let return_url = workspace_return_url(
        state.frontend_url(),
        request.workspace_slug.as_deref(),
        request.return_path.as_deref(),
        "/dashboard/settings/billing",
    );

    let session = polar
        .create_customer_session(&CustomerSessionCreate {
            external_customer_id: &user.id,
            return_url: Some(&return_url),
        })
        .await
        .map_err(|err| {
            error!(stage = "api", user_id = %user.id, %err, "failed to create customer portal session");
            ApiError::internal("failed to create customer portal session")
        })?;

    info!(stage = "api", user_id = %user.id, "customer portal session created");
    Ok(Json(json!({ "url": session.customer_portal_url })))
}

/// Gate for the session routes acting on behalf of a user.
///
/// The original service resolved the caller's identity from a per-user auth
/// token; without such a token store here, a shared bearer token restricts
/// these routes to trusted callers (the frontend backend). An absent token is
/// a deployment misconfiguration, not a caller error.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_token() else {
        error!(stage = "api", "API_AUTH_TOKEN is not configured");
        return Err(ApiError::internal("API auth token is not configured"));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiError::unauthorized("you are not authorized to access this resource")
        })?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        warn!(stage = "api", "rejected request with invalid API token");
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(())
}

fn require_polar(state: &AppState) -> Result<&PolarClient, ApiError> {
    state.polar().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Polar access token is not configured",
        )
    })
}

async fn require_user(state: &AppState, user_id: &str) -> Result<UserRecord, ApiError> {
    state
        .storage()
        .users()
        .fetch(user_id)
        .await
        .map_err(|err| {
            error!(stage = "api", user_id, %err, "failed to load user");
            ApiError::internal("failed to load user")
        })?
        .ok_or_else(|| ApiError::not_found("user not found"))
}

/// Joins the configured frontend base with a path, tolerating a trailing
/// slash on the base and a missing leading slash on the path.
fn frontend_join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn checkout_success_url(
    base: &str,
    workspace_slug: Option<&str>,
    return_path: Option<&str>,
) -> String {
    match workspace_slug {
        Some(slug) => {
            let path = return_path.filter(|p| !p.is_empty()).unwrap_or("/dashboard");
            frontend_join(base, &format!("/{slug}{path}?checkout=success"))
        }
        None => frontend_join(base, "/checkout/success"),
    }
}

fn workspace_return_url(
    base: &str,
    workspace_slug: Option<&str>,
    return_path: Option<&str>,
    default_path: &str,
) -> String {
    match workspace_slug {
        Some(slug) => {
            let path = return_path.filter(|p| !p.is_empty()).unwrap_or(default_path);
            frontend_join(base, &format!("/{slug}{path}"))
        }
        None => frontend_join(base, default_path),
    }
}
