mod api;
mod error;
mod hooks;
mod reconcile;
mod router;
mod signature;
mod telemetry;
mod webhook;

use std::net::SocketAddr;

use tracing::{info, warn};
use url::Url;

use polar_bridge_client::{PolarClient, PRODUCTION_API_URL, SANDBOX_API_URL};
use polar_bridge_storage::Database;
use polar_bridge_util::{load_env_file, AppConfig, PolarEnvironment};

use crate::signature::WebhookVerifier;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    if config.polar_webhook_secret.is_none() {
        warn!(stage = "app", "POLAR_WEBHOOK_SECRET is not set, webhook deliveries will be rejected");
    }
    if config.polar_access_token.is_none() {
        warn!(stage = "app", "POLAR_ACCESS_TOKEN is not set, Polar API routes are disabled");
    }
    if config.api_auth_token.is_none() {
        warn!(stage = "app", "API_AUTH_TOKEN is not set, session routes will be rejected");
    }

    let storage = Database::connect(&config.database_url).await?;
    storage.run_migrations().await?;

    let verifier = WebhookVerifier::from_secret(config.polar_webhook_secret.as_deref());

    let api_base = match config.polar_environment {
        PolarEnvironment::Sandbox => SANDBOX_API_URL,
        PolarEnvironment::Production => PRODUCTION_API_URL,
    };
    let polar = config
        .polar_access_token
        .as_deref()
        .map(|token| -> Result<PolarClient, url::ParseError> {
            Ok(PolarClient::new(
                token,
                Url::parse(api_base)?,
                reqwest::Client::new(),
            ))
        })
        .transpose()?;

    let state = router::AppState::new(
        metrics,
        storage,
        verifier,
        polar,
        config.api_auth_token.clone(),
        config.frontend_url.clone(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        polar_env = %config.polar_environment.as_str(),
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
