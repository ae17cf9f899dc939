use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use polar_bridge_client::CustomerCreate;
use polar_bridge_storage::UserRecord;

use crate::router::AppState;

/// Spawns provider-side customer provisioning for a freshly created user.
///
/// Runs detached so user creation never waits on the provider; the handle is
/// returned so tests (and shutdown paths) can await completion. Every failure
/// mode is logged and counted, none of them fail the originating request.
pub fn spawn_customer_provisioning(state: &AppState, user: UserRecord) -> JoinHandle<()> {
    let state = state.clone();
    tokio::spawn(async move { provision_customer(state, user).await })
}

async fn provision_customer(state: AppState, user: UserRecord) {
    let Some(polar) = state.polar() else {
        warn!(
            stage = "hooks",
            user_id = %user.id,
            "no access token configured, skipping customer provisioning"
        );
        return;
    };

    if user.email.is_empty() {
        warn!(stage = "hooks", user_id = %user.id, "user has no email, skipping customer provisioning");
        return;
    }

    let create = CustomerCreate {
        external_id: &user.id,
        email: &user.email,
        name: (!user.name.is_empty()).then_some(user.name.as_str()),
    };

    let customer = match polar.create_customer(&create).await {
        Ok(customer) => customer,
        Err(err) => {
            warn!(stage = "hooks", user_id = %user.id, %err, "failed to create Polar customer");
            counter!("polar_customer_sync_total", "result" => "error").increment(1);
            return;
        }
    };

    if let Err(err) = state
        .storage()
        .users()
        .set_polar_customer(&user.id, &customer.id, customer.created_at, state.now())
        .await
    {
        warn!(
            stage = "hooks",
            user_id = %user.id,
            customer_id = %customer.id,
            %err,
            "created Polar customer but failed to record it locally"
        );
        counter!("polar_customer_sync_total", "result" => "error").increment(1);
        return;
    }

    info!(
        stage = "hooks",
        user_id = %user.id,
        customer_id = %customer.id,
        "Polar customer provisioned"
    );
    counter!("polar_customer_sync_total", "result" => "ok").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use sqlx::Row;
    use url::Url;

    use polar_bridge_client::PolarClient;
    use polar_bridge_storage::{Database, NewUser};

    use crate::signature::WebhookVerifier;
    use crate::telemetry;

    async fn setup(db_name: &str, polar: Option<PolarClient>) -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect(&format!(
            "sqlite:file:{db_name}?mode=memory&cache=shared"
        ))
        .await
        .expect("connect");
        database.run_migrations().await.expect("migrations");
        AppState::new(
            metrics,
            database,
            WebhookVerifier::from_secret(Some("test-secret")),
            polar,
            None,
            "http://localhost:3000".to_string(),
        )
    }

    #[tokio::test]
    async fn provisioning_records_customer_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/customers/")
                    .json_body_partial(json!({ "external_id": "user_7" }).to_string());
                then.status(201).json_body(json!({
                    "id": "cus_99",
                    "email": "u@example.com",
                    "external_id": "user_7",
                    "created_at": "2025-01-01T00:00:00Z"
                }));
            })
            .await;

        let base_url = Url::parse(&format!("{}/v1/", server.base_url())).expect("url");
        let polar = PolarClient::new("token", base_url, reqwest::Client::new());
        let state = setup("hooks-provision", Some(polar)).await;

        let user = state
            .storage()
            .users()
            .create(
                NewUser {
                    id: Some("user_7".to_string()),
                    email: "u@example.com".to_string(),
                    name: "Uri".to_string(),
                },
                state.now(),
            )
            .await
            .expect("create user");

        spawn_customer_provisioning(&state, user)
            .await
            .expect("task completes");

        mock.assert_async().await;
        let row = sqlx::query("SELECT polar_customer_id FROM users WHERE id = 'user_7'")
            .fetch_one(state.storage().pool())
            .await
            .expect("row");
        assert_eq!(
            row.get::<Option<String>, _>("polar_customer_id").as_deref(),
            Some("cus_99")
        );
    }

    #[tokio::test]
    async fn provisioning_without_client_is_a_noop() {
        let state = setup("hooks-noop", None).await;
        let user = state
            .storage()
            .users()
            .create(
                NewUser {
                    id: Some("user_8".to_string()),
                    email: "v@example.com".to_string(),
                    name: String::new(),
                },
                state.now(),
            )
            .await
            .expect("create user");

        spawn_customer_provisioning(&state, user)
            .await
            .expect("task completes");

        let row = sqlx::query("SELECT polar_customer_id FROM users WHERE id = 'user_8'")
            .fetch_one(state.storage().pool())
            .await
            .expect("row");
        assert!(row.get::<Option<String>, _>("polar_customer_id").is_none());
    }
}
