use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for interacting with user records.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for interacting with product records.
    pub fn products(&self) -> ProductRepository {
        ProductRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A user row as read from the `users` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub subscription_id: Option<String>,
    pub subscription_status: Option<String>,
    pub subscription_product_id: Option<String>,
    pub subscription_current_period_end: Option<DateTime<Utc>>,
    pub subscription_cancel_at_period_end: bool,
    pub last_payment_status: Option<String>,
    pub polar_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters required to create a user record.
pub struct NewUser {
    pub id: Option<String>,
    pub email: String,
    pub name: String,
}

/// The subscription field group written wholesale on subscription events.
///
/// Every write replaces all five fields; nothing is incremented or merged, so
/// redelivering the same event is idempotent.
#[derive(Debug, Clone)]
pub struct SubscriptionFields<'a> {
    pub subscription_id: &'a str,
    pub status: &'a str,
    pub product_id: &'a str,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Subscription activation written alongside a paid order when the order is
/// the first payment of a new subscription.
#[derive(Debug, Clone)]
pub struct OrderActivation<'a> {
    pub subscription_id: &'a str,
    pub product_id: &'a str,
}

const USER_COLUMNS: &str = "id, email, name, subscription_id, subscription_status, \
     subscription_product_id, subscription_current_period_end, \
     subscription_cancel_at_period_end, last_payment_status, polar_customer_id, \
     created_at, updated_at";

/// Repository for user (subject) records.
///
/// No lock or transaction spans a find-then-update pair: concurrent webhook
/// deliveries touching the same user race last-write-wins on the final
/// UPDATE. That is an accepted property of the design, not an oversight.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Looks up the user whose primary id equals the provider's external id.
    ///
    /// The ordering and limit make the tie-break explicit: newest record
    /// first, at most one row.
    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<UserRecord>, UserError> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Fetches a user by id.
    pub async fn fetch(&self, id: &str) -> Result<Option<UserRecord>, UserError> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Inserts a new user record, generating an id when none is supplied.
    pub async fn create(&self, user: NewUser, now: DateTime<Utc>) -> Result<UserRecord, UserError> {
        let id = user.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let stamp = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO users (id, email, name, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(&id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&stamp)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("1555") => {
                UserError::DuplicateId(id.clone())
            }
            other => UserError::Database(other),
        })?;

        Ok(UserRecord {
            id,
            email: user.email,
            name: user.name,
            subscription_id: None,
            subscription_status: None,
            subscription_product_id: None,
            subscription_current_period_end: None,
            subscription_cancel_at_period_end: false,
            last_payment_status: None,
            polar_customer_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Overwrites the full subscription field group on a user.
    pub async fn set_subscription(
        &self,
        user_id: &str,
        fields: &SubscriptionFields<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        sqlx::query(
            "UPDATE users SET \
                 subscription_id = ?2, \
                 subscription_status = ?3, \
                 subscription_product_id = ?4, \
                 subscription_current_period_end = ?5, \
                 subscription_cancel_at_period_end = ?6, \
                 updated_at = ?7 \
             WHERE id = ?1",
        )
        .bind(user_id)
        .bind(fields.subscription_id)
        .bind(fields.status)
        .bind(fields.product_id)
        .bind(fields.current_period_end.map(to_rfc3339))
        .bind(fields.cancel_at_period_end)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes only the cancellation-specific fields, leaving the rest of the
    /// subscription group untouched.
    pub async fn set_cancellation(
        &self,
        user_id: &str,
        status: &str,
        cancel_at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        sqlx::query(
            "UPDATE users SET \
                 subscription_status = ?2, \
                 subscription_cancel_at_period_end = ?3, \
                 updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(user_id)
        .bind(status)
        .bind(cancel_at_period_end)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a paid order, optionally forcing the subscription active when
    /// the order is the subscription's first payment.
    pub async fn record_paid_order(
        &self,
        user_id: &str,
        activation: Option<&OrderActivation<'_>>,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        let stamp = to_rfc3339(now);
        match activation {
            Some(activation) => {
                sqlx::query(
                    "UPDATE users SET \
                         last_payment_status = 'paid', \
                         subscription_status = 'active', \
                         subscription_id = ?2, \
                         subscription_product_id = ?3, \
                         updated_at = ?4 \
                     WHERE id = ?1",
                )
                .bind(user_id)
                .bind(activation.subscription_id)
                .bind(activation.product_id)
                .bind(&stamp)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE users SET last_payment_status = 'paid', updated_at = ?2 \
                     WHERE id = ?1",
                )
                .bind(user_id)
                .bind(&stamp)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Writes the Polar customer id produced by the provisioning task.
    pub async fn set_polar_customer(
        &self,
        user_id: &str,
        customer_id: &str,
        customer_created: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        sqlx::query(
            "UPDATE users SET polar_customer_id = ?2, polar_customer_created = ?3, \
                 updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(user_id)
        .bind(customer_id)
        .bind(customer_created.map(to_rfc3339))
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Errors that can occur while reading or writing user records.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user id already exists: {0}")]
    DuplicateId(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A product row as read from the `polar_products` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub price_amount: i64,
    pub price_currency: String,
    pub recurring_interval: String,
    pub recurring_interval_count: i64,
    pub is_recurring: bool,
    pub is_archived: bool,
    pub trial_interval: Option<String>,
    pub trial_interval_count: Option<i64>,
    pub polar_price_id: String,
}

/// The complete product field set, written wholesale on every product event.
#[derive(Debug, Clone)]
pub struct ProductFields<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub price_amount: i64,
    pub price_currency: &'a str,
    pub recurring_interval: &'a str,
    pub recurring_interval_count: i64,
    pub is_recurring: bool,
    pub is_archived: bool,
    pub trial_interval: Option<&'a str>,
    pub trial_interval_count: Option<i64>,
    pub polar_price_id: &'a str,
}

const PRODUCT_COLUMNS: &str = "id, name, description, price_amount, price_currency, \
     recurring_interval, recurring_interval_count, is_recurring, is_archived, \
     trial_interval, trial_interval_count, polar_price_id";

/// Repository for product records keyed by the provider's product id.
#[derive(Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    /// Fetches a product by provider id.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<ProductRecord>, ProductError> {
        let row = sqlx::query_as::<_, ProductRecord>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM polar_products WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Lists products that are not archived.
    pub async fn list_unarchived(&self) -> Result<Vec<ProductRecord>, ProductError> {
        let rows = sqlx::query_as::<_, ProductRecord>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM polar_products WHERE is_archived = 0 ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Inserts or fully replaces a product row.
    ///
    /// Partial patches are never issued; the same payload always produces the
    /// same row regardless of what was stored before.
    pub async fn upsert(
        &self,
        fields: &ProductFields<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), ProductError> {
        let stamp = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO polar_products \
                 (id, name, description, price_amount, price_currency, \
                  recurring_interval, recurring_interval_count, is_recurring, \
                  is_archived, trial_interval, trial_interval_count, polar_price_id, \
                  created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13) \
             ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 description = excluded.description, \
                 price_amount = excluded.price_amount, \
                 price_currency = excluded.price_currency, \
                 recurring_interval = excluded.recurring_interval, \
                 recurring_interval_count = excluded.recurring_interval_count, \
                 is_recurring = excluded.is_recurring, \
                 is_archived = excluded.is_archived, \
                 trial_interval = excluded.trial_interval, \
                 trial_interval_count = excluded.trial_interval_count, \
                 polar_price_id = excluded.polar_price_id, \
                 updated_at = excluded.updated_at",
        )
        .bind(fields.id)
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.price_amount)
        .bind(fields.price_currency)
        .bind(fields.recurring_interval)
        .bind(fields.recurring_interval_count)
        .bind(fields.is_recurring)
        .bind(fields.is_archived)
        .bind(fields.trial_interval)
        .bind(fields.trial_interval_count)
        .bind(fields.polar_price_id)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Errors that can occur while reading or writing product records.
#[derive(Debug, Error)]
pub enum ProductError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    // Each test gets its own named in-memory database; a bare shared-cache
    // `:memory:` URL is process-wide and tests would trample each other.
    static DB_SEQ: AtomicUsize = AtomicUsize::new(0);

    async fn setup_db() -> Database {
        let seq = DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let db = Database::connect(&format!(
            "sqlite:file:storage-test-{seq}?mode=memory&cache=shared"
        ))
        .await
        .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn sample_product(id: &str) -> ProductFields<'_> {
        ProductFields {
            id,
            name: "Pro Plan",
            description: Some("Monthly pro tier"),
            price_amount: 990,
            price_currency: "usd",
            recurring_interval: "month",
            recurring_interval_count: 1,
            is_recurring: true,
            is_archived: false,
            trial_interval: None,
            trial_interval_count: None,
            polar_price_id: "price_1",
        }
    }

    #[tokio::test]
    async fn create_and_find_user_by_external_id() {
        let db = setup_db().await;
        let users = db.users();
        let now = Utc::now();

        let created = users
            .create(
                NewUser {
                    id: Some("user_42".to_string()),
                    email: "a@example.com".to_string(),
                    name: "Ada".to_string(),
                },
                now,
            )
            .await
            .expect("create");
        assert_eq!(created.id, "user_42");

        let found = users
            .find_by_external_id("user_42")
            .await
            .expect("query")
            .expect("user exists");
        assert_eq!(found.email, "a@example.com");
        assert!(found.subscription_id.is_none());

        let missing = users
            .find_by_external_id("user_missing")
            .await
            .expect("query");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn create_generates_id_when_absent() {
        let db = setup_db().await;
        let created = db
            .users()
            .create(
                NewUser {
                    id: None,
                    email: "b@example.com".to_string(),
                    name: "Bea".to_string(),
                },
                Utc::now(),
            )
            .await
            .expect("create");
        assert!(!created.id.is_empty());
    }

    #[tokio::test]
    async fn duplicate_user_id_is_reported() {
        let db = setup_db().await;
        let users = db.users();
        let now = Utc::now();
        let new = |email: &str| NewUser {
            id: Some("user_1".to_string()),
            email: email.to_string(),
            name: String::new(),
        };

        users.create(new("a@example.com"), now).await.expect("first");
        let err = users
            .create(new("b@example.com"), now)
            .await
            .expect_err("duplicate should fail");
        assert!(matches!(err, UserError::DuplicateId(id) if id == "user_1"));
    }

    #[tokio::test]
    async fn set_subscription_overwrites_all_fields() {
        let db = setup_db().await;
        let users = db.users();
        let now = Utc::now();
        users
            .create(
                NewUser {
                    id: Some("user_1".to_string()),
                    email: String::new(),
                    name: String::new(),
                },
                now,
            )
            .await
            .expect("create");

        let period_end = "2025-01-01T00:00:00Z".parse().expect("timestamp");
        users
            .set_subscription(
                "user_1",
                &SubscriptionFields {
                    subscription_id: "sub_1",
                    status: "active",
                    product_id: "prod_9",
                    current_period_end: Some(period_end),
                    cancel_at_period_end: false,
                },
                now,
            )
            .await
            .expect("update");

        let user = users.fetch("user_1").await.expect("fetch").expect("exists");
        assert_eq!(user.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(user.subscription_status.as_deref(), Some("active"));
        assert_eq!(user.subscription_current_period_end, Some(period_end));
    }

    #[tokio::test]
    async fn cancellation_leaves_other_subscription_fields_alone() {
        let db = setup_db().await;
        let users = db.users();
        let now = Utc::now();
        users
            .create(
                NewUser {
                    id: Some("user_1".to_string()),
                    email: String::new(),
                    name: String::new(),
                },
                now,
            )
            .await
            .expect("create");
        users
            .set_subscription(
                "user_1",
                &SubscriptionFields {
                    subscription_id: "sub_1",
                    status: "active",
                    product_id: "prod_9",
                    current_period_end: None,
                    cancel_at_period_end: false,
                },
                now,
            )
            .await
            .expect("seed");

        users
            .set_cancellation("user_1", "canceled", true, now)
            .await
            .expect("cancel");

        let user = users.fetch("user_1").await.expect("fetch").expect("exists");
        assert_eq!(user.subscription_status.as_deref(), Some("canceled"));
        assert!(user.subscription_cancel_at_period_end);
        assert_eq!(user.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(user.subscription_product_id.as_deref(), Some("prod_9"));
    }

    #[tokio::test]
    async fn product_upsert_is_a_full_replace() {
        let db = setup_db().await;
        let products = db.products();
        let now = Utc::now();

        products
            .upsert(&sample_product("prod_9"), now)
            .await
            .expect("insert");

        let mut updated = sample_product("prod_9");
        updated.name = "Pro Plan v2";
        updated.description = None;
        updated.price_amount = 1490;
        updated.is_archived = true;
        products.upsert(&updated, now).await.expect("replace");

        let record = products
            .find_by_id("prod_9")
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(record.name, "Pro Plan v2");
        assert_eq!(record.price_amount, 1490);
        assert!(record.description.is_none());
        assert!(record.is_archived);
    }

    #[tokio::test]
    async fn list_unarchived_filters_archived_rows() {
        let db = setup_db().await;
        let products = db.products();
        let now = Utc::now();

        products
            .upsert(&sample_product("prod_a"), now)
            .await
            .expect("insert");
        let mut archived = sample_product("prod_b");
        archived.is_archived = true;
        products.upsert(&archived, now).await.expect("insert");

        let listed = products.list_unarchived().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "prod_a");
    }
}
