//! PostgreSQL pool shared by the role store and the audit sink.

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Host, port and database of a connection, without credentials.
fn describe(options: &PgConnectOptions) -> String {
    format!(
        "{}:{}/{}",
        options.get_host(),
        options.get_port(),
        options.get_database().unwrap_or("postgres")
    )
}

/// Open the pool and bring the `approles` / `audit_events` schema up to date.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let options = PgConnectOptions::from_str(&config.url)
        .context("DATABASE_URL is not a valid PostgreSQL URL")?;
    let database = describe(&options);

    tracing::info!(
        database = %database,
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Opening role store pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .idle_timeout(IDLE_TIMEOUT)
        .test_before_acquire(true)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to {}", database))?;

    let migrator = sqlx::migrate!("./migrations");
    migrator
        .run(&pool)
        .await
        .context("Failed to apply role and audit schema")?;
    tracing::info!(
        database = %database,
        migrations = migrator.iter().count(),
        "Role store schema is current"
    );

    Ok(pool)
}

/// Round trip used by the health endpoint.
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| ())
}
