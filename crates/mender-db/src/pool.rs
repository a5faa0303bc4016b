//! Pool construction and schema management.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Open a connection pool against the configured database.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(5))
        .connect(config.url())
        .await
        .with_context(|| format!("failed to connect to database at {}", config.url()))
}

/// Apply any pending schema migrations.
///
/// The migration files ship with this crate and are loaded at runtime, so
/// building the workspace never requires a live database.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"));
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to apply migrations")?;

    info!("schema is up to date");
    Ok(())
}

/// Create the configured database if it is missing.
///
/// `CREATE DATABASE` cannot run against the database it creates, so this
/// goes through the server's `postgres` maintenance database.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .with_context(|| format!("no database name in URL {}", config.url()))?
        .to_owned();

    // CREATE DATABASE takes no bind parameters; refuse any name that could
    // smuggle SQL into the statement.
    if !is_safe_identifier(&name) {
        bail!("refusing to create database named {name:?}");
    }

    let admin = connect(&config.with_database("postgres")).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&name)
            .fetch_one(&admin)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = %name, "database already exists");
    } else {
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .with_context(|| format!("failed to create database {name}"))?;
        info!(db = %name, "database created");
    }

    admin.close().await;
    Ok(())
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
