//! Postgres pool, migrations and sqlx error translation

use parley_common::config::DatabaseConfig;
use parley_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

/// Shared Postgres pool handed to every `Db*` repository
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect using the `[database]` section; only the postgres backend has a pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = connection_url(config)?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_secs = config.acquire_timeout_secs,
            "Connecting to Postgres"
        );

        let pool = pool_options(config)
            .connect(url)
            .await
            .map_err(|e| Error::Unavailable(format!("could not connect to Postgres: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from `migrations/`
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;

        info!("Database schema up to date");
        Ok(())
    }
}

fn connection_url(config: &DatabaseConfig) -> Result<&str> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "backend {:?} has no connection pool",
            config.backend
        )));
    }
    config
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| Error::Config("database.url is required for the postgres backend".into()))
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.acquire_timeout())
}

/// Translate a sqlx failure into the error the caller can act on.
///
/// Uniqueness violations become [`Error::Conflict`], connection trouble
/// becomes [`Error::Unavailable`], and everything else stays a database error.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            warn!(error = %e, "Postgres unavailable");
            Error::Unavailable(e.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(
            db.constraint()
                .map(|c| format!("duplicate value violates {}", c))
                .unwrap_or_else(|| db.message().to_string()),
        ),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            Error::Validation(format!("referenced record does not exist: {}", db.message()))
        }
        _ => Error::Database(e.to_string()),
    }
}
