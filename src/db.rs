//! Database connections: the local SQLite vector index and one Postgres
//! pool per domain.

use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Config, ConnectionSettings};

/// Open (creating if missing) the SQLite index database.
pub async fn connect_index(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.index.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Connection options for one domain, with the server-side statement
/// timeout applied to every session.
pub fn pg_options(settings: &ConnectionSettings, statement_timeout_secs: u64) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .username(&settings.user)
        .database(&settings.dbname)
        .application_name("nlsql");

    if let Some(password) = &settings.password {
        options = options.password(password);
    }
    if statement_timeout_secs > 0 {
        let ms = (statement_timeout_secs * 1000).to_string();
        options = options.options([("statement_timeout", ms.as_str())]);
    }
    options
}

/// Open a small pool to a domain's database.
pub async fn connect_domain(config: &Config, domain: &str) -> Result<PgPool> {
    let settings = config.connection(domain)?;
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout_secs))
        .connect_with(pg_options(&settings, config.postgres.statement_timeout_secs))
        .await?;
    Ok(pool)
}
