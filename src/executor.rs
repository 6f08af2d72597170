//! Running validated SQL against a domain's Postgres database.
//!
//! [`PgExecutor`] keeps one small pool per domain, opened on first use.
//! Statements run inside a read-only transaction that is always rolled
//! back, and every row is decoded positionally into JSON so duplicate or
//! unnamed columns (`?column?`) survive. Rows are streamed and the read
//! stops once `max_rows` is exceeded, whatever the statement's own LIMIT.

use async_trait::async_trait;
use base64::Engine as _;
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use sqlx::postgres::{PgColumn, PgPool, PgRow, PgTypeKind};
use sqlx::{Column, Executor, Row, TypeInfo};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::models::QueryResult;

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run one statement against `domain` and return its rows.
    async fn execute(&self, domain: &str, sql: &str) -> Result<QueryResult, PipelineError>;
}

pub struct PgExecutor {
    config: Config,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PgExecutor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool(&self, domain: &str) -> Result<PgPool, PipelineError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(domain) {
            return Ok(pool.clone());
        }

        if self.config.domains.get(domain).is_none() {
            return Err(PipelineError::UnknownDomain {
                name: domain.to_string(),
                available: self.config.domain_names().join(", "),
            });
        }

        let pool = db::connect_domain(&self.config, domain)
            .await
            .map_err(|e| PipelineError::Connectivity {
                domain: domain.to_string(),
                message: format!("{:#}", e),
            })?;
        tracing::debug!(domain, "opened postgres pool");
        pools.insert(domain.to_string(), pool.clone());
        Ok(pool)
    }

    /// Close every open pool.
    pub async fn close(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }

    async fn run(&self, pool: &PgPool, sql: &str) -> Result<QueryResult, sqlx::Error> {
        let max_rows = self.config.postgres.max_rows;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let (rows, truncated) = {
            let stream = sqlx::query(sql).persistent(false).fetch(&mut *tx);
            take_capped(stream, max_rows).await?
        };

        // An empty result has no row to read column names from.
        let columns = match rows.first() {
            Some(row) => column_names(row.columns()),
            None => column_names((&mut *tx).describe(sql).await?.columns()),
        };
        tx.rollback().await?;

        if truncated {
            tracing::debug!(max_rows, "result truncated");
        }
        Ok(QueryResult {
            columns,
            rows: rows.iter().map(row_to_values).collect(),
            truncated,
        })
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(&self, domain: &str, sql: &str) -> Result<QueryResult, PipelineError> {
        let pool = self.pool(domain).await?;
        self.run(&pool, sql)
            .await
            .map_err(|e| classify_error(domain, sql, e))
    }
}

/// Pull at most `max` items and report whether the stream had more. Nothing
/// past item `max + 1` is ever read.
async fn take_capped<S, T, E>(mut stream: S, max: usize) -> Result<(Vec<T>, bool), E>
where
    S: futures::Stream<Item = Result<T, E>> + Unpin,
{
    let mut items = Vec::new();
    while let Some(item) = stream.try_next().await? {
        if items.len() >= max {
            return Ok((items, true));
        }
        items.push(item);
    }
    Ok((items, false))
}

/// Driver errors are retryable; transport failures are not.
pub fn classify_error(domain: &str, sql: &str, err: sqlx::Error) -> PipelineError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Configuration(_) => PipelineError::Connectivity {
            domain: domain.to_string(),
            message: err.to_string(),
        },
        sqlx::Error::Database(db_err) => PipelineError::Execution {
            sql: sql.to_string(),
            message: db_err.message().to_string(),
        },
        other => PipelineError::Execution {
            sql: sql.to_string(),
            message: other.to_string(),
        },
    }
}

fn column_names(columns: &[PgColumn]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

fn row_to_values(row: &PgRow) -> Vec<Value> {
    (0..row.columns().len()).map(|i| decode_cell(row, i)).collect()
}

/// The type name to decode as: domains resolve to their base type and
/// enums decode as text.
fn effective_type_name(row: &PgRow, idx: usize) -> String {
    let info = row.columns()[idx].type_info();
    match info.kind() {
        PgTypeKind::Domain(base) => base.name().to_string(),
        PgTypeKind::Enum(_) => "TEXT".to_string(),
        _ => info.name().to_string(),
    }
}

fn decode_cell(row: &PgRow, idx: usize) -> Value {
    let type_name = effective_type_name(row, idx);

    macro_rules! get {
        ($t:ty, $to_json:expr) => {
            to_cell(row.try_get_unchecked::<Option<$t>, _>(idx), $to_json)
        };
    }

    let decoded = match type_name.as_str() {
        "UUID" => get!(uuid::Uuid, |u| json!(u.to_string())),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => get!(String, Value::from),
        "INT2" => get!(i16, Value::from),
        "INT4" => get!(i32, Value::from),
        "INT8" => get!(i64, Value::from),
        "OID" => get!(sqlx::postgres::types::Oid, |o| json!(o.0)),
        "FLOAT4" => get!(f32, |f| json!(f)),
        "FLOAT8" => get!(f64, |f| json!(f)),
        "NUMERIC" => get!(rust_decimal::Decimal, |d| match d.to_f64() {
            Some(f) if f.is_finite() => json!(f),
            _ => json!(d.to_string()),
        }),
        "BOOL" => get!(bool, Value::from),
        "JSON" | "JSONB" => get!(Value, |v| v),
        "TIMESTAMPTZ" => get!(chrono::DateTime<chrono::Utc>, |dt| json!(dt.to_rfc3339())),
        "TIMESTAMP" => get!(chrono::NaiveDateTime, |dt| json!(dt.to_string())),
        "DATE" => get!(chrono::NaiveDate, |d| json!(d.to_string())),
        "TIME" => get!(chrono::NaiveTime, |t| json!(t.to_string())),
        "BYTEA" => get!(Vec<u8>, |b| json!(
            base64::engine::general_purpose::STANDARD.encode(b)
        )),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => get!(Vec<String>, |v| json!(v)),
        "INT4[]" => get!(Vec<i32>, |v| json!(v)),
        "INT8[]" => get!(Vec<i64>, |v| json!(v)),
        _ if is_null(row, idx) => Ok(Value::Null),
        _ => Ok(json!(format!("<unsupported {}>", type_name.to_lowercase()))),
    };

    match decoded {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(column = idx, %type_name, error = %err, "cell decode failed");
            undecodable(&type_name, row.try_get_unchecked::<Option<String>, _>(idx))
        }
    }
}

/// `Ok(None)` is SQL NULL. A decode error stays an error so it is never
/// mistaken for NULL.
fn to_cell<T>(
    decoded: Result<Option<T>, sqlx::Error>,
    to_json: impl FnOnce(T) -> Value,
) -> Result<Value, sqlx::Error> {
    Ok(decoded?.map(to_json).unwrap_or(Value::Null))
}

/// Text rendering of a cell the typed decode rejected, or a marker.
fn undecodable(type_name: &str, text: Result<Option<String>, sqlx::Error>) -> Value {
    match text {
        Ok(Some(text)) => Value::from(text),
        _ => json!(format!("<undecodable {}>", type_name.to_lowercase())),
    }
}

fn is_null(row: &PgRow, idx: usize) -> bool {
    use sqlx::ValueRef;
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}
