//! Per-domain status: the `SELECT 1` healthcheck and the index overview.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::executor::{PgExecutor, SqlExecutor};
use crate::migrate;
use crate::store::{SqliteStore, VectorStore};

#[derive(Debug, Clone, Serialize)]
pub struct DomainHealth {
    pub domain: String,
    pub ok: bool,
    pub detail: String,
}

/// Run `SELECT 1` on every domain and check the scalar is `1`.
pub async fn check_domains(executor: &dyn SqlExecutor, domains: &[String]) -> Vec<DomainHealth> {
    let mut out = Vec::with_capacity(domains.len());
    for domain in domains {
        let (ok, detail) = match executor.execute(domain, "SELECT 1").await {
            Ok(result) => match result.scalar().and_then(|v| v.as_i64()) {
                Some(1) => (true, "SELECT 1 -> 1".to_string()),
                _ => (false, format!("unexpected result: {:?}", result.rows)),
            },
            Err(e) => (false, e.to_string()),
        };
        if !ok {
            tracing::warn!(domain = %domain, "healthcheck failed: {}", detail);
        }
        out.push(DomainHealth {
            domain: domain.clone(),
            ok,
            detail,
        });
    }
    out
}

pub fn print_health(results: &[DomainHealth]) {
    println!("{:<16} {:<8} DETAIL", "DOMAIN", "STATUS");
    for r in results {
        println!(
            "{:<16} {:<8} {}",
            r.domain,
            if r.ok { "OK" } else { "FAIL" },
            r.detail
        );
    }
}

/// `nlsql health`. Returns whether every domain passed.
pub async fn run_health(config: &Config) -> Result<bool> {
    let executor = PgExecutor::new(config.clone());
    let results = check_domains(&executor, &config.domain_names()).await;
    executor.close().await;
    print_health(&results);
    Ok(results.iter().all(|r| r.ok))
}

/// `nlsql domains`: configured domains and what is indexed for each.
pub async fn run_domains(config: &Config) -> Result<()> {
    let pool = db::connect_index(config).await?;
    migrate::create_tables(&pool).await?;
    let store = SqliteStore::new(pool);

    println!(
        "{:<16} {:<16} {:<8} {:<8} {:<20} INDEXED",
        "DOMAIN", "DBNAME", "CHUNKS", "VECTORS", "MODEL"
    );
    for name in config.domain_names() {
        let domain = config.domain(&name)?;
        let stats = store.stats(&name).await?;
        let indexed = stats
            .indexed_at
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<16} {:<16} {:<8} {:<8} {:<20} {}",
            name,
            domain.dbname,
            stats.chunks,
            stats.embedded,
            stats.model.as_deref().unwrap_or("-"),
            indexed
        );
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::models::QueryResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubExecutor;

    #[async_trait]
    impl SqlExecutor for StubExecutor {
        async fn execute(&self, domain: &str, _sql: &str) -> Result<QueryResult, PipelineError> {
            match domain {
                "chinook" => Ok(QueryResult {
                    columns: vec!["?column?".into()],
                    rows: vec![vec![json!(1)]],
                    truncated: false,
                }),
                "weird" => Ok(QueryResult {
                    columns: vec!["?column?".into()],
                    rows: vec![vec![json!(2)]],
                    truncated: false,
                }),
                _ => Err(PipelineError::Connectivity {
                    domain: domain.into(),
                    message: "connection refused".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_reports_each_domain() {
        let domains = vec!["chinook".to_string(), "weird".to_string(), "northwind".to_string()];
        let results = check_domains(&StubExecutor, &domains).await;
        let oks: Vec<bool> = results.iter().map(|r| r.ok).collect();
        assert_eq!(oks, vec![true, false, false]);
        assert!(results[2].detail.contains("connection refused"));
    }
}
