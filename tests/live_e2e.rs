//! End-to-end against a real Postgres with the chinook sample database and
//! a running Ollama. Run with:
//!
//! ```bash
//! NLSQL_CONFIG=./config/nlsql.toml cargo test --test live_e2e -- --ignored
//! ```
//!
//! The chinook domain must already be indexed (`nlsql index --domain chinook`).

use std::path::PathBuf;

use nlsql::config::load_config;
use nlsql::pipeline::Services;

fn config_path() -> PathBuf {
    std::env::var("NLSQL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config/nlsql.toml"))
}

#[tokio::test]
#[ignore]
async fn test_list_all_customers_on_chinook() {
    let cfg = load_config(&config_path()).unwrap();
    let services = Services::from_config(&cfg).await.unwrap();

    let answer = services
        .ask("chinook", "List all customers", None)
        .await
        .unwrap();

    let sql = answer.outcome.sql.to_uppercase();
    assert!(sql.trim_start().starts_with("SELECT") || sql.trim_start().starts_with("WITH"));
    assert!(sql.contains("LIMIT"));
    assert!(!answer.outcome.result.rows.is_empty());
    assert!(answer.outcome.result.row_count() <= cfg.postgres.max_rows);
}
