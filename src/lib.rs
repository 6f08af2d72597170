//! # nlsql
//!
//! A local-first natural-language-to-SQL assistant for PostgreSQL.
//!
//! Each configured *domain* is one Postgres database. Its catalog is
//! extracted into schema chunks, embedded into a SQLite vector index, and
//! retrieved per question to ground a locally hosted model. Generated SQL
//! passes rule-based guardrails, runs read-only, and is repaired with
//! bounded retries when it fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Postgres  │──▶│ Extract +   │──▶│ SQLite index │
//! │  catalog   │   │ Chunk+Embed │   │  (vectors)   │
//! └────────────┘   └─────────────┘   └──────┬───────┘
//!                                           │ top-K
//!      question ──▶ prompt ──▶ LLM ──▶ guardrails ──▶ read-only execute
//!                     ▲                                   │
//!                     └──────── repair on failure ◀───────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! nlsql init                               # create the index database
//! nlsql extract --all                      # snapshot catalogs
//! nlsql index --all                        # embed schema chunks
//! nlsql ask --domain chinook "List all customers"
//! nlsql serve                              # web UI on 127.0.0.1:8501
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`schema_extract`] | Catalog extraction and snapshots |
//! | [`chunk`] | Schema chunk rendering |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store backends |
//! | [`retrieve`] | Top-K retrieval |
//! | [`prompt`] | Generation and repair prompts |
//! | [`llm`] | Model client |
//! | [`guardrails`] | SQL validation |
//! | [`executor`] | Read-only Postgres execution |
//! | [`retry`] | Repair loop |
//! | [`pipeline`] | End-to-end flow |
//! | [`eval`] | Gold-set evaluation |
//! | [`server`] | Web UI and JSON API |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod executor;
pub mod guardrails;
pub mod health;
pub mod index;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retrieve;
pub mod retry;
pub mod schema_extract;
pub mod server;
pub mod store;
