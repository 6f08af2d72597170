//! # nlsql CLI
//!
//! The `nlsql` binary drives every stage of the assistant: index setup,
//! catalog extraction, schema indexing, retrieval, question answering,
//! evaluation, and the web UI.
//!
//! ## Usage
//!
//! ```bash
//! nlsql --config ./config/nlsql.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nlsql init` | Create the SQLite index database and tables |
//! | `nlsql domains` | List configured domains and index status |
//! | `nlsql health` | `SELECT 1` against every domain |
//! | `nlsql extract --all` | Write catalog snapshots |
//! | `nlsql index --all` | Rebuild schema chunk embeddings |
//! | `nlsql retrieve --domain D "<q>"` | Show retrieved chunks |
//! | `nlsql ask --domain D "<q>"` | Answer a question with SQL |
//! | `nlsql eval --gold PATH` | Score against a gold set |
//! | `nlsql serve` | Start the web UI |

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nlsql::config::{self, Config};
use nlsql::pipeline::{self, AskOptions};
use nlsql::{eval, health, index, migrate, schema_extract, server};

/// nlsql — ask questions about your Postgres databases in plain language.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/nlsql.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "nlsql",
    about = "nlsql — a local-first natural-language-to-SQL assistant for PostgreSQL",
    version,
    long_about = "nlsql retrieves the relevant parts of a database schema for each question, \
    asks a locally hosted model for a read-only query, validates it with guardrails, runs it, \
    and repairs failing queries with bounded retries."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nlsql.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database.
    ///
    /// Creates the SQLite file and its tables. Safe to run repeatedly.
    Init,

    /// List configured domains and what is indexed for each.
    Domains,

    /// Check every domain answers `SELECT 1`.
    ///
    /// Exits with status 1 if any domain fails.
    Health,

    /// Extract catalog metadata and write JSON snapshots.
    Extract {
        /// Domain to extract.
        #[arg(long, conflicts_with = "all")]
        domain: Option<String>,

        /// Extract every configured domain.
        #[arg(long)]
        all: bool,
    },

    /// Rebuild the schema index for one or all domains.
    ///
    /// Existing chunks for the domain are replaced only after every new
    /// chunk has been embedded.
    Index {
        #[arg(long, conflicts_with = "all")]
        domain: Option<String>,

        #[arg(long)]
        all: bool,

        /// Read catalog snapshots instead of connecting to Postgres.
        #[arg(long)]
        from_snapshot: bool,
    },

    /// Show the schema chunks retrieved for a question.
    Retrieve {
        #[arg(long)]
        domain: String,

        question: String,

        /// Number of chunks (defaults to `[retrieval].top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Answer a question: generate SQL, run it, print the result.
    Ask {
        #[arg(long)]
        domain: String,

        question: String,

        #[arg(long)]
        k: Option<usize>,

        /// Print every prompt sent to the model.
        #[arg(long)]
        show_prompt: bool,

        /// Print only the final SQL.
        #[arg(long)]
        sql_only: bool,

        /// Also write the result table to this CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Run the evaluation harness over a JSONL gold set.
    Eval {
        #[arg(long)]
        gold: PathBuf,

        /// Per-case CSV report.
        #[arg(long, default_value = "eval/report.csv")]
        report: PathBuf,
    },

    /// Start the web UI.
    Serve,
}

fn select_domains(cfg: &Config, domain: Option<String>, all: bool) -> anyhow::Result<Vec<String>> {
    match (domain, all) {
        (Some(d), _) => {
            cfg.domain(&d)?;
            Ok(vec![d])
        }
        (None, true) => Ok(cfg.domain_names()),
        (None, false) => bail!("Specify --domain <name> or --all"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Index database initialized successfully.");
        }
        Commands::Domains => {
            health::run_domains(&cfg).await?;
        }
        Commands::Health => {
            if !health::run_health(&cfg).await? {
                std::process::exit(1);
            }
        }
        Commands::Extract { domain, all } => {
            let domains = select_domains(&cfg, domain, all)?;
            schema_extract::run_extract(&cfg, &domains).await?;
        }
        Commands::Index {
            domain,
            all,
            from_snapshot,
        } => {
            let domains = select_domains(&cfg, domain, all)?;
            index::run_index(&cfg, &domains, from_snapshot).await?;
        }
        Commands::Retrieve {
            domain,
            question,
            k,
        } => {
            pipeline::run_retrieve(&cfg, &domain, &question, k).await?;
        }
        Commands::Ask {
            domain,
            question,
            k,
            show_prompt,
            sql_only,
            csv,
        } => {
            let opts = AskOptions {
                k,
                show_prompt,
                sql_only,
                csv: csv.as_deref(),
            };
            pipeline::run_ask(&cfg, &domain, &question, opts).await?;
        }
        Commands::Eval { gold, report } => {
            eval::run_eval(&cfg, &gold, &report).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
