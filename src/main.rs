use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod error;
mod executor;
mod models;
mod narrator;
mod oracle;
mod pipeline;
#[cfg(test)]
mod testing;
mod translator;

use config::Config;
use db::{MongoSessionStore, SessionStore};
use narrator::ResultNarrator;
use oracle::ChatCompletionsOracle;
use pipeline::QueryPipeline;
use translator::QueryTranslator;

#[derive(Parser)]
#[command(name = "session-insights")]
#[command(about = "Ask plain-English questions about session ratings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question about the session ratings
    Ask {
        question: String,
        /// Total execution attempts, repairs included
        #[arg(long)]
        max_retries: Option<usize>,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the database connection
    Health,
    /// Print stored session documents
    Sample {
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u16).range(1..))]
        limit: u16,
    },
    /// Import sessions from a ratings CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = Arc::new(
        MongoSessionStore::connect(&config.store)
            .await
            .context("failed to connect to MongoDB")?,
    );

    match cli.command {
        Commands::Ask {
            question,
            max_retries,
            timeout_secs,
            json,
        } => {
            let oracle = Arc::new(
                ChatCompletionsOracle::new(&config.oracle).context("oracle is not configured")?,
            );
            let translator = Arc::new(QueryTranslator::new(oracle.clone()));
            translator.initialize();
            let narrator = Arc::new(ResultNarrator::new(oracle));
            narrator.initialize();

            let mut pipeline = QueryPipeline::new(translator, narrator, store, config.max_retries);
            if let Some(max_retries) = max_retries {
                pipeline = pipeline.with_max_retries(max_retries);
            }

            let outcome = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                pipeline.process_query(&question),
            )
            .await
            .with_context(|| format!("no answer within {timeout_secs}s"))?;

            match outcome {
                Ok(response) if json => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                Ok(response) => {
                    println!("{}", response.analysis);
                    println!();
                    println!("({} matching records)", response.result_count);
                }
                Err(err) => {
                    error!(error = %err, "question failed");
                    anyhow::bail!("{}", err.user_message());
                }
            }
        }
        Commands::Health => {
            store
                .test_connection()
                .await
                .context("database health check failed")?;
            let count = store.count().await?;
            println!("Database reachable, {count} session documents.");
        }
        Commands::Sample { limit } => {
            let documents = store.sample(usize::from(limit)).await?;
            println!("{}", serde_json::to_string_pretty(&documents)?);
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&store, &csv).await?;
            println!("Inserted {inserted} sessions from {}.", csv.display());
        }
    }

    Ok(())
}
