use courtside::config::PipelineConfig;
use courtside::pipeline::QueryPipeline;
use courtside::schema::{SchemaDescriptor, SchemaProvider};
use courtside::sql::{DialectRepairEngine, SafetyValidator, ValidationOutcome};
use courtside::store::SqliteStore;
use courtside::templates::TemplateLibrary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courtside")]
#[command(about = "Ask questions about UCLA women's basketball box scores")]
#[command(version)]
struct Args {
    /// SQLite database (or set COURTSIDE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Statistics table (or set COURTSIDE_TABLE)
    #[arg(long, global = true)]
    table: Option<String>,

    /// Model name (or set ANTHROPIC_MODEL_NAME)
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question
    Ask {
        question: String,

        /// Print the full result envelope as JSON
        #[arg(long)]
        json: bool,
    },
    /// Repair and validate a SQL statement without running it
    Check { sql: String },
    /// Print the column listing used in prompts
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = PipelineConfig::from_env()?;
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(table) = args.table {
        config.table_name = table;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    config.check()?;

    match args.command {
        Commands::Ask { question, json } => ask(&config, &question, json).await,
        Commands::Check { sql } => check(&config, &sql),
        Commands::Schema => schema(&config),
    }
}

async fn ask(config: &PipelineConfig, question: &str, json: bool) -> Result<()> {
    let pipeline = QueryPipeline::from_config(config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize pipeline: {}", e))?;

    let envelope = pipeline.process_query(question).await;
    info!(
        request_id = %envelope.request_id,
        succeeded = envelope.succeeded,
        used_fallback = envelope.used_fallback,
        "Query finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    println!("\n{}\n", envelope.narrative_text);
    if let Some(sql) = &envelope.final_sql {
        println!("SQL:\n{}", sql);
    }
    if let Some(detail) = &envelope.error_detail {
        println!("Error: {}", detail);
    }
    Ok(())
}

fn check(config: &PipelineConfig, sql: &str) -> Result<()> {
    let templates = match &config.templates_path {
        Some(path) => TemplateLibrary::from_json_file(path)?,
        None => TemplateLibrary::builtin(),
    };
    let engine = DialectRepairEngine::new(config.table_name.clone(), Arc::new(templates))
        .with_approximate_rewrites(config.allow_approximate_rewrites);
    let validator = SafetyValidator::new(config.table_name.clone());

    let report = engine.repair_with_report(sql);
    println!("{}", report.sql);
    if report.changed() {
        println!("\nRepairs: {:?}", report.applied);
    }
    match validator.validate(&report.sql) {
        ValidationOutcome::Accepted => println!("Verdict: accepted"),
        ValidationOutcome::Rejected(reason) => {
            println!("Verdict: rejected ({}: {})", reason, reason.describe())
        }
    }
    Ok(())
}

fn schema(config: &PipelineConfig) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)?;
    let schema = store
        .get_schema(&config.table_name)?
        .unwrap_or_else(|| SchemaDescriptor::unavailable(&config.table_name));
    println!("{}", schema.render_listing());
    Ok(())
}
