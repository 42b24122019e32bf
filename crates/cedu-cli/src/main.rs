use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use cedu_storage::{MemoryCatalog, PgCatalog};
use cedu_sync::{ImportConfig, ImportOptions, ImportPipeline, ImportResult};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cedu-cli")]
#[command(about = "Course catalog import command-line interface")]
struct Cli {
    /// Log at debug level unless CEDU_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import the catalog snapshot into the database.
    Import {
        /// Load and validate only; nothing is written.
        #[arg(long)]
        dry_run: bool,
        /// Snapshot file to use instead of the configured search paths.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the admin API.
    Serve,
    /// Summarize recent import audit files as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("CEDU_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

async fn import(options: ImportOptions) -> Result<ImportResult> {
    let config = ImportConfig::from_env();
    if options.dry_run {
        // Dry runs never touch the store.
        return Ok(ImportPipeline::new(config, MemoryCatalog::new())
            .run(options)
            .await);
    }
    let catalog = PgCatalog::connect(&config.database_url)
        .await
        .context("connecting to the catalog database")?;
    Ok(ImportPipeline::new(config, catalog).run(options).await)
}

fn print_summary(result: &ImportResult) {
    let status = if result.success { "succeeded" } else { "FAILED" };
    println!(
        "import {status}: run_id={} snapshot={} duration_ms={} errors={} warnings={}",
        result.run_id,
        result.snapshot_version.as_deref().unwrap_or("-"),
        result.duration_ms,
        result.errors.len(),
        result.warnings.len()
    );
    if let Some(failure) = result.failure {
        println!("  failure: {failure:?}");
    }
    for (table, count) in &result.counts {
        println!(
            "  {table:<15} expected={:<5} imported={:<5} verified={}",
            count.expected, count.imported, count.verified
        );
    }
    println!(
        "  reconciliation: banks_created={} questions_populated={} orphans_fixed={}",
        result.reconciliation.banks_created,
        result.reconciliation.questions_populated,
        result.reconciliation.orphans_fixed
    );
    for error in &result.errors {
        println!("  error: {error}");
    }
    if let Some(path) = &result.audit_file {
        println!("  audit log: {}", path.display());
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let command = cli.command.unwrap_or(Commands::Import {
        dry_run: false,
        snapshot: None,
        json: false,
    });
    match command {
        Commands::Import {
            dry_run,
            snapshot,
            json,
        } => {
            let result = import(ImportOptions {
                dry_run,
                snapshot_path: snapshot,
            })
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let config = ImportConfig::from_env();
            let catalog = PgCatalog::connect(&config.database_url)
                .await
                .context("connecting to the catalog database")?;
            catalog.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Serve => {
            cedu_web::serve_from_env().await?;
        }
        Commands::Report { runs } => {
            let config = ImportConfig::from_env();
            println!("{}", cedu_sync::report_markdown(runs, &config.logs_dir)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
