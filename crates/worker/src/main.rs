use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stockrec_core::config::Settings;
use stockrec_core::domain::run::RunState;
use stockrec_core::planner::PlannerConfig;
use stockrec_core::storage::memory::MemoryStore;
use stockrec_core::storage::symbols::PgSymbolDirectory;
use stockrec_core::storage::{PersistenceGateway, PgStore};
use stockrec_core::symbols::{CompanyInfo, InMemorySymbolDirectory, ReferenceSymbolDirectory};
use stockrec_core::workflow::pipeline::Pipeline;
use stockrec_core::workflow::{Orchestrator, WorkflowConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "stockrec_worker")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one collection pass to completion (default).
    Run(RunArgs),
    /// Load the reference symbol master from a zip archive.
    ImportSymbols {
        #[arg(long)]
        file: PathBuf,
        /// Mark every imported listing as tracked by the planner.
        #[arg(long)]
        tracked: bool,
    },
    /// Print the latest run checkpoint as JSON.
    Checkpoint,
}

#[derive(Debug, Default, clap::Args)]
struct RunArgs {
    /// Keep everything in memory; nothing is written to the database.
    #[arg(long)]
    dry_run: bool,

    /// Override PLANNER_MAX_QUERIES for this run.
    #[arg(long)]
    max_queries: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run(RunArgs::default()));

    let res = match command {
        Command::Run(run) => run_pipeline(&settings, run).await,
        Command::ImportSymbols { file, tracked } => import_symbols(&settings, &file, tracked).await,
        Command::Checkpoint => print_checkpoint(&settings).await,
    };
    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
    }
    res
}

async fn connect(settings: &Settings) -> anyhow::Result<sqlx::PgPool> {
    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    stockrec_core::storage::migrate(&pool).await?;
    Ok(pool)
}

async fn run_pipeline(settings: &Settings, args: RunArgs) -> anyhow::Result<()> {
    let mut planner = PlannerConfig::from_env();
    if let Some(n) = args.max_queries {
        planner.max_queries = n;
    }

    let pool = if args.dry_run && settings.database_url.is_none() {
        None
    } else {
        Some(connect(settings).await?)
    };

    if planner.targets.is_empty() {
        if let Some(pool) = &pool {
            planner.targets = stockrec_core::storage::symbols::tracked_targets(pool).await?;
        }
    }

    let symbols: Arc<dyn ReferenceSymbolDirectory> = match &pool {
        Some(pool) => {
            let dir = PgSymbolDirectory::new(pool.clone());
            let n = dir.count().await?;
            if n == 0 {
                tracing::warn!("reference_symbols is empty; every candidate will be rejected");
            }
            Arc::new(dir)
        }
        // Dry run without a database: only the configured targets are known.
        None => Arc::new(InMemorySymbolDirectory::new(planner.targets.iter().map(|t| {
            CompanyInfo {
                ticker: t.ticker.clone(),
                exchange: t.exchange.clone(),
                company_name: t.company_name.clone(),
                mic: None,
            }
        }))),
    };

    let store: Arc<dyn PersistenceGateway> = match (&pool, args.dry_run) {
        (Some(pool), false) => Arc::new(PgStore::new(pool.clone())),
        _ => Arc::new(MemoryStore::new()),
    };

    let pipeline = Pipeline::from_settings(settings, planner, symbols, store)?;
    let orchestrator = Orchestrator::new(pipeline, WorkflowConfig::from_env());

    let Some(status) = orchestrator.run_once().await else {
        tracing::warn!("run not started; another run in progress");
        return Ok(());
    };

    let counts = &status.counts;
    match status.state {
        RunState::Completed => {
            tracing::info!(
                run_id = ?status.run_id,
                dry_run = args.dry_run,
                queries_done = counts.queries_done,
                urls_found = counts.urls_found,
                fetched = counts.fetched,
                accepted = counts.accepted,
                rejected = counts.rejected,
                persisted = counts.persisted,
                errored = counts.errored,
                "collection run completed"
            );
            Ok(())
        }
        state => anyhow::bail!(
            "collection run ended {state}: {}",
            status.last_error.as_deref().unwrap_or("unknown error")
        ),
    }
}

async fn import_symbols(
    settings: &Settings,
    file: &std::path::Path,
    tracked: bool,
) -> anyhow::Result<()> {
    let records = stockrec_core::symbols::master::load_master_zip(file).await?;
    tracing::info!(file = %file.display(), records = records.len(), "symbol master parsed");

    let pool = connect(settings).await?;
    let affected = stockrec_core::storage::symbols::import_symbols(&pool, &records, tracked).await?;
    let total = PgSymbolDirectory::new(pool).count().await?;

    tracing::info!(affected, total, tracked, "reference symbols imported");
    Ok(())
}

async fn print_checkpoint(settings: &Settings) -> anyhow::Result<()> {
    let pool = connect(settings).await?;
    let store = PgStore::new(pool);

    match store.load_checkpoint().await? {
        Some(cp) => {
            let status = stockrec_core::workflow::state::status_from_checkpoint(cp);
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("serialize checkpoint failed")?
            );
        }
        None => tracing::info!("no checkpoint recorded yet"),
    }
    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
