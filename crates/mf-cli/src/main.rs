use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mf_core::PeriodFilter;
use mf_query::{RankCriteria, RankingOutcome, StockQueryService, TopStocksQuery};
use mf_storage::{PgRecordStore, RecordStore};
use mf_sync::{connect_cache, export_period_snapshot, stop_channel, StopHandle, SyncConfig, SyncRuntime};
use mf_web::{AppState, WebConfig};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mf-cli")]
#[command(about = "Magic Formula screener: fundamentals acquisition, ranking and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scheduler (daily bulk pass and retry sweep) plus the HTTP API.
    Run,
    /// Walk symbol x year one unit at a time.
    Continuous,
    /// One bulk pass now, ignoring the batch window.
    Batch {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Retry every due ledger entry once.
    Retry,
    Migrate,
    /// HTTP API only.
    Serve,
    Rank {
        year: i32,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long, default_value_t = mf_query::DEFAULT_TOP_N)]
        top_n: usize,
        #[arg(long, default_value_t = 0.0)]
        min_earnings_yield: f64,
        #[arg(long, default_value_t = 0.0)]
        min_return_on_capital: f64,
        #[arg(long)]
        min_market_cap: Option<f64>,
    },
    Periods,
    Completion,
    /// Parquet snapshot of one period's records and ranking.
    Export {
        year: i32,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long, default_value = "./exports")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runtime = SyncRuntime::connect(config).await?;
            let (handle, stop) = stop_channel();
            spawn_ctrl_c(handle);

            let web = WebConfig::from_env();
            let state = AppState::new(runtime.query_service(), web.auth_provider()?, runtime.config.screening());
            let server = {
                let stop = stop.clone();
                tokio::spawn(async move { mf_web::serve(state, web.port, async move { stop.stopped().await }).await })
            };

            let scheduler = runtime.scheduler(stop);
            run_alongside(scheduler.run(), server).await?;
        }
        Commands::Continuous => {
            let runtime = SyncRuntime::connect(config).await?;
            let (handle, stop) = stop_channel();
            spawn_ctrl_c(handle);
            runtime.scheduler(stop).run_continuous().await?;
            println!("{}", serde_json::to_string_pretty(&runtime.chain.stats())?);
        }
        Commands::Batch { year } => {
            let runtime = SyncRuntime::connect(config).await?;
            let (handle, stop) = stop_channel();
            spawn_ctrl_c(handle);
            let scheduler = runtime.scheduler(stop);
            scheduler.reconcile_on_startup().await?;
            let summaries = match year {
                Some(year) => vec![scheduler.process_year(year).await?],
                None => scheduler.run_bulk_pass().await?,
            };
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Retry => {
            let runtime = SyncRuntime::connect(config).await?;
            let (handle, stop) = stop_channel();
            spawn_ctrl_c(handle);
            let scheduler = runtime.scheduler(stop);
            scheduler.reconcile_on_startup().await?;
            let summary = scheduler.retry_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store: Arc<dyn RecordStore> = Arc::new(connect_store(&config).await?);
            let query = StockQueryService::new(store, connect_cache(config.redis_url.as_deref()).await);
            let web = WebConfig::from_env();
            let state = AppState::new(query, web.auth_provider()?, config.screening());
            let (handle, stop) = stop_channel();
            spawn_ctrl_c(handle);
            mf_web::serve(state, web.port, async move { stop.stopped().await }).await?;
        }
        Commands::Rank {
            year,
            month,
            top_n,
            min_earnings_yield,
            min_return_on_capital,
            min_market_cap,
        } => {
            let query = query_service(&config).await?;
            let mut screening = config.screening();
            if let Some(min_market_cap) = min_market_cap {
                screening.min_market_cap = min_market_cap;
            }
            let request = TopStocksQuery {
                year,
                month,
                fallback_to_yearly: month.is_some(),
                criteria: RankCriteria {
                    top_n,
                    min_earnings_yield,
                    min_return_on_capital,
                    screening,
                },
            };
            match query.get_top_stocks(&request).await? {
                RankingOutcome::NoDataForPeriod => println!("no data stored for {year}"),
                RankingOutcome::NoMatches { total_in_database } => {
                    println!("{total_in_database} stocks stored, none match the filters")
                }
                RankingOutcome::Ranked(result) => {
                    if result.fallback_to_yearly {
                        println!("no monthly data, ranked the whole of {year}");
                    }
                    for stock in &result.stocks {
                        println!(
                            "{:>3}  {:<6} score={:<4} ey={:>7.2}% roc={:>7.2}%  {}",
                            stock.rank,
                            stock.record.symbol,
                            stock.magic_formula_score,
                            stock.record.earnings_yield,
                            stock.record.return_on_capital,
                            stock.record.company_name
                        );
                    }
                }
            }
        }
        Commands::Periods => {
            let query = query_service(&config).await?;
            println!("{}", serde_json::to_string_pretty(&query.get_available_periods().await?)?);
        }
        Commands::Completion => {
            let query = query_service(&config).await?;
            println!("{}", serde_json::to_string_pretty(&query.get_completion_status().await?)?);
        }
        Commands::Export { year, month, out } => {
            let store = connect_store(&config).await?;
            let criteria = RankCriteria {
                top_n: usize::MAX,
                screening: config.screening(),
                ..RankCriteria::default()
            };
            let filter = PeriodFilter::for_request(year, month);
            let summary = export_period_snapshot(&store, filter, &criteria, &out).await?;
            println!(
                "exported {} records ({} ranked) to {}",
                summary.records,
                summary.ranked,
                summary.manifest_path.display()
            );
        }
    }

    Ok(())
}

async fn connect_store(config: &SyncConfig) -> Result<PgRecordStore> {
    PgRecordStore::connect(&config.database_url, 5)
        .await
        .context("connecting to database")
}

async fn query_service(config: &SyncConfig) -> Result<StockQueryService> {
    let store: Arc<dyn RecordStore> = Arc::new(connect_store(config).await?);
    Ok(StockQueryService::new(store, connect_cache(config.redis_url.as_deref()).await))
}

/// Drives the scheduler next to the API task. A scheduler failure takes the
/// API down with it instead of leaving it serving a stalled dataset.
async fn run_alongside<E>(
    scheduler: impl Future<Output = Result<(), E>>,
    server: JoinHandle<Result<()>>,
) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Err(err) = scheduler.await {
        server.abort();
        return Err(err).context("acquisition scheduler failed");
    }
    server.await.context("api task panicked")?
}

fn spawn_ctrl_c(handle: StopHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("stop requested, finishing in-flight work"),
            Err(err) => warn!(error = %err, "ctrl-c listener failed, stopping"),
        }
        handle.stop();
    });
}
