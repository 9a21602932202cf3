//! workpool CLI: run the scheduler, or submit and inspect work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use workpool::config::Config;
use workpool::db::Db;
use workpool::telemetry::{TelemetryConfig, init_telemetry};
use workpool::{
    CancelCursor, Error, FunctionRegistry, LogLevel, NewWork, PoolConfig, PoolOptions, RetryPolicy,
    WorkId, Workpool,
};

#[derive(Parser)]
#[command(name = "workpool", about = "Durable, parallelism-bounded work scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Serve {
        /// Directory containing command function TOML configs
        #[arg(long, default_value = "functions")]
        functions: PathBuf,
        /// Maximum concurrent executions (overrides WORKPOOL_MAX_PARALLELISM)
        #[arg(long)]
        max_parallelism: Option<u32>,
        /// Watchdog poll interval
        #[arg(long, default_value_t = 1_000)]
        poll_interval_ms: u64,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Show queue depths and running count
    Snapshot,
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit a new work item
    Submit {
        /// Registered function name
        function: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
        /// Delay before the first attempt
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Display name for logs
        #[arg(long)]
        name: Option<String>,
        /// Total attempts allowed; enables retries
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long, default_value_t = 250)]
        initial_backoff_ms: u64,
        #[arg(long, default_value_t = 2.0)]
        base: f64,
    },
    /// Show a work item's status
    Status {
        /// Work item ID
        id: String,
    },
    /// Request cancellation of a work item
    Cancel {
        /// Work item ID
        id: String,
    },
    /// Cancel every work item created before now
    CancelAll {
        #[arg(long, default_value_t = 64)]
        page_size: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            functions,
            max_parallelism,
            poll_interval_ms,
        } => {
            let max_parallelism = max_parallelism.unwrap_or(config.max_parallelism);
            cmd_serve(config, functions, max_parallelism, poll_interval_ms).await
        }
        Command::Work { action } => {
            let pool = client(&config).await?;
            match action {
                WorkAction::Submit {
                    function,
                    args,
                    delay_ms,
                    name,
                    max_attempts,
                    initial_backoff_ms,
                    base,
                } => {
                    let mut new = NewWork::action(function);
                    if let Some(json) = args {
                        new = new.args(serde_json::from_str(&json)?);
                    }
                    if let Some(ms) = delay_ms {
                        new = new.run_after(Duration::from_millis(ms));
                    }
                    if let Some(name) = name {
                        new = new.name(name);
                    }
                    if let Some(max_attempts) = max_attempts {
                        new = new.retry(RetryPolicy::new(max_attempts, initial_backoff_ms, base));
                    }
                    let id = pool.submit(new).await?;
                    println!("Submitted: {id}");
                    Ok(())
                }
                WorkAction::Status { id } => {
                    let id: WorkId = id.parse()?;
                    println!("{id}: {}", pool.status(id).await?);
                    Ok(())
                }
                WorkAction::Cancel { id } => {
                    let id: WorkId = id.parse()?;
                    pool.cancel(id).await?;
                    println!("Cancel requested: {id}");
                    Ok(())
                }
                WorkAction::CancelAll { page_size } => {
                    let mut cursor = CancelCursor::before(workpool::segment::now_ms() + 1);
                    let mut scanned = 0;
                    let mut requested = 0;
                    loop {
                        let page = pool.cancel_all_page(cursor, page_size).await?;
                        scanned += page.scanned;
                        requested += page.requested;
                        match page.next {
                            Some(next) => cursor = next,
                            None => break,
                        }
                    }
                    println!("Scanned {scanned} item(s), requested {requested} cancelation(s)");
                    Ok(())
                }
            }
        }
        Command::Snapshot => {
            let pool = client(&config).await?;
            let snapshot = pool.snapshot().await?;
            println!("Waiting:    {}", snapshot.waiting);
            println!("Running:    {}", snapshot.running);
            println!("Completing: {}", snapshot.completing);
            println!("Canceling:  {}", snapshot.canceling);
            println!("Spare:      {}", snapshot.spare_capacity);
            Ok(())
        }
    }
}

/// LOG_LEVEL is a tracing filter directive; event verbosity follows it when it
/// is a bare level name.
fn pool_options(config: &Config, max_parallelism: u32) -> PoolOptions {
    PoolOptions {
        config: PoolConfig {
            max_parallelism,
            log_level: config.log_level.parse().unwrap_or(LogLevel::Info),
        },
        ..PoolOptions::default()
    }
}

async fn client(config: &Config) -> anyhow::Result<Workpool> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let options = pool_options(config, config.max_parallelism);
    Ok(Workpool::client(Arc::new(db), options)?)
}

async fn cmd_serve(
    config: Config,
    functions: PathBuf,
    max_parallelism: u32,
    poll_interval_ms: u64,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        event_level: config.event_log_level.clone(),
        max_parallelism: Some(max_parallelism),
        ..TelemetryConfig::new("workpool", config.log_level.clone())
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let mut registry = FunctionRegistry::empty();
    match registry.load_commands_from_dir(&functions) {
        Ok(loaded) => {
            tracing::info!(loaded, functions = ?registry.names(), "command functions loaded");
        }
        Err(Error::NotFound(_)) => {
            tracing::warn!(dir = %functions.display(), "function directory not found, no handlers loaded");
        }
        Err(e) => return Err(e.into()),
    }

    let options = pool_options(&config, max_parallelism);
    let pool = Workpool::new(Arc::new(db), Arc::new(registry), options)?;
    pool.resume().await?;

    let stopper = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    pool.watch(Duration::from_millis(poll_interval_ms)).await?;
    pool.db().close().await;
    Ok(())
}
