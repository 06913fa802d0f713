use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use db_throttle::clock::SystemClock;
use db_throttle::config::ThrottleConfig;
use db_throttle::db::Database;
use db_throttle::registry::BackendRegistry;
use db_throttle::service::ThrottleService;

/// Database-backed distributed locks and rate limiting.
#[derive(Debug, Parser)]
#[command(name = "db-throttle", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "THROTTLE_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding the configuration
    #[arg(long, env = "THROTTLE_DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the lock and rate limit tables
    InitSchema,
    /// Delete expired locks and limiter states
    Prune,
    /// Try once to take a lock and print its token
    Lock {
        resource: String,
        /// Lock lifetime in seconds
        #[arg(long, default_value_t = 300.0)]
        ttl: f64,
    },
    /// Consume tokens from a configured rate limiter
    Consume {
        /// Rate limiter name
        limiter: String,
        /// Key limited independently, e.g. a user id
        key: String,
        #[arg(long, default_value_t = 1)]
        tokens: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => ThrottleConfig::from_file(path)?,
        None => ThrottleConfig::default(),
    };
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }

    let db = Database::connect(&config.database).await?;

    match cli.command {
        Command::InitSchema => {
            db.ensure_schema().await?;
            info!("Schema created");
        }
        Command::Prune => {
            let service = build_service(&config, db)?;
            let (locks, states) = service.prune().await?;
            println!("pruned {} locks and {} limiter states", locks, states);
        }
        Command::Lock { resource, ttl } => {
            let service = build_service(&config, db)?;
            match service.lock(&resource, Some(ttl), false).await? {
                Some(lock) => println!("{}", lock.key().token()),
                None => anyhow::bail!("lock {:?} is held by someone else", resource),
            }
        }
        Command::Consume {
            limiter,
            key,
            tokens,
        } => {
            let service = build_service(&config, db)?;
            let mut limiter = service.rate_limiter(Some(limiter.as_str()))?.create(&key);
            let limit = limiter.consume(tokens).await?;

            println!(
                "accepted={} available={} limit={} retry_after={:.3}s",
                limit.accepted,
                limit.available_tokens,
                limit.limit,
                limit.retry_after.as_secs_f64()
            );
            if !limit.accepted {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn build_service(config: &ThrottleConfig, db: Database) -> anyhow::Result<ThrottleService> {
    Ok(ThrottleService::from_config(
        config,
        db,
        &BackendRegistry::default(),
        Arc::new(SystemClock),
    )?)
}
