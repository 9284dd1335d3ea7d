use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reag_core::ScrapeBatchResult;
use reag_storage::PgFingerprintStore;
use reag_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "reag-cli")]
#[command(about = "Real estate listing ingestion")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured source, splitting the limit across them.
    Scrape {
        #[arg(long, default_value = "Mumbai")]
        city: String,
        #[arg(long, default_value_t = 30)]
        limit: usize,
    },
    /// Scrape a single source with the whole limit.
    ScrapeSource {
        source_id: String,
        #[arg(long, default_value = "Mumbai")]
        city: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Status,
    /// Delete every stored listing.
    Clear,
    Migrate,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "reag=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn print_batch(batch: &ScrapeBatchResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(batch)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let command = cli.command.unwrap_or(Commands::Scrape {
        city: "Mumbai".to_string(),
        limit: 30,
    });

    match command {
        Commands::Scrape { city, limit } => {
            let batch = reag_sync::run_scrape_from_env(&city, limit).await?;
            print_batch(&batch)?;
        }
        Commands::ScrapeSource { source_id, city, limit } => {
            let pipeline = reag_sync::pipeline_from_env().await?;
            let batch = pipeline.scrape_one_source(&source_id, &city, limit).await?;
            print_batch(&batch)?;
        }
        Commands::Status => {
            let pipeline = reag_sync::pipeline_from_env().await?;
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Clear => {
            let pipeline = reag_sync::pipeline_from_env().await?;
            let removed = pipeline.clear_all().await?;
            println!("cleared {removed} listings");
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgFingerprintStore::connect(url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
