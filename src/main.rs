use clap::Parser;
use quotes_crawler::{
    quotes::{QuotesCrawler, QuotesData},
    run_crawler, CrawlConfig, Storage, Table, DEFAULT_START_URL,
};
use std::path::PathBuf;
use tokio::time::Duration;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;

/// Crawl quotes.toscrape.com into a SQLite database.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// First listing page
    #[arg(long, default_value = DEFAULT_START_URL)]
    start_url: String,

    /// SQLite database file, created when missing
    #[arg(long, default_value = "quotes.db")]
    database: PathBuf,

    /// Maximum number of requests in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Minimum delay between two requests, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Retries of a failed request
    #[arg(long)]
    retries: Option<u32>,

    /// Delay before the first retry, in milliseconds
    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    #[arg(long)]
    user_agent: Option<String>,
}

impl Args {
    fn crawl_config(&self) -> CrawlConfig {
        let default = CrawlConfig::default();
        CrawlConfig {
            user_agent: self.user_agent.clone().unwrap_or(default.user_agent),
            concurrency: self.concurrency.unwrap_or(default.concurrency),
            request_delay: self
                .delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default.request_delay),
            retries: self.retries.unwrap_or(default.retries),
            retry_backoff: self
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(default.retry_backoff),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
                "debug,html5ever=error,selectors=error,hyper=warn,reqwest=info,sqlx=warn".into()
            }),
        )
        .with(ErrorLayer::default())
        .init();

    let args = Args::parse();
    let config = args.crawl_config();

    let data = QuotesData::new(&args.database).await?;
    run_crawler(&QuotesCrawler, &data, &args.start_url, &config).await?;

    info!(
        "{} now holds {} quotes, {} authors, {} tags",
        args.database.display(),
        data.results_count().await?,
        data.authors.count().await?,
        data.tags.count().await?
    );

    Ok(())
}
