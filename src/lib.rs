use reqwest::{Client, Response, StatusCode};
use scraper::Html;
use std::{collections::HashSet, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex, Semaphore},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

pub mod quotes;

mod config;
mod data;
mod error;
mod utils;

pub use config::{CrawlConfig, DEFAULT_START_URL};
pub use data::Table;
pub use error::CrawlerError;

pub enum CrawlerResult<R> {
    Links(Vec<Url>),
    RecordsAndLinks(Vec<Result<R, CrawlerError>>, Vec<Url>),
}

pub trait Crawler {
    type Record: Send + std::fmt::Display;

    fn can_be_scrapped(&self, doc: &Html) -> bool;
    fn crawl(&self, url: &Url, doc: &Html) -> CrawlerResult<Self::Record>;
    fn extract_links(&self, url: &Url, doc: &Html) -> Vec<Url>;
}

#[async_trait::async_trait]
pub trait Storage {
    type Record;

    async fn results_insert(&self, record: Self::Record) -> Result<(), CrawlerError>;
    async fn results_count(&self) -> Result<u32, CrawlerError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlStats {
    pub pages: u64,
    pub records: u64,
    pub failures: u64,
}

/// Spaces consecutive requests by at least `delay`.
struct Throttle {
    last_request: Mutex<Option<Instant>>,
    delay: Duration,
}

impl Throttle {
    fn new(delay: Duration) -> Self {
        Throttle {
            last_request: Mutex::new(None),
            delay,
        }
    }

    async fn wait(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(last_request) = *last_request {
            let elapsed = last_request.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        last_request.replace(Instant::now());
    }
}

struct Fetcher {
    client: Client,
    throttle: Throttle,
    retries: u32,
    retry_backoff: Duration,
}

impl Fetcher {
    fn new(config: &CrawlConfig) -> Result<Self, CrawlerError> {
        Ok(Fetcher {
            client: Client::builder()
                .user_agent(config.user_agent.as_str())
                .build()?,
            throttle: Throttle::new(config.request_delay),
            retries: config.retries,
            retry_backoff: config.retry_backoff,
        })
    }

    /// Delay before retry number `attempt + 1`, doubling each time.
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn fetch(&self, url: &Url) -> Result<String, CrawlerError> {
        let mut attempt = 0;
        loop {
            self.throttle.wait().await;

            debug!("Visit {}", url);
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .and_then(Response::error_for_status);

            match response {
                Ok(response) => return Ok(response.text().await?),
                Err(e) if attempt < self.retries && is_retryable(&e) => {
                    let backoff = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "Request to {} failed ({}), retry {}/{} in {:.1}s",
                        url,
                        e,
                        attempt,
                        self.retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_retryable(e: &reqwest::Error) -> bool {
    match e.status() {
        Some(status) => {
            status.is_server_error()
                || status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::REQUEST_TIMEOUT
        }
        None => e.is_connect() || e.is_timeout(),
    }
}

/// Only links on the start url's host are followed.
fn should_follow(start_url: &Url, link: &Url) -> bool {
    matches!(link.scheme(), "http" | "https") && link.host_str() == start_url.host_str()
}

type Fetched = (Url, Result<String, CrawlerError>);

fn spawn_fetch(
    url: Url,
    fetcher: Arc<Fetcher>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<Fetched>,
) {
    tokio::spawn(async move {
        let html = match semaphore.acquire_owned().await {
            Ok(_permit) => fetcher.fetch(&url).await,
            Err(_) => Err(CrawlerError::SchedulerClosed),
        };
        if tx.send((url, html)).await.is_err() {
            debug!("Crawl loop is gone, dropping response");
        }
    });
}

/// Crawls from `start_url` until no page is left to visit.
///
/// Pages are downloaded concurrently, but parsing and every
/// [`Storage::results_insert`] call happen on the calling task, one record
/// at a time, in the order responses arrive. A record that fails to extract
/// or to store is logged and counted in [`CrawlStats::failures`]; the crawl
/// goes on.
pub async fn run_crawler<C, S>(
    crawler: &C,
    storage: &S,
    start_url: &str,
    config: &CrawlConfig,
) -> Result<CrawlStats, CrawlerError>
where
    C: Crawler,
    S: Storage<Record = C::Record>,
{
    let start_url = Url::parse(start_url)?;
    let fetcher = Arc::new(Fetcher::new(config)?);
    let concurrency = config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::channel::<Fetched>(concurrency * 2);

    let mut stats = CrawlStats::default();
    let mut seen = HashSet::new();
    seen.insert(start_url.clone());
    spawn_fetch(
        start_url.clone(),
        fetcher.clone(),
        semaphore.clone(),
        tx.clone(),
    );
    let mut in_flight = 1usize;

    info!("Start crawling {}", start_url);

    while in_flight > 0 {
        let Some((url, html)) = rx.recv().await else {
            break;
        };
        in_flight -= 1;

        let html = match html {
            Ok(html) => html,
            Err(e) => {
                warn!("Failed to fetch {}: {}", url, e);
                stats.failures += 1;
                continue;
            }
        };
        stats.pages += 1;

        let result = {
            let doc = Html::parse_document(&html);
            crawler.crawl(&url, &doc)
        };

        let (records, links) = match result {
            CrawlerResult::Links(links) => (vec![], links),
            CrawlerResult::RecordsAndLinks(records, links) => (records, links),
        };

        for mut link in links {
            link.set_fragment(None);
            if !should_follow(&start_url, &link) {
                debug!("Skip offsite link {}", link);
                continue;
            }
            if seen.insert(link.clone()) {
                spawn_fetch(link, fetcher.clone(), semaphore.clone(), tx.clone());
                in_flight += 1;
            }
        }

        for record in records {
            let stored = match record {
                Ok(record) => {
                    debug!("Extracted from {}\n{}", url, record);
                    storage.results_insert(record).await
                }
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => stats.records += 1,
                Err(e) => {
                    warn!("Dropped record from {}: {}", url, e);
                    stats.failures += 1;
                }
            }
        }
    }

    info!(
        "Crawl finished: {} pages, {} records, {} failures",
        stats.pages, stats.records, stats.failures
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_only_same_host() {
        let start = Url::parse(DEFAULT_START_URL).unwrap();

        let next = start.join("/page/2/").unwrap();
        let author = start.join("/author/Jane-Austen").unwrap();
        let offsite = Url::parse("https://www.goodreads.com/quotes").unwrap();
        let mail = Url::parse("mailto:someone@quotes.toscrape.com").unwrap();

        assert!(should_follow(&start, &next));
        assert!(should_follow(&start, &author));
        assert!(!should_follow(&start, &offsite));
        assert!(!should_follow(&start, &mail));
    }

    #[tokio::test]
    async fn throttle_spaces_requests() {
        let throttle = Throttle::new(Duration::from_millis(40));

        let begin = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        throttle.wait().await;

        assert!(begin.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn throttle_without_delay_does_not_wait() {
        let throttle = Throttle::new(Duration::ZERO);

        let begin = Instant::now();
        throttle.wait().await;
        throttle.wait().await;

        assert!(begin.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let fetcher = Fetcher::new(&CrawlConfig::default()).unwrap();

        assert_eq!(fetcher.backoff(0), Duration::from_millis(500));
        assert_eq!(fetcher.backoff(1), Duration::from_millis(1000));
        assert_eq!(fetcher.backoff(3), Duration::from_millis(4000));
        assert_eq!(fetcher.backoff(64), fetcher.backoff(u32::MAX));
    }

    #[tokio::test]
    async fn closed_scheduler_still_reports_the_url() {
        let fetcher = Arc::new(Fetcher::new(&CrawlConfig::default()).unwrap());
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.close();
        let (tx, mut rx) = mpsc::channel(1);
        let url = Url::parse("http://quotes.toscrape.com/").unwrap();

        spawn_fetch(url.clone(), fetcher, semaphore, tx);

        let (fetched, html) = rx.recv().await.unwrap();
        assert_eq!(fetched, url);
        assert!(matches!(html, Err(CrawlerError::SchedulerClosed)));
    }

    mod crawl {
        use crate::quotes::{QuotesCrawler, QuotesData};
        use crate::{run_crawler, CrawlConfig, CrawlStats, Storage, Table};
        use chrono::NaiveDate;
        use mockito::{Mock, Server};
        use sqlx::sqlite::SqlitePoolOptions;
        use std::fs;
        use tokio::time::Duration;

        async fn memory_data() -> QuotesData {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap();
            QuotesData::with_pool(pool).await.unwrap()
        }

        fn test_config() -> CrawlConfig {
            CrawlConfig {
                request_delay: Duration::ZERO,
                retries: 2,
                retry_backoff: Duration::from_millis(1),
                ..CrawlConfig::default()
            }
        }

        /// One quote block per `(author, slug, tag)`, no next page.
        fn listing_page(quotes: &[(&str, &str, &str)]) -> String {
            let blocks = quotes
                .iter()
                .map(|(author, slug, tag)| {
                    format!(
                        r#"<div class="quote">
                            <span class="text">“Said by {author}.”</span>
                            <span>by <small class="author">{author}</small>
                            <a href="/author/{slug}">(about)</a></span>
                            <div class="tags">Tags: <a class="tag" href="/tag/{tag}/page/1/">{tag}</a></div>
                        </div>"#
                    )
                })
                .collect::<String>();
            format!("<html><body>{blocks}</body></html>")
        }

        fn author_page(name: &str, born: &str, location: &str) -> String {
            format!(
                r#"<html><body><div class="author-details">
                    <h3 class="author-title">{name}</h3>
                    <p><strong>Born:</strong> <span class="author-born-date">{born}</span>
                    <span class="author-born-location">in {location}</span></p>
                    <div class="author-description">{name} wrote things.</div>
                </div></body></html>"#
            )
        }

        async fn serve(
            server: &mut Server,
            path: &str,
            status: usize,
            body: &str,
            hits: usize,
        ) -> Mock {
            server
                .mock("GET", path)
                .with_status(status)
                .with_header("content-type", "text/html; charset=utf-8")
                .with_body(body)
                .expect(hits)
                .create_async()
                .await
        }

        #[tokio::test]
        async fn crawl_visits_each_page_once() {
            let mut server = Server::new_async().await;
            let listing =
                fs::read_to_string("tests/htmls/listing.html").expect("Invalid file url");
            let einstein =
                fs::read_to_string("tests/htmls/author.html").expect("Invalid file url");

            let mocks = vec![
                serve(&mut server, "/", 200, &listing, 1).await,
                serve(
                    &mut server,
                    "/page/2/",
                    200,
                    &listing_page(&[("Albert Einstein", "Albert-Einstein", "humor")]),
                    1,
                )
                .await,
                serve(&mut server, "/author/Albert-Einstein", 200, &einstein, 1).await,
                serve(
                    &mut server,
                    "/author/J-K-Rowling",
                    200,
                    &author_page(
                        "J.K. Rowling",
                        "July 31, 1965",
                        "Yate, South Gloucestershire, England",
                    ),
                    1,
                )
                .await,
                serve(
                    &mut server,
                    "/author/Jane-Austen",
                    200,
                    &author_page(
                        "Jane Austen",
                        "December 16, 1775",
                        "Steventon Rectory, Hampshire, The United Kingdom",
                    ),
                    1,
                )
                .await,
            ];

            let data = memory_data().await;
            let start = format!("{}/", server.url());
            let stats = run_crawler(&QuotesCrawler, &data, &start, &test_config())
                .await
                .unwrap();

            for mock in mocks {
                mock.assert_async().await;
            }
            assert_eq!(
                stats,
                CrawlStats {
                    pages: 5,
                    records: 8,
                    failures: 0,
                }
            );
            assert_eq!(data.results_count().await.unwrap(), 5);
            assert_eq!(data.authors.count().await.unwrap(), 3);
            assert_eq!(data.tags.count().await.unwrap(), 10);

            let einstein = data.authors.find("Albert Einstein").await.unwrap().unwrap();
            assert_eq!(einstein.born_date, NaiveDate::from_ymd_opt(1879, 3, 14));
            assert_eq!(einstein.born_location.as_deref(), Some("Ulm, Germany"));
            assert!(einstein.bio.is_some());
        }

        #[tokio::test]
        async fn server_error_is_retried_then_counted() {
            let mut server = Server::new_async().await;
            let root = serve(
                &mut server,
                "/",
                200,
                &listing_page(&[("Broken Author", "Broken-Author", "lost")]),
                1,
            )
            .await;
            let broken = serve(&mut server, "/author/Broken-Author", 500, "", 3).await;

            let data = memory_data().await;
            let start = format!("{}/", server.url());
            let stats = run_crawler(&QuotesCrawler, &data, &start, &test_config())
                .await
                .unwrap();

            root.assert_async().await;
            broken.assert_async().await;
            assert_eq!(
                stats,
                CrawlStats {
                    pages: 1,
                    records: 1,
                    failures: 1,
                }
            );
            assert_eq!(data.results_count().await.unwrap(), 1);
            let stub = data.authors.find("Broken Author").await.unwrap().unwrap();
            assert_eq!(stub.bio, None);
        }

        #[tokio::test]
        async fn not_found_is_not_retried() {
            let mut server = Server::new_async().await;
            let root = serve(
                &mut server,
                "/",
                200,
                &listing_page(&[("Missing Author", "Missing-Author", "lost")]),
                1,
            )
            .await;
            let missing = serve(&mut server, "/author/Missing-Author", 404, "", 1).await;

            let data = memory_data().await;
            let start = format!("{}/", server.url());
            let stats = run_crawler(&QuotesCrawler, &data, &start, &test_config())
                .await
                .unwrap();

            root.assert_async().await;
            missing.assert_async().await;
            assert_eq!(
                stats,
                CrawlStats {
                    pages: 1,
                    records: 1,
                    failures: 1,
                }
            );
        }
    }
}
