use std::time::Duration;

pub const DEFAULT_START_URL: &str = "http://quotes.toscrape.com/";

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub user_agent: String,

    /// Maximum number of requests in flight.
    pub concurrency: usize,

    /// Minimum spacing between two consecutive requests.
    pub request_delay: Duration,

    /// How many times a failed request is retried before the page is dropped.
    pub retries: u32,

    /// Delay before the first retry; doubled for each further one.
    pub retry_backoff: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            concurrency: default_concurrency(),
            request_delay: default_request_delay(),
            retries: default_retries(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

fn default_user_agent() -> String {
    format!("quotes-crawler/{}", env!("CARGO_PKG_VERSION"))
}

fn default_concurrency() -> usize {
    16
}

fn default_request_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_retries() -> u32 {
    2
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}
