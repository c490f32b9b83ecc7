#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("Database error")]
    DatabaseError(#[from] sqlx::error::Error),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Missing field `{0}`")]
    MissingField(&'static str),

    #[error("Request scheduler closed")]
    SchedulerClosed,

    #[error("Invalid date {0:?}: {1}")]
    InvalidDate(String, chrono::ParseError),
}
