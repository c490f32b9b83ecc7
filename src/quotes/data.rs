use super::{AuthorRecord, QuoteRecord, QuotesRecord};
use crate::{utils, CrawlerError, Storage, Table};
use chrono::{DateTime, FixedOffset, NaiveDate};
use futures::TryStreamExt;
use itertools::Itertools;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqliteConnection, SqlitePool};
use std::{fmt, path::Path};
use tracing::{debug, info};

const AUTHORS: &str = "authors";
const TAGS: &str = "tags";
const QUOTES: &str = "quotes";
const QUOTE_TAGS: &str = "quote_m2m_tag";

/// Row of `authors`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Author {
    pub id: i64,
    pub fullname: String,
    pub born_date: Option<NaiveDate>,
    pub born_location: Option<String>,
    pub bio: Option<String>,
    pub created: DateTime<FixedOffset>,
}

/// A quote read back with its author name and tag names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredQuote {
    pub id: i64,
    pub content: String,
    pub author: Option<String>,
    pub tags: Vec<String>,
}

impl fmt::Display for StoredQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.author.as_deref().unwrap_or("None"),
            self.tags.join(", ")
        )
    }
}

pub enum NewAuthor<'a> {
    /// Known only from a quote attribution.
    Stub(&'a str),
    Detailed(&'a AuthorRecord),
}

pub struct AuthorTable {
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl Table for AuthorTable {
    type Record<'a> = NewAuthor<'a>;

    fn get_name(&self) -> &str {
        AUTHORS
    }

    fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn get_schema(&self) -> &str {
        r#"
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fullname TEXT NOT NULL UNIQUE,
            born_date DATE,
            bio TEXT,
            born_location TEXT,
            created DATETIME
        "#
    }

    async fn insert<'a>(
        &self,
        conn: &mut SqliteConnection,
        record: Self::Record<'a>,
    ) -> Result<i64, sqlx::Error> {
        let (fullname, born_date, bio, born_location) = match record {
            NewAuthor::Stub(fullname) => (fullname, None, None, None),
            NewAuthor::Detailed(a) => (
                a.fullname.as_str(),
                Some(a.born_date),
                Some(a.bio.as_str()),
                Some(a.born_location.as_str()),
            ),
        };
        let query = format!(
            "INSERT INTO {} (fullname, born_date, bio, born_location, created) VALUES (?, ?, ?, ?, ?)",
            AUTHORS
        );
        Ok(sqlx::query(&query)
            .bind(fullname)
            .bind(born_date)
            .bind(bio)
            .bind(born_location)
            .bind(utils::get_now())
            .execute(&mut *conn)
            .await?
            .last_insert_rowid())
    }
}

impl AuthorTable {
    pub async fn find_id(
        &self,
        conn: &mut SqliteConnection,
        fullname: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        let query = format!("SELECT id FROM {} WHERE fullname = ?", AUTHORS);
        match sqlx::query(&query)
            .bind(fullname)
            .fetch_optional(&mut *conn)
            .await?
        {
            Some(row) => Ok(Some(row.try_get("id")?)),
            None => Ok(None),
        }
    }

    /// Returns the id of the author named `fullname`, creating a stub row
    /// when there is none.
    pub async fn get_or_create(
        &self,
        conn: &mut SqliteConnection,
        fullname: &str,
    ) -> Result<i64, sqlx::Error> {
        match self.find_id(conn, fullname).await? {
            Some(id) => Ok(id),
            None => {
                debug!("New author {}", fullname);
                self.insert(conn, NewAuthor::Stub(fullname)).await
            }
        }
    }

    pub async fn update_details(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        record: &AuthorRecord,
    ) -> Result<(), sqlx::Error> {
        let query = format!(
            "UPDATE {} SET born_date = ?, bio = ?, born_location = ? WHERE id = ?",
            AUTHORS
        );
        sqlx::query(&query)
            .bind(record.born_date)
            .bind(record.bio.as_str())
            .bind(record.born_location.as_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn find(&self, fullname: &str) -> Result<Option<Author>, sqlx::Error> {
        let query = format!(
            "SELECT id, fullname, born_date, born_location, bio, created FROM {} WHERE fullname = ?",
            AUTHORS
        );
        sqlx::query_as::<_, Author>(&query)
            .bind(fullname)
            .fetch_optional(&self.pool)
            .await
    }
}

pub struct TagTable {
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl Table for TagTable {
    type Record<'a> = &'a str;

    fn get_name(&self) -> &str {
        TAGS
    }

    fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn get_schema(&self) -> &str {
        r#"
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        "#
    }

    async fn insert<'a>(
        &self,
        conn: &mut SqliteConnection,
        record: Self::Record<'a>,
    ) -> Result<i64, sqlx::Error> {
        let query = format!("INSERT INTO {} (name) VALUES (?)", TAGS);
        Ok(sqlx::query(&query)
            .bind(record)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid())
    }
}

impl TagTable {
    /// Returns the id of the tag `name`, creating it when missing.
    pub async fn get_or_create(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<i64, sqlx::Error> {
        let query = format!("SELECT id FROM {} WHERE name = ?", TAGS);
        if let Some(row) = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
        {
            return row.try_get("id");
        }
        debug!("New tag {}", name);
        self.insert(conn, name).await
    }
}

pub struct QuoteTable {
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl Table for QuoteTable {
    /// `(author_id, content)`
    type Record<'a> = (Option<i64>, &'a str);

    fn get_name(&self) -> &str {
        QUOTES
    }

    fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn get_schema(&self) -> &str {
        r#"
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            author_id INTEGER REFERENCES authors(id) ON DELETE CASCADE,
            content TEXT,
            created DATETIME
        "#
    }

    async fn insert<'a>(
        &self,
        conn: &mut SqliteConnection,
        (author_id, content): Self::Record<'a>,
    ) -> Result<i64, sqlx::Error> {
        let query = format!(
            "INSERT INTO {} (author_id, content, created) VALUES (?, ?, ?)",
            QUOTES
        );
        Ok(sqlx::query(&query)
            .bind(author_id)
            .bind(content)
            .bind(utils::get_now())
            .execute(&mut *conn)
            .await?
            .last_insert_rowid())
    }
}

pub struct QuoteTagTable {
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl Table for QuoteTagTable {
    /// `(quote_id, tag_id)`
    type Record<'a> = (i64, i64);

    fn get_name(&self) -> &str {
        QUOTE_TAGS
    }

    fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn get_schema(&self) -> &str {
        r#"
            id INTEGER PRIMARY KEY,
            tag INTEGER REFERENCES tags(id),
            quote INTEGER REFERENCES quotes(id)
        "#
    }

    async fn insert<'a>(
        &self,
        conn: &mut SqliteConnection,
        (quote, tag): Self::Record<'a>,
    ) -> Result<i64, sqlx::Error> {
        let query = format!("INSERT INTO {} (tag, quote) VALUES (?, ?)", QUOTE_TAGS);
        Ok(sqlx::query(&query)
            .bind(tag)
            .bind(quote)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid())
    }
}

pub struct QuotesData {
    pub authors: AuthorTable,
    pub tags: TagTable,
    pub quotes: QuoteTable,
    pub quote_tags: QuoteTagTable,
    pool: SqlitePool,
}

impl QuotesData {
    /// Opens (or creates) the database file at `path`.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<QuotesData, CrawlerError> {
        let opt = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opt).await?;
        QuotesData::with_pool(pool).await
    }

    /// Uses an existing pool, creating the missing tables.
    pub async fn with_pool(pool: SqlitePool) -> Result<QuotesData, CrawlerError> {
        let d = QuotesData {
            authors: AuthorTable { pool: pool.clone() },
            tags: TagTable { pool: pool.clone() },
            quotes: QuoteTable { pool: pool.clone() },
            quote_tags: QuoteTagTable { pool: pool.clone() },
            pool,
        };

        d.authors.create().await?;
        d.tags.create().await?;
        d.quotes.create().await?;
        d.quote_tags.create().await?;

        Ok(d)
    }

    /// Stores a scraped quote with its tags and author in one transaction.
    ///
    /// Tags and the author are looked up by name and created when missing.
    /// The quote itself is always inserted, so ingesting the same record
    /// twice yields two quote rows.
    pub async fn insert_quote(&self, record: &QuoteRecord) -> Result<i64, CrawlerError> {
        let mut tx = self.pool.begin().await?;

        let mut tag_ids = vec![];
        for name in &record.tags {
            tag_ids.push(self.tags.get_or_create(&mut tx, name).await?);
        }

        let author_id = match record.author.as_deref() {
            Some(fullname) => Some(self.authors.get_or_create(&mut tx, fullname).await?),
            None => None,
        };

        let quote_id = self
            .quotes
            .insert(&mut tx, (author_id, record.content.as_str()))
            .await?;
        for tag_id in tag_ids.into_iter().unique() {
            self.quote_tags.insert(&mut tx, (quote_id, tag_id)).await?;
        }

        tx.commit().await?;
        Ok(quote_id)
    }

    /// Stores an author page in one transaction.
    ///
    /// An existing row with the same full name gets its biography fields
    /// overwritten; otherwise a complete row is created.
    pub async fn upsert_author(&self, record: &AuthorRecord) -> Result<i64, CrawlerError> {
        let mut tx = self.pool.begin().await?;

        let id = match self.authors.find_id(&mut tx, &record.fullname).await? {
            Some(id) => {
                self.authors.update_details(&mut tx, id, record).await?;
                id
            }
            None => {
                self.authors
                    .insert(&mut tx, NewAuthor::Detailed(record))
                    .await?
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    /// Every stored quote in insertion order.
    pub async fn quotes(&self) -> Result<Vec<StoredQuote>, CrawlerError> {
        let query = format!(
            r#"
                SELECT q.id, q.content, a.fullname, t.name
                FROM {quotes} q
                LEFT JOIN {authors} a ON a.id = q.author_id
                LEFT JOIN {quote_tags} qt ON qt.quote = q.id
                LEFT JOIN {tags} t ON t.id = qt.tag
                ORDER BY q.id, qt.id
            "#,
            quotes = QUOTES,
            authors = AUTHORS,
            quote_tags = QUOTE_TAGS,
            tags = TAGS,
        );

        let mut quotes: Vec<StoredQuote> = vec![];
        let mut rows = sqlx::query(&query).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let id: i64 = row.try_get("id")?;
            let tag: Option<String> = row.try_get("name")?;

            match quotes.last_mut() {
                Some(last) if last.id == id => last.tags.extend(tag),
                _ => quotes.push(StoredQuote {
                    id,
                    content: row.try_get("content")?,
                    author: row.try_get("fullname")?,
                    tags: tag.into_iter().collect(),
                }),
            }
        }

        Ok(quotes)
    }
}

#[async_trait::async_trait]
impl Storage for QuotesData {
    type Record = QuotesRecord;

    async fn results_insert(&self, record: Self::Record) -> Result<(), CrawlerError> {
        match record {
            QuotesRecord::Quote(quote) => {
                let id = self.insert_quote(&quote).await?;
                info!(
                    "[{}] Insert quote by {}",
                    id,
                    quote.author.as_deref().unwrap_or("unknown author")
                );
            }
            QuotesRecord::Author(author) => {
                let id = self.upsert_author(&author).await?;
                info!("[{}] Update author {}", id, author.fullname);
            }
        }
        Ok(())
    }

    async fn results_count(&self) -> Result<u32, CrawlerError> {
        Ok(self.quotes.count().await?)
    }
}
