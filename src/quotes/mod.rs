mod crawler;
mod data;

pub use crawler::QuotesCrawler;
pub use data::{
    Author, AuthorTable, NewAuthor, QuoteTable, QuoteTagTable, QuotesData, StoredQuote, TagTable,
};

use chrono::NaiveDate;
use lazy_regex::regex;
use std::fmt;

/// A quote as it appears on a listing page.
///
/// The author is only known by name here; biography fields come from the
/// author's own page and are carried by [`AuthorRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRecord {
    pub content: String,
    pub author: Option<String>,
    pub tags: Vec<String>,
}

/// An author detail page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorRecord {
    pub fullname: String,
    pub born_date: NaiveDate,
    pub born_location: String,
    pub bio: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotesRecord {
    Quote(QuoteRecord),
    Author(AuthorRecord),
}

/// Canonical form of an author name, used as the identity key of `authors`.
///
/// Both ingestion paths (quote attribution and author page) go through here,
/// so the same person always maps to the same row.
pub fn normalize_author_name(name: &str) -> String {
    regex!(r"\s+")
        .replace_all(name.replace('-', " ").trim(), " ")
        .into_owned()
}

impl fmt::Display for QuoteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Quote           : {}", self.content)?;
        if let Some(d) = self.author.as_ref() {
            writeln!(f, "Author          : {}", d)?;
        } else {
            writeln!(f, "Author          : None")?;
        };
        writeln!(f, "Tags            : {}", self.tags.join(", "))
    }
}

impl fmt::Display for AuthorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Full Name       : {}", self.fullname)?;
        writeln!(f, "Born Date       : {}", self.born_date)?;
        writeln!(f, "Born Location   : {}", self.born_location)?;
        writeln!(f, "Bio             : ")?;
        writeln!(f, "> {}", self.bio.replace('\n', "\n  "))
    }
}

impl fmt::Display for QuotesRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotesRecord::Quote(q) => fmt::Display::fmt(q, f),
            QuotesRecord::Author(a) => fmt::Display::fmt(a, f),
        }
    }
}
