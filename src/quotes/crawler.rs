use crate::{
    quotes::{normalize_author_name, AuthorRecord, QuoteRecord, QuotesRecord},
    Crawler, CrawlerError, CrawlerResult,
};
use chrono::NaiveDate;
use itertools::Itertools;
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use url::Url;

const E: &str = "Invalid selector";
lazy_static! {
    static ref QUOTE: Selector = Selector::parse("div.quote").expect(E);
    static ref QUOTE_TEXT: Selector = Selector::parse("span.text").expect(E);
    static ref QUOTE_AUTHOR: Selector = Selector::parse("small.author").expect(E);
    static ref QUOTE_TAG: Selector = Selector::parse("div.tags > a").expect(E);
    static ref AUTHOR_LINK: Selector = Selector::parse("span > a[href]").expect(E);
    static ref NEXT: Selector = Selector::parse("li.next > a[href]").expect(E);
    static ref AUTHOR_DETAILS: Selector = Selector::parse("div.author-details").expect(E);
    static ref AUTHOR_TITLE: Selector = Selector::parse("h3").expect(E);
    static ref BORN_DATE: Selector = Selector::parse("span.author-born-date").expect(E);
    static ref BORN_LOCATION: Selector = Selector::parse("span.author-born-location").expect(E);
    static ref DESCRIPTION: Selector = Selector::parse("div.author-description").expect(E);
}

const BORN_DATE_FORMAT: &str = "%B %d, %Y";

/// Crawler for quotes.toscrape.com.
///
/// Listing pages yield one [`QuoteRecord`] per quote block plus the author
/// pages and the next listing page as links. Author pages yield a single
/// [`AuthorRecord`].
#[derive(Debug, Default, Clone, Copy)]
pub struct QuotesCrawler;

impl Crawler for QuotesCrawler {
    type Record = QuotesRecord;

    fn can_be_scrapped(&self, doc: &Html) -> bool {
        doc.select(&AUTHOR_DETAILS).next().is_some() || doc.select(&QUOTE).next().is_some()
    }

    fn extract_links(&self, url: &Url, doc: &Html) -> Vec<Url> {
        doc.select(&QUOTE)
            .filter_map(|quote| quote.select(&AUTHOR_LINK).next())
            .chain(doc.select(&NEXT))
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| url.join(l).ok())
            .unique()
            .collect()
    }

    fn crawl(&self, url: &Url, doc: &Html) -> CrawlerResult<Self::Record> {
        if !self.can_be_scrapped(doc) {
            return CrawlerResult::Links(vec![]);
        }

        if let Some(details) = doc.select(&AUTHOR_DETAILS).next() {
            let author = extract_author(details).map(QuotesRecord::Author);
            return CrawlerResult::RecordsAndLinks(vec![author], vec![]);
        }

        let quotes = doc
            .select(&QUOTE)
            .map(|quote| extract_quote(quote).map(QuotesRecord::Quote))
            .collect();
        CrawlerResult::RecordsAndLinks(quotes, self.extract_links(url, doc))
    }
}

fn extract_quote(el: ElementRef) -> Result<QuoteRecord, CrawlerError> {
    let tags = el.select(&QUOTE_TAG).map(text_of).collect();

    let author = normalize_author_name(&select_text(el, &QUOTE_AUTHOR, "author")?);
    let author = (!author.is_empty()).then_some(author);

    let content = strip_quote_marks(&select_text(el, &QUOTE_TEXT, "quote")?);

    Ok(QuoteRecord {
        content,
        author,
        tags,
    })
}

fn extract_author(el: ElementRef) -> Result<AuthorRecord, CrawlerError> {
    let fullname = normalize_author_name(&select_text(el, &AUTHOR_TITLE, "fullname")?);
    let born_date = parse_born_date(&select_text(el, &BORN_DATE, "born_date")?)?;
    let born_location = strip_location_prefix(&select_text(el, &BORN_LOCATION, "born_location")?);
    let bio = select_text(el, &DESCRIPTION, "bio")?.trim().to_string();

    Ok(AuthorRecord {
        fullname,
        born_date,
        born_location,
        bio,
    })
}

fn text_of(el: ElementRef) -> String {
    el.text().collect()
}

fn select_text(
    el: ElementRef,
    selector: &Selector,
    field: &'static str,
) -> Result<String, CrawlerError> {
    el.select(selector)
        .next()
        .map(text_of)
        .ok_or(CrawlerError::MissingField(field))
}

/// Drops the opening and closing quotation marks around a quote.
fn strip_quote_marks(text: &str) -> String {
    let mut chars = text.chars();
    chars.next();
    chars.next_back();
    chars.as_str().to_string()
}

/// Drops the leading "in " of a birth location.
fn strip_location_prefix(text: &str) -> String {
    text.trim().chars().skip(3).collect()
}

fn parse_born_date(text: &str) -> Result<NaiveDate, CrawlerError> {
    let text = text.trim().replace('-', " ");
    match NaiveDate::parse_from_str(&text, BORN_DATE_FORMAT) {
        Ok(date) => Ok(date),
        Err(e) => Err(CrawlerError::InvalidDate(text, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_quote_marks() {
        assert_eq!(strip_quote_marks("“Test quote.”"), "Test quote.");
        assert_eq!(strip_quote_marks("\"plain\""), "plain");
        assert_eq!(strip_quote_marks("“"), "");
        assert_eq!(strip_quote_marks(""), "");
    }

    #[test]
    fn strips_location_prefix() {
        assert_eq!(
            strip_location_prefix("in Concord, Massachusetts"),
            "Concord, Massachusetts"
        );
        assert_eq!(strip_location_prefix("  in Ulm, Germany\n"), "Ulm, Germany");
        assert_eq!(strip_location_prefix("in"), "");
    }

    #[test]
    fn parses_born_date() {
        assert_eq!(
            parse_born_date("June 3, 1821").unwrap(),
            NaiveDate::from_ymd_opt(1821, 6, 3).unwrap()
        );
        assert_eq!(
            parse_born_date("  March 14, 1879 ").unwrap(),
            NaiveDate::from_ymd_opt(1879, 3, 14).unwrap()
        );
        assert_eq!(
            parse_born_date("December-16, 1775").unwrap(),
            NaiveDate::from_ymd_opt(1775, 12, 16).unwrap()
        );
    }

    #[test]
    fn rejects_invalid_born_date() {
        assert!(matches!(
            parse_born_date("1879-03-14"),
            Err(CrawlerError::InvalidDate(text, _)) if text == "1879 03 14"
        ));
        assert!(matches!(
            parse_born_date("Smarch 1, 1900"),
            Err(CrawlerError::InvalidDate(_, _))
        ));
    }

    #[test]
    fn missing_field_fails_only_that_quote() {
        let c = QuotesCrawler;
        let url = Url::parse("http://quotes.toscrape.com/").unwrap();
        let doc = Html::parse_document(
            r#"<html><body>
                <div class="quote">
                    <span>by <small class="author">Mark Twain</small>
                    <a href="/author/Mark-Twain">(about)</a></span>
                </div>
                <div class="quote">
                    <span class="text">“Test quote.”</span>
                    <span>by <small class="author">Mark Twain</small>
                    <a href="/author/Mark-Twain">(about)</a></span>
                    <div class="tags">Tags: <a class="tag" href="/tag/books/page/1/">books</a></div>
                </div>
            </body></html>"#,
        );

        let CrawlerResult::RecordsAndLinks(records, links) = c.crawl(&url, &doc) else {
            panic!("Listing page is scrapable");
        };
        assert_eq!(records.len(), 2);
        assert!(matches!(
            &records[0],
            Err(CrawlerError::MissingField("quote"))
        ));
        assert!(matches!(
            &records[1],
            Ok(QuotesRecord::Quote(q)) if q.content == "Test quote." && q.tags == vec!["books".to_string()]
        ));
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn author_page_with_bad_date_is_an_error() {
        let c = QuotesCrawler;
        let url = Url::parse("http://quotes.toscrape.com/author/Nobody").unwrap();
        let doc = Html::parse_document(
            r#"<html><body><div class="author-details">
                <h3 class="author-title">Nobody</h3>
                <p><strong>Born:</strong> <span class="author-born-date">someday</span>
                <span class="author-born-location">in Nowhere</span></p>
                <div class="author-description">Nothing.</div>
            </div></body></html>"#,
        );

        let CrawlerResult::RecordsAndLinks(records, _) = c.crawl(&url, &doc) else {
            panic!("Author page is scrapable");
        };
        assert!(matches!(
            records.as_slice(),
            [Err(CrawlerError::InvalidDate(_, _))]
        ));
    }
}
