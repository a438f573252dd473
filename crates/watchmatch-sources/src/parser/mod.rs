//! Watchlist page parsing.
//!
//! The site serves listings in more than one shape. [`detect_format`] picks
//! the variant from the response, and [`parser_for`] returns the matching
//! [`PageParser`]. Bodies that match no known variant are a parse failure,
//! never an empty page.

mod friends;
mod json_listing;
mod poster_grid;


pub use friends::{parse_friends_page, FriendsPage};
pub use json_listing::JsonListingParser;
pub use poster_grid::PosterGridParser;

use crate::error::SourceError;
use scraper::Selector;
use watchmatch_models::RawEntry;

/// One page of a watchlist listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchlistPage {
    pub entries: Vec<RawEntry>,
    /// The page carries an explicit link/flag to a following page
    pub has_next: bool,
    /// Total watchlist size when the page advertises it (progress display only)
    pub total_hint: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    /// Server-rendered HTML grid of posters
    PosterGrid,
    /// JSON document with an entries array
    JsonListing,
}

pub trait PageParser: Send + Sync {
    fn format(&self) -> PageFormat;

    fn parse(&self, body: &str) -> Result<WatchlistPage, SourceError>;
}

/// Decide which parser understands `body`.
///
/// The `Content-Type` header wins when it names JSON; otherwise the body is
/// sniffed. Returns `None` for anything unrecognised.
pub fn detect_format(body: &str, content_type: Option<&str>) -> Option<PageFormat> {
    if let Some(content_type) = content_type {
        if content_type.to_ascii_lowercase().contains("json") {
            return Some(PageFormat::JsonListing);
        }
    }

    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        return Some(PageFormat::JsonListing);
    }

    // Only the head of the document is needed to recognise HTML
    let head: String = trimmed.chars().take(4096).collect::<String>().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") || body.contains("poster-container") {
        return Some(PageFormat::PosterGrid);
    }

    None
}

pub fn parser_for(format: PageFormat) -> &'static dyn PageParser {
    match format {
        PageFormat::PosterGrid => &PosterGridParser,
        PageFormat::JsonListing => &JsonListingParser,
    }
}

/// Detect the format and parse in one step
pub fn parse_page(body: &str, content_type: Option<&str>) -> Result<WatchlistPage, SourceError> {
    let format = detect_format(body, content_type)
        .ok_or_else(|| SourceError::Parse("unrecognised page format".to_string()))?;
    parser_for(format).parse(body)
}

pub(crate) fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(e.to_string()))
}

/// Accept only plausible release years
pub(crate) fn parse_year(raw: &str) -> Option<u16> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|year| (1870..=2100).contains(year))
}
