use super::{PageFormat, PageParser, WatchlistPage};
use crate::error::SourceError;
use serde::Deserialize;
use watchmatch_models::RawEntry;

#[derive(Debug, Deserialize)]
struct JsonListing {
    #[serde(alias = "items")]
    entries: Vec<JsonEntry>,
    #[serde(default)]
    has_next: bool,
    /// Some listings link the next page instead of flagging it
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct JsonEntry {
    #[serde(alias = "name")]
    title: String,
    #[serde(default, alias = "releaseYear")]
    year: Option<u16>,
    #[serde(default)]
    slug: Option<String>,
}

/// JSON watchlist listing: `{"entries": [{"title", "year", "slug"}], "has_next" | "next", "total"}`
pub struct JsonListingParser;

impl PageParser for JsonListingParser {
    fn format(&self) -> PageFormat {
        PageFormat::JsonListing
    }

    fn parse(&self, body: &str) -> Result<WatchlistPage, SourceError> {
        let listing: JsonListing =
            serde_json::from_str(body).map_err(|e| SourceError::Parse(format!("invalid JSON listing: {}", e)))?;

        let entries = listing
            .entries
            .into_iter()
            .filter(|e| !e.title.trim().is_empty())
            .map(|e| RawEntry {
                title: e.title.trim().to_string(),
                year: e.year,
                slug: e.slug,
            })
            .collect();

        Ok(WatchlistPage {
            entries,
            has_next: listing.has_next || listing.next.is_some_and(|n| !n.is_empty()),
            total_hint: listing.total,
        })
    }
}
