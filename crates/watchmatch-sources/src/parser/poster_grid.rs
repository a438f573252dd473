use super::{parse_year, selector, PageFormat, PageParser, WatchlistPage};
use crate::error::SourceError;
use scraper::{ElementRef, Html};
use tracing::debug;
use watchmatch_models::RawEntry;

/// HTML watchlist page: `ul.poster-list` of `li.poster-container` items.
///
/// The film name comes from a `data-film-name` attribute, falling back to the
/// poster image's `alt` text. The next page is signalled by an `a.next` link.
pub struct PosterGridParser;

impl PageParser for PosterGridParser {
    fn format(&self) -> PageFormat {
        PageFormat::PosterGrid
    }

    fn parse(&self, body: &str) -> Result<WatchlistPage, SourceError> {
        let document = Html::parse_document(body);
        let list_selector = selector("ul.poster-list")?;
        let item_selector = selector("li.poster-container")?;
        let named_selector = selector("[data-film-name]")?;
        let img_selector = selector("img[alt]")?;
        let next_selector = selector("a.next")?;
        let count_selector = selector("span.js-watchlist-count")?;

        let items: Vec<ElementRef> = document.select(&item_selector).collect();
        if items.is_empty() && document.select(&list_selector).next().is_none() {
            return Err(SourceError::NoListing("watchlist page has no poster list".to_string()));
        }

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let named = item.select(&named_selector).next();
            let title = named
                .and_then(|el| el.value().attr("data-film-name"))
                .or_else(|| {
                    item.select(&img_selector)
                        .next()
                        .and_then(|img| img.value().attr("alt"))
                })
                .map(str::trim)
                .filter(|t| !t.is_empty());

            let Some(title) = title else {
                debug!("Skipping poster without a film name");
                continue;
            };

            let year = named
                .and_then(|el| el.value().attr("data-film-release-year"))
                .and_then(parse_year);
            let slug = named
                .and_then(|el| el.value().attr("data-film-slug"))
                .map(|s| s.to_string());

            entries.push(RawEntry {
                title: title.to_string(),
                year,
                slug,
            });
        }

        let has_next = document.select(&next_selector).next().is_some();
        let total_hint = document
            .select(&count_selector)
            .next()
            .and_then(|el| {
                // e.g. "7,727 films"
                let digits: String = el
                    .text()
                    .collect::<String>()
                    .chars()
                    .filter(|c| c.is_ascii_digit())
                    .collect();
                digits.parse::<usize>().ok()
            });

        Ok(WatchlistPage {
            entries,
            has_next,
            total_hint,
        })
    }
}
