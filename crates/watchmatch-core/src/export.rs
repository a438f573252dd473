use crate::enrichment::EnrichedMatch;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use watchmatch_models::KeyConfidence;

#[derive(Debug, Serialize)]
struct MatchRow<'a> {
    title: &'a str,
    year: Option<u16>,
    friend_count: usize,
    friends: String,
    rating: Option<f32>,
    poster_url: Option<&'a str>,
    external_id: Option<u64>,
    runtime_minutes: Option<u32>,
    genres: Option<String>,
    director: Option<&'a str>,
    /// Matched on title alone; the year may belong to a different film
    title_only_match: bool,
}

impl<'a> From<&'a EnrichedMatch> for MatchRow<'a> {
    fn from(m: &'a EnrichedMatch) -> Self {
        let metadata = m.metadata.as_ref();
        Self {
            title: &m.result.title,
            year: m.result.year,
            friend_count: m.result.friend_count(),
            friends: m
                .result
                .matching_friend_ids
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(";"),
            rating: metadata.and_then(|md| md.rating),
            poster_url: metadata.and_then(|md| md.poster_url.as_deref()),
            external_id: metadata.and_then(|md| md.external_id),
            runtime_minutes: metadata.and_then(|md| md.runtime_minutes),
            genres: metadata.filter(|md| !md.genres.is_empty()).map(|md| md.genres.join(";")),
            director: metadata.and_then(|md| md.director.as_deref()),
            title_only_match: m.result.confidence == KeyConfidence::Low,
        }
    }
}

/// Write matches as CSV with a header row, in the order given
pub fn write_matches_csv<W: Write>(writer: W, matches: &[EnrichedMatch]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for m in matches {
        csv.serialize(MatchRow::from(m)).context("Failed to write CSV row")?;
    }
    csv.flush().context("Failed to flush CSV output")?;
    Ok(())
}

pub fn export_matches_csv(path: &Path, matches: &[EnrichedMatch]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create export directory: {:?}", parent))?;
        }
    }
    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    write_matches_csv(file, matches)?;
    tracing::info!(operation = "export_matches", path = ?path, rows = matches.len(), "Exported matches");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use watchmatch_models::{FriendId, MatchResult, MovieMetadata};

    fn enriched(title: &str, year: u16, friends: &[&str], rating: Option<f32>) -> EnrichedMatch {
        let key = crate::normalize::normalize(title, Some(year));
        let now = Utc::now();
        EnrichedMatch {
            metadata: rating.map(|r| MovieMetadata {
                normalized_key: key.clone(),
                external_id: Some(42),
                title: Some(title.to_string()),
                poster_url: Some("https://image.test/p.jpg".to_string()),
                rating: Some(r),
                overview: None,
                release_date: None,
                runtime_minutes: Some(148),
                genres: vec!["Action".to_string(), "Science Fiction".to_string()],
                director: Some("Christopher Nolan".to_string()),
                fetched_at: now,
                ttl_expires_at: now,
            }),
            result: MatchResult {
                normalized_key: key,
                title: title.to_string(),
                year: Some(year),
                matching_friend_ids: friends.iter().map(|f| FriendId::new(*f)).collect(),
                primary_user_has: true,
                confidence: KeyConfidence::High,
            },
        }
    }

    #[test]
    fn test_csv_layout() {
        let mut out = Vec::new();
        write_matches_csv(
            &mut out,
            &[
                enriched("Inception", 2010, &["bob", "alice"], Some(8.5)),
                enriched("Heat, Part 1", 1995, &["alice"], None),
            ],
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "title,year,friend_count,friends,rating,poster_url,external_id,runtime_minutes,genres,director,title_only_match"
        );
        assert_eq!(
            lines[1],
            "Inception,2010,2,alice;bob,8.5,https://image.test/p.jpg,42,148,Action;Science Fiction,Christopher Nolan,false"
        );
        assert_eq!(lines[2], "\"Heat, Part 1\",1995,1,alice,,,,,,,false");
    }

    #[test]
    fn test_title_only_match_is_flagged() {
        let mut m = enriched("Solaris", 1972, &["alice"], None);
        m.result.year = None;
        m.result.normalized_key = crate::normalize::normalize("Solaris", None);
        m.result.confidence = KeyConfidence::Low;

        let mut out = Vec::new();
        write_matches_csv(&mut out, &[m]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().nth(1), Some("Solaris,,1,alice,,,,,,,true"));
    }

    #[test]
    fn test_export_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exports").join("matches.csv");
        export_matches_csv(&path, &[enriched("Up", 2009, &["a"], None)]).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Up,2009,1,a"));
    }
}
