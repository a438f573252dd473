use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::normalized_key::NormalizedKey;

/// Cached details from the external metadata provider.
///
/// An entry with `external_id: None` records that the provider had no match;
/// it is cached like any other entry so the lookup is not repeated until the
/// TTL runs out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MovieMetadata {
    pub normalized_key: NormalizedKey,
    pub external_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub poster_url: Option<String>,
    /// Provider vote average, 0-10
    pub rating: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    /// Director names, comma separated when there are several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
}

impl MovieMetadata {
    /// Negative cache entry for a movie the provider does not know
    pub fn not_found(normalized_key: NormalizedKey, fetched_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            normalized_key,
            external_id: None,
            title: None,
            poster_url: None,
            rating: None,
            overview: None,
            release_date: None,
            runtime_minutes: None,
            genres: Vec::new(),
            director: None,
            fetched_at,
            ttl_expires_at: fetched_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl_expires_at
    }

    pub fn is_found(&self) -> bool {
        self.external_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_inclusive_of_deadline() {
        let now = Utc::now();
        let entry = MovieMetadata::not_found(
            NormalizedKey::from_parts("heat", Some(1995)),
            now - chrono::Duration::days(2),
            chrono::Duration::days(2),
        );
        assert!(entry.is_expired(now));
        assert!(!entry.is_expired(now - chrono::Duration::seconds(1)));
        assert!(!entry.is_found());
    }
}
