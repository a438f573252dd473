use serde::{Deserialize, Serialize};
use std::fmt;
use crate::friend::FriendId;
use crate::normalized_key::NormalizedKey;

/// Monotonic per-friend snapshot number assigned by the store on commit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GenerationId(pub i64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// One listing row as parsed from a watchlist page, before normalization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEntry {
    pub title: String,
    pub year: Option<u16>,
    /// Site-specific film slug, when the page exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl RawEntry {
    pub fn new(title: impl Into<String>, year: Option<u16>) -> Self {
        Self { title: title.into(), year, slug: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchlistEntry {
    pub normalized_key: NormalizedKey,
    pub raw_title: String,
    pub year: Option<u16>,
    pub friend_id: FriendId,
    pub generation_id: GenerationId,
}
