use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use crate::friend::FriendId;
use crate::normalized_key::{KeyConfidence, NormalizedKey};

/// How per-friend intersections are combined across the selected friends.
///
/// No `Default`: callers choose a mode explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Movies every selected friend has on their watchlist
    All,
    /// Movies at least one selected friend has on their watchlist
    Any,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::All => f.write_str("all"),
            MatchMode::Any => f.write_str("any"),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(MatchMode::All),
            "any" => Ok(MatchMode::Any),
            other => Err(format!("Invalid match mode: {}. Use 'all' or 'any'", other)),
        }
    }
}

/// A movie from the primary user's watchlist together with the friends who share it.
///
/// Always derived from the committed watchlist entries; never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchResult {
    pub normalized_key: NormalizedKey,
    /// Display title taken from the primary user's entry
    pub title: String,
    pub year: Option<u16>,
    pub matching_friend_ids: BTreeSet<FriendId>,
    pub primary_user_has: bool,
    /// `Low` when the movie matched on title alone, with no release year
    pub confidence: KeyConfidence,
}

impl MatchResult {
    pub fn friend_count(&self) -> usize {
        self.matching_friend_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_mode_parsing() {
        assert_eq!("ALL".parse::<MatchMode>(), Ok(MatchMode::All));
        assert_eq!("any".parse::<MatchMode>(), Ok(MatchMode::Any));
        assert!("some".parse::<MatchMode>().is_err());

        let mode: MatchMode = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(mode, MatchMode::Any);
        assert_eq!(MatchMode::All.to_string(), "all");
    }
}
