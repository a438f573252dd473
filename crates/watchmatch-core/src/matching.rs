use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use serde::Serialize;
use watchmatch_models::{FriendId, MatchMode, MatchResult, NormalizedKey, RawEntry, WatchlistEntry};
use crate::normalize::normalize_entry;


/// The primary user's watchlist, keyed by normalized key.
///
/// Captured once at batch start and read-only for the rest of the batch.
/// When two raw entries normalize to the same key the first one is kept for
/// display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchlistSnapshot {
    entries: BTreeMap<NormalizedKey, RawEntry>,
}

impl WatchlistSnapshot {
    pub fn from_raw<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = RawEntry>,
    {
        let mut snapshot = Self::default();
        for entry in entries {
            snapshot.entries.entry(normalize_entry(&entry)).or_insert(entry);
        }
        snapshot
    }

    /// Rebuild from committed store rows
    pub fn from_entries(entries: &[WatchlistEntry]) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            snapshot
                .entries
                .entry(entry.normalized_key.clone())
                .or_insert_with(|| RawEntry::new(entry.raw_title.clone(), entry.year));
        }
        snapshot
    }

    pub fn contains(&self, key: &NormalizedKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &NormalizedKey) -> Option<&RawEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &NormalizedKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// U ∩ F: keys on both the primary user's watchlist and one friend's
pub fn intersect(primary: &WatchlistSnapshot, friend_keys: &BTreeSet<NormalizedKey>) -> BTreeSet<NormalizedKey> {
    friend_keys
        .iter()
        .filter(|key| primary.contains(key))
        .cloned()
        .collect()
}

/// Combine per-friend intersections across the selected friends.
///
/// * `All`: movies every selected friend shares with the primary user.
/// * `Any`: movies at least one selected friend shares (union of the
///   pairwise intersections).
///
/// Friends absent from `friends` are simply not selected. An empty selection
/// yields no matches in either mode. Results are ordered by matching-friend
/// count descending, then by normalized title ascending (year breaks ties).
pub fn compute_matches(
    primary: &WatchlistSnapshot,
    friends: &BTreeMap<FriendId, BTreeSet<NormalizedKey>>,
    mode: MatchMode,
) -> Vec<MatchResult> {
    if friends.is_empty() {
        return Vec::new();
    }

    let mut matched: BTreeMap<NormalizedKey, BTreeSet<FriendId>> = BTreeMap::new();
    for (friend_id, keys) in friends {
        for key in intersect(primary, keys) {
            matched.entry(key).or_default().insert(friend_id.clone());
        }
    }

    if mode == MatchMode::All {
        matched.retain(|_, ids| ids.len() == friends.len());
    }

    let mut results: Vec<MatchResult> = matched
        .into_iter()
        .map(|(key, matching_friend_ids)| {
            let (title, year) = primary
                .get(&key)
                .map(|raw| (raw.title.clone(), raw.year.or(key.year())))
                .unwrap_or_else(|| (key.text().to_string(), key.year()));
            MatchResult {
                confidence: key.confidence(),
                normalized_key: key,
                title,
                year,
                matching_friend_ids,
                primary_user_has: true,
            }
        })
        .collect();

    sort_matches(&mut results);
    results
}

/// Stable ordering: friend count descending, then key ascending
pub fn sort_matches(results: &mut [MatchResult]) {
    results.sort_by(|a, b| {
        (Reverse(a.friend_count()), &a.normalized_key).cmp(&(Reverse(b.friend_count()), &b.normalized_key))
    });
}

/// Filters for browsing a single friend's watchlist
#[derive(Debug, Clone, Default)]
pub struct FriendViewFilter {
    /// Only movies the primary user also wants to watch
    pub common_only: bool,
    /// Case- and accent-insensitive substring of the title
    pub title_contains: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FriendViewRow {
    pub title: String,
    pub year: Option<u16>,
    pub normalized_key: NormalizedKey,
    pub in_common: bool,
}

/// One friend's committed watchlist, annotated with overlap, sorted by key
pub fn friend_view(
    primary: &WatchlistSnapshot,
    friend_entries: &[WatchlistEntry],
    filter: &FriendViewFilter,
) -> Vec<FriendViewRow> {
    let needle = filter
        .title_contains
        .as_deref()
        .map(crate::normalize::normalize_text)
        .filter(|n| !n.is_empty());

    let mut rows: Vec<FriendViewRow> = friend_entries
        .iter()
        .map(|entry| FriendViewRow {
            title: entry.raw_title.clone(),
            year: entry.year,
            normalized_key: entry.normalized_key.clone(),
            in_common: primary.contains(&entry.normalized_key),
        })
        .filter(|row| !filter.common_only || row.in_common)
        .filter(|row| match &needle {
            Some(needle) => row.normalized_key.text().contains(needle.as_str()),
            None => true,
        })
        .collect();

    rows.sort_by(|a, b| a.normalized_key.cmp(&b.normalized_key));
    rows
}
