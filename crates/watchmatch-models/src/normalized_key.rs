use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier of a logical movie across all watchlists.
///
/// Two keys are equal only when both the normalized title text and the year
/// are equal. A key without a year never matches a key with one, even when
/// the text is identical, so remakes and same-named sequels stay distinct.
///
/// Field order matters: the derived `Ord` sorts by title text first, which is
/// what the match ordering relies on for its tie-break.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey {
    text: String,
    year: Option<u16>,
}

/// How much a key can be trusted to identify a single movie
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyConfidence {
    /// Title and release year are both known
    High,
    /// Title only; a remake with the same title would collide
    Low,
}

impl NormalizedKey {
    /// Build a key from already-normalized text.
    ///
    /// Callers should go through `watchmatch_core::normalize` instead of
    /// constructing keys from raw titles.
    pub fn from_parts(text: impl Into<String>, year: Option<u16>) -> Self {
        Self { text: text.into(), year }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn year(&self) -> Option<u16> {
        self.year
    }

    pub fn confidence(&self) -> KeyConfidence {
        if self.year.is_some() {
            KeyConfidence::High
        } else {
            KeyConfidence::Low
        }
    }

    /// Single-column representation used by the persistent store: `text|year`,
    /// with an empty year segment when the year is unknown.
    pub fn storage_key(&self) -> String {
        match self.year {
            Some(year) => format!("{}|{}", self.text, year),
            None => format!("{}|", self.text),
        }
    }

    /// Inverse of [`NormalizedKey::storage_key`]
    pub fn from_storage_key(raw: &str) -> Option<Self> {
        let (text, year) = raw.rsplit_once('|')?;
        let year = if year.is_empty() {
            None
        } else {
            Some(year.parse::<u16>().ok()?)
        };
        Some(Self::from_parts(text, year))
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} ({})", self.text, year),
            None => write!(f, "{}", self.text),
        }
    }
}
