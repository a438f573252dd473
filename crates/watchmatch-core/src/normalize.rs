//! Title canonicalization.
//!
//! `normalize("The Amélie (2001)", None)` and `normalize("amelie", Some(2001))`
//! produce the same key: diacritics and punctuation are stripped, case is
//! folded, a leading English article is dropped and whitespace collapsed.
//! A year embedded as a trailing `(YYYY)` is used when no separate year is
//! given.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use watchmatch_models::{NormalizedKey, RawEntry};

const LEADING_ARTICLES: [&str; 3] = ["the", "a", "an"];

pub fn normalize(raw_title: &str, raw_year: Option<u16>) -> NormalizedKey {
    let (title, embedded_year) = match raw_year {
        Some(_) => (raw_title, None),
        None => split_trailing_year(raw_title),
    };
    NormalizedKey::from_parts(normalize_text(title), raw_year.or(embedded_year))
}

pub fn normalize_entry(entry: &RawEntry) -> NormalizedKey {
    normalize(&entry.title, entry.year)
}

/// Split `"Title (YYYY)"` into `("Title", Some(YYYY))`
pub fn split_trailing_year(raw_title: &str) -> (&str, Option<u16>) {
    let trimmed = raw_title.trim_end();
    let Some(without_paren) = trimmed.strip_suffix(')') else {
        return (raw_title, None);
    };
    let Some(open) = without_paren.rfind('(') else {
        return (raw_title, None);
    };

    let digits = &without_paren[open + 1..];
    let title = without_paren[..open].trim_end();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) || title.is_empty() {
        return (raw_title, None);
    }
    match digits.parse::<u16>() {
        Ok(year) if (1870..=2100).contains(&year) => (title, Some(year)),
        _ => (raw_title, None),
    }
}

/// Canonical title text without the year
pub fn normalize_text(title: &str) -> String {
    let mut folded = String::with_capacity(title.len());
    for c in title.nfkd() {
        if is_combining_mark(c) {
            continue;
        }
        // Apostrophes join words ("Schindler's" == "Schindlers")
        if matches!(c, '\'' | '\u{2019}' | '\u{2018}' | '`') {
            continue;
        }
        if c.is_alphanumeric() {
            folded.extend(c.to_lowercase());
        } else {
            folded.push(' ');
        }
    }

    let words: Vec<&str> = folded.split_whitespace().collect();
    let words = match words.split_first() {
        Some((first, rest)) if !rest.is_empty() && LEADING_ARTICLES.contains(first) => rest,
        _ => &words[..],
    };

    if words.is_empty() {
        // Nothing alphanumeric survived ("!!!"); keep the raw text so the key is not empty
        return title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    }
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_punctuation_and_whitespace() {
        assert_eq!(normalize_text("  Star Wars:   Episode IV - A New Hope "), "star wars episode iv a new hope");
        assert_eq!(normalize_text("Schindler's List"), normalize_text("Schindlers List"));
        assert_eq!(normalize_text("WALL·E"), "wall e");
    }

    #[test]
    fn test_diacritics_are_stripped() {
        assert_eq!(normalize_text("Amélie"), "amelie");
        assert_eq!(normalize_text("Léon: The Professional"), "leon the professional");
        assert_eq!(normalize_text("Pokémon"), normalize_text("POKEMON"));
    }

    #[test]
    fn test_leading_article_dropped_only_when_more_words_follow() {
        assert_eq!(normalize_text("The Matrix"), "matrix");
        assert_eq!(normalize_text("A Quiet Place"), "quiet place");
        assert_eq!(normalize_text("An Education"), "education");
        assert_eq!(normalize_text("The"), "the");
        assert_eq!(normalize_text("Them!"), "them");
    }

    #[test]
    fn test_embedded_year_is_extracted() {
        assert_eq!(normalize("Inception (2010)", None), NormalizedKey::from_parts("inception", Some(2010)));
        assert_eq!(normalize("Inception", Some(2010)), normalize("Inception (2010)", None));
        // Explicit year wins; the parenthesised text stays part of the title
        assert_eq!(normalize("1984 (1956)", Some(1984)).text(), "1984 1956");
        assert_eq!(split_trailing_year("Blade Runner (Final Cut)"), ("Blade Runner (Final Cut)", None));
        assert_eq!(split_trailing_year("(2010)"), ("(2010)", None));
    }

    #[test]
    fn test_same_title_different_years_stay_distinct() {
        assert_ne!(normalize("Dune", Some(1984)), normalize("Dune", Some(2021)));
        assert_ne!(normalize("Dune", None), normalize("Dune", Some(2021)));
    }

    #[test]
    fn test_punctuation_only_title_keeps_a_key() {
        assert_eq!(normalize_text("!!!"), "!!!");
    }
}
