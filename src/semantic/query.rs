//! Query-string filters and option merging for the boundary layer.
//!
//! A raw query like `blessed book:Psalms chapter:23` carries inline filters.
//! They are lifted out here, and the rest of the text goes to the embedder.

use serde::Deserialize;

use crate::semantic::corpus::{Granularity, UnknownGranularity};
use crate::semantic::service::{SearchOptions, DEFAULT_K};

/// Filters and knobs a caller may supply for one search.
///
/// Used both for explicit request fields and for a nested `options` object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub book: Option<String>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub verse: Option<String>,
    #[serde(default)]
    pub granularity: Option<String>,
    #[serde(default)]
    pub k: Option<i64>,
}

/// Filters found inside the query text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineFilters {
    pub book: Option<String>,
    pub chapter: Option<String>,
    pub verse: Option<String>,
}

/// Split `raw` into semantic text and inline `book:`/`chapter:`/`verse:` filters.
///
/// Keys are case-insensitive. Tokens with any other key stay in the text.
/// A repeated key keeps the last value.
pub fn parse_query(raw: &str) -> (String, InlineFilters) {
    let mut filters = InlineFilters::default();
    let mut kept = Vec::new();

    for token in raw.split_whitespace() {
        let Some((key, value)) = token.split_once(':') else {
            kept.push(token);
            continue;
        };

        let slot = match key.to_lowercase().as_str() {
            "book" => &mut filters.book,
            "chapter" => &mut filters.chapter,
            "verse" => &mut filters.verse,
            _ => {
                kept.push(token);
                continue;
            }
        };
        *slot = Some(value.to_string());
    }

    (kept.join(" "), filters)
}

/// First value that is present and non-empty.
pub fn coalesce<'a, I>(values: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    values
        .into_iter()
        .flatten()
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve the effective search text and options.
///
/// Filters: explicit, then inline, then nested. Granularity: explicit,
/// then nested, then verse. `k`: first positive of explicit and nested,
/// otherwise 10.
pub fn merge_options(
    raw_query: &str,
    explicit: &FilterSet,
    nested: &FilterSet,
) -> Result<(String, SearchOptions), UnknownGranularity> {
    let (text, inline) = parse_query(raw_query);

    let granularity = match coalesce([
        explicit.granularity.as_deref(),
        nested.granularity.as_deref(),
    ]) {
        Some(name) => name.parse::<Granularity>()?,
        None => Granularity::Verse,
    };

    let k = [explicit.k, nested.k]
        .into_iter()
        .flatten()
        .find(|&k| k > 0)
        .map_or(DEFAULT_K, |k| k as usize);

    let options = SearchOptions {
        book: coalesce([
            explicit.book.as_deref(),
            inline.book.as_deref(),
            nested.book.as_deref(),
        ]),
        chapter: coalesce([
            explicit.chapter.as_deref(),
            inline.chapter.as_deref(),
            nested.chapter.as_deref(),
        ]),
        verse: coalesce([
            explicit.verse.as_deref(),
            inline.verse.as_deref(),
            nested.verse.as_deref(),
        ]),
        granularity,
        k,
    };

    Ok((text, options))
}
