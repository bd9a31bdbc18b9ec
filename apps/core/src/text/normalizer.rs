//! Phrase normalization.
//!
//! Deterministic and idempotent: `normalize(normalize(x)) == normalize(x)`.
//! Steps run in a fixed order: case-fold, punctuation to space, strip dimension
//! tokens, drop denylisted words, collapse whitespace.

use crate::error::AppError;
use crate::models::{NormalizedPhrase, Phrase, PhraseId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Words that mark time-sensitivity rather than topic.
const TIME_WORDS: &[&str] = &[
    "new", "newest", "latest", "today", "tonight", "now", "current", "currently", "recent",
    "updated",
];

/// File-format and delivery words.
const FORMAT_WORDS: &[&str] = &[
    "pdf", "png", "jpg", "jpeg", "svg", "gif", "webp", "doc", "docx", "xls", "xlsx", "csv",
    "ppt", "pptx", "txt", "epub", "file", "files", "printable", "download", "downloadable",
];

const FIRST_DENIED_YEAR: u32 = 2015;
const LAST_DENIED_YEAR: u32 = 2030;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{P}\p{S}]+").expect("Invalid regex: punctuation"));

static DIMENSION_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:x\d+)+\b").expect("Invalid regex: dimension pair"));

static DIMENSION_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(?:mm|cm|inch|in|ft|px)\b").expect("Invalid regex: dimension unit")
});

static DENYLIST: LazyLock<HashSet<String>> = LazyLock::new(|| {
    TIME_WORDS
        .iter()
        .chain(FORMAT_WORDS.iter())
        .map(|w| w.to_string())
        .chain((FIRST_DENIED_YEAR..=LAST_DENIED_YEAR).map(|y| y.to_string()))
        .collect()
});

/// Normalizes raw phrase text. Empty input yields an empty string.
pub fn normalize(raw: &str) -> String {
    let folded = raw.to_lowercase();
    let spaced = PUNCTUATION.replace_all(&folded, " ");
    let no_pairs = DIMENSION_PAIR.replace_all(&spaced, " ");
    let no_dims = DIMENSION_UNIT.replace_all(&no_pairs, " ");

    no_dims
        .split_whitespace()
        .filter(|token| !DENYLIST.contains(*token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word containment of an already-normalized keyword in normalized text.
pub fn contains_keyword(normalized_text: &str, normalized_keyword: &str) -> bool {
    if normalized_keyword.is_empty() || normalized_text.is_empty() {
        return false;
    }
    let haystack = format!(" {} ", normalized_text);
    let needle = format!(" {} ", normalized_keyword);
    haystack.contains(&needle)
}

/// Accepted length of a raw phrase in characters, measured after trimming and
/// collapsing whitespace. Phrases outside the bounds never reach embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthBounds {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for LengthBounds {
    fn default() -> Self {
        Self {
            min_chars: 3,
            max_chars: 100,
        }
    }
}

impl LengthBounds {
    pub fn check(&self) -> Result<(), AppError> {
        if self.min_chars == 0 || self.min_chars > self.max_chars {
            return Err(AppError::Config(format!(
                "Phrase length bounds {}..={} are invalid",
                self.min_chars, self.max_chars
            )));
        }
        Ok(())
    }

    pub fn contains(&self, raw: &str) -> bool {
        (self.min_chars..=self.max_chars).contains(&raw_length(raw))
    }
}

/// Character count of `raw` with runs of whitespace counted once and the ends trimmed.
fn raw_length(raw: &str) -> usize {
    let (chars, words) = raw
        .split_whitespace()
        .fold((0usize, 0usize), |(chars, words), word| (chars + word.chars().count(), words + 1));
    chars + words.saturating_sub(1)
}

/// Phrases split by whether they take part in embedding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preprocessed {
    pub kept: Vec<NormalizedPhrase>,
    /// Raw text shorter or longer than the configured bounds.
    pub out_of_bounds: Vec<PhraseId>,
    /// Nothing left after normalization.
    pub empty: Vec<PhraseId>,
}

/// Normalizer handed to pipeline phases.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextPreprocessor {
    bounds: LengthBounds,
}

impl TextPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(bounds: LengthBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> LengthBounds {
        self.bounds
    }

    pub fn normalize(&self, raw: &str) -> String {
        normalize(raw)
    }

    pub fn normalize_phrase(&self, phrase: &Phrase) -> NormalizedPhrase {
        NormalizedPhrase {
            phrase_id: phrase.phrase_id,
            text: normalize(&phrase.phrase_text),
        }
    }

    /// Length check on the raw text first, then normalization.
    pub fn normalize_all<'a, I>(&self, phrases: I) -> Preprocessed
    where
        I: IntoIterator<Item = &'a Phrase>,
    {
        let mut out = Preprocessed::default();
        for phrase in phrases {
            if !self.bounds.contains(&phrase.phrase_text) {
                out.out_of_bounds.push(phrase.phrase_id);
                continue;
            }
            let normalized = self.normalize_phrase(phrase);
            if normalized.is_empty() {
                out.empty.push(phrase.phrase_id);
            } else {
                out.kept.push(normalized);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_length_ignores_extra_whitespace() {
        assert_eq!(raw_length("  ab   cd "), 5);
        assert_eq!(raw_length(""), 0);
        assert_eq!(raw_length("café"), 4);
    }

    #[test]
    fn test_length_bounds_are_inclusive() {
        let bounds = LengthBounds::default();
        assert!(!bounds.contains("ab"));
        assert!(bounds.contains("abc"));
        assert!(bounds.contains(&"x".repeat(100)));
        assert!(!bounds.contains(&"x".repeat(101)));
        assert!(LengthBounds { min_chars: 5, max_chars: 4 }.check().is_err());
        assert!(LengthBounds { min_chars: 0, max_chars: 4 }.check().is_err());
    }

    #[test]
    fn test_case_fold_and_punctuation() {
        assert_eq!(normalize("Best (Budget) Planner!!"), "best budget planner");
        assert_eq!(normalize("wedding-checklist/ideas"), "wedding checklist ideas");
    }

    #[test]
    fn test_strips_dimensions() {
        assert_eq!(normalize("poster 8x10 frame"), "poster frame");
        assert_eq!(normalize("canvas 24x36x2 wall art"), "canvas wall art");
        assert_eq!(normalize("label 50mm round"), "label round");
        assert_eq!(normalize("banner 1920px wide 6ft"), "banner wide");
        assert_eq!(normalize("frame 5 inch"), "frame 5 inch");
    }

    #[test]
    fn test_keeps_number_words_that_are_not_dimensions() {
        assert_eq!(normalize("2 in 1 charger"), "2 in 1 charger");
        assert_eq!(normalize("mp3 player"), "mp3 player");
    }

    #[test]
    fn test_denylist_whole_words_only() {
        assert_eq!(normalize("Budget Planner PDF 2024"), "budget planner");
        assert_eq!(normalize("latest newsletter template"), "newsletter template");
        assert_eq!(normalize("pdfs explained"), "pdfs explained");
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \t\n "), "");
        assert_eq!(normalize("?!..."), "");
        assert_eq!(normalize("new pdf 2025"), "");
    }

    #[test]
    fn test_contains_keyword_whole_word() {
        assert!(contains_keyword("best budget planner", "budget"));
        assert!(contains_keyword("best budget planner", "budget planner"));
        assert!(!contains_keyword("budgeting tips", "budget"));
        assert!(!contains_keyword("", "budget"));
        assert!(!contains_keyword("budget", ""));
    }
}
