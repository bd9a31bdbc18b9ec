//! Lightweight per-phrase features used by cluster summaries.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static QUESTION_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(how|what|why|where|when|who|which)\b")
        .expect("Invalid regex: question words")
});

static BEST_OR_TOP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(best|top)\b").expect("Invalid regex: best/top"));

/// Coarse query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Question,
    BestList,
    Normal,
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// True when the raw text contains a question word or ends with `?`.
pub fn is_question_like(raw: &str) -> bool {
    QUESTION_WORD.is_match(raw) || raw.trim_end().ends_with('?')
}

pub fn has_best_or_top(raw: &str) -> bool {
    BEST_OR_TOP.is_match(raw)
}

pub fn query_type(raw: &str) -> QueryType {
    if is_question_like(raw) {
        QueryType::Question
    } else if has_best_or_top(raw) {
        QueryType::BestList
    } else {
        QueryType::Normal
    }
}
