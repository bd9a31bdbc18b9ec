use crate::error::AppError;
use crate::text::features::QueryType;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

/// Dense identifier assigned to a phrase when the corpus is built.
pub type PhraseId = u64;

/// Label value reserved for "did not fit any density-based group".
pub const NOISE_LABEL: i32 = -1;

/// Ingestion channel a phrase came from. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Semrush,
    Dropdown,
    RelatedSearch,
    KeywordTool,
}

impl SourceType {
    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Semrush => "semrush",
            SourceType::Dropdown => "dropdown",
            SourceType::RelatedSearch => "related_search",
            SourceType::KeywordTool => "keyword_tool",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for SourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "semrush" => Ok(SourceType::Semrush),
            "dropdown" => Ok(SourceType::Dropdown),
            "related_search" => Ok(SourceType::RelatedSearch),
            "keyword_tool" => Ok(SourceType::KeywordTool),
            _ => Err(AppError::Validation(format!("Unknown source_type '{}'", s))),
        }
    }
}

/// A single search-query string plus its provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phrase {
    pub phrase_id: PhraseId,
    pub phrase_text: String,
    pub seed_word: String,
    pub source_type: SourceType,
    /// Non-negative weight used for ranking and tie-breaking.
    pub frequency: f64,
    /// Search volume, only for sources that report it.
    #[serde(default)]
    pub volume: Option<f64>,
}

/// The normalized form of a phrase. Always derived, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPhrase {
    pub phrase_id: PhraseId,
    pub text: String,
}

impl NormalizedPhrase {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Which clustering pass produced a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    A,
    B,
    Resplit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::A => write!(f, "A"),
            Stage::B => write!(f, "B"),
            Stage::Resplit => write!(f, "resplit"),
        }
    }
}

/// Hierarchical cluster identifier.
///
/// Top-level clusters carry a single label (`7`, noise `-1`). A resplit appends the
/// sub-label to the parent path, rendered `parent.sub` (`7.2`, resplit noise `7.-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(Vec<i32>);

impl ClusterId {
    pub fn from_label(label: i32) -> Self {
        Self(vec![label])
    }

    pub fn noise() -> Self {
        Self::from_label(NOISE_LABEL)
    }

    /// Identifier of a sub-cluster produced by resplitting `self`.
    pub fn child(&self, label: i32) -> Self {
        let mut segments = self.0.clone();
        segments.push(label);
        Self(segments)
    }

    pub fn parent(&self) -> Option<ClusterId> {
        if self.0.len() > 1 {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// The innermost label.
    pub fn label(&self) -> i32 {
        self.0.last().copied().unwrap_or(NOISE_LABEL)
    }

    pub fn is_noise(&self) -> bool {
        self.label() == NOISE_LABEL
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", rendered.join("."))
    }
}

impl FromStr for ClusterId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Empty cluster id".to_string()));
        }
        let segments = trimmed
            .split('.')
            .map(|part| {
                part.parse::<i32>()
                    .map_err(|_| AppError::Validation(format!("Invalid cluster id '{}'", s)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        // Noise may only terminate a path.
        if segments[..segments.len() - 1].iter().any(|&l| l < 0) {
            return Err(AppError::Validation(format!(
                "Cluster id '{}' nests under noise",
                s
            )));
        }
        if segments.iter().any(|&l| l < NOISE_LABEL) {
            return Err(AppError::Validation(format!("Invalid cluster id '{}'", s)));
        }
        Ok(Self(segments))
    }
}

impl Serialize for ClusterId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClusterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(label) => Ok(ClusterId::from_label(label)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// One group of phrases produced by a clustering invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: ClusterId,
    pub stage: Stage,
    pub member_phrase_ids: BTreeSet<PhraseId>,
    pub is_noise: bool,
}

impl Cluster {
    pub fn new(cluster_id: ClusterId, stage: Stage, members: BTreeSet<PhraseId>) -> Self {
        let is_noise = cluster_id.is_noise();
        Self {
            cluster_id,
            stage,
            member_phrase_ids: members,
            is_noise,
        }
    }

    pub fn size(&self) -> usize {
        self.member_phrase_ids.len()
    }
}

/// Aggregated view of a cluster, recomputed whenever the cluster changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction_keyword: Option<String>,
    pub size: usize,
    pub total_frequency: f64,
    pub avg_frequency: f64,
    pub total_volume: f64,
    /// Mean volume over members that report one; 0 when none do.
    #[serde(default)]
    pub avg_search_volume: f64,
    pub seed_words_in_cluster: Vec<String>,
    pub example_phrases: Vec<String>,
    pub avg_word_count: f64,
    pub question_ratio: f64,
    /// Most common query shape among members.
    pub dominant_query_type: QueryType,
    pub is_noise: bool,
}

/// A Stage-A cluster promoted for finer-grained Stage-B analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Direction {
    #[validate(length(min = 1))]
    pub direction_keyword: String,
    pub source_cluster_id: ClusterId,
    #[validate(length(min = 1))]
    pub round_id: String,
    /// When false the keyword is only a label and Stage B takes the source
    /// cluster's members alone.
    #[serde(default = "default_match_keyword")]
    pub match_keyword: bool,
}

fn default_match_keyword() -> bool {
    true
}

impl Direction {
    pub fn new(keyword: impl Into<String>, source_cluster_id: ClusterId, round_id: impl Into<String>) -> Self {
        Self {
            direction_keyword: keyword.into(),
            source_cluster_id,
            round_id: round_id.into(),
            match_keyword: true,
        }
    }

    pub fn label_only(label: impl Into<String>, source_cluster_id: ClusterId, round_id: impl Into<String>) -> Self {
        Self {
            match_keyword: false,
            ..Self::new(label, source_cluster_id, round_id)
        }
    }
}
