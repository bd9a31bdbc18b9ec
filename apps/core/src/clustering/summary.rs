use crate::error::AppError;
use crate::models::{Cluster, ClusterSummary, Phrase, PhraseId};
use crate::text::features::{self, QueryType};
use std::cmp::Ordering;
use std::collections::BTreeSet;

pub const DEFAULT_EXAMPLE_COUNT: usize = 5;

/// Builds per-cluster statistics and representative examples.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSummarizer {
    example_count: usize,
}

impl Default for ClusterSummarizer {
    fn default() -> Self {
        Self::new(DEFAULT_EXAMPLE_COUNT)
    }
}

impl ClusterSummarizer {
    pub fn new(example_count: usize) -> Self {
        Self { example_count }
    }

    /// `phrases` is the corpus, indexed by phrase id.
    pub fn summarize(
        &self,
        cluster: &Cluster,
        phrases: &[Phrase],
    ) -> Result<ClusterSummary, AppError> {
        let members = cluster
            .member_phrase_ids
            .iter()
            .map(|&id| resolve(phrases, id))
            .collect::<Result<Vec<_>, _>>()?;

        let size = members.len();
        let total_frequency: f64 = members.iter().map(|p| p.frequency).sum();
        let volumes: Vec<f64> = members.iter().filter_map(|p| p.volume).collect();
        let total_volume: f64 = volumes.iter().sum();
        let avg_search_volume = if volumes.is_empty() {
            0.0
        } else {
            total_volume / volumes.len() as f64
        };
        let seed_words: BTreeSet<&str> = members
            .iter()
            .map(|p| p.seed_word.trim())
            .filter(|s| !s.is_empty())
            .collect();

        let mut ranked = members.clone();
        ranked.sort_by(|a, b| {
            b.frequency
                .total_cmp(&a.frequency)
                .then_with(|| a.phrase_text.cmp(&b.phrase_text))
        });
        let example_phrases = ranked
            .iter()
            .take(self.example_count)
            .map(|p| p.phrase_text.clone())
            .collect();

        let (avg_frequency, avg_word_count, question_ratio) = if size == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let words: usize = members.iter().map(|p| features::word_count(&p.phrase_text)).sum();
            let questions = members
                .iter()
                .filter(|p| features::is_question_like(&p.phrase_text))
                .count();
            (
                total_frequency / size as f64,
                words as f64 / size as f64,
                questions as f64 / size as f64,
            )
        };

        Ok(ClusterSummary {
            cluster_id: cluster.cluster_id.clone(),
            stage: cluster.stage,
            direction_keyword: None,
            size,
            total_frequency,
            avg_frequency,
            total_volume,
            avg_search_volume,
            seed_words_in_cluster: seed_words.into_iter().map(str::to_string).collect(),
            example_phrases,
            avg_word_count,
            question_ratio,
            dominant_query_type: dominant_query_type(&members),
            is_noise: cluster.is_noise,
        })
    }

    /// Summaries of every cluster in summary-table order, tagged with the
    /// direction keyword when given.
    pub fn summarize_all(
        &self,
        clusters: &[Cluster],
        phrases: &[Phrase],
        direction_keyword: Option<&str>,
    ) -> Result<Vec<ClusterSummary>, AppError> {
        let mut summaries = clusters
            .iter()
            .map(|c| {
                let mut summary = self.summarize(c, phrases)?;
                summary.direction_keyword = direction_keyword.map(str::to_string);
                Ok(summary)
            })
            .collect::<Result<Vec<_>, AppError>>()?;
        order_summary_table(&mut summaries);
        Ok(summaries)
    }
}

fn resolve(phrases: &[Phrase], id: PhraseId) -> Result<&Phrase, AppError> {
    usize::try_from(id)
        .ok()
        .and_then(|index| phrases.get(index))
        .filter(|p| p.phrase_id == id)
        .ok_or_else(|| AppError::Validation(format!("Unknown phrase id {}", id)))
}

fn dominant_query_type(members: &[&Phrase]) -> QueryType {
    let mut counts = [(QueryType::Question, 0usize), (QueryType::BestList, 0), (QueryType::Normal, 0)];
    for phrase in members {
        let kind = features::query_type(&phrase.phrase_text);
        if let Some(slot) = counts.iter_mut().find(|(k, _)| *k == kind) {
            slot.1 += 1;
        }
    }
    // Stable sort: ties keep Question > BestList > Normal.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    if counts[0].1 == 0 {
        QueryType::Normal
    } else {
        counts[0].0
    }
}

fn by_weight(a: &ClusterSummary, b: &ClusterSummary) -> Ordering {
    b.total_frequency
        .total_cmp(&a.total_frequency)
        .then_with(|| a.cluster_id.cmp(&b.cluster_id))
}

/// Non-noise by total frequency descending then cluster id; noise rows last.
pub fn order_summary_table(summaries: &mut [ClusterSummary]) {
    summaries.sort_by(|a, b| a.is_noise.cmp(&b.is_noise).then_with(|| by_weight(a, b)));
}

/// Candidates for direction selection: noise removed, ordered by total
/// frequency, then size, then cluster id.
pub fn rank_for_directions(summaries: &[ClusterSummary]) -> Vec<&ClusterSummary> {
    let mut ranked: Vec<&ClusterSummary> = summaries.iter().filter(|s| !s.is_noise).collect();
    ranked.sort_by(|a, b| {
        b.total_frequency
            .total_cmp(&a.total_frequency)
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });
    ranked
}
