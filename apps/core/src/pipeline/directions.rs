//! Direction tables: the automated top-N helper, file I/O and the checks run
//! before Stage B.

use crate::clustering::summary::rank_for_directions;
use crate::error::AppError;
use crate::models::{ClusterSummary, Direction};
use crate::text::normalizer::normalize;
use std::collections::HashSet;
use std::path::Path;
use validator::Validate;

/// Promotes the `n` heaviest non-noise clusters. The keyword is the first seed
/// word of the cluster not already taken. Without one the direction is labelled
/// `direction_<cluster id>` and matches no phrases by keyword.
pub fn top_n_by_frequency(summaries: &[ClusterSummary], n: usize, round_id: &str) -> Vec<Direction> {
    let mut taken: HashSet<String> = HashSet::new();
    rank_for_directions(summaries)
        .into_iter()
        .take(n)
        .map(|summary| {
            let seed = summary.seed_words_in_cluster.iter().find(|seed| {
                let normalized = normalize(seed);
                !normalized.is_empty() && !taken.contains(&normalized)
            });
            match seed {
                Some(seed) => {
                    taken.insert(normalize(seed));
                    Direction::new(seed.clone(), summary.cluster_id.clone(), round_id)
                }
                None => Direction::label_only(
                    format!("direction_{}", summary.cluster_id),
                    summary.cluster_id.clone(),
                    round_id,
                ),
            }
        })
        .collect()
}

/// Field checks plus distinct keywords.
pub fn validate_directions(directions: &[Direction]) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for direction in directions {
        direction.validate()?;
        if !seen.insert(direction.direction_keyword.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate direction keyword '{}'",
                direction.direction_keyword
            )));
        }
    }
    Ok(())
}

pub fn load_directions(path: &Path) -> Result<Vec<Direction>, AppError> {
    let content = std::fs::read_to_string(path)?;
    let directions: Vec<Direction> = serde_json::from_str(&content)?;
    validate_directions(&directions)?;
    Ok(directions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterId, Stage};
    use crate::text::features::QueryType;

    fn summary(label: i32, total: f64, seeds: &[&str]) -> ClusterSummary {
        ClusterSummary {
            cluster_id: ClusterId::from_label(label),
            stage: Stage::A,
            direction_keyword: None,
            size: 3,
            total_frequency: total,
            avg_frequency: total / 3.0,
            total_volume: 0.0,
            avg_search_volume: 0.0,
            seed_words_in_cluster: seeds.iter().map(|s| s.to_string()).collect(),
            example_phrases: Vec::new(),
            avg_word_count: 2.0,
            question_ratio: 0.0,
            dominant_query_type: QueryType::Normal,
            is_noise: label < 0,
        }
    }

    #[test]
    fn test_top_n_skips_noise_and_taken_keywords() {
        let summaries = vec![
            summary(-1, 1_000.0, &["noise"]),
            summary(0, 10.0, &["planner", "wedding"]),
            summary(1, 50.0, &["planner"]),
            summary(2, 30.0, &["Planner"]),
        ];
        let directions = top_n_by_frequency(&summaries, 3, "r7");

        let keywords: Vec<&str> = directions.iter().map(|d| d.direction_keyword.as_str()).collect();
        assert_eq!(keywords, vec!["planner", "direction_2", "wedding"]);
        let matching: Vec<bool> = directions.iter().map(|d| d.match_keyword).collect();
        assert_eq!(matching, vec![true, false, true]);
        assert!(directions.iter().all(|d| d.round_id == "r7"));
        assert_eq!(directions[0].source_cluster_id, ClusterId::from_label(1));
    }

    #[test]
    fn test_validate_rejects_blank_and_duplicates() {
        let blank = vec![Direction::new("", ClusterId::from_label(0), "r")];
        assert!(validate_directions(&blank).is_err());

        let dup = vec![
            Direction::new("a", ClusterId::from_label(0), "r"),
            Direction::new("a", ClusterId::from_label(1), "r"),
        ];
        assert!(validate_directions(&dup).is_err());
    }
}
