use crate::error::AppError;
use crate::models::{Phrase, PhraseId, SourceType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, warn};

pub const REQUIRED_COLUMNS: [&str; 4] = ["phrase", "seed_word", "source_type", "frequency"];

/// One input row as read, before any checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPhraseRecord {
    #[serde(default)]
    pub phrase: Option<String>,
    #[serde(default)]
    pub seed_word: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub frequency: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CorpusOptions {
    /// Merge rows whose trimmed, lowercased phrase text is identical.
    pub merge_duplicates: bool,
}

impl Default for CorpusOptions {
    fn default() -> Self {
        Self {
            merge_duplicates: true,
        }
    }
}

/// The ingested phrase set. `phrase_id` equals the position in `phrases()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    phrases: Vec<Phrase>,
    #[serde(default)]
    merged_rows: usize,
}

impl Corpus {
    /// `columns` are the header names of the input; every required column must be there.
    pub fn from_records<S: AsRef<str>>(
        columns: &[S],
        records: Vec<RawPhraseRecord>,
        options: CorpusOptions,
    ) -> Result<Self, AppError> {
        let present: BTreeSet<&str> = columns.iter().map(|c| c.as_ref().trim()).collect();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !present.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "Missing required columns: {}",
                missing.join(", ")
            )));
        }
        if records.is_empty() {
            return Err(AppError::Validation("Corpus has no rows".to_string()));
        }

        let mut phrases: Vec<Phrase> = Vec::with_capacity(records.len());
        let mut index_by_text: HashMap<String, usize> = HashMap::new();
        let mut merged_rows = 0;

        for (row, record) in records.into_iter().enumerate() {
            let phrase = check_record(row, record)?;
            if options.merge_duplicates {
                let key = phrase.phrase_text.trim().to_lowercase();
                if let Some(&existing) = index_by_text.get(&key) {
                    let target = &mut phrases[existing];
                    target.frequency += phrase.frequency;
                    target.volume = match (target.volume, phrase.volume) {
                        (Some(a), Some(b)) => Some(a + b),
                        (a, b) => a.or(b),
                    };
                    merged_rows += 1;
                    continue;
                }
                index_by_text.insert(key, phrases.len());
            }
            phrases.push(Phrase {
                phrase_id: phrases.len() as PhraseId,
                ..phrase
            });
        }

        if merged_rows > 0 {
            info!(merged = merged_rows, unique = phrases.len(), "Merged duplicate phrases");
        }
        Ok(Self {
            phrases,
            merged_rows,
        })
    }

    /// Reads a JSON array of row objects, or JSON Lines.
    pub fn load(path: &Path, options: CorpusOptions) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)?;
        let (columns, records) = parse_rows(&content)?;
        let corpus = Self::from_records(&columns, records, options)?;
        info!(path = ?path, phrases = corpus.len(), "Corpus loaded");
        Ok(corpus)
    }

    pub fn phrases(&self) -> &[Phrase] {
        &self.phrases
    }

    pub fn get(&self, id: PhraseId) -> Option<&Phrase> {
        usize::try_from(id).ok().and_then(|i| self.phrases.get(i))
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Rows folded into an earlier row.
    pub fn merged_rows(&self) -> usize {
        self.merged_rows
    }
}

fn check_record(row: usize, record: RawPhraseRecord) -> Result<Phrase, AppError> {
    let phrase_text = record
        .phrase
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::Validation(format!("Row {}: empty phrase", row)))?;

    let source_type = record
        .source_type
        .as_deref()
        .ok_or_else(|| AppError::Validation(format!("Row {}: missing source_type", row)))?
        .parse::<SourceType>()
        .map_err(|e| AppError::Validation(format!("Row {}: {}", row, e)))?;

    let frequency = record
        .frequency
        .ok_or_else(|| AppError::Validation(format!("Row {}: missing frequency", row)))?;
    if !frequency.is_finite() || frequency < 0.0 {
        return Err(AppError::Validation(format!(
            "Row {}: frequency must be a finite non-negative number, got {}",
            row, frequency
        )));
    }
    if let Some(volume) = record.volume {
        if !volume.is_finite() || volume < 0.0 {
            return Err(AppError::Validation(format!(
                "Row {}: volume must be a finite non-negative number, got {}",
                row, volume
            )));
        }
    }

    Ok(Phrase {
        phrase_id: 0,
        phrase_text,
        seed_word: record.seed_word.unwrap_or_default().trim().to_string(),
        source_type,
        frequency,
        volume: record.volume,
    })
}

/// Splits JSON or JSON Lines input into the union of keys and typed rows.
fn parse_rows(content: &str) -> Result<(Vec<String>, Vec<RawPhraseRecord>), AppError> {
    let trimmed = content.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    AppError::Validation(format!("Line {}: invalid JSON: {}", n + 1, e))
                })
            })
            .collect::<Result<_, _>>()?
    };

    let mut columns = BTreeSet::new();
    let mut records = Vec::with_capacity(values.len());
    for (row, value) in values.into_iter().enumerate() {
        let Value::Object(map) = value else {
            return Err(AppError::Validation(format!("Row {} is not an object", row)));
        };
        columns.extend(map.keys().cloned());
        let unknown: Vec<&String> = map
            .keys()
            .filter(|k| !REQUIRED_COLUMNS.contains(&k.as_str()) && k.as_str() != "volume")
            .collect();
        if row == 0 && !unknown.is_empty() {
            warn!(columns = ?unknown, "Ignoring unknown corpus columns");
        }
        let record: RawPhraseRecord = serde_json::from_value(Value::Object(map))
            .map_err(|e| AppError::Validation(format!("Row {}: {}", row, e)))?;
        records.push(record);
    }
    Ok((columns.into_iter().collect(), records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phrase: &str, seed: &str, source: &str, frequency: f64) -> RawPhraseRecord {
        RawPhraseRecord {
            phrase: Some(phrase.to_string()),
            seed_word: Some(seed.to_string()),
            source_type: Some(source.to_string()),
            frequency: Some(frequency),
            volume: None,
        }
    }

    #[test]
    fn test_missing_columns_rejected() {
        let err = Corpus::from_records(
            &["phrase", "seed_word"],
            vec![record("a", "b", "semrush", 1.0)],
            CorpusOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("source_type"));
        assert!(err.to_string().contains("frequency"));
    }

    #[test]
    fn test_empty_corpus_rejected() {
        assert!(matches!(
            Corpus::from_records(&REQUIRED_COLUMNS, Vec::new(), CorpusOptions::default()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_row_checks_name_the_row() {
        let rows = vec![record("ok", "s", "dropdown", 1.0), record("bad", "s", "dropdown", -2.0)];
        let err = Corpus::from_records(&REQUIRED_COLUMNS, rows, CorpusOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Row 1"));

        let rows = vec![record("x", "s", "newsletter", 1.0)];
        assert!(Corpus::from_records(&REQUIRED_COLUMNS, rows, CorpusOptions::default()).is_err());
    }

    #[test]
    fn test_duplicates_merge_into_first_row() {
        let mut second = record("  Wedding Planner ", "planner", "semrush", 3.0);
        second.volume = Some(40.0);
        let rows = vec![
            record("wedding planner", "wedding", "dropdown", 2.0),
            record("budget", "budget", "keyword-tool", 1.0),
            second,
        ];
        let corpus = Corpus::from_records(&REQUIRED_COLUMNS, rows, CorpusOptions::default()).unwrap();

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.merged_rows(), 1);
        let merged = corpus.get(0).unwrap();
        assert_eq!(merged.frequency, 5.0);
        assert_eq!(merged.volume, Some(40.0));
        assert_eq!(merged.seed_word, "wedding");
        assert_eq!(merged.source_type, SourceType::Dropdown);
        assert_eq!(corpus.get(1).unwrap().phrase_id, 1);
        assert_eq!(corpus.get(1).unwrap().source_type, SourceType::KeywordTool);
    }

    #[test]
    fn test_merge_can_be_disabled() {
        let rows = vec![record("a b", "a", "dropdown", 1.0), record("A B", "a", "dropdown", 1.0)];
        let corpus = Corpus::from_records(
            &REQUIRED_COLUMNS,
            rows,
            CorpusOptions { merge_duplicates: false },
        )
        .unwrap();
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn test_parse_json_and_jsonl() {
        let array = r#"[{"phrase":"a","seed_word":"s","source_type":"semrush","frequency":1,"volume":10}]"#;
        let (columns, records) = parse_rows(array).unwrap();
        assert!(columns.contains(&"volume".to_string()));
        assert_eq!(records[0].volume, Some(10.0));

        let lines = "{\"phrase\":\"a\",\"seed_word\":\"s\",\"source_type\":\"semrush\",\"frequency\":1}\n\n{\"phrase\":\"b\",\"seed_word\":\"s\",\"source_type\":\"dropdown\",\"frequency\":2.5}\n";
        let (columns, records) = parse_rows(lines).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(columns.len(), 4);

        assert!(parse_rows("[1, 2]").is_err());
    }
}
