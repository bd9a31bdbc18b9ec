//! Configuration Tests
//!
//! Environment overlay on top of the defaults. Every test pins the variables it
//! reads so ambient values cannot leak in.

use crate::config::{PipelineConfig, ProviderKind, DEFAULT_MODEL_ID};
use crate::error::AppError;

const KEYS: [&str; 10] = [
    "PHRASEMAP_ROUND_ID",
    "PHRASEMAP_MODEL_ID",
    "PHRASEMAP_PROVIDER",
    "PHRASEMAP_EMBEDDING_URL",
    "PHRASEMAP_EMBEDDING_DIMENSION",
    "PHRASEMAP_BATCH_SIZE",
    "PHRASEMAP_MERGE_DUPLICATES",
    "PHRASEMAP_RESPLIT_THRESHOLD",
    "PHRASEMAP_MIN_PHRASE_CHARS",
    "PHRASEMAP_MAX_PHRASE_CHARS",
];

/// Runs `f` with every key in `KEYS` unset except the given overrides.
fn with_env<R>(overrides: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let vars: Vec<(&str, Option<&str>)> = KEYS
        .iter()
        .map(|key| {
            let value = overrides.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
            (*key, value)
        })
        .collect();
    temp_env::with_vars(vars, f)
}

#[test]
fn test_defaults_are_valid() {
    let config = PipelineConfig::default();
    assert!(config.check().is_ok());
    assert_eq!(config.embedding.model_id, DEFAULT_MODEL_ID);
    assert_eq!(config.embedding.provider, ProviderKind::Fastembed);
    assert!(config.merge_duplicates);
    assert_eq!(config.phrase_length.min_chars, 3);
    assert_eq!(config.phrase_length.max_chars, 100);
}

#[test]
fn test_env_overrides_defaults() {
    let config = with_env(
        &[
            ("PHRASEMAP_ROUND_ID", "spring-2025"),
            ("PHRASEMAP_MODEL_ID", "all-minilm-l6-v2"),
            ("PHRASEMAP_BATCH_SIZE", "64"),
            ("PHRASEMAP_MERGE_DUPLICATES", "false"),
            ("PHRASEMAP_RESPLIT_THRESHOLD", "250"),
        ],
        PipelineConfig::from_env,
    )
    .unwrap();

    assert_eq!(config.round_id, "spring-2025");
    assert_eq!(config.embedding.model_id, "all-minilm-l6-v2");
    assert_eq!(config.embedding.batch_size, 64);
    assert!(!config.merge_duplicates);
    assert_eq!(config.resplit_threshold, 250);
}

#[test]
fn test_unparseable_number_is_config_error() {
    let result = with_env(&[("PHRASEMAP_BATCH_SIZE", "lots")], PipelineConfig::from_env);
    match result {
        Err(AppError::Config(message)) => assert!(message.contains("PHRASEMAP_BATCH_SIZE")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_out_of_range_value_fails_validation() {
    let result = with_env(&[("PHRASEMAP_BATCH_SIZE", "0")], PipelineConfig::from_env);
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[test]
fn test_http_provider_needs_url_and_dimension() {
    let missing_url = with_env(&[("PHRASEMAP_PROVIDER", "http")], PipelineConfig::from_env);
    assert!(matches!(missing_url, Err(AppError::Config(_))));

    let missing_dimension = with_env(
        &[
            ("PHRASEMAP_PROVIDER", "http"),
            ("PHRASEMAP_EMBEDDING_URL", "http://localhost:8080/v1"),
        ],
        PipelineConfig::from_env,
    );
    assert!(matches!(missing_dimension, Err(AppError::Config(_))));

    let config = with_env(
        &[
            ("PHRASEMAP_PROVIDER", "remote"),
            ("PHRASEMAP_EMBEDDING_URL", "http://localhost:8080/v1"),
            ("PHRASEMAP_EMBEDDING_DIMENSION", "384"),
        ],
        PipelineConfig::from_env,
    )
    .unwrap();
    assert_eq!(config.embedding.provider, ProviderKind::Http);
    assert_eq!(config.embedding.dimension, Some(384));
}

#[test]
fn test_unknown_provider_is_rejected() {
    let result = with_env(&[("PHRASEMAP_PROVIDER", "carrier-pigeon")], PipelineConfig::from_env);
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn test_phrase_length_bounds_from_env() {
    let config = with_env(
        &[
            ("PHRASEMAP_MIN_PHRASE_CHARS", "2"),
            ("PHRASEMAP_MAX_PHRASE_CHARS", "80"),
        ],
        PipelineConfig::from_env,
    )
    .unwrap();
    assert_eq!(config.phrase_length.min_chars, 2);
    assert_eq!(config.phrase_length.max_chars, 80);

    let inverted = with_env(
        &[
            ("PHRASEMAP_MIN_PHRASE_CHARS", "50"),
            ("PHRASEMAP_MAX_PHRASE_CHARS", "10"),
        ],
        PipelineConfig::from_env,
    );
    assert!(matches!(inverted, Err(AppError::Config(_))));
}

#[test]
fn test_round_id_must_be_plain_name() {
    let config = PipelineConfig {
        round_id: "../other".to_string(),
        ..PipelineConfig::default()
    };
    assert!(matches!(config.check(), Err(AppError::Config(_))));
}
