//! Preflight Check System
//!
//! Verifies the data directories, the embedding cache store, the model registry
//! and the provider before a long run starts.

use crate::embedding::{EmbeddingProvider, VectorStore};
use crate::fs_manager::DataLayout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const PROVIDER_CHECK_TIMEOUT: Duration = Duration::from_secs(60);
const SAMPLE_TEXTS: [&str; 2] = ["wedding planner", "budget spreadsheet"];

/// Result of a single check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    fn pass(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.to_string(),
            details: None,
        }
    }

    fn fail(name: &str, message: &str, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.to_string(),
            details,
        }
    }
}

/// Complete preflight check report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub all_passed: bool,
    pub checks: Vec<CheckResult>,
    pub summary: String,
}

/// Runs every check and logs the outcome. Never fails; failures are in the report.
pub async fn run_preflight_checks(
    layout: &DataLayout,
    store: &dyn VectorStore,
    provider: &dyn EmbeddingProvider,
    round_id: &str,
) -> PreflightReport {
    info!("Running preflight checks");

    let mut checks = vec![check_directories(layout)];
    checks.push(check_store(store, round_id).await);
    checks.push(check_model_registry(store, provider).await);
    checks.push(check_provider(provider).await);

    let all_passed = checks.iter().all(|c| c.passed);
    let failed = checks.iter().filter(|c| !c.passed).count();
    let summary = if all_passed {
        "All checks passed. Ready to run.".to_string()
    } else {
        format!("{} of {} checks failed.", failed, checks.len())
    };

    for check in &checks {
        if check.passed {
            info!("  [ok] {}: {}", check.name, check.message);
        } else {
            warn!("  [failed] {}: {}", check.name, check.message);
            if let Some(details) = &check.details {
                warn!("      Details: {}", details);
            }
        }
    }
    info!("Summary: {}", summary);

    PreflightReport {
        all_passed,
        checks,
        summary,
    }
}

// --- Individual Checks ---

fn check_directories(layout: &DataLayout) -> CheckResult {
    if let Err(e) = layout.init() {
        return CheckResult::fail(
            "directories",
            "Failed to create directories",
            Some(e.to_string()),
        );
    }

    let marker = layout.logs_dir().join(".write_check");
    match std::fs::write(&marker, b"ok").and_then(|_| std::fs::remove_file(&marker)) {
        Ok(()) => CheckResult::pass(
            "directories",
            &format!("Data directory writable at {:?}", layout.data_dir()),
        ),
        Err(e) => CheckResult::fail(
            "directories",
            "Data directory is not writable",
            Some(e.to_string()),
        ),
    }
}

async fn check_store(store: &dyn VectorStore, round_id: &str) -> CheckResult {
    match store.count(round_id).await {
        Ok(count) => CheckResult::pass(
            "cache_store",
            &format!("Cache store OK ({} vectors in round '{}')", count, round_id),
        ),
        Err(e) => CheckResult::fail("cache_store", "Cannot query cache store", Some(e.to_string())),
    }
}

async fn check_model_registry(store: &dyn VectorStore, provider: &dyn EmbeddingProvider) -> CheckResult {
    match store.registered_dimension(provider.model_id()).await {
        Ok(None) => CheckResult::pass(
            "model_registry",
            &format!("Model '{}' not registered yet", provider.model_id()),
        ),
        Ok(Some(dimension)) if dimension == provider.dimension() => CheckResult::pass(
            "model_registry",
            &format!("Model '{}' registered with {} dims", provider.model_id(), dimension),
        ),
        Ok(Some(dimension)) => CheckResult::fail(
            "model_registry",
            "Registered dimension differs from the provider",
            Some(format!(
                "Registry: {}, provider: {}. Invalidate the model to recompute.",
                dimension,
                provider.dimension()
            )),
        ),
        Err(e) => CheckResult::fail("model_registry", "Cannot read model registry", Some(e.to_string())),
    }
}

async fn check_provider(provider: &dyn EmbeddingProvider) -> CheckResult {
    let texts: Vec<String> = SAMPLE_TEXTS.iter().map(|t| t.to_string()).collect();
    let result = tokio::time::timeout(PROVIDER_CHECK_TIMEOUT, provider.embed(&texts)).await;

    match result {
        Err(_) => CheckResult::fail("provider", "Provider check timed out", None),
        Ok(Err(e)) => CheckResult::fail("provider", "Provider check failed", Some(e.to_string())),
        Ok(Ok(items)) => {
            let bad: Vec<String> = items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match item {
                    Ok(v) if v.len() == provider.dimension() => None,
                    Ok(v) => Some(format!("item {}: {} dims", i, v.len())),
                    Err(e) => Some(format!("item {}: {}", i, e)),
                })
                .collect();
            if items.len() == texts.len() && bad.is_empty() {
                CheckResult::pass(
                    "provider",
                    &format!("Provider '{}' answered ({} dims)", provider.model_id(), provider.dimension()),
                )
            } else {
                CheckResult::fail(
                    "provider",
                    "Provider returned unusable vectors",
                    Some(format!("{} of {} items: {}", items.len(), texts.len(), bad.join("; "))),
                )
            }
        }
    }
}
