use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const CACHE_DB_FILENAME: &str = "embeddings.sqlite";

/// Directory tree under the configured data root.
///
/// ```text
/// <root>/db/embeddings.sqlite
/// <root>/models/            fastembed model cache
/// <root>/logs/runs.log
/// <root>/output/<round_id>/ JSON artifacts
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data root itself.
    pub fn data_dir(&self) -> &Path {
        &self.root
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    /// SQLite file of the embedding cache.
    pub fn cache_db_path(&self) -> PathBuf {
        self.db_dir().join(CACHE_DB_FILENAME)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Artifacts of one round.
    pub fn output_dir(&self, round_id: &str) -> PathBuf {
        self.root.join("output").join(round_id)
    }

    /// Creates the data, db, models and logs directories when missing.
    pub fn init(&self) -> Result<(), std::io::Error> {
        for path in [self.root.clone(), self.db_dir(), self.models_dir(), self.logs_dir()] {
            if !path.exists() {
                info!("Creating directory: {:?}", path);
                fs::create_dir_all(&path)?;
            }
        }
        Ok(())
    }
}
