// phrasemap CLI entry point
// Each command reads and writes JSON artifacts under <data>/output/<round_id>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use phrasemap_core::actors::{CacheOptions, EmbeddingCacheHandle};
use phrasemap_core::clustering::{ClusteringEngine, Hdbscan};
use phrasemap_core::config::{PipelineConfig, ProviderKind};
use phrasemap_core::embedding::{
    CacheKey, EmbeddingProvider, FastEmbedProvider, HttpEmbeddingProvider, SqliteVectorStore,
    VectorStore,
};
use phrasemap_core::fs_manager::DataLayout;
use phrasemap_core::models::{Cluster, ClusterId};
use phrasemap_core::pipeline::directions::{load_directions, top_n_by_frequency};
use phrasemap_core::pipeline::{Corpus, CorpusOptions, Pipeline, ResplitRun, StageAResult, StageBResult};
use phrasemap_core::preflight::run_preflight_checks;
use phrasemap_core::run_logger::RunJournal;
use phrasemap_core::telemetry::{self, LogFormat};
use phrasemap_core::text::normalize;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const CORPUS_FILE: &str = "corpus.json";
const STAGE_A_FILE: &str = "stage_a.json";
const DIRECTIONS_FILE: &str = "directions.json";
const STAGE_B_FILE: &str = "stage_b.json";
const RESPLIT_FILE: &str = "resplit.json";

/// Two-stage semantic clustering of search-query phrases.
#[derive(Parser, Debug)]
#[command(name = "phrasemap", version, about)]
struct Cli {
    /// Round identifier; partitions cached vectors and output artifacts.
    #[arg(long, global = true)]
    round_id: Option<String>,

    /// Data root (cache database, models, logs, output).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log output: pretty or json (bunyan).
    #[arg(long, global = true, default_value = "pretty", env = "PHRASEMAP_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster the whole corpus coarsely.
    StageA {
        /// Phrase rows as a JSON array or JSON Lines.
        #[arg(long)]
        corpus: PathBuf,
    },
    /// Promote the heaviest Stage-A clusters to directions.
    SelectDirections {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Re-cluster each direction finely.
    StageB {
        /// Direction table; defaults to the round's directions.json.
        #[arg(long)]
        directions: Option<PathBuf>,
    },
    /// Split clusters above the size threshold one level down.
    Resplit {
        /// Resplit Stage-B clusters of this direction instead of Stage-A clusters.
        #[arg(long)]
        direction: Option<String>,
        /// Only this cluster.
        #[arg(long)]
        cluster: Option<ClusterId>,
        #[arg(long)]
        threshold: Option<usize>,
    },
    /// Drop cached vectors so they are recomputed on the next run.
    Invalidate {
        /// Every vector of the configured model and its registry entry.
        #[arg(long)]
        model: bool,
        /// Phrase texts to drop from this round (normalized before hashing).
        #[arg(long = "text")]
        texts: Vec<String>,
    },
    /// Verify directories, cache store, model registry and provider.
    Check,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::StageA { .. } => "stage-a",
            Commands::SelectDirections { .. } => "select-directions",
            Commands::StageB { .. } => "stage-b",
            Commands::Resplit { .. } => "resplit",
            Commands::Invalidate { .. } => "invalidate",
            Commands::Check => "check",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing("phrasemap", cli.log_format)?;

    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;
    if let Some(round_id) = &cli.round_id {
        config.round_id = round_id.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Commands::Resplit { threshold: Some(t), .. } = &cli.command {
        config.resplit_threshold = *t;
    }
    config.check().context("Invalid configuration")?;

    let layout = config.layout();
    layout.init().context("Failed to initialize data directory")?;

    let command = cli.command.name();
    let mut journal = RunJournal::start(&layout, command, &config.round_id)?;
    let result = run(cli.command, &config, &layout, &mut journal).await;
    match &result {
        Ok(()) => journal.complete(true),
        Err(e) => {
            journal.log_error(&format!("{:#}", e), Some(command));
            journal.complete(false);
        }
    }
    result
}

async fn run(
    command: Commands,
    config: &PipelineConfig,
    layout: &DataLayout,
    journal: &mut RunJournal,
) -> Result<()> {
    let output = layout.output_dir(&config.round_id);
    std::fs::create_dir_all(&output)?;

    match command {
        Commands::StageA { corpus } => {
            let corpus = Corpus::load(
                &corpus,
                CorpusOptions {
                    merge_duplicates: config.merge_duplicates,
                },
            )?;
            let pipeline = build_pipeline(config, layout).await?;
            let result = pipeline.run_stage_a(&corpus).await?;
            journal.record_report(result.report.clone());

            write_json(&output.join(CORPUS_FILE), &corpus)?;
            write_json(&output.join(STAGE_A_FILE), &result)?;
            info!(
                clusters = result.report.cluster_count,
                output = ?output,
                "Stage A written"
            );
        }
        Commands::SelectDirections { top } => {
            let stage_a: StageAResult = read_json(&output.join(STAGE_A_FILE))?;
            let directions = top_n_by_frequency(&stage_a.summaries, top, &stage_a.round_id);
            if directions.is_empty() {
                bail!("Stage A produced no non-noise clusters to promote");
            }
            write_json(&output.join(DIRECTIONS_FILE), &directions)?;
            info!(directions = directions.len(), "Directions written");
        }
        Commands::StageB { directions } => {
            let corpus: Corpus = read_json(&output.join(CORPUS_FILE))?;
            let stage_a: StageAResult = read_json(&output.join(STAGE_A_FILE))?;
            let path = directions.unwrap_or_else(|| output.join(DIRECTIONS_FILE));
            let directions = load_directions(&path)
                .with_context(|| format!("Failed to read directions from {:?}", path))?;

            let pipeline = build_pipeline(config, layout).await?;
            let result = pipeline.run_stage_b(&corpus, &stage_a, &directions).await?;
            for direction in &result.directions {
                journal.record_report(direction.report.clone());
            }
            write_json(&output.join(STAGE_B_FILE), &result)?;
            info!(directions = result.directions.len(), "Stage B written");
        }
        Commands::Resplit {
            direction, cluster, ..
        } => {
            let corpus: Corpus = read_json(&output.join(CORPUS_FILE))?;
            let clusters: Vec<Cluster> = match &direction {
                None => read_json::<StageAResult>(&output.join(STAGE_A_FILE))?.clusters,
                Some(keyword) => read_json::<StageBResult>(&output.join(STAGE_B_FILE))?
                    .direction(keyword)
                    .map(|d| d.clusters.clone())
                    .with_context(|| format!("No Stage-B direction '{}'", keyword))?,
            };

            let pipeline = build_pipeline(config, layout).await?;
            let runs: Vec<ResplitRun> = match cluster {
                Some(id) => {
                    let target = clusters
                        .iter()
                        .find(|c| c.cluster_id == id)
                        .with_context(|| format!("Unknown cluster {}", id))?;
                    pipeline
                        .resplit(&corpus, target, direction.as_deref())
                        .await?
                        .into_iter()
                        .collect()
                }
                None => {
                    pipeline
                        .resplit_oversized(&corpus, &clusters, direction.as_deref())
                        .await?
                }
            };
            for run in &runs {
                journal.record_report(run.report.clone());
            }
            write_json(&output.join(RESPLIT_FILE), &runs)?;
            info!(
                resplit = runs.len(),
                threshold = pipeline.resplitter().size_threshold(),
                "Resplit written"
            );
        }
        Commands::Invalidate { model, texts } => {
            if !model && texts.is_empty() {
                bail!("Nothing to invalidate: pass --model or at least one --text");
            }
            let cache = build_cache(config, layout).await?;
            if model {
                let removed = cache.invalidate_model().await?;
                info!(removed, model_id = cache.model_id(), "Model invalidated");
            }
            if !texts.is_empty() {
                let keys: Vec<CacheKey> = texts
                    .iter()
                    .map(|t| CacheKey::compute(&normalize(t), cache.model_id()))
                    .collect();
                let removed = cache.invalidate(keys).await?;
                info!(removed, "Keys invalidated");
            }
        }
        Commands::Check => {
            let store = open_store(layout).await?;
            let provider = build_provider(config, layout).await?;
            let report =
                run_preflight_checks(layout, store.as_ref(), provider.as_ref(), &config.round_id).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_passed {
                bail!(report.summary);
            }
        }
    }
    Ok(())
}

async fn open_store(layout: &DataLayout) -> Result<Arc<dyn VectorStore>> {
    let store = SqliteVectorStore::open(&layout.cache_db_path())
        .await
        .context("Failed to open embedding cache")?;
    Ok(Arc::new(store))
}

async fn build_provider(config: &PipelineConfig, layout: &DataLayout) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedding = &config.embedding;
    let provider: Arc<dyn EmbeddingProvider> = match embedding.provider {
        ProviderKind::Fastembed => {
            Arc::new(FastEmbedProvider::load(&embedding.model_id, layout.models_dir()).await?)
        }
        ProviderKind::Http => {
            let (Some(endpoint), Some(dimension)) = (&embedding.endpoint, embedding.dimension) else {
                bail!("The http provider needs an endpoint and a dimension");
            };
            Arc::new(HttpEmbeddingProvider::new(
                endpoint,
                &embedding.model_id,
                dimension,
                embedding.api_key.clone(),
                embedding.request_timeout(),
            )?)
        }
    };
    Ok(provider)
}

async fn build_cache(config: &PipelineConfig, layout: &DataLayout) -> Result<EmbeddingCacheHandle> {
    let store = open_store(layout).await?;
    let provider = build_provider(config, layout).await?;
    let options: CacheOptions = config.embedding.cache_options();
    Ok(EmbeddingCacheHandle::spawn(
        config.round_id.clone(),
        store,
        provider,
        options,
    ))
}

async fn build_pipeline(config: &PipelineConfig, layout: &DataLayout) -> Result<Pipeline> {
    let cache = build_cache(config, layout).await?;
    let engine = ClusteringEngine::new(Arc::new(Hdbscan), config.silhouette_max_points);
    Ok(Pipeline::new(config, cache, engine)?)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("Failed to parse {:?}", path))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write {:?}", path))
}
