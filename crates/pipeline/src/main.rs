//! kg-build
//!
//! Build a knowledge graph from a file of text chunks and write it as JSON.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use extract::Chunk;
use graph::{GraphStore, MemoryGraphStore};
use pipeline::{BuildConfig, KgBuilder, OperationMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kg-build")]
#[command(author, version, about = "Extract entities and relations from text chunks into a knowledge graph", long_about = None)]
struct Cli {
    /// Chunks as a JSON array or JSON lines of {"id", "content"}
    #[arg(short, long)]
    chunks: PathBuf,

    /// JSON build config. Flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Preset used when no config file is given
    #[arg(long, value_enum, default_value_t = Mode::Balanced)]
    mode: Mode,

    /// Where to write the graph
    #[arg(short, long, default_value = "graph.json")]
    output: PathBuf,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    no_cache: bool,

    #[arg(long)]
    no_batching: bool,

    /// Let the scheduler resize batches from observed latency
    #[arg(long)]
    adaptive: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Fast,
    Balanced,
    Accurate,
}

impl From<Mode> for OperationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fast => OperationMode::Fast,
            Mode::Balanced => OperationMode::Balanced,
            Mode::Accurate => OperationMode::Accurate,
        }
    }
}

impl Cli {
    fn build_config(&self) -> Result<BuildConfig> {
        let mut config = match &self.config {
            Some(path) => BuildConfig::from_file(path)?,
            None => BuildConfig::for_mode(self.mode.into()),
        };

        if let Some(model) = &self.model {
            config.model.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.model.base_url = base_url.clone();
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
        if self.no_batching {
            config.scheduler.enabled = false;
        }
        if self.adaptive {
            config.scheduler.adaptive.enabled = true;
        }
        if let Some(batch_size) = self.batch_size {
            config.scheduler.batch_size = batch_size;
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn read_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read chunks from {}", path.display()))?;

    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid chunk on line {}", idx + 1))
            })
            .collect()
    } else {
        serde_json::from_str(&raw).context("Invalid chunk array")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.build_config()?;
    let chunks = read_chunks(&cli.chunks).await?;
    info!(chunks = chunks.len(), path = %cli.chunks.display(), "Loaded chunks");

    let builder = KgBuilder::from_config(config)?;
    let store = Arc::new(MemoryGraphStore::new());
    let report = builder
        .build(chunks, Arc::clone(&store) as Arc<dyn GraphStore>)
        .await?;

    let snapshot = store.snapshot().await;
    let json = serde_json::to_string_pretty(&snapshot)?;
    tokio::fs::write(&cli.output, json)
        .await
        .with_context(|| format!("Failed to write graph to {}", cli.output.display()))?;

    info!(
        nodes = snapshot.nodes.len(),
        edges = snapshot.edges.len(),
        output = %cli.output.display(),
        "Graph written"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
