use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Deserialize;

use vocablink::ensemble::EnsembleModel;
use vocablink::feedback::FeedbackEvent;
use vocablink::vocabulary::VocabularyItem;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML config; defaults are used when it does not exist
    #[clap(short, long, default_value = "vocablink.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct InputArgs {
    /// Vocabulary snapshot: a JSON array of items
    #[clap(short, long)]
    pub vocabulary: PathBuf,

    /// Feedback log: one JSON event per line
    #[clap(short, long)]
    pub feedback: Option<PathBuf>,

    /// Previously trained model to serve with
    #[clap(short, long)]
    pub model: Option<PathBuf>,

    /// Precomputed label embeddings (JSON) instead of training them
    #[clap(long)]
    pub embeddings: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Rank link suggestions for the vocabulary
    Suggest {
        #[clap(flatten)]
        input: InputArgs,

        /// Only suggestions starting at this item
        #[clap(long)]
        from: Option<String>,

        /// Maximum number of suggestions
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Score and explain a single directed pair
    Score {
        #[clap(flatten)]
        input: InputArgs,

        from: String,

        to: String,
    },

    /// Retrain the confidence model on the feedback log
    Retrain {
        #[clap(flatten)]
        input: InputArgs,

        /// Write the accepted model here
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the state of the confidence model
    ModelInfo {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Print the effective configuration, or write it to a file
    Config {
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

/// Precomputed embeddings file.
#[derive(Debug, Deserialize)]
pub struct EmbeddingTableFile {
    pub dimensions: usize,
    /// Label to vector
    pub vectors: HashMap<String, Vec<f32>>,
}

pub fn load_vocabulary(path: &Path) -> anyhow::Result<Vec<VocabularyItem>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("malformed vocabulary {}", path.display()))
}

/// Events with their 1-based line numbers; blank lines are skipped.
pub fn load_feedback(path: &Path) -> anyhow::Result<Vec<(usize, FeedbackEvent)>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open feedback log {}", path.display()))?;

    let mut events = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: FeedbackEvent = serde_json::from_str(&line)
            .with_context(|| format!("malformed feedback at {}:{}", path.display(), idx + 1))?;
        events.push((idx + 1, event));
    }
    Ok(events)
}

pub fn load_model(path: &Path) -> anyhow::Result<EnsembleModel> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read model {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("malformed model {}", path.display()))
}

pub fn save_model(path: &Path, model: &EnsembleModel) -> anyhow::Result<()> {
    let data = serde_json::to_vec(model)?;
    std::fs::write(path, data).with_context(|| format!("failed to write model {}", path.display()))
}

pub fn load_embeddings(path: &Path) -> anyhow::Result<EmbeddingTableFile> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read embeddings {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("malformed embeddings {}", path.display()))
}
