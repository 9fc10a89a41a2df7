//! Text embeddings for vocabulary labels.
//!
//! Three backends sit behind the same [`Embedder`] interface:
//! - `Trained`: a skip-gram model with negative sampling, fitted once on the
//!   vocabulary corpus
//! - `Fallback`: IDF-weighted bag-of-words random projection, used when the
//!   corpus is too small to train on
//! - `Table`: vectors supplied by the caller, keyed by label
//!
//! Every vector handed out is L2-normalized, so cosine similarity is a dot
//! product. All backends are deterministic for a fixed corpus and seed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::semantic::lexical::tokenize;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding unavailable: {0}")]
    Unavailable(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot normalize a zero-norm vector")]
    ZeroNormVector,

    #[error("Invalid embedding table: {0}")]
    InvalidTable(String),
}

/// Which backend the provider should use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Train when the corpus is large enough, otherwise fall back.
    #[default]
    Auto,
    Trained,
    Fallback,
}

/// Knobs for building a provider from a corpus.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingOptions {
    pub backend: EmbeddingBackend,
    pub dimensions: usize,
    pub min_corpus_tokens: usize,
    pub window: usize,
    pub epochs: usize,
    pub negative_samples: usize,
    pub learning_rate: f32,
    pub seed: u64,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Auto,
            dimensions: 100,
            min_corpus_tokens: 50,
            window: 2,
            epochs: 25,
            negative_samples: 3,
            learning_rate: 0.05,
            seed: 42,
        }
    }
}

pub trait Embedder {
    fn name(&self) -> &'static str;

    fn dimensions(&self) -> usize;

    /// Embed a text into a unit-length vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Embedding provider over a closed set of backends.
#[derive(Debug, Clone)]
pub enum EmbeddingProvider {
    Trained(SkipGramEmbedding),
    Fallback(BagOfWordsEmbedding),
    Table(TableEmbedding),
}

impl EmbeddingProvider {
    /// Build a provider for `corpus` (one sentence per entry).
    ///
    /// Never fails: a corpus that cannot be trained on yields the fallback
    /// projection.
    pub fn build(corpus: &[String], options: &EmbeddingOptions) -> Self {
        let distinct = distinct_tokens(corpus);

        let train = match options.backend {
            EmbeddingBackend::Fallback => false,
            EmbeddingBackend::Trained => !distinct.is_empty(),
            EmbeddingBackend::Auto => distinct.len() >= options.min_corpus_tokens,
        };

        if train {
            match SkipGramEmbedding::train(corpus, options) {
                Ok(model) => {
                    log::info!(
                        "trained embedding tokens={} dims={}",
                        model.vocabulary_size(),
                        model.dimensions()
                    );
                    return EmbeddingProvider::Trained(model);
                }
                Err(err) => log::warn!("embedding training failed, using fallback: {err}"),
            }
        } else if options.backend != EmbeddingBackend::Fallback {
            log::info!(
                "corpus has {} distinct tokens (< {}), using fallback embedding",
                distinct.len(),
                options.min_corpus_tokens
            );
        }

        EmbeddingProvider::Fallback(BagOfWordsEmbedding::fit(
            corpus,
            options.dimensions,
            options.seed,
        ))
    }

    /// Provider backed by precomputed vectors keyed by label.
    pub fn from_table(
        table: HashMap<String, Vec<f32>>,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        Ok(EmbeddingProvider::Table(TableEmbedding::new(table, dimensions)?))
    }

    fn inner(&self) -> &dyn Embedder {
        match self {
            EmbeddingProvider::Trained(model) => model,
            EmbeddingProvider::Fallback(model) => model,
            EmbeddingProvider::Table(model) => model,
        }
    }
}

impl Embedder for EmbeddingProvider {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn dimensions(&self) -> usize {
        self.inner().dimensions()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner().embed(text)
    }
}

/// Skip-gram with negative sampling over a small corpus.
#[derive(Debug, Clone)]
pub struct SkipGramEmbedding {
    vocabulary: BTreeMap<String, usize>,
    vectors: Vec<Vec<f32>>,
    dimensions: usize,
}

impl SkipGramEmbedding {
    pub fn train(corpus: &[String], options: &EmbeddingOptions) -> Result<Self, EmbeddingError> {
        let dims = options.dimensions;
        if dims == 0 {
            return Err(EmbeddingError::DimensionMismatch {
                expected: 1,
                got: 0,
            });
        }

        let vocabulary: BTreeMap<String, usize> = distinct_tokens(corpus)
            .into_iter()
            .enumerate()
            .map(|(idx, token)| (token, idx))
            .collect();
        if vocabulary.is_empty() {
            return Err(EmbeddingError::Unavailable("empty corpus".to_string()));
        }

        let sentences: Vec<Vec<usize>> = corpus
            .iter()
            .map(|line| {
                tokenize(line)
                    .into_iter()
                    .filter_map(|t| vocabulary.get(&t).copied())
                    .collect()
            })
            .collect();

        let vocab_size = vocabulary.len();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let init_range = 0.5 / dims as f32;
        let mut input: Vec<Vec<f32>> = (0..vocab_size)
            .map(|_| {
                (0..dims)
                    .map(|_| rng.random_range(-init_range..init_range))
                    .collect()
            })
            .collect();
        let mut output: Vec<Vec<f32>> = vec![vec![0.0; dims]; vocab_size];
        let mut gradient = vec![0.0f32; dims];

        let epochs = options.epochs.max(1);
        for epoch in 0..epochs {
            let progress = epoch as f32 / epochs as f32;
            let lr = (options.learning_rate * (1.0 - progress)).max(options.learning_rate * 1e-4);

            for sentence in &sentences {
                for (pos, &center) in sentence.iter().enumerate() {
                    let start = pos.saturating_sub(options.window);
                    let end = (pos + options.window + 1).min(sentence.len());
                    for (ctx_pos, &context) in sentence.iter().enumerate().take(end).skip(start) {
                        if ctx_pos == pos {
                            continue;
                        }
                        gradient.iter_mut().for_each(|g| *g = 0.0);

                        sgns_step(&input[center], &mut output[context], 1.0, lr, &mut gradient);
                        for _ in 0..options.negative_samples {
                            let negative = rng.random_range(0..vocab_size);
                            if negative == context {
                                continue;
                            }
                            sgns_step(&input[center], &mut output[negative], 0.0, lr, &mut gradient);
                        }

                        for (w, g) in input[center].iter_mut().zip(gradient.iter()) {
                            *w += g;
                        }
                    }
                }
            }
        }

        Ok(Self {
            vocabulary,
            vectors: input,
            dimensions: dims,
        })
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }
}

/// One logistic update of an (input, output) pair; accumulates the input
/// gradient into `gradient` and applies the output update in place.
fn sgns_step(input: &[f32], output: &mut [f32], label: f32, lr: f32, gradient: &mut [f32]) {
    let dot: f32 = input.iter().zip(output.iter()).map(|(a, b)| a * b).sum();
    let g = (label - sigmoid(dot)) * lr;
    for ((grad, out), inp) in gradient.iter_mut().zip(output.iter_mut()).zip(input.iter()) {
        *grad += g * *out;
        *out += g * inp;
    }
}

impl Embedder for SkipGramEmbedding {
    fn name(&self) -> &'static str {
        "skipgram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut sum = vec![0.0f32; self.dimensions];
        let mut known = 0usize;
        for token in tokenize(text) {
            if let Some(&idx) = self.vocabulary.get(&token) {
                for (s, v) in sum.iter_mut().zip(self.vectors[idx].iter()) {
                    *s += v;
                }
                known += 1;
            }
        }
        if known == 0 {
            return Err(EmbeddingError::Unavailable(format!(
                "no trained tokens in '{text}'"
            )));
        }
        l2_normalize(sum)
    }
}

/// IDF-weighted sum of per-token random projections.
#[derive(Debug, Clone)]
pub struct BagOfWordsEmbedding {
    idf: BTreeMap<String, f32>,
    unknown_idf: f32,
    projections: HashMap<String, Vec<f32>>,
    dimensions: usize,
    seed: u64,
}

impl BagOfWordsEmbedding {
    pub fn fit(corpus: &[String], dimensions: usize, seed: u64) -> Self {
        let mut document_frequency: BTreeMap<String, usize> = BTreeMap::new();
        for line in corpus {
            let unique: BTreeSet<String> = tokenize(line).into_iter().collect();
            for token in unique {
                *document_frequency.entry(token).or_insert(0) += 1;
            }
        }

        let documents = corpus.len() as f32;
        let idf: BTreeMap<String, f32> = document_frequency
            .into_iter()
            .map(|(token, df)| {
                let weight = ((documents + 1.0) / (df as f32 + 1.0)).ln() + 1.0;
                (token, weight)
            })
            .collect();
        let unknown_idf = (documents + 1.0).ln() + 1.0;

        let projections = idf
            .keys()
            .map(|token| (token.clone(), project_token(token, dimensions, seed)))
            .collect();

        Self {
            idf,
            unknown_idf,
            projections,
            dimensions,
            seed,
        }
    }
}

impl Embedder for BagOfWordsEmbedding {
    fn name(&self) -> &'static str {
        "bag-of-words"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut term_frequency: BTreeMap<String, f32> = BTreeMap::new();
        for token in tokenize(text) {
            *term_frequency.entry(token).or_insert(0.0) += 1.0;
        }
        if term_frequency.is_empty() {
            return Err(EmbeddingError::Unavailable(format!("no tokens in '{text}'")));
        }

        let mut sum = vec![0.0f32; self.dimensions];
        for (token, tf) in &term_frequency {
            let weight = tf * self.idf.get(token).copied().unwrap_or(self.unknown_idf);
            let computed;
            let projection = match self.projections.get(token) {
                Some(p) => p,
                None => {
                    computed = project_token(token, self.dimensions, self.seed);
                    &computed
                }
            };
            for (s, p) in sum.iter_mut().zip(projection.iter()) {
                *s += weight * p;
            }
        }
        l2_normalize(sum)
    }
}

/// Deterministic pseudo-random direction for a token.
fn project_token(token: &str, dimensions: usize, seed: u64) -> Vec<f32> {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(bytes) ^ seed);
    (0..dimensions).map(|_| rng.random_range(-1.0f32..1.0)).collect()
}

/// Caller-supplied vectors keyed by label.
#[derive(Debug, Clone)]
pub struct TableEmbedding {
    vectors: HashMap<String, Vec<f32>>,
    dimensions: usize,
}

impl TableEmbedding {
    pub fn new(table: HashMap<String, Vec<f32>>, dimensions: usize) -> Result<Self, EmbeddingError> {
        let mut vectors = HashMap::with_capacity(table.len());
        for (label, vector) in table {
            if vector.len() != dimensions {
                return Err(EmbeddingError::InvalidTable(format!(
                    "vector for '{label}' has {} dimensions, expected {dimensions}",
                    vector.len()
                )));
            }
            let normalized = l2_normalize(vector)
                .map_err(|_| EmbeddingError::InvalidTable(format!("zero vector for '{label}'")))?;
            vectors.insert(table_key(&label), normalized);
        }
        Ok(Self {
            vectors,
            dimensions,
        })
    }
}

impl Embedder for TableEmbedding {
    fn name(&self) -> &'static str {
        "table"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .get(&table_key(text))
            .cloned()
            .ok_or_else(|| EmbeddingError::Unavailable(format!("'{text}' not in table")))
    }
}

fn table_key(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn distinct_tokens(corpus: &[String]) -> BTreeSet<String> {
    corpus.iter().flat_map(|line| tokenize(line)).collect()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Scale a vector to unit length.
pub fn l2_normalize(mut v: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON || !norm.is_finite() {
        return Err(EmbeddingError::ZeroNormVector);
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(v)
}

/// Cosine similarity of two unit vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
