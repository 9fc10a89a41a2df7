//! Similarity infrastructure for vocabulary items.
//!
//! # Architecture
//!
//! - `lexical`: Keyword tokenizer and Jaccard similarity
//! - `preprocess`: Label normalization before scoring
//! - `embeddings`: Embedding provider (trained, fallback, table backends)
//! - `similarity`: Pairwise and causal-chain scoring
//! - `cache`: Pair score memoization keyed by method version

pub mod cache;
pub mod embeddings;
pub mod lexical;
mod preprocess;
pub mod similarity;

pub use cache::{method_version, SimilarityCache};
pub use embeddings::{Embedder, EmbeddingBackend, EmbeddingError, EmbeddingOptions, EmbeddingProvider};
pub use preprocess::{preprocess_label, word_count};
pub use similarity::{Method, PairScore, PairScorer, SimilarityEngine, SimilarityError};

/// Default threshold a hop must exceed to take part in a causal chain
pub const DEFAULT_CHAIN_THRESHOLD: f32 = 0.5;
