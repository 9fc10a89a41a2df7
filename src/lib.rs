//! Semantic link suggestions between bowtie vocabulary items.
//!
//! A vocabulary snapshot (activities, pressures, consequences, controls) is
//! scored pairwise by keyword and embedding similarity, ranked by a
//! confidence model learned from accept/reject feedback, and every
//! suggestion carries an explanation of what drove its confidence.

pub mod candidate;
pub mod config;
pub mod dispatch;
pub mod ensemble;
pub mod explain;
pub mod features;
pub mod feedback;
pub mod item_id;
pub mod semantic;
pub mod suggest;
pub mod vocabulary;

#[cfg(test)]
mod tests;

pub use candidate::{ConfidenceBucket, Explanation, Factor, LinkCandidate};
pub use config::Config;
pub use suggest::{SuggestError, SuggestionRequest, SuggestionResponse, SuggestionService};
pub use vocabulary::{Category, VocabularyItem};
