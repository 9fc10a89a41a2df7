//! Vocabulary snapshot and the category adjacency table.
//!
//! A [`Snapshot`] is the immutable set of vocabulary items the engine works
//! against. Loading a new snapshot replaces the previous one wholesale; its
//! fingerprint is what downstream caches key their invalidation on.

use std::collections::HashMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::item_id::ItemId;

/// Bow-tie role of a vocabulary item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "Activity")]
    Activity,
    #[serde(alias = "Pressure")]
    Pressure,
    #[serde(alias = "Consequence")]
    Consequence,
    #[serde(alias = "Control")]
    Control,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Activity => "activity",
            Category::Pressure => "pressure",
            Category::Consequence => "consequence",
            Category::Control => "control",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry of the vocabulary hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VocabularyItem {
    pub id: ItemId,
    pub label: String,
    pub category: Category,
    /// Level 1 items are category headers and never become link endpoints.
    #[serde(alias = "hierarchyLevel")]
    pub hierarchy_level: u32,
    /// Weak reference; a dangling parent is tolerated.
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<ItemId>,
}

impl VocabularyItem {
    pub fn new(id: &str, label: &str, category: Category, hierarchy_level: u32) -> Self {
        Self {
            id: ItemId::from(id),
            label: label.to_string(),
            category,
            hierarchy_level,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent_id = Some(ItemId::from(parent));
        self
    }

    /// Whether the item may appear on either end of a link candidate.
    pub fn is_linkable(&self) -> bool {
        self.hierarchy_level > 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VocabularyError {
    #[error("duplicate item id: {0}")]
    DuplicateId(ItemId),

    #[error("item {id} has invalid hierarchy level {level} (must be >= 1)")]
    InvalidLevel { id: ItemId, level: u32 },

    #[error("item {0} has an empty label")]
    EmptyLabel(ItemId),
}

/// One allowed category transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    pub from: Category,
    pub to: Category,
}

/// Table of category transitions a link may follow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkRules {
    transitions: Vec<Transition>,
}

impl Default for LinkRules {
    fn default() -> Self {
        Self::new(DOCUMENTED_TRANSITIONS.to_vec())
    }
}

/// Transitions with a dedicated link-type feature slot, in slot order.
pub const DOCUMENTED_TRANSITIONS: [Transition; 4] = [
    Transition {
        from: Category::Activity,
        to: Category::Pressure,
    },
    Transition {
        from: Category::Pressure,
        to: Category::Consequence,
    },
    Transition {
        from: Category::Activity,
        to: Category::Control,
    },
    Transition {
        from: Category::Consequence,
        to: Category::Control,
    },
];

impl LinkRules {
    pub fn new(mut transitions: Vec<Transition>) -> Self {
        transitions.sort_by_key(|t| (t.from, t.to));
        transitions.dedup();
        Self { transitions }
    }

    pub fn allows(&self, from: Category, to: Category) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Categories reachable in one hop from `from`, in category order.
    pub fn targets(&self, from: Category) -> impl Iterator<Item = Category> + '_ {
        self.transitions
            .iter()
            .filter(move |t| t.from == from)
            .map(|t| t.to)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// Kind of link, derived from the endpoint categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkType {
    pub from: Category,
    pub to: Category,
}

impl LinkType {
    pub fn new(from: Category, to: Category) -> Self {
        Self { from, to }
    }

    /// Index into [`DOCUMENTED_TRANSITIONS`], if this is one of them.
    pub fn slot(&self) -> Option<usize> {
        DOCUMENTED_TRANSITIONS
            .iter()
            .position(|t| t.from == self.from && t.to == self.to)
    }
}

impl Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Immutable, id-ordered view of a loaded vocabulary.
#[derive(Debug, Clone)]
pub struct Snapshot {
    items: Vec<VocabularyItem>,
    index: HashMap<ItemId, usize>,
    fingerprint: [u8; 32],
}

impl Snapshot {
    /// Validate and freeze a vocabulary. Items are re-ordered by id.
    pub fn new(mut items: Vec<VocabularyItem>) -> Result<Self, VocabularyError> {
        items.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index = HashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            if item.hierarchy_level == 0 {
                return Err(VocabularyError::InvalidLevel {
                    id: item.id.clone(),
                    level: item.hierarchy_level,
                });
            }
            if item.label.trim().is_empty() {
                return Err(VocabularyError::EmptyLabel(item.id.clone()));
            }
            if index.insert(item.id.clone(), pos).is_some() {
                return Err(VocabularyError::DuplicateId(item.id.clone()));
            }
        }

        for item in &items {
            if let Some(parent) = &item.parent_id {
                if !index.contains_key(parent) {
                    log::debug!("item {} references missing parent {}", item.id, parent);
                }
            }
        }

        let fingerprint = Self::compute_fingerprint(&items);

        Ok(Self {
            items,
            index,
            fingerprint,
        })
    }

    pub fn empty() -> Self {
        Self {
            items: vec![],
            index: HashMap::new(),
            fingerprint: Self::compute_fingerprint(&[]),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &ItemId) -> Option<&VocabularyItem> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    /// All items in ascending id order.
    pub fn items(&self) -> &[VocabularyItem] {
        &self.items
    }

    /// Linkable items of one category, ascending id order.
    pub fn linkable(&self, category: Category) -> impl Iterator<Item = &VocabularyItem> + '_ {
        self.items
            .iter()
            .filter(move |item| item.category == category && item.is_linkable())
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Short hex form of the fingerprint for logs and metadata.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Every (from, to) pair permitted by `rules`, sorted by (from, to).
    pub fn eligible_pairs(&self, rules: &LinkRules) -> Vec<(ItemId, ItemId)> {
        let mut pairs = Vec::new();
        for from in self.items.iter().filter(|item| item.is_linkable()) {
            for target in rules.targets(from.category) {
                for to in self.linkable(target) {
                    if to.id != from.id {
                        pairs.push((from.id.clone(), to.id.clone()));
                    }
                }
            }
        }
        pairs.sort();
        pairs
    }

    fn compute_fingerprint(items: &[VocabularyItem]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for item in items {
            hasher.update(item.id.as_bytes());
            hasher.update([0x1f]);
            hasher.update(item.label.as_bytes());
            hasher.update([0x1f]);
            hasher.update(item.category.as_str().as_bytes());
            hasher.update(item.hierarchy_level.to_le_bytes());
            hasher.update([0x1e]);
        }
        hasher.finalize().into()
    }
}
