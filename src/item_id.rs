use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

/// Stable identifier of a vocabulary item.
///
/// Ids are compared lexicographically; every ordering guarantee in the crate
/// (pair enumeration, merge order, ranking tie-breaks) relies on this.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ItemId(s.to_string()))
    }
}

impl Deref for ItemId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(fr: &str) -> Self {
        ItemId(fr.to_string())
    }
}

impl From<String> for ItemId {
    fn from(fr: String) -> Self {
        ItemId(fr)
    }
}

impl From<ItemId> for String {
    fn from(fr: ItemId) -> Self {
        fr.0
    }
}

impl ItemId {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
