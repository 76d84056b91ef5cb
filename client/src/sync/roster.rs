use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Read-only view of the ids currently online. Cloning is cheap; the set
/// behind it is never mutated once published.
#[derive(Debug, Clone)]
pub struct Roster {
    ids: Arc<HashSet<String>>,
    updated_at: DateTime<Utc>,
}

impl Roster {
    pub fn empty() -> Self {
        Self::from_set(HashSet::new())
    }

    pub(crate) fn from_set(ids: HashSet<String>) -> Self {
        Self {
            ids: Arc::new(ids),
            updated_at: Utc::now(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Ids in lexical order, for display and stable comparisons.
    pub fn to_sorted_vec(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// When the change that produced this snapshot was applied.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::empty()
    }
}

/// Two rosters are equal when they hold the same ids, regardless of when they were taken.
impl PartialEq for Roster {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
    }
}

impl Eq for Roster {}

/// An incremental online/offline change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Added(String),
    Removed(String),
}

impl Delta {
    /// Apply to a set. Returns true if the set changed; re-adding a present id or
    /// removing an absent one is a no-op.
    pub fn apply(&self, ids: &mut HashSet<String>) -> bool {
        match self {
            Delta::Added(id) => ids.insert(id.clone()),
            Delta::Removed(id) => ids.remove(id),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Delta::Added(id) | Delta::Removed(id) => id,
        }
    }
}
