//! Text keyword triggers.
//!
//! Triggers are plain keywords matched against decoded textual response
//! bodies. They are meant for highly specific content; any text payload is
//! subject to them, so common words make poor triggers. Keywords are
//! case-folded on load and duplicates collapse.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use crate::error::{CoreError, Result};
use crate::options::CategorySet;

/// A trigger keyword found in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHit {
    pub category: u8,
    pub keyword: String,
}

/// Case-folded keyword sets grouped by category.
#[derive(Default)]
pub struct TriggerStore {
    inner: RwLock<BTreeMap<u8, BTreeSet<String>>>,
}

impl TriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads one keyword per line into `category`, returning how many unique
    /// keywords the category now gained. Category 0 is reserved.
    pub fn load_from_text(&self, text: &str, category: u8, flush_existing: bool) -> Result<u32> {
        if category == 0 {
            return Err(CoreError::ReservedCategory);
        }

        let mut inner = self.inner.write();
        if flush_existing {
            inner.remove(&category);
        }
        let set = inner.entry(category).or_default();

        let mut loaded = 0;
        for line in text.split(['\n', '\r']) {
            let keyword = line.trim();
            if keyword.is_empty() {
                continue;
            }
            if set.insert(keyword.to_lowercase()) {
                loaded += 1;
            }
        }
        if set.is_empty() {
            inner.remove(&category);
        }
        Ok(loaded)
    }

    /// Drops every trigger in `category`.
    pub fn unload_category(&self, category: u8) {
        self.inner.write().remove(&category);
    }

    /// True when any enabled category holds triggers. Cheap pre-check before
    /// buffering a body.
    pub fn has_triggers(&self, categories: &CategorySet) -> bool {
        self.inner
            .read()
            .iter()
            .any(|(&cat, set)| categories.get(cat) && !set.is_empty())
    }

    /// Scans a textual payload for the first enabled trigger keyword.
    /// A linear substring scan over the case-folded body.
    pub fn scan(&self, body: &str, categories: &CategorySet) -> Option<TriggerHit> {
        let folded = body.to_lowercase();
        let inner = self.inner.read();
        for (&category, keywords) in inner.iter() {
            if !categories.get(category) {
                continue;
            }
            for keyword in keywords {
                if folded.contains(keyword.as_str()) {
                    return Some(TriggerHit {
                        category,
                        keyword: keyword.clone(),
                    });
                }
            }
        }
        None
    }
}
