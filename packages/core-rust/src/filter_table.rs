//! Priority-ordered filter table with ambiguity detection.
//!
//! Resolution rule: among all filters matching a message, only those at the
//! numerically highest priority are candidates. Exactly one candidate is a
//! match; zero is a normal "not found"; two or more is `AmbiguousMatch`.
//! Lower-priority matches never win over a higher-priority match.

use std::sync::Arc;

use crate::filter::{same_filter, MessageFilter};
use crate::message::Message;

/// Errors raised by filter table mutation and lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("{count} filters matched the message at priority {priority}")]
    AmbiguousMatch { priority: i32, count: usize },
    #[error("filter is already registered in this table")]
    DuplicateFilter,
}

struct FilterEntry<T> {
    filter: Arc<dyn MessageFilter>,
    priority: i32,
    data: T,
}

/// Associative table from filter (by identity) to data and priority.
pub struct MessageFilterTable<T> {
    entries: Vec<FilterEntry<T>>,
}

impl<T> MessageFilterTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `filter` with its data and priority.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::DuplicateFilter` if this exact filter instance is
    /// already present.
    pub fn add(
        &mut self,
        filter: Arc<dyn MessageFilter>,
        data: T,
        priority: i32,
    ) -> Result<(), FilterError> {
        if self.contains(&filter) {
            return Err(FilterError::DuplicateFilter);
        }
        self.entries.push(FilterEntry {
            filter,
            priority,
            data,
        });
        Ok(())
    }

    /// Remove a filter by identity, returning its data.
    pub fn remove(&mut self, filter: &Arc<dyn MessageFilter>) -> Option<T> {
        let idx = self
            .entries
            .iter()
            .position(|entry| same_filter(&entry.filter, filter))?;
        Some(self.entries.remove(idx).data)
    }

    #[must_use]
    pub fn contains(&self, filter: &Arc<dyn MessageFilter>) -> bool {
        self.entries
            .iter()
            .any(|entry| same_filter(&entry.filter, filter))
    }

    /// Priority a filter was registered with.
    #[must_use]
    pub fn priority_of(&self, filter: &Arc<dyn MessageFilter>) -> Option<i32> {
        self.entries
            .iter()
            .find(|entry| same_filter(&entry.filter, filter))
            .map(|entry| entry.priority)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(filter, data, priority)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<dyn MessageFilter>, &T, i32)> {
        self.entries
            .iter()
            .map(|entry| (&entry.filter, &entry.data, entry.priority))
    }

    /// Data of the single best match, `Ok(None)` if nothing matches.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::AmbiguousMatch` if two or more filters match at
    /// the highest matching priority.
    pub fn try_get_best_match(&self, message: &Message) -> Result<Option<&T>, FilterError> {
        Ok(self.best_entry(message)?.map(|entry| &entry.data))
    }

    /// The single best matching filter.
    ///
    /// # Errors
    ///
    /// Same ambiguity rule as [`try_get_best_match`](Self::try_get_best_match).
    pub fn get_matching_filter(
        &self,
        message: &Message,
    ) -> Result<Option<&Arc<dyn MessageFilter>>, FilterError> {
        Ok(self.best_entry(message)?.map(|entry| &entry.filter))
    }

    /// All data whose filters match at the highest matching priority, in
    /// registration order. Never ambiguous: multi-result callers opt into ties.
    #[must_use]
    pub fn get_matching_values(&self, message: &Message) -> Vec<&T> {
        let matched = self.top_priority_matches(message);
        matched.into_iter().map(|entry| &entry.data).collect()
    }

    fn best_entry(&self, message: &Message) -> Result<Option<&FilterEntry<T>>, FilterError> {
        let matched = self.top_priority_matches(message);
        match matched.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(*single)),
            [first, ..] => Err(FilterError::AmbiguousMatch {
                priority: first.priority,
                count: matched.len(),
            }),
        }
    }

    fn top_priority_matches(&self, message: &Message) -> Vec<&FilterEntry<T>> {
        let mut best: Option<i32> = None;
        let mut matched: Vec<&FilterEntry<T>> = Vec::new();
        for entry in &self.entries {
            if best.is_some_and(|p| entry.priority < p) {
                continue;
            }
            if !entry.filter.matches(message) {
                continue;
            }
            if !best.is_some_and(|p| entry.priority <= p) {
                best = Some(entry.priority);
                matched.clear();
            }
            matched.push(entry);
        }
        matched
    }
}

impl<T> Default for MessageFilterTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MessageFilterTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| (&e.filter, e.priority, &e.data)),
            )
            .finish()
    }
}
