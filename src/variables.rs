//! Indexed request-scoped variable slots
//!
//! Slot names are registered once from configuration (`$name` form) and
//! resolve to a [`SlotIndex`]. Each client request then gets its own
//! [`SlotTable`] through which the orchestrator hands the next fetch's
//! target URI and Range value to the dispatch path.

use crate::error::{RelayError, Result};
use std::fmt;

/// Index of a registered slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry of slot names, shared by every request
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    names: Vec<String>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `$name` slot, returning the existing index if already known
    ///
    /// # Returns
    /// * `Err(RelayError::ConfigError)` if the name lacks the `$` prefix or is empty
    pub fn register(&mut self, name: &str) -> Result<SlotIndex> {
        let bare = name
            .strip_prefix('$')
            .filter(|bare| !bare.is_empty())
            .ok_or_else(|| RelayError::ConfigError(format!("invalid variable name \"{}\"", name)))?;

        if let Some(index) = self.index_of(bare) {
            return Ok(index);
        }

        self.names.push(bare.to_string());
        Ok(SlotIndex(self.names.len() - 1))
    }

    /// Look up a slot by name, with or without the `$` prefix
    pub fn index_of(&self, name: &str) -> Option<SlotIndex> {
        let bare = name.strip_prefix('$').unwrap_or(name);
        self.names.iter().position(|n| n == bare).map(SlotIndex)
    }

    pub fn name(&self, index: SlotIndex) -> Option<&str> {
        self.names.get(index.0).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Allocate an empty value table for one request
    pub fn new_table(&self) -> SlotTable {
        SlotTable {
            values: vec![None; self.names.len()],
        }
    }
}

/// Per-request slot values
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    values: Vec<Option<String>>,
}

impl SlotTable {
    pub fn set(&mut self, index: SlotIndex, value: impl Into<String>) -> Result<()> {
        let slot = self
            .values
            .get_mut(index.0)
            .ok_or_else(|| RelayError::InternalError(format!("variable slot {} not allocated", index)))?;
        *slot = Some(value.into());
        Ok(())
    }

    pub fn get(&self, index: SlotIndex) -> Option<&str> {
        self.values.get(index.0).and_then(|v| v.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_requires_dollar_prefix() {
        let mut registry = SlotRegistry::new();
        assert!(registry.register("relay_uri").is_err());
        assert!(registry.register("$").is_err());
        assert!(registry.register("$relay_uri").is_ok());
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = SlotRegistry::new();
        let first = registry.register("$relay_uri").unwrap();
        let range = registry.register("$relay_range").unwrap();
        assert_ne!(first, range);
        assert_eq!(registry.register("$relay_uri").unwrap(), first);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.name(range), Some("relay_range"));
        assert_eq!(registry.index_of("$relay_range"), Some(range));
    }

    #[test]
    fn test_table_values_are_per_request() {
        let mut registry = SlotRegistry::new();
        let uri = registry.register("$relay_uri").unwrap();

        let mut first = registry.new_table();
        let second = registry.new_table();
        first.set(uri, "http://origin/a").unwrap();

        assert_eq!(first.get(uri), Some("http://origin/a"));
        assert_eq!(second.get(uri), None);
    }

    #[test]
    fn test_set_unallocated_slot_fails() {
        let mut registry = SlotRegistry::new();
        let mut table = registry.new_table();
        let late = registry.register("$late").unwrap();
        assert!(table.set(late, "x").is_err());
    }
}
