//! Per-library address → function name table
//!
//! Entries are created eagerly with an empty sentinel the first time an
//! address is seen and filled in later by a resolver. "Pending" and "absent"
//! are different states: only pending slots are ever sent for resolution.

use std::collections::{BTreeMap, HashMap};

/// State of one `(library, address)` slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLookup<'a> {
    /// Address never registered
    Missing,
    /// Registered, still waiting for a name
    Pending,
    Resolved(&'a str),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    libraries: HashMap<String, HashMap<u64, Option<String>>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` with an empty sentinel unless it is already present
    pub fn ensure(&mut self, library: &str, addr: u64) {
        self.libraries.entry(library.to_owned()).or_default().entry(addr).or_insert(None);
    }

    /// Fill a pending slot. Returns `false` when the slot is missing or
    /// already resolved.
    pub fn fill(&mut self, library: &str, addr: u64, name: &str) -> bool {
        match self.libraries.get_mut(library).and_then(|slots| slots.get_mut(&addr)) {
            Some(slot @ None) if !name.is_empty() => {
                *slot = Some(name.to_owned());
                true
            }
            _ => false,
        }
    }

    /// Set a slot unconditionally (file loading, synthetic snapshots).
    /// An empty name stores the sentinel.
    pub fn set(&mut self, library: &str, addr: u64, name: &str) {
        let value = if name.is_empty() { None } else { Some(name.to_owned()) };
        self.libraries.entry(library.to_owned()).or_default().insert(addr, value);
    }

    #[must_use]
    pub fn lookup(&self, library: &str, addr: u64) -> SymbolLookup<'_> {
        match self.libraries.get(library).and_then(|slots| slots.get(&addr)) {
            None => SymbolLookup::Missing,
            Some(None) => SymbolLookup::Pending,
            Some(Some(name)) => SymbolLookup::Resolved(name),
        }
    }

    /// Name used in call trees and reports: the resolved symbol, or
    /// `library!0xaddr` when unresolved
    #[must_use]
    pub fn display_name(&self, library: &str, addr: u64) -> String {
        match self.lookup(library, addr) {
            SymbolLookup::Resolved(name) => name.to_owned(),
            SymbolLookup::Missing | SymbolLookup::Pending => format!("{library}!0x{addr:x}"),
        }
    }

    /// Pending addresses of `library`, ascending
    #[must_use]
    pub fn unresolved(&self, library: &str) -> Vec<u64> {
        let mut addrs: Vec<u64> = self
            .libraries
            .get(library)
            .map(|slots| slots.iter().filter(|(_, name)| name.is_none()).map(|(a, _)| *a).collect())
            .unwrap_or_default();
        addrs.sort_unstable();
        addrs
    }

    /// Library names, sorted
    #[must_use]
    pub fn libraries(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.libraries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Slots of one library in address order; `""` marks a pending slot
    #[must_use]
    pub fn entries(&self, library: &str) -> BTreeMap<u64, &str> {
        self.libraries
            .get(library)
            .map(|slots| {
                slots.iter().map(|(addr, name)| (*addr, name.as_deref().unwrap_or(""))).collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    /// Total number of slots over all libraries
    #[must_use]
    pub fn len(&self) -> usize {
        self.libraries.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.libraries.values().flat_map(HashMap::values).filter(|name| name.is_some()).count()
    }
}
