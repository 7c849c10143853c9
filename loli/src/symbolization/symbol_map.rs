//! Sorted symbol ranges for bulk lookup
//!
//! Built either from `nm -nCS` output or from the ELF symbol table of an
//! unstripped library. Lookup is a binary search for the greatest start
//! `<= addr`; the hit counts when `addr <= start + size`, so an address one
//! past the last byte still maps to the symbol (return addresses of tail
//! calls land there).

use super::SymbolTable;
use crate::domain::ResolutionError;
use log::debug;
use object::{Object, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::fs;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRange {
    pub start: u64,
    pub size: u64,
    pub name: String,
}

#[derive(Debug, Default, Clone)]
pub struct SymbolMap {
    ranges: Vec<SymbolRange>,
}

impl SymbolMap {
    /// Build from arbitrary ranges; sorts by start address
    #[must_use]
    pub fn from_ranges(mut ranges: Vec<SymbolRange>) -> Self {
        ranges.sort_by_key(|range| range.start);
        Self { ranges }
    }

    /// Parse `nm -nCS` output: `<addr> <size> <type> <name...>`.
    /// Lines without a size column (undefined symbols, absolutes) are skipped.
    #[must_use]
    pub fn parse_nm(text: &str) -> Self {
        let ranges = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(4, char::is_whitespace);
                let start = u64::from_str_radix(fields.next()?, 16).ok()?;
                let size = u64::from_str_radix(fields.next()?, 16).ok()?;
                let kind = fields.next()?;
                let name = fields.next()?.trim();
                if kind.len() != 1 || name.is_empty() {
                    return None;
                }
                Some(SymbolRange { start, size, name: name.to_owned() })
            })
            .collect();
        Self::from_ranges(ranges)
    }

    /// Run an `nm`-compatible tool on `library_file` and parse the result
    ///
    /// # Errors
    /// Returns an error if the tool cannot be started or exits unsuccessfully
    pub fn from_nm_tool(program: &Path, library_file: &Path) -> Result<Self, ResolutionError> {
        let name = program.display().to_string();
        let output = Command::new(program)
            .arg("-nCS")
            .arg(library_file)
            .output()
            .map_err(|error| ResolutionError::SpawnFailed { program: name.clone(), error })?;
        if !output.status.success() {
            return Err(ResolutionError::ExitFailure { program: name, status: output.status });
        }
        Ok(Self::parse_nm(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Read function symbols straight from an ELF file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_elf(path: &Path) -> Result<Self, ResolutionError> {
        let data = fs::read(path)?;
        let file = object::File::parse(&*data).map_err(|e| ResolutionError::DebugInfo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let ranges: Vec<SymbolRange> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.is_definition())
            .filter_map(|symbol| {
                let name = symbol.name().ok().filter(|name| !name.is_empty())?;
                Some(SymbolRange {
                    start: symbol.address(),
                    size: symbol.size(),
                    name: format!("{:#}", demangle(name)),
                })
            })
            .collect();
        debug!("{}: {} function symbols", path.display(), ranges.len());
        Ok(Self::from_ranges(ranges))
    }

    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<&str> {
        let idx = self.ranges.partition_point(|range| range.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (addr <= range.start.saturating_add(range.size)).then_some(range.name.as_str())
    }

    /// Fill every pending slot of `library`; returns how many were resolved
    pub fn resolve_into(&self, table: &mut SymbolTable, library: &str) -> usize {
        table
            .unresolved(library)
            .into_iter()
            .filter_map(|addr| self.lookup(addr).map(|name| (addr, name)))
            .filter(|(addr, name)| table.fill(library, *addr, name))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NM_OUTPUT: &str = "\
                 U malloc
0000000000001000 0000000000000020 T Game::Start()
0000000000001040 0000000000000010 t helper(int, char const*)
0000000000002000 0000000000000100 W std::vector<int>::push_back(int const&)
0000000000003000 B _end
";

    #[test]
    fn test_parse_nm() {
        let map = SymbolMap::parse_nm(NM_OUTPUT);
        assert_eq!(map.len(), 3);
        assert_eq!(map.lookup(0x1010), Some("Game::Start()"));
        assert_eq!(map.lookup(0x1048), Some("helper(int, char const*)"));
    }

    #[test]
    fn test_lookup_boundaries() {
        let map = SymbolMap::parse_nm(NM_OUTPUT);
        assert_eq!(map.lookup(0x0fff), None);
        assert_eq!(map.lookup(0x1000), Some("Game::Start()"));
        assert_eq!(map.lookup(0x1020), Some("Game::Start()"));
        assert_eq!(map.lookup(0x1021), None);
        assert_eq!(map.lookup(0x2100), Some("std::vector<int>::push_back(int const&)"));
        assert_eq!(map.lookup(0x9000), None);
    }

    #[test]
    fn test_resolve_into_fills_pending_only() {
        let map = SymbolMap::parse_nm(NM_OUTPUT);
        let mut table = SymbolTable::new();
        table.ensure("libgame.so", 0x1004);
        table.ensure("libgame.so", 0x5000);
        table.set("libgame.so", 0x2004, "already");

        assert_eq!(map.resolve_into(&mut table, "libgame.so"), 1);
        assert_eq!(table.display_name("libgame.so", 0x1004), "Game::Start()");
        assert_eq!(table.display_name("libgame.so", 0x2004), "already");
        assert_eq!(table.unresolved("libgame.so"), vec![0x5000]);
    }

    #[test]
    fn test_from_ranges_sorts() {
        let map = SymbolMap::from_ranges(vec![
            SymbolRange { start: 0x200, size: 0x10, name: "b".into() },
            SymbolRange { start: 0x100, size: 0x10, name: "a".into() },
        ]);
        assert_eq!(map.lookup(0x105), Some("a"));
        assert_eq!(map.lookup(0x205), Some("b"));
    }
}
