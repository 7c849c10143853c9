//! Memory mapping utilities for library attribution
//!
//! The device dumps `/proc/self/smaps` when the host sends `SMAPS_DUMP`.
//! This module parses that text into per-mapping sections and uses them to
//! turn raw return addresses into `(library, library-relative address)`
//! pairs, which is what the symbolizers expect.

use crate::capture::store::{CallStack, Frame, RecordStore};
use crate::config::worker_count;
use crate::domain::{RecordId, StringHash};
use crate::interner::{StringInterner, UNKNOWN_LIBRARY};
use crate::symbolization::SymbolTable;
use loli_common::{RecordKind, AGENT_LIBRARY_NAME};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::path::Path;

/// One mapping line: `start-end perms offset dev inode path`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// All mappings sharing one path, with summed counters (kB)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SmapsSection {
    pub ranges: Vec<MemoryRange>,
    pub virtual_kb: u32,
    pub rss: u32,
    pub pss: u32,
    pub private_clean: u32,
    pub private_dirty: u32,
    pub shared_clean: u32,
    pub shared_dirty: u32,
}

impl SmapsSection {
    /// Load bias of the module: start of the offset-0 segment, otherwise
    /// `start - offset` of the first segment
    #[must_use]
    pub fn load_bias(&self) -> u64 {
        self.ranges
            .iter()
            .find(|range| range.offset == 0)
            .map(|range| range.start)
            .or_else(|| self.ranges.first().map(|range| range.start.wrapping_sub(range.offset)))
            .unwrap_or(0)
    }

    /// Translate a runtime address into a library-relative address
    #[must_use]
    pub fn translate(&self, addr: u64) -> Option<u64> {
        if self.ranges.iter().any(|range| range.contains(addr)) {
            Some(addr.wrapping_sub(self.load_bias()))
        } else {
            None
        }
    }

    fn add_counter(&mut self, key: &str, value: u32) -> bool {
        let slot = match key {
            "Size:" => &mut self.virtual_kb,
            "Rss:" => &mut self.rss,
            "Pss:" => &mut self.pss,
            "Shared_Clean:" => &mut self.shared_clean,
            "Shared_Dirty:" => &mut self.shared_dirty,
            "Private_Clean:" => &mut self.private_clean,
            "Private_Dirty:" => &mut self.private_dirty,
            _ => return false,
        };
        *slot = slot.saturating_add(value);
        true
    }
}

/// Sections keyed by mapping path
pub type SmapsSections = BTreeMap<String, SmapsSection>;

/// Parse smaps text. Anonymous mappings (no path) are skipped; unreadable
/// lines are ignored.
#[must_use]
pub fn parse_smaps(text: &str) -> SmapsSections {
    let mut sections = SmapsSections::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(range) = parse_header_range(&parts) {
            // Header: "start-end perms offset dev inode [pathname]"
            if parts.len() < 6 {
                current = None;
                continue;
            }
            let name = parts[5..].join(" ");
            sections.entry(name.clone()).or_default().ranges.push(range);
            current = Some(name);
        } else if parts.len() >= 2 {
            let Some(name) = current.as_ref() else { continue };
            let Ok(value) = parts[1].parse::<u32>() else { continue };
            if let Some(section) = sections.get_mut(name) {
                section.add_counter(parts[0], value);
            }
        }
    }

    sections
}

fn parse_header_range(parts: &[&str]) -> Option<MemoryRange> {
    if parts.len() < 5 {
        return None;
    }
    let (start, end) = parts[0].split_once('-')?;
    Some(MemoryRange {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(parts[2], 16).ok()?,
    })
}

/// Sum of every section's counters
#[must_use]
pub fn total(sections: &SmapsSections) -> SmapsSection {
    let mut sum = SmapsSection::default();
    for section in sections.values() {
        sum.virtual_kb = sum.virtual_kb.saturating_add(section.virtual_kb);
        sum.rss = sum.rss.saturating_add(section.rss);
        sum.pss = sum.pss.saturating_add(section.pss);
        sum.private_clean = sum.private_clean.saturating_add(section.private_clean);
        sum.private_dirty = sum.private_dirty.saturating_add(section.private_dirty);
        sum.shared_clean = sum.shared_clean.saturating_add(section.shared_clean);
        sum.shared_dirty = sum.shared_dirty.saturating_add(section.shared_dirty);
    }
    sum
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttributionSummary {
    pub records: usize,
    pub frames: usize,
    pub unknown_frames: usize,
}

/// What one worker produced for its contiguous slice of records
#[derive(Default)]
struct PartialAttribution {
    stacks: Vec<(RecordId, CallStack)>,
    /// `(library, addr)` pairs that need a symbol slot
    symbols: Vec<(StringHash, u64)>,
    summary: AttributionSummary,
}

/// Map every stack-mode frame onto a loaded `.so` and register symbol slots.
///
/// Records are split into contiguous index ranges, one per worker; each
/// worker writes only its own records. Stacks and symbol slots are merged
/// afterwards on the calling thread.
pub fn attribute_libraries(
    store: &mut RecordStore,
    strings: &mut StringInterner,
    symbols: &mut SymbolTable,
    sections: &SmapsSections,
    workers: Option<usize>,
) -> AttributionSummary {
    let modules: Vec<(StringHash, &SmapsSection)> = sections
        .iter()
        .filter(|(name, _)| name.ends_with(".so"))
        .map(|(name, section)| (strings.intern(name), section))
        .collect();
    let unknown = strings.intern(UNKNOWN_LIBRARY);
    // The agent's own frames are matched by file name, wherever it is mapped from
    let agent: HashSet<StringHash> = sections
        .keys()
        .filter(|name| Path::new(name.as_str()).file_name() == Some(OsStr::new(AGENT_LIBRARY_NAME)))
        .map(|name| strings.intern(name))
        .collect();
    let agent = &agent;

    let workers = workers.unwrap_or_else(worker_count).max(1);
    let (records, stacks) = store.records_and_stacks_mut();
    let per_worker = records.len().div_ceil(workers).max(1);
    let stacks: &HashMap<RecordId, CallStack> = stacks;
    let modules = &modules;

    info!("Attributing {} records using {} workers", records.len(), workers);

    let partials: Vec<PartialAttribution> = std::thread::scope(|scope| {
        let handles: Vec<_> = records
            .chunks_mut(per_worker)
            .map(|slice| {
                scope.spawn(move || {
                    let mut partial = PartialAttribution::default();
                    for record in slice.iter_mut() {
                        if record.kind != RecordKind::StackCaptured {
                            continue;
                        }
                        let Some(raw) = stacks.get(&record.id) else { continue };
                        let stack = attribute_stack(raw, modules, unknown, &mut partial);
                        if let Some(top) = stack.iter().find(|frame| !agent.contains(&frame.library)).or(stack.first()) {
                            record.library = top.library;
                            record.func_addr = top.addr;
                        }
                        partial.summary.records += 1;
                        partial.stacks.push((record.id, stack));
                    }
                    partial
                })
            })
            .collect();
        handles.into_iter().filter_map(|handle| handle.join().ok()).collect()
    });

    let mut summary = AttributionSummary::default();
    for partial in partials {
        summary.records += partial.summary.records;
        summary.frames += partial.summary.frames;
        summary.unknown_frames += partial.summary.unknown_frames;
        for (id, stack) in partial.stacks {
            store.insert_call_stack(id, stack);
        }
        for (library, addr) in partial.symbols {
            symbols.ensure(strings.resolve(library), addr);
        }
    }
    debug!(
        "Attribution: {} frames, {} outside every module",
        summary.frames, summary.unknown_frames
    );
    summary
}

fn attribute_stack(
    raw: &CallStack,
    modules: &[(StringHash, &SmapsSection)],
    unknown: StringHash,
    partial: &mut PartialAttribution,
) -> CallStack {
    raw.iter()
        .map(|frame| {
            partial.summary.frames += 1;
            let hit = modules
                .iter()
                .find_map(|(library, section)| section.translate(frame.addr).map(|vaddr| (*library, vaddr)));
            match hit {
                Some((library, addr)) => {
                    partial.symbols.push((library, addr));
                    Frame { library, addr }
                }
                None => {
                    partial.summary.unknown_frames += 1;
                    Frame { library: unknown, addr: frame.addr }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::batch::{AllocLine, AllocPayload, DecodedBatch, RecordLine};
    use crate::domain::Seq;
    use loli_common::RecordTag;

    const SMAPS: &str = "\
7000000000-7000001000 r--p 00000000 fd:00 123 /system/lib64/libgame.so
Size:                  4 kB
Rss:                   4 kB
Pss:                   2 kB
Private_Dirty:         1 kB
7000001000-7000005000 r-xp 00001000 fd:00 123 /system/lib64/libgame.so
Size:                 16 kB
Rss:                   8 kB
7100000000-7100002000 r-xp 00000000 fd:00 456 /data/app/libloli.so
Size:                  8 kB
7200000000-7200001000 rw-p 00000000 00:00 0
Size:                  4 kB
";

    #[test]
    fn test_parse_smaps_sections() {
        let sections = parse_smaps(SMAPS);
        let game = &sections["/system/lib64/libgame.so"];
        assert_eq!(game.ranges.len(), 2);
        assert_eq!(game.virtual_kb, 20);
        assert_eq!(game.rss, 12);
        assert_eq!(game.pss, 2);
        assert_eq!(game.private_dirty, 1);
        assert_eq!(sections.len(), 2);
        assert_eq!(total(&sections).virtual_kb, 28);
    }

    #[test]
    fn test_translate_uses_load_bias() {
        let sections = parse_smaps(SMAPS);
        let game = &sections["/system/lib64/libgame.so"];
        assert_eq!(game.load_bias(), 0x70_0000_0000);
        assert_eq!(game.translate(0x70_0000_1234), Some(0x1234));
        assert_eq!(game.translate(0x70_0000_5000), None);
    }

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000, offset: 0 };
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_attribution_skips_agent_frames() {
        let sections = parse_smaps(SMAPS);
        let mut store = RecordStore::new();
        let mut strings = StringInterner::new();
        let mut symbols = SymbolTable::new();
        let batch = DecodedBatch {
            lines: vec![RecordLine::Alloc(AllocLine {
                tag: RecordTag::Malloc,
                seq: Seq(1),
                time: 0,
                size: 16,
                addr: 0x99,
                payload: AllocPayload::Stack(vec![0x71_0000_0010, 0x70_0000_1234, 0x1]),
            })],
        };
        store.ingest(&batch, &mut strings);

        let summary = attribute_libraries(&mut store, &mut strings, &mut symbols, &sections, Some(2));
        assert_eq!(summary, AttributionSummary { records: 1, frames: 3, unknown_frames: 1 });

        let record = &store.records()[0];
        assert_eq!(strings.resolve(record.library), "/system/lib64/libgame.so");
        assert_eq!(record.func_addr, 0x1234);

        let stack = store.call_stack(record.id).unwrap();
        assert_eq!(strings.resolve(stack[0].library), "/data/app/libloli.so");
        assert_eq!(strings.resolve(stack[2].library), UNKNOWN_LIBRARY);
        assert_eq!(symbols.unresolved("/system/lib64/libgame.so"), vec![0x1234]);
    }

    #[test]
    fn test_agent_only_stack_keeps_first_frame() {
        let sections = parse_smaps(SMAPS);
        let mut store = RecordStore::new();
        let mut strings = StringInterner::new();
        let mut symbols = SymbolTable::new();
        let batch = DecodedBatch {
            lines: vec![RecordLine::Alloc(AllocLine {
                tag: RecordTag::Calloc,
                seq: Seq(1),
                time: 0,
                size: 8,
                addr: 0x40,
                payload: AllocPayload::Stack(vec![0x71_0000_0010, 0x71_0000_0020]),
            })],
        };
        store.ingest(&batch, &mut strings);
        attribute_libraries(&mut store, &mut strings, &mut symbols, &sections, Some(1));

        let record = &store.records()[0];
        assert_eq!(strings.resolve(record.library), "/data/app/libloli.so");
        assert_eq!(record.func_addr, 0x10);
    }
}
