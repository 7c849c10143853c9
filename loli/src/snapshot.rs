//! The unit of persistence: everything one capture produced
//!
//! Each snapshot owns its interner, so a baseline and a comparison loaded
//! side by side never share string state.

use crate::capture::batch::DecodedBatch;
use crate::capture::store::{Frame, IngestSummary, RecordStore};
use crate::interner::StringInterner;
use crate::symbolization::smaps::{attribute_libraries, parse_smaps, AttributionSummary};
use crate::symbolization::{SmapsSections, SymbolTable};

/// A JPEG captured at `time` ms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub time: i32,
    pub jpeg: Vec<u8>,
}

/// `(time ms, value)` points of one memory-usage series
pub type MemInfoSeries = Vec<(i32, i32)>;

#[derive(Debug, Default, Clone)]
pub struct ProfileSnapshot {
    pub meminfo: Vec<MemInfoSeries>,
    pub strings: StringInterner,
    pub records: RecordStore,
    pub symbols: SymbolTable,
    pub screenshots: Vec<Screenshot>,
    pub smaps: SmapsSections,
}

impl ProfileSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded batch to the record store
    pub fn ingest_batch(&mut self, batch: &DecodedBatch) -> IngestSummary {
        self.records.ingest(batch, &mut self.strings)
    }

    /// Append one point to series `series`, creating missing series
    pub fn push_meminfo(&mut self, series: usize, time: i32, value: i32) {
        if self.meminfo.len() <= series {
            self.meminfo.resize_with(series + 1, Vec::new);
        }
        self.meminfo[series].push((time, value));
    }

    /// Parse an smaps dump, keep its sections, and attribute every
    /// stack-mode frame to a library
    pub fn apply_smaps(&mut self, text: &str, workers: Option<usize>) -> AttributionSummary {
        self.smaps = parse_smaps(text);
        attribute_libraries(
            &mut self.records,
            &mut self.strings,
            &mut self.symbols,
            &self.smaps,
            workers,
        )
    }

    #[must_use]
    pub fn library_name(&self, frame: &Frame) -> &str {
        self.strings.resolve(frame.library)
    }

    /// Resolved function name of a frame, or `library!0xaddr`
    #[must_use]
    pub fn function_name(&self, frame: &Frame) -> String {
        self.symbols.display_name(self.library_name(frame), frame.addr)
    }

    /// Highest value over every meminfo series
    #[must_use]
    pub fn meminfo_max(&self) -> i32 {
        self.meminfo.iter().flatten().map(|(_, value)| *value).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::batch::{AllocLine, AllocPayload, RecordLine};
    use crate::domain::Seq;
    use loli_common::RecordTag;

    #[test]
    fn test_function_name_falls_back_to_address() {
        let mut snapshot = ProfileSnapshot::new();
        let library = snapshot.strings.intern("libgame.so");
        snapshot.symbols.set("libgame.so", 0x10, "Game::Tick()");
        let resolved = Frame { library, addr: 0x10 };
        let unresolved = Frame { library, addr: 0x20 };
        assert_eq!(snapshot.function_name(&resolved), "Game::Tick()");
        assert_eq!(snapshot.function_name(&unresolved), "libgame.so!0x20");
    }

    #[test]
    fn test_meminfo_series_grow() {
        let mut snapshot = ProfileSnapshot::new();
        snapshot.push_meminfo(2, 100, 7);
        snapshot.push_meminfo(0, 100, 30);
        assert_eq!(snapshot.meminfo.len(), 3);
        assert!(snapshot.meminfo[1].is_empty());
        assert_eq!(snapshot.meminfo_max(), 30);
    }

    #[test]
    fn test_apply_smaps_attributes_frames() {
        let mut snapshot = ProfileSnapshot::new();
        snapshot.ingest_batch(&DecodedBatch {
            lines: vec![RecordLine::Alloc(AllocLine {
                tag: RecordTag::Malloc,
                seq: Seq(1),
                time: 5,
                size: 128,
                addr: 0x5000,
                payload: AllocPayload::Stack(vec![0x7000_0010]),
            })],
        });
        let smaps = "70000000-70001000 r-xp 00000000 fd:00 1 /data/libgame.so\nRss: 4 kB\n";
        let summary = snapshot.apply_smaps(smaps, Some(1));
        assert_eq!(summary.unknown_frames, 0);
        let stack = snapshot.records.call_stack(snapshot.records.records()[0].id).unwrap();
        assert_eq!(snapshot.function_name(&stack[0]), "/data/libgame.so!0x10");
        assert_eq!(snapshot.smaps["/data/libgame.so"].rss, 4);
    }
}
