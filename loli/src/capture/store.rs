//! # Record Store
//!
//! Append-only, capture-ordered storage for decoded allocations plus the
//! free index.
//!
//! Frees never delete anything: they only raise `FreeIndex[addr]` to the
//! highest seq seen. Liveness is evaluated at query time, so the same store
//! serves both the "all allocations" and the "still allocated" views.
//!
//! ```text
//! alive(record) = FreeIndex[record.addr] is absent
//!              || record.seq >= FreeIndex[record.addr]
//! ```

use super::batch::{AllocPayload, DecodedBatch, RecordLine};
use crate::domain::{RecordId, Seq, StringHash};
use crate::interner::{StringInterner, UNKNOWN_LIBRARY};
use loli_common::RecordKind;
use std::collections::HashMap;

/// One frame of a call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    pub library: StringHash,
    /// Raw return address, or library-relative address once attributed
    pub addr: u64,
}

/// Leaf-first: index 0 is the allocation site, the last index the root caller
pub type CallStack = Vec<Frame>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub id: RecordId,
    pub seq: Seq,
    /// Milliseconds since capture start
    pub time: i64,
    /// Bytes; negative only in synthetic diff snapshots
    pub size: i64,
    /// Allocated pointer, used as an opaque key
    pub addr: u64,
    pub kind: RecordKind,
    pub library: StringHash,
    /// Top attributed frame (raw until symbolized)
    pub func_addr: u64,
}

/// `address → highest seq at which a free was observed`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeIndex {
    entries: HashMap<u64, Seq>,
}

impl FreeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a free; the stored seq never regresses
    pub fn record_free(&mut self, addr: u64, seq: Seq) {
        let entry = self.entries.entry(addr).or_insert(seq);
        if seq > *entry {
            *entry = seq;
        }
    }

    #[must_use]
    pub fn get(&self, addr: u64) -> Option<Seq> {
        self.entries.get(&addr).copied()
    }

    /// Whether an allocation at `addr` made at `seq` is still live
    #[must_use]
    pub fn is_alive(&self, addr: u64, seq: Seq) -> bool {
        self.get(addr).map_or(true, |freed| seq >= freed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Seq)> + '_ {
        self.entries.iter().map(|(addr, seq)| (*addr, *seq))
    }
}

/// Counts of what one ingested batch contributed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub allocs: usize,
    pub frees: usize,
}

#[derive(Debug, Default, Clone)]
pub struct RecordStore {
    records: Vec<AllocationRecord>,
    call_stacks: HashMap<RecordId, CallStack>,
    free_index: FreeIndex,
    next_id: u64,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every line of a decoded batch.
    ///
    /// Stack-mode frames are stored with the `unknown` library until
    /// [`attribute_libraries`](crate::symbolization::smaps::attribute_libraries)
    /// maps them onto loaded modules.
    pub fn ingest(&mut self, batch: &DecodedBatch, strings: &mut StringInterner) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for line in &batch.lines {
            match line {
                RecordLine::Free(free) => {
                    self.free_index.record_free(free.addr, free.seq);
                    summary.frees += 1;
                }
                RecordLine::Alloc(alloc) => {
                    let id = self.allocate_id();
                    let (kind, library, func_addr, stack) = match &alloc.payload {
                        AllocPayload::Library(name) => {
                            (RecordKind::NoStack, strings.intern(name), 0, None)
                        }
                        AllocPayload::Stack(frames) => {
                            let unknown = strings.intern(UNKNOWN_LIBRARY);
                            let stack: CallStack = frames
                                .iter()
                                .map(|&addr| Frame { library: unknown, addr })
                                .collect();
                            let top = frames.first().copied().unwrap_or_default();
                            (RecordKind::StackCaptured, unknown, top, Some(stack))
                        }
                    };
                    self.records.push(AllocationRecord {
                        id,
                        seq: alloc.seq,
                        time: alloc.time,
                        size: i64::from(alloc.size),
                        addr: alloc.addr,
                        kind,
                        library,
                        func_addr,
                    });
                    if let Some(stack) = stack {
                        self.call_stacks.insert(id, stack);
                    }
                    summary.allocs += 1;
                }
            }
        }
        summary
    }

    /// Append an already-built record, e.g. one read from a `.loli` file
    pub fn push(&mut self, record: AllocationRecord, stack: Option<CallStack>) {
        self.next_id = self.next_id.max(record.id.0.saturating_add(1));
        if let Some(stack) = stack {
            self.call_stacks.insert(record.id, stack);
        }
        self.records.push(record);
    }

    /// Attach a call stack to an existing record id
    pub fn insert_call_stack(&mut self, id: RecordId, stack: CallStack) {
        self.call_stacks.insert(id, stack);
    }

    pub fn record_free(&mut self, addr: u64, seq: Seq) {
        self.free_index.record_free(addr, seq);
    }

    #[must_use]
    pub fn next_id(&self) -> RecordId {
        RecordId(self.next_id)
    }

    fn allocate_id(&mut self) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        id
    }

    #[must_use]
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    #[must_use]
    pub fn call_stack(&self, id: RecordId) -> Option<&CallStack> {
        self.call_stacks.get(&id)
    }

    #[must_use]
    pub fn call_stacks(&self) -> &HashMap<RecordId, CallStack> {
        &self.call_stacks
    }

    /// Split borrow used by library attribution
    pub fn records_and_stacks_mut(
        &mut self,
    ) -> (&mut [AllocationRecord], &mut HashMap<RecordId, CallStack>) {
        (&mut self.records, &mut self.call_stacks)
    }

    #[must_use]
    pub fn free_index(&self) -> &FreeIndex {
        &self.free_index
    }

    #[must_use]
    pub fn is_alive(&self, record: &AllocationRecord) -> bool {
        self.free_index.is_alive(record.addr, record.seq)
    }

    /// Records not freed as of the end of capture
    pub fn live_records(&self) -> impl Iterator<Item = &AllocationRecord> + '_ {
        self.records.iter().filter(|record| self.is_alive(record))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of the sizes of live records
    #[must_use]
    pub fn live_size(&self) -> i64 {
        self.live_records().map(|record| record.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::batch::{AllocLine, FreeLine};
    use loli_common::RecordTag;

    fn alloc_line(seq: u32, addr: u64, size: u32) -> RecordLine {
        RecordLine::Alloc(AllocLine {
            tag: RecordTag::Malloc,
            seq: Seq(seq),
            time: 0,
            size,
            addr,
            payload: AllocPayload::Stack(vec![0x100, 0x200]),
        })
    }

    fn free_line(seq: u32, addr: u64) -> RecordLine {
        RecordLine::Free(FreeLine { seq: Seq(seq), addr })
    }

    #[test]
    fn test_free_index_monotonic() {
        let mut index = FreeIndex::new();
        for seq in [5, 2, 9, 3] {
            index.record_free(0xA, Seq(seq));
        }
        assert_eq!(index.get(0xA), Some(Seq(9)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_liveness_filter() {
        let mut index = FreeIndex::new();
        assert!(index.is_alive(0xA, Seq(10)));
        index.record_free(0xA, Seq(9));
        assert!(index.is_alive(0xA, Seq(10)));
        assert!(!index.is_alive(0xA, Seq(1)));
        index.record_free(0xA, Seq(10));
        assert!(index.is_alive(0xA, Seq(10)));
        index.record_free(0xA, Seq(11));
        assert!(!index.is_alive(0xA, Seq(10)));
    }

    #[test]
    fn test_ingest_keeps_freed_allocations() {
        let mut store = RecordStore::new();
        let mut strings = StringInterner::new();
        let batch = DecodedBatch {
            lines: vec![alloc_line(1, 0x10, 32), alloc_line(2, 0x20, 64), free_line(3, 0x10)],
        };
        let summary = store.ingest(&batch, &mut strings);
        assert_eq!(summary, IngestSummary { allocs: 2, frees: 1 });
        assert_eq!(store.len(), 2);
        assert_eq!(store.live_records().count(), 1);
        assert_eq!(store.live_size(), 64);
    }

    #[test]
    fn test_realloc_same_address_stays_alive() {
        let mut store = RecordStore::new();
        let mut strings = StringInterner::new();
        let batch = DecodedBatch { lines: vec![free_line(7, 0x10), alloc_line(7, 0x10, 16)] };
        store.ingest(&batch, &mut strings);
        assert_eq!(store.live_records().count(), 1);
    }

    #[test]
    fn test_stack_records_get_call_stacks() {
        let mut store = RecordStore::new();
        let mut strings = StringInterner::new();
        store.ingest(&DecodedBatch { lines: vec![alloc_line(1, 0x10, 8)] }, &mut strings);
        let record = &store.records()[0];
        assert_eq!(record.kind, RecordKind::StackCaptured);
        assert_eq!(record.func_addr, 0x100);
        let stack = store.call_stack(record.id).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(strings.resolve(stack[0].library), UNKNOWN_LIBRARY);
    }

    #[test]
    fn test_push_advances_next_id() {
        let mut store = RecordStore::new();
        let record = AllocationRecord {
            id: RecordId(41),
            seq: Seq(1),
            time: 0,
            size: 1,
            addr: 1,
            kind: RecordKind::NoStack,
            library: StringHash::EMPTY,
            func_addr: 0,
        };
        store.push(record, None);
        assert_eq!(store.next_id(), RecordId(42));
    }

    #[test]
    fn test_push_of_largest_id_does_not_overflow() {
        let mut store = RecordStore::new();
        let record = AllocationRecord {
            id: RecordId(u64::MAX),
            seq: Seq(1),
            time: 0,
            size: 1,
            addr: 1,
            kind: RecordKind::NoStack,
            library: StringHash::EMPTY,
            func_addr: 0,
        };
        store.push(record, None);
        assert_eq!(store.next_id(), RecordId(u64::MAX));
    }
}
