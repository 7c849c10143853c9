//! # `.loli` Snapshot Codec
//!
//! Binary, little-endian, versioned. Sections are written back to back in
//! a fixed order and read back the same way; there is no seeking and no
//! forward-compatible partial read.
//!
//! ```text
//! u32 magic (0xA4B3C2D1)   i32 version (1)
//! meminfo      i32 series, per series: i32 points, (i32 time, i32 value)*
//! strings      i32 n, (u32 hash, str)*
//! records      i32 n, (u64 id, u32 seq, i64 time, i64 size, u64 addr,
//!                      u8 kind, u64 func_addr, u32 library)*
//! call stacks  i32 n, (u64 id, i32 frames, (u32 library, u64 addr)*)*
//! symbols      i32 n, (str library, i32 slots, (u64 addr, str name)*)*
//! free index   i32 n, (u64 addr, u32 seq)*
//! screenshots  i32 n, (i32 time, u32 len, bytes)*
//! smaps        i32 n, (str name, i32 ranges, (u64 start, u64 end, u64 offset)*,
//!                      u32 virtual, rss, pss, private_clean, private_dirty,
//!                      shared_clean, shared_dirty)*
//!
//! str = u32 byte length + UTF-8
//! ```
//!
//! Keyed sections are written in key order, so saving the same snapshot
//! twice produces identical bytes. An empty symbol name is the pending
//! sentinel.

use crate::capture::store::{AllocationRecord, CallStack, Frame};
use crate::domain::{FileFormatError, RecordId, Seq, StringHash};
use crate::snapshot::{ProfileSnapshot, Screenshot};
use crate::symbolization::smaps::{MemoryRange, SmapsSection};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use loli_common::RecordKind;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const MAGIC: u32 = 0xA4B3_C2D1;
pub const FORMAT_VERSION: i32 = 1;

/// Upper bound on up-front reservations driven by counts read from a file
const MAX_PREALLOC: usize = 4096;

type LE = LittleEndian;

/// Write `snapshot` to `path`
pub fn save(snapshot: &ProfileSnapshot, path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_snapshot(&mut writer, snapshot)?;
    writer.flush()?;
    info!("Saved {} records to {}", snapshot.records.len(), path.display());
    Ok(())
}

/// Read a snapshot from `path`
pub fn load(path: impl AsRef<Path>) -> Result<ProfileSnapshot, FileFormatError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let snapshot = read_snapshot(&mut reader)?;
    info!("Loaded {} records from {}", snapshot.records.len(), path.display());
    Ok(snapshot)
}

pub fn write_snapshot<W: Write>(w: &mut W, snapshot: &ProfileSnapshot) -> io::Result<()> {
    w.write_u32::<LE>(MAGIC)?;
    w.write_i32::<LE>(FORMAT_VERSION)?;

    write_count(w, snapshot.meminfo.len())?;
    for series in &snapshot.meminfo {
        write_count(w, series.len())?;
        for (time, value) in series {
            w.write_i32::<LE>(*time)?;
            w.write_i32::<LE>(*value)?;
        }
    }

    let mut strings: Vec<(StringHash, &str)> = snapshot.strings.iter().collect();
    strings.sort_unstable_by_key(|(hash, _)| *hash);
    write_count(w, strings.len())?;
    for (hash, text) in strings {
        w.write_u32::<LE>(hash.0)?;
        write_str(w, text)?;
    }

    let records = snapshot.records.records();
    write_count(w, records.len())?;
    for record in records {
        w.write_u64::<LE>(record.id.0)?;
        w.write_u32::<LE>(record.seq.0)?;
        w.write_i64::<LE>(record.time)?;
        w.write_i64::<LE>(record.size)?;
        w.write_u64::<LE>(record.addr)?;
        w.write_u8(record.kind as u8)?;
        w.write_u64::<LE>(record.func_addr)?;
        w.write_u32::<LE>(record.library.0)?;
    }

    let mut stacks: Vec<(&RecordId, &CallStack)> = snapshot.records.call_stacks().iter().collect();
    stacks.sort_unstable_by_key(|(id, _)| **id);
    write_count(w, stacks.len())?;
    for (id, stack) in stacks {
        w.write_u64::<LE>(id.0)?;
        write_count(w, stack.len())?;
        for frame in stack {
            w.write_u32::<LE>(frame.library.0)?;
            w.write_u64::<LE>(frame.addr)?;
        }
    }

    let libraries = snapshot.symbols.libraries();
    write_count(w, libraries.len())?;
    for library in libraries {
        let entries = snapshot.symbols.entries(library);
        write_str(w, library)?;
        write_count(w, entries.len())?;
        for (addr, name) in entries {
            w.write_u64::<LE>(addr)?;
            write_str(w, name)?;
        }
    }

    let mut frees: Vec<(u64, Seq)> = snapshot.records.free_index().iter().collect();
    frees.sort_unstable();
    write_count(w, frees.len())?;
    for (addr, seq) in frees {
        w.write_u64::<LE>(addr)?;
        w.write_u32::<LE>(seq.0)?;
    }

    write_count(w, snapshot.screenshots.len())?;
    for shot in &snapshot.screenshots {
        w.write_i32::<LE>(shot.time)?;
        write_len(w, shot.jpeg.len())?;
        w.write_all(&shot.jpeg)?;
    }

    write_count(w, snapshot.smaps.len())?;
    for (name, section) in &snapshot.smaps {
        write_str(w, name)?;
        write_count(w, section.ranges.len())?;
        for range in &section.ranges {
            w.write_u64::<LE>(range.start)?;
            w.write_u64::<LE>(range.end)?;
            w.write_u64::<LE>(range.offset)?;
        }
        for counter in [
            section.virtual_kb,
            section.rss,
            section.pss,
            section.private_clean,
            section.private_dirty,
            section.shared_clean,
            section.shared_dirty,
        ] {
            w.write_u32::<LE>(counter)?;
        }
    }
    Ok(())
}

pub fn read_snapshot<R: Read>(r: &mut R) -> Result<ProfileSnapshot, FileFormatError> {
    let magic = r.read_u32::<LE>().map_err(in_section("header"))?;
    if magic != MAGIC {
        return Err(FileFormatError::BadMagic(magic));
    }
    let version = r.read_i32::<LE>().map_err(in_section("header"))?;
    if version != FORMAT_VERSION {
        return Err(FileFormatError::VersionMismatch { expected: FORMAT_VERSION, found: version });
    }

    let mut snapshot = ProfileSnapshot::new();
    read_meminfo(r, &mut snapshot).map_err(truncated("meminfo"))?;
    read_strings(r, &mut snapshot).map_err(truncated("strings"))?;
    let records = read_records(r).map_err(truncated("records"))?;
    let mut stacks = read_call_stacks(r).map_err(truncated("call stacks"))?;
    for record in records {
        let stack = stacks.remove(&record.id);
        snapshot.records.push(record, stack);
    }
    for (id, stack) in stacks {
        debug!("Call stack {id} has no record");
        snapshot.records.insert_call_stack(id, stack);
    }
    read_symbols(r, &mut snapshot).map_err(truncated("symbols"))?;
    read_free_index(r, &mut snapshot).map_err(truncated("free index"))?;
    read_screenshots(r, &mut snapshot).map_err(truncated("screenshots"))?;
    read_smaps(r, &mut snapshot).map_err(truncated("smaps"))?;
    Ok(snapshot)
}

fn read_meminfo<R: Read>(r: &mut R, snapshot: &mut ProfileSnapshot) -> Result<(), FileFormatError> {
    let series_count = read_count(r, "meminfo")?;
    for _ in 0..series_count {
        let points = read_count(r, "meminfo")?;
        let mut series = Vec::with_capacity(points.min(MAX_PREALLOC));
        for _ in 0..points {
            let time = r.read_i32::<LE>()?;
            let value = r.read_i32::<LE>()?;
            series.push((time, value));
        }
        snapshot.meminfo.push(series);
    }
    Ok(())
}

fn read_strings<R: Read>(r: &mut R, snapshot: &mut ProfileSnapshot) -> Result<(), FileFormatError> {
    let count = read_count(r, "strings")?;
    for _ in 0..count {
        let hash = StringHash(r.read_u32::<LE>()?);
        let text = read_str(r, "strings")?;
        snapshot.strings.insert(hash, text);
    }
    Ok(())
}

fn read_records<R: Read>(r: &mut R) -> Result<Vec<AllocationRecord>, FileFormatError> {
    let count = read_count(r, "records")?;
    let mut records = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let id = RecordId(r.read_u64::<LE>()?);
        if id.0 == u64::MAX {
            return Err(FileFormatError::RecordIdOutOfRange(id.0));
        }
        let seq = Seq(r.read_u32::<LE>()?);
        let time = r.read_i64::<LE>()?;
        let size = r.read_i64::<LE>()?;
        let addr = r.read_u64::<LE>()?;
        let raw_kind = r.read_u8()?;
        let kind = RecordKind::from_u8(raw_kind).ok_or(FileFormatError::InvalidRecordKind(raw_kind))?;
        let func_addr = r.read_u64::<LE>()?;
        let library = StringHash(r.read_u32::<LE>()?);
        records.push(AllocationRecord { id, seq, time, size, addr, kind, library, func_addr });
    }
    Ok(records)
}

fn read_call_stacks<R: Read>(
    r: &mut R,
) -> Result<HashMap<RecordId, CallStack>, FileFormatError> {
    let count = read_count(r, "call stacks")?;
    let mut stacks = HashMap::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let id = RecordId(r.read_u64::<LE>()?);
        let frames = read_count(r, "call stacks")?;
        let mut stack = Vec::with_capacity(frames.min(MAX_PREALLOC));
        for _ in 0..frames {
            let library = StringHash(r.read_u32::<LE>()?);
            let addr = r.read_u64::<LE>()?;
            stack.push(Frame { library, addr });
        }
        stacks.insert(id, stack);
    }
    Ok(stacks)
}

fn read_symbols<R: Read>(r: &mut R, snapshot: &mut ProfileSnapshot) -> Result<(), FileFormatError> {
    let count = read_count(r, "symbols")?;
    for _ in 0..count {
        let library = read_str(r, "symbols")?;
        let slots = read_count(r, "symbols")?;
        for _ in 0..slots {
            let addr = r.read_u64::<LE>()?;
            let name = read_str(r, "symbols")?;
            snapshot.symbols.set(&library, addr, &name);
        }
    }
    Ok(())
}

fn read_free_index<R: Read>(r: &mut R, snapshot: &mut ProfileSnapshot) -> Result<(), FileFormatError> {
    let count = read_count(r, "free index")?;
    for _ in 0..count {
        let addr = r.read_u64::<LE>()?;
        let seq = Seq(r.read_u32::<LE>()?);
        snapshot.records.record_free(addr, seq);
    }
    Ok(())
}

fn read_screenshots<R: Read>(r: &mut R, snapshot: &mut ProfileSnapshot) -> Result<(), FileFormatError> {
    let count = read_count(r, "screenshots")?;
    for _ in 0..count {
        let time = r.read_i32::<LE>()?;
        let jpeg = read_bytes(r)?;
        snapshot.screenshots.push(Screenshot { time, jpeg });
    }
    Ok(())
}

fn read_smaps<R: Read>(r: &mut R, snapshot: &mut ProfileSnapshot) -> Result<(), FileFormatError> {
    let count = read_count(r, "smaps")?;
    for _ in 0..count {
        let name = read_str(r, "smaps")?;
        let range_count = read_count(r, "smaps")?;
        let mut section = SmapsSection::default();
        for _ in 0..range_count {
            let start = r.read_u64::<LE>()?;
            let end = r.read_u64::<LE>()?;
            let offset = r.read_u64::<LE>()?;
            section.ranges.push(MemoryRange { start, end, offset });
        }
        section.virtual_kb = r.read_u32::<LE>()?;
        section.rss = r.read_u32::<LE>()?;
        section.pss = r.read_u32::<LE>()?;
        section.private_clean = r.read_u32::<LE>()?;
        section.private_dirty = r.read_u32::<LE>()?;
        section.shared_clean = r.read_u32::<LE>()?;
        section.shared_dirty = r.read_u32::<LE>()?;
        snapshot.smaps.insert(name, section);
    }
    Ok(())
}

fn write_count<W: Write>(w: &mut W, count: usize) -> io::Result<()> {
    let count = i32::try_from(count)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "section too large for .loli"))?;
    w.write_i32::<LE>(count)
}

fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "blob too large for .loli"))?;
    w.write_u32::<LE>(len)
}

fn write_str<W: Write>(w: &mut W, text: &str) -> io::Result<()> {
    write_len(w, text.len())?;
    w.write_all(text.as_bytes())
}

fn read_count<R: Read>(r: &mut R, section: &'static str) -> Result<usize, FileFormatError> {
    let count = r.read_i32::<LE>()?;
    usize::try_from(count).map_err(|_| FileFormatError::NegativeCount { section, count })
}

/// Length-prefixed blob; reads at most what the stream actually holds
fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, FileFormatError> {
    let len = r.read_u32::<LE>()?;
    let mut bytes = Vec::new();
    r.by_ref().take(u64::from(len)).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(bytes)
}

fn read_str<R: Read>(r: &mut R, section: &'static str) -> Result<String, FileFormatError> {
    String::from_utf8(read_bytes(r)?).map_err(|_| FileFormatError::InvalidUtf8(section))
}

/// Map an early end of file to [`FileFormatError::Truncated`]
fn truncated(section: &'static str) -> impl Fn(FileFormatError) -> FileFormatError {
    move |err| match err {
        FileFormatError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            FileFormatError::Truncated(section)
        }
        other => other,
    }
}

fn in_section(section: &'static str) -> impl Fn(io::Error) -> FileFormatError {
    let map = truncated(section);
    move |err| map(FileFormatError::Io(err))
}
