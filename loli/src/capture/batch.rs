//! # Batch Decoding
//!
//! Parses one reassembled payload into typed records.
//!
//! ## Packet Routing
//!
//! - `PacketType::DataBatch` → decompress the LZ4 block, split it into
//!   `[u16 len][line]` records, decode each line
//! - `PacketType::Command` → acknowledgement of a host command
//!   (`Command::SmapsDump` is the only one defined)
//!
//! Any error inside a batch drops the whole batch; the session logs it and
//! keeps reading. The encoders at the bottom of this module produce exactly
//! what the device agent writes and are used by the agent model and tests.

use super::frame::wire_len;
use crate::domain::{CaptureError, ProtocolError, Seq};
use byteorder::{LittleEndian, ReadBytesExt};
use loli_common::{
    Command, PacketType, RecordKind, RecordTag, ALLOC_LINE_PREFIX_SIZE, BATCH_HEADER_SIZE,
    COMMAND_PACKET_SIZE, FREE_LINE_SIZE, LINE_HEADER_SIZE, PACKET_TYPE_SIZE, STACK_FRAME_SIZE,
};
use log::{trace, warn};
use std::io::{Cursor, Read};

/// Longest library name a no-stack line can carry
pub const MAX_LIBRARY_NAME_LEN: usize = u16::MAX as usize;

/// Default upper bound for a decompressed batch (256 MiB)
pub const DEFAULT_MAX_BATCH_LEN: usize = 256 * 1024 * 1024;

/// Tail of an allocation line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocPayload {
    /// No-stack mode: the agent already knows the calling library
    Library(String),
    /// Stack mode: raw return addresses, leaf first
    Stack(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocLine {
    pub tag: RecordTag,
    pub seq: Seq,
    /// Milliseconds since the agent installed its hooks
    pub time: i64,
    pub size: u32,
    pub addr: u64,
    pub payload: AllocPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeLine {
    pub seq: Seq,
    pub addr: u64,
}

/// One decoded line, in the order the agent wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLine {
    Alloc(AllocLine),
    Free(FreeLine),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub lines: Vec<RecordLine>,
}

impl DecodedBatch {
    pub fn allocs(&self) -> impl Iterator<Item = &AllocLine> {
        self.lines.iter().filter_map(|line| match line {
            RecordLine::Alloc(alloc) => Some(alloc),
            RecordLine::Free(_) => None,
        })
    }

    pub fn frees(&self) -> impl Iterator<Item = &FreeLine> {
        self.lines.iter().filter_map(|line| match line {
            RecordLine::Free(free) => Some(free),
            RecordLine::Alloc(_) => None,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Batch(DecodedBatch),
    Command(Command),
}

/// Stateful decoder; reuses its decompression buffer across batches
#[derive(Debug)]
pub struct BatchDecoder {
    max_batch_len: usize,
    uncompressed: Vec<u8>,
}

impl Default for BatchDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_LEN)
    }
}

impl BatchDecoder {
    #[must_use]
    pub fn new(max_batch_len: usize) -> Self {
        Self { max_batch_len, uncompressed: Vec::with_capacity(1024) }
    }

    /// Decode one reassembled payload
    ///
    /// # Errors
    /// `ProtocolError` for malformed headers or lines, `CaptureError::Decompression`
    /// for a corrupt LZ4 block. Both only invalidate this payload.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Packet, CaptureError> {
        if payload.len() < PACKET_TYPE_SIZE {
            return Err(ProtocolError::TruncatedPacket { what: "packet", len: payload.len() }.into());
        }
        let packet_type = read_u32(payload, 0);
        match PacketType::from_u32(packet_type) {
            Some(PacketType::DataBatch) => self.decode_batch(payload).map(Packet::Batch),
            Some(PacketType::Command) => decode_command(payload).map(Packet::Command),
            None => Err(ProtocolError::UnknownPacketType(packet_type).into()),
        }
    }

    fn decode_batch(&mut self, payload: &[u8]) -> Result<DecodedBatch, CaptureError> {
        if payload.len() < BATCH_HEADER_SIZE {
            return Err(ProtocolError::TruncatedPacket { what: "batch", len: payload.len() }.into());
        }
        let compressed_len = read_u32(payload, 4) as usize;
        let original_len = read_u32(payload, 8) as usize;
        let block = &payload[BATCH_HEADER_SIZE..];

        if compressed_len > block.len() {
            return Err(ProtocolError::TruncatedPacket { what: "compressed block", len: block.len() }
                .into());
        }
        if original_len > self.max_batch_len {
            return Err(ProtocolError::MalformedLine(format!(
                "batch announces {original_len} bytes, limit is {}",
                self.max_batch_len
            ))
            .into());
        }

        self.uncompressed.clear();
        self.uncompressed.resize(original_len, 0);
        let written = lz4_flex::block::decompress_into(&block[..compressed_len], &mut self.uncompressed)?;
        if written != original_len {
            return Err(CaptureError::DecompressedSizeMismatch {
                expected: original_len,
                actual: written,
            });
        }

        let batch = decode_lines(&self.uncompressed)?;
        trace!("Decoded batch: {} lines from {} bytes", batch.lines.len(), original_len);
        Ok(batch)
    }
}

fn decode_command(payload: &[u8]) -> Result<Command, CaptureError> {
    if payload.len() < COMMAND_PACKET_SIZE {
        return Err(ProtocolError::TruncatedPacket { what: "command", len: payload.len() }.into());
    }
    let id = read_u32(payload, PACKET_TYPE_SIZE);
    Command::from_u32(id).ok_or_else(|| ProtocolError::UnknownCommand(id).into())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(field)
}

/// Split a decompressed batch into lines and decode each one
///
/// # Errors
/// `ProtocolError::MalformedLine` when a line is cut short or inconsistent.
pub fn decode_lines(buffer: &[u8]) -> Result<DecodedBatch, ProtocolError> {
    let mut lines = Vec::new();
    let mut rest = buffer;
    while !rest.is_empty() {
        if rest.len() < LINE_HEADER_SIZE {
            return Err(ProtocolError::MalformedLine(format!(
                "{} trailing bytes after the last line",
                rest.len()
            )));
        }
        let line_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[LINE_HEADER_SIZE..];
        if line_len > rest.len() {
            return Err(ProtocolError::MalformedLine(format!(
                "line announces {line_len} bytes, {} remain",
                rest.len()
            )));
        }
        lines.push(decode_line(&rest[..line_len])?);
        rest = &rest[line_len..];
    }
    Ok(DecodedBatch { lines })
}

fn truncated(what: &str) -> impl Fn(std::io::Error) -> ProtocolError + '_ {
    move |_| ProtocolError::MalformedLine(format!("line too short for {what}"))
}

fn decode_line(line: &[u8]) -> Result<RecordLine, ProtocolError> {
    let Some(&tag_byte) = line.first() else {
        return Err(ProtocolError::MalformedLine("empty line".into()));
    };
    let tag = RecordTag::from_u8(tag_byte).ok_or(ProtocolError::UnknownRecordTag(tag_byte))?;
    let mut cursor = Cursor::new(&line[1..]);

    if !tag.is_allocation() {
        let seq = cursor.read_u32::<LittleEndian>().map_err(truncated("free seq"))?;
        let addr = cursor.read_u64::<LittleEndian>().map_err(truncated("free address"))?;
        return Ok(RecordLine::Free(FreeLine { seq: Seq(seq), addr }));
    }

    let seq = cursor.read_u32::<LittleEndian>().map_err(truncated("seq"))?;
    let time = cursor.read_i64::<LittleEndian>().map_err(truncated("time"))?;
    let size = cursor.read_u32::<LittleEndian>().map_err(truncated("size"))?;
    let addr = cursor.read_u64::<LittleEndian>().map_err(truncated("address"))?;
    let kind_byte = cursor.read_u8().map_err(truncated("record type"))?;
    let kind = RecordKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownRecordKind(kind_byte))?;

    let payload = match kind {
        RecordKind::NoStack => {
            let name_len = cursor.read_u16::<LittleEndian>().map_err(truncated("library length"))?;
            let mut name = vec![0u8; name_len as usize];
            cursor.read_exact(&mut name).map_err(truncated("library name"))?;
            AllocPayload::Library(String::from_utf8_lossy(&name).into_owned())
        }
        RecordKind::StackCaptured => {
            // The frame run has no terminator; it consumes whatever is left
            let tail = &line[ALLOC_LINE_PREFIX_SIZE..];
            if tail.len() % STACK_FRAME_SIZE != 0 {
                return Err(ProtocolError::MalformedLine(format!(
                    "stack tail of {} bytes is not a whole number of frames",
                    tail.len()
                )));
            }
            let frames = tail
                .chunks_exact(STACK_FRAME_SIZE)
                .map(|frame| {
                    let mut bytes = [0u8; STACK_FRAME_SIZE];
                    bytes.copy_from_slice(frame);
                    u64::from_le_bytes(bytes)
                })
                .collect();
            AllocPayload::Stack(frames)
        }
    };

    Ok(RecordLine::Alloc(AllocLine { tag, seq: Seq(seq), time, size, addr, payload }))
}

// ============================================================================
// Encoders (agent side of the contract)
// ============================================================================

#[must_use]
pub fn encode_free_line(free: &FreeLine) -> Vec<u8> {
    let mut line = Vec::with_capacity(FREE_LINE_SIZE);
    line.push(RecordTag::Free as u8);
    line.extend_from_slice(&free.seq.0.to_le_bytes());
    line.extend_from_slice(&free.addr.to_le_bytes());
    line
}

#[must_use]
pub fn encode_alloc_line(alloc: &AllocLine) -> Vec<u8> {
    let mut line = Vec::with_capacity(ALLOC_LINE_PREFIX_SIZE + 64);
    line.push(alloc.tag as u8);
    line.extend_from_slice(&alloc.seq.0.to_le_bytes());
    line.extend_from_slice(&alloc.time.to_le_bytes());
    line.extend_from_slice(&alloc.size.to_le_bytes());
    line.extend_from_slice(&alloc.addr.to_le_bytes());
    match &alloc.payload {
        AllocPayload::Library(name) => {
            line.push(RecordKind::NoStack as u8);
            let name = truncate_name(name);
            #[allow(clippy::cast_possible_truncation)]
            let len = name.len() as u16;
            line.extend_from_slice(&len.to_le_bytes());
            line.extend_from_slice(name.as_bytes());
        }
        AllocPayload::Stack(frames) => {
            line.push(RecordKind::StackCaptured as u8);
            for frame in frames {
                line.extend_from_slice(&frame.to_le_bytes());
            }
        }
    }
    line
}

/// Library names longer than `MAX_LIBRARY_NAME_LEN` bytes are cut at the
/// last character boundary that fits the u16 length prefix
fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_LIBRARY_NAME_LEN {
        return name;
    }
    let mut end = MAX_LIBRARY_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    warn!("Truncating {} byte library name to {end} bytes", name.len());
    &name[..end]
}

#[must_use]
pub fn encode_line(line: &RecordLine) -> Vec<u8> {
    match line {
        RecordLine::Alloc(alloc) => encode_alloc_line(alloc),
        RecordLine::Free(free) => encode_free_line(free),
    }
}

/// Concatenate encoded lines as `[u16 len][line]` records.
///
/// Lines longer than `u16::MAX` cannot be represented and are skipped.
#[must_use]
pub fn encode_lines<L: AsRef<[u8]>>(lines: &[L]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for line in lines {
        let line = line.as_ref();
        let Ok(len) = u16::try_from(line.len()) else {
            warn!("Skipping {} byte line, longer than the wire format allows", line.len());
            continue;
        };
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(line);
    }
    buffer
}

/// Build a type-0 payload (header + LZ4 block) from an uncompressed batch
///
/// # Errors
/// `ProtocolError::FrameTooLarge` if either size overflows its u32 field
pub fn encode_batch_payload(uncompressed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let original = wire_len(uncompressed.len())?;
    let compressed = lz4_flex::block::compress(uncompressed);
    let mut payload = Vec::with_capacity(BATCH_HEADER_SIZE + compressed.len());
    payload.extend_from_slice(&(PacketType::DataBatch as u32).to_le_bytes());
    payload.extend_from_slice(&wire_len(compressed.len())?.to_le_bytes());
    payload.extend_from_slice(&original.to_le_bytes());
    payload.extend_from_slice(&compressed);
    Ok(payload)
}

/// Build a type-1 payload acknowledging `command`
#[must_use]
pub fn encode_command_payload(command: Command) -> Vec<u8> {
    let mut payload = Vec::with_capacity(COMMAND_PACKET_SIZE);
    payload.extend_from_slice(&(PacketType::Command as u32).to_le_bytes());
    payload.extend_from_slice(&u32::from(command as u8).to_le_bytes());
    payload
}
