//! # Shared Wire Contract (Capture Agent ↔ Host)
//!
//! Defines the byte-level contract between the native capture agent injected
//! into the profiled Android process and the desktop host. The agent side is
//! C++ and cannot depend on this crate, so everything here mirrors the layout
//! the agent writes. All multi-byte integers are little-endian.
//!
//! ## Stream Layout
//!
//! ```text
//! TCP stream   := packet*
//! packet       := len:u32 payload[len]
//! payload      := packet_type:u32 body
//!   type 0     := compressed_len:u32 original_len:u32 lz4_block[compressed_len]
//!   type 1     := command_id:u32
//! batch (lz4)  := (line_len:u16 line[line_len])*
//! free line    := tag=0:u8 seq:u32 addr:u64
//! alloc line   := tag=1..4:u8 seq:u32 time:i64 size:u32 addr:u64 rec_type:u8 tail
//!   rec_type 0 := lib_len:u16 lib[lib_len]          (no-stack mode)
//!   rec_type 1 := return_addr:u64*                  (stack mode, fills the line)
//! ```
//!
//! ## Key Types
//!
//! - [`PacketType`] - Selects the payload layout after framing
//! - [`RecordTag`] - First byte of every decoded line
//! - [`RecordKind`] - Tail layout of allocation lines
//! - [`Command`] - Host → device command byte / device → host ack id

#![no_std]

// ============================================================================
// Framing
// ============================================================================

/// Size of the little-endian length prefix in front of every packet
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the packet type field at the start of every payload
pub const PACKET_TYPE_SIZE: usize = 4;

/// Header of a data batch payload: type, compressed size, original size
pub const BATCH_HEADER_SIZE: usize = PACKET_TYPE_SIZE + 4 + 4;

/// Size of a command payload: type and command id
pub const COMMAND_PACKET_SIZE: usize = PACKET_TYPE_SIZE + 4;

/// Size of the length prefix of every line inside a decompressed batch
pub const LINE_HEADER_SIZE: usize = 2;

// ============================================================================
// Record Layouts
// ============================================================================

/// Encoded size of a free line (tag + seq + addr)
pub const FREE_LINE_SIZE: usize = 1 + 4 + 8;

/// Fixed prefix of every allocation line (tag + seq + time + size + addr + rec type)
pub const ALLOC_LINE_PREFIX_SIZE: usize = 1 + 4 + 8 + 4 + 8 + 1;

/// Size of one return address in a stack-mode allocation line
pub const STACK_FRAME_SIZE: usize = 8;

/// Library name of the capture agent itself; its frames are skipped when
/// attributing an allocation to a library.
pub const AGENT_LIBRARY_NAME: &str = "libloli.so";

// ============================================================================
// Agent Policy Defaults
// ============================================================================

/// Maximum number of records the agent keeps per tick before shedding the oldest
pub const MAX_BUFFERED_RECORDS: usize = 3000;

/// Interval between two agent send ticks, in milliseconds
pub const TICK_INTERVAL_MS: u64 = 66;

/// TCP port the agent listens on inside the device
pub const DEFAULT_PORT: u16 = 7100;

// ============================================================================
// Enumerations
// ============================================================================

/// Packet type carried in the first 4 bytes of every payload
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// LZ4-compressed batch of record lines
    DataBatch = 0,
    /// Command acknowledgement
    Command = 1,
}

impl PacketType {
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::DataBatch),
            1 => Some(Self::Command),
            _ => None,
        }
    }
}

/// Tag byte at the start of every decoded line
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTag {
    Free = 0,
    Malloc = 1,
    Calloc = 2,
    Memalign = 3,
    Realloc = 4,
}

impl RecordTag {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Malloc),
            2 => Some(Self::Calloc),
            3 => Some(Self::Memalign),
            4 => Some(Self::Realloc),
            _ => None,
        }
    }

    /// Every tag except `Free` carries an allocation payload
    #[must_use]
    pub const fn is_allocation(self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Layout of the tail of an allocation line
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Tail is a length-prefixed library name
    NoStack = 0,
    /// Tail is a run of return addresses, leaf first
    StackCaptured = 1,
}

impl RecordKind {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoStack),
            1 => Some(Self::StackCaptured),
            _ => None,
        }
    }
}

/// Commands exchanged on the same socket.
///
/// Host → device: a single byte holding the command id.
/// Device → host: a type-1 packet holding the same id as `u32`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Dump `/proc/self/smaps` on the device and stop sending batches
    SmapsDump = 0,
}

impl Command {
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::SmapsDump),
            _ => None,
        }
    }
}
