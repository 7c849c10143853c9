//! Structured error types for loli
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Batch-level errors (`CaptureError::Decompression`, most `ProtocolError`s)
//! are isolated by the capture session; file and setup errors reach the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame length {len} exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Packet of {len} bytes is too short for a {what} header")]
    TruncatedPacket { what: &'static str, len: usize },

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u32),

    #[error("Unknown command id: {0}")]
    UnknownCommand(u32),

    #[error("Unknown record tag: {0}")]
    UnknownRecordTag(u8),

    #[error("Unknown record type {0} in allocation line")]
    UnknownRecordKind(u8),

    #[error("Malformed record line: {0}")]
    MalformedLine(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("LZ4 decompression failed: {0}")]
    Decompression(#[from] lz4_flex::block::DecompressError),

    #[error("Decompressed {actual} bytes but the header announced {expected}")]
    DecompressedSizeMismatch { expected: usize, actual: usize },

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),
}

impl CaptureError {
    /// Whether the error only invalidates the current batch.
    ///
    /// Oversized frames and connection failures end the session because the
    /// byte stream can no longer be framed.
    #[must_use]
    pub fn is_batch_local(&self) -> bool {
        match self {
            Self::Decompression(_) | Self::DecompressedSizeMismatch { .. } => true,
            Self::Protocol(ProtocolError::FrameTooLarge { .. }) | Self::Connection(_) => false,
            Self::Protocol(_) => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum FileFormatError {
    #[error("Invalid magic number: 0x{0:08x}")]
    BadMagic(u32),

    #[error("Version mismatch (expected {expected}, got {found})")]
    VersionMismatch { expected: i32, found: i32 },

    #[error("Negative element count {count} in {section}")]
    NegativeCount { section: &'static str, count: i32 },

    #[error("Invalid UTF-8 string in {0}")]
    InvalidUtf8(&'static str),

    #[error("Unknown record type {0} in record section")]
    InvalidRecordKind(u8),

    #[error("Record id {0} is out of range")]
    RecordIdOutOfRange(u64),

    #[error("File ends inside the {0} section")]
    Truncated(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Failed to start resolver {program}: {error}")]
    SpawnFailed { program: String, error: std::io::Error },

    #[error("Resolver {program} exited with {status}")]
    ExitFailure { program: String, status: std::process::ExitStatus },

    #[error("Failed to load debug info from {path}: {reason}")]
    DebugInfo { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
