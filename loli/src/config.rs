//! Runtime tunables
//!
//! Every knob has a default matching the device agent; the CLI overrides a
//! subset of them. Nothing is read from files or the environment except
//! `RUST_LOG`, which `env_logger` handles.

use crate::capture::batch::DEFAULT_MAX_BATCH_LEN;
use crate::capture::frame::DEFAULT_MAX_FRAME_LEN;
use loli_common::{DEFAULT_PORT, MAX_BUFFERED_RECORDS, TICK_INTERVAL_MS};
use std::path::PathBuf;
use std::time::Duration;

/// Host side of a capture session
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub host: String,
    pub port: u16,
    /// Packets whose length prefix exceeds this end the session
    pub max_frame_len: usize,
    /// Upper bound on a decompressed batch
    pub max_batch_len: usize,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// How long to wait for the smaps answer after `SMAPS_DUMP`
    pub smaps_timeout: Duration,
    pub read_buffer_size: usize,
    /// Capacity of the session event channel
    pub event_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_batch_len: DEFAULT_MAX_BATCH_LEN,
            connect_attempts: 5,
            retry_delay: Duration::from_millis(500),
            smaps_timeout: Duration::from_secs(10),
            read_buffer_size: 1024 * 1024,
            event_capacity: 1024,
        }
    }
}

impl CaptureConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Device agent model
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Oldest lines are dropped beyond this many pending records
    pub max_buffered_records: usize,
    pub tick_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_buffered_records: MAX_BUFFERED_RECORDS,
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
        }
    }
}

/// Symbol resolution
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Addresses per resolver invocation
    pub chunk_size: usize,
    pub workers: usize,
    pub addr2line: PathBuf,
    pub nm: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            workers: worker_count(),
            addr2line: PathBuf::from("addr2line"),
            nm: PathBuf::from("nm"),
        }
    }
}

/// Available parallelism, never fewer than two workers
#[must_use]
pub fn worker_count() -> usize {
    std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get).max(2)
}
