//! # Device Send Loop
//!
//! Host-side model of the capture agent's network half, used as a loopback
//! fake device and to exercise the load-shedding policy at small scale.
//!
//! ```text
//!  hook threads ──push──► AgentBuffer (Mutex) ──drain every tick──► [u16 len][line]...
//!                                                                        │ lz4 block
//!                                                                        ▼
//!  host ◄──────────────── [len][type=0][compressed][original][block] ◄── SendLoop
//!  host ──── 1 byte ────► SendLoop: SMAPS_DUMP → flush, ack [len][type=1][cmd], stop batching
//! ```
//!
//! A tick keeps only the newest `max_buffered_records` lines; the oldest
//! excess is dropped and counted.

use super::batch::{
    encode_alloc_line, encode_batch_payload, encode_command_payload, encode_free_line,
    encode_lines, AllocLine, FreeLine,
};
use super::frame::frame_packet;
use crate::config::AgentConfig;
use crate::domain::ProtocolError;
use loli_common::Command;
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;

/// Encode `lines` as one framed type-0 packet
///
/// # Errors
/// `ProtocolError::FrameTooLarge` when the batch does not fit the u32 size fields
pub fn encode_batch_packet<L: AsRef<[u8]>>(lines: &[L]) -> Result<Vec<u8>, ProtocolError> {
    frame_packet(&encode_batch_payload(&encode_lines(lines))?)
}

/// Encode one framed type-1 packet acknowledging `command`
///
/// # Errors
/// Same as [`frame_packet`]
pub fn encode_command_packet(command: Command) -> Result<Vec<u8>, ProtocolError> {
    frame_packet(&encode_command_payload(command))
}

/// Lines appended by allocator hooks, waiting for the next tick
#[derive(Debug)]
pub struct AgentBuffer {
    lines: Mutex<Vec<Vec<u8>>>,
    max_buffered_records: usize,
    dropped: AtomicU64,
}

impl AgentBuffer {
    #[must_use]
    pub fn new(max_buffered_records: usize) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            max_buffered_records: max_buffered_records.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push_line(&self, line: Vec<u8>) {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).push(line);
    }

    pub fn record_alloc(&self, alloc: &AllocLine) {
        self.push_line(encode_alloc_line(alloc));
    }

    pub fn record_free(&self, free: &FreeLine) {
        self.push_line(encode_free_line(free));
    }

    /// Take everything buffered, keeping only the newest lines
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut lines =
            std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner));
        if lines.len() > self.max_buffered_records {
            let excess = lines.len() - self.max_buffered_records;
            lines.drain(..excess);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            debug!("Dropped {excess} buffered records over the per-tick cap");
        }
        lines
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Records shed by the per-tick cap so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    pub batches: u64,
    pub records: u64,
    pub dropped: u64,
    pub smaps_dumped: bool,
}

pub struct SendLoop<'a> {
    buffer: &'a AgentBuffer,
    config: AgentConfig,
}

impl<'a> SendLoop<'a> {
    #[must_use]
    pub fn new(buffer: &'a AgentBuffer, config: AgentConfig) -> Self {
        Self { buffer, config }
    }

    /// Serve one host connection until it closes.
    ///
    /// # Errors
    /// Returns an I/O error if writing to the host fails or a batch cannot be framed
    pub async fn run<S>(&self, stream: S) -> io::Result<SendStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = SendStats::default();
        let mut command = [0u8; 1];

        loop {
            tokio::select! {
                read = reader.read(&mut command) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => match Command::from_u32(u32::from(command[0])) {
                            Some(Command::SmapsDump) if !stats.smaps_dumped => {
                                self.flush(&mut writer, &mut stats).await?;
                                let ack = encode_command_packet(Command::SmapsDump).map_err(io::Error::other)?;
                                writer.write_all(&ack).await?;
                                writer.flush().await?;
                                stats.smaps_dumped = true;
                                info!("Acknowledged smaps dump, batching stopped");
                            }
                            Some(Command::SmapsDump) => {}
                            None => warn!("Ignoring unknown command byte {}", command[0]),
                        },
                    }
                }
                _ = ticker.tick() => {
                    if !stats.smaps_dumped {
                        self.flush(&mut writer, &mut stats).await?;
                    }
                }
            }
        }

        stats.dropped = self.buffer.dropped();
        Ok(stats)
    }

    async fn flush<W>(&self, writer: &mut W, stats: &mut SendStats) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let lines = self.buffer.drain();
        if lines.is_empty() {
            return Ok(());
        }
        let packet = encode_batch_packet(&lines).map_err(io::Error::other)?;
        writer.write_all(&packet).await?;
        writer.flush().await?;
        stats.batches += 1;
        stats.records += lines.len() as u64;
        Ok(())
    }
}
