//! # Host Capture Session
//!
//! Owns the socket, the reassembler, the decoder, and the snapshot being
//! filled. Everything runs on the task that owns the socket, so the record
//! store has exactly one writer.
//!
//! ```text
//!   TcpStream ──read──► FrameReassembler ──packet──► BatchDecoder ──► ProfileSnapshot
//!       ▲                                                  │
//!       └── SMAPS_DUMP byte ◄── SessionControl             └──► SessionEvent (crossbeam)
//! ```
//!
//! The session ends on `SessionControl::Stop`, on the smaps acknowledgement,
//! when the peer disconnects, or when the stream can no longer be framed.
//! Whatever partial packet is buffered at that point is discarded.

use super::batch::{BatchDecoder, Packet};
use super::frame::FrameReassembler;
use crate::config::CaptureConfig;
use crate::domain::CaptureError;
use crate::snapshot::ProfileSnapshot;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use loli_common::Command;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Progress notifications for the orchestration layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { address: String },
    BatchDecoded { allocs: usize, frees: usize },
    BatchDropped { reason: String },
    SmapsDumped,
    ConnectionLost { reason: String },
}

/// Requests from the orchestration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    RequestSmapsDump,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    SmapsDumped,
    SmapsTimeout,
    Disconnected,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub packets: u64,
    pub batches: u64,
    pub dropped_batches: u64,
    pub allocs: u64,
    pub frees: u64,
}

pub struct CaptureSession {
    config: CaptureConfig,
    reassembler: FrameReassembler,
    decoder: BatchDecoder,
    snapshot: ProfileSnapshot,
    events: Option<Sender<SessionEvent>>,
    stats: SessionStats,
    allocated_bytes: i64,
    smaps_dumped: bool,
}

impl CaptureSession {
    #[must_use]
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            reassembler: FrameReassembler::new(config.max_frame_len),
            decoder: BatchDecoder::new(config.max_batch_len),
            config,
            snapshot: ProfileSnapshot::new(),
            events: None,
            stats: SessionStats::default(),
            allocated_bytes: 0,
            smaps_dumped: false,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Connect to the forwarded device port, retrying a bounded number of times
    ///
    /// # Errors
    /// Returns `CaptureError::Connection` with the last failure once every
    /// attempt is used up
    pub async fn connect(&self) -> Result<TcpStream, CaptureError> {
        let address = self.config.address();
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = io::Error::new(io::ErrorKind::NotConnected, "no attempt made");

        for attempt in 1..=attempts {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    info!("Connected to {address} (attempt {attempt})");
                    self.emit(SessionEvent::Connected { address });
                    return Ok(stream);
                }
                Err(err) => {
                    warn!("Connection to {address} failed (attempt {attempt}/{attempts}): {err}");
                    last_error = err;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(CaptureError::Connection(last_error))
    }

    /// Read from `stream` until the session ends
    ///
    /// # Errors
    /// `CaptureError::Protocol` when the stream can no longer be framed, and
    /// `CaptureError::Connection` when the connection fails before any byte
    /// arrived or a command cannot be sent
    pub async fn run<S>(
        &mut self,
        stream: S,
        mut control: mpsc::Receiver<SessionControl>,
    ) -> Result<StopReason, CaptureError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut chunk = vec![0u8; self.config.read_buffer_size.max(1)];
        let mut smaps_deadline: Option<Instant> = None;
        let mut control_open = true;

        let reason = loop {
            let deadline = smaps_deadline;
            tokio::select! {
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => break self.connection_lost("peer closed the connection".into())?,
                    Ok(n) => {
                        if let Some(reason) = self.feed(&chunk[..n])? {
                            break reason;
                        }
                    }
                    Err(err) => break self.connection_lost(err.to_string())?,
                },
                request = control.recv(), if control_open => match request {
                    Some(SessionControl::RequestSmapsDump) => {
                        writer.write_all(&[Command::SmapsDump as u8]).await?;
                        writer.flush().await?;
                        smaps_deadline = Some(Instant::now() + self.config.smaps_timeout);
                        info!("Requested smaps dump");
                    }
                    Some(SessionControl::Stop) => break StopReason::Cancelled,
                    None => control_open = false,
                },
                () = sleep_until(deadline) => {
                    warn!("No smaps acknowledgement within {:?}", self.config.smaps_timeout);
                    break StopReason::SmapsTimeout;
                }
            }
        };

        self.reassembler.reset();
        info!("Capture stopped ({reason:?}): {} records", self.snapshot.records.len());
        Ok(reason)
    }

    /// Feed one chunk of received bytes.
    ///
    /// Returns `Some(StopReason::SmapsDumped)` once the acknowledgement
    /// arrives; packets after it are ignored.
    ///
    /// # Errors
    /// Only errors that end the session: an oversized frame length. Packets
    /// completed earlier in the same chunk are ingested first.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<StopReason>, CaptureError> {
        let mut results = Vec::new();
        let decoder = &mut self.decoder;
        let smaps_dumped = self.smaps_dumped;
        let framed = self.reassembler.push(chunk, |payload| {
            if !smaps_dumped {
                results.push(decoder.decode(&payload));
            }
        });

        for result in results {
            if self.smaps_dumped {
                break;
            }
            self.stats.packets += 1;
            match result {
                Ok(Packet::Batch(batch)) => {
                    let summary = self.snapshot.ingest_batch(&batch);
                    self.stats.batches += 1;
                    self.stats.allocs += summary.allocs as u64;
                    self.stats.frees += summary.frees as u64;
                    self.sample_memory(&batch);
                    debug!("Batch: {} allocs, {} frees", summary.allocs, summary.frees);
                    self.emit(SessionEvent::BatchDecoded {
                        allocs: summary.allocs,
                        frees: summary.frees,
                    });
                }
                Ok(Packet::Command(Command::SmapsDump)) => {
                    info!("Device acknowledged smaps dump");
                    self.smaps_dumped = true;
                    self.emit(SessionEvent::SmapsDumped);
                }
                Err(err) if err.is_batch_local() => {
                    warn!("Dropping packet: {err}");
                    self.stats.dropped_batches += 1;
                    self.emit(SessionEvent::BatchDropped { reason: err.to_string() });
                }
                Err(err) => return Err(err),
            }
        }

        if let Err(err) = framed {
            warn!("Stream can no longer be framed: {err}");
            return Err(err.into());
        }
        Ok(self.smaps_dumped.then_some(StopReason::SmapsDumped))
    }

    /// Series 0 tracks cumulative allocated kilobytes at the last allocation time
    fn sample_memory(&mut self, batch: &super::batch::DecodedBatch) {
        let mut last_time = None;
        for alloc in batch.allocs() {
            self.allocated_bytes += i64::from(alloc.size);
            last_time = Some(alloc.time);
        }
        if let Some(time) = last_time {
            let time = i32::try_from(time).unwrap_or(i32::MAX);
            let kb = i32::try_from(self.allocated_bytes / 1024).unwrap_or(i32::MAX);
            self.snapshot.push_meminfo(0, time, kb);
        }
    }

    fn connection_lost(&mut self, reason: String) -> Result<StopReason, CaptureError> {
        warn!("Connection lost: {reason}");
        self.emit(SessionEvent::ConnectionLost { reason: reason.clone() });
        if self.reassembler.stats().bytes_received == 0 {
            return Err(CaptureError::Connection(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                reason,
            )));
        }
        Ok(StopReason::Disconnected)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // A full or closed channel only loses progress reporting
            let _ = events.try_send(event);
        }
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    #[must_use]
    pub fn snapshot(&self) -> &ProfileSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn into_snapshot(self) -> ProfileSnapshot {
        self.snapshot
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::agent::{encode_batch_packet, encode_command_packet};
    use crate::capture::batch::{encode_alloc_line, encode_free_line, AllocLine, AllocPayload, FreeLine};
    use crate::domain::{ProtocolError, Seq};
    use crossbeam_channel::unbounded;
    use loli_common::RecordTag;

    fn alloc(seq: u32, addr: u64, size: u32) -> Vec<u8> {
        encode_alloc_line(&AllocLine {
            tag: RecordTag::Malloc,
            seq: Seq(seq),
            time: i64::from(seq) * 10,
            size,
            addr,
            payload: AllocPayload::Stack(vec![0x10, 0x20]),
        })
    }

    fn free(seq: u32, addr: u64) -> Vec<u8> {
        encode_free_line(&FreeLine { seq: Seq(seq), addr })
    }

    #[test]
    fn test_feed_ingests_batches_and_stops_on_ack() {
        let (tx, rx) = unbounded();
        let mut session = CaptureSession::new(CaptureConfig::default()).with_events(tx);
        let mut stream = encode_batch_packet(&[alloc(1, 0xA, 2048), free(2, 0xA)]).unwrap();
        stream.extend(encode_command_packet(Command::SmapsDump).unwrap());
        stream.extend(encode_batch_packet(&[alloc(3, 0xB, 16)]).unwrap());

        assert_eq!(session.feed(&stream).unwrap(), Some(StopReason::SmapsDumped));
        assert_eq!(session.snapshot().records.len(), 1);
        assert_eq!(session.stats().batches, 1);
        assert_eq!(session.snapshot().meminfo[0], vec![(10, 2)]);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![SessionEvent::BatchDecoded { allocs: 1, frees: 1 }, SessionEvent::SmapsDumped]
        );
    }

    #[test]
    fn test_corrupt_batch_is_dropped() {
        let mut session = CaptureSession::new(CaptureConfig::default());
        let mut garbage = 0u32.to_le_bytes().to_vec();
        garbage.extend_from_slice(&4u32.to_le_bytes());
        garbage.extend_from_slice(&100u32.to_le_bytes());
        garbage.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let mut stream = crate::capture::frame::frame_packet(&garbage).unwrap();
        stream.extend(encode_batch_packet(&[alloc(1, 0xA, 8)]).unwrap());

        assert_eq!(session.feed(&stream).unwrap(), None);
        assert_eq!(session.stats().dropped_batches, 1);
        assert_eq!(session.snapshot().records.len(), 1);
    }

    #[test]
    fn test_oversized_frame_ends_session() {
        let config = CaptureConfig { max_frame_len: 8, ..CaptureConfig::default() };
        let mut session = CaptureSession::new(config);
        let err = session.feed(&encode_batch_packet(&[alloc(1, 0xA, 8)]).unwrap()).unwrap_err();
        assert!(!err.is_batch_local());
    }

    #[test]
    fn test_packets_before_oversized_frame_are_kept() {
        let good = encode_batch_packet(&[alloc(1, 0xA, 8)]).unwrap();
        let config = CaptureConfig { max_frame_len: good.len(), ..CaptureConfig::default() };
        let mut session = CaptureSession::new(config);
        let mut chunk = good;
        chunk.extend_from_slice(&u32::MAX.to_le_bytes());

        let err = session.feed(&chunk).unwrap_err();
        assert!(matches!(err, CaptureError::Protocol(ProtocolError::FrameTooLarge { .. })));
        assert_eq!(session.snapshot().records.len(), 1);
        assert_eq!(session.stats().batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_without_smaps_ack() {
        let (host, mut device) = tokio::io::duplex(1024);
        let (control_tx, control_rx) = mpsc::channel(1);
        control_tx.send(SessionControl::RequestSmapsDump).await.unwrap();
        let config = CaptureConfig::default();
        let timeout = config.smaps_timeout;
        let mut session = CaptureSession::new(config);

        // the device keeps sending data but never acknowledges the dump
        device.write_all(&encode_batch_packet(&[alloc(1, 0xA, 64)]).unwrap()).await.unwrap();
        let started = Instant::now();
        let reason = session.run(host, control_rx).await.unwrap();
        assert_eq!(reason, StopReason::SmapsTimeout);
        assert!(started.elapsed() >= timeout);
        assert_eq!(session.snapshot().records.len(), 1);

        let mut command = [0u8; 1];
        device.read_exact(&mut command).await.unwrap();
        assert_eq!(command[0], Command::SmapsDump as u8);
    }

    #[tokio::test]
    async fn test_run_reports_early_disconnect() {
        let (host, device) = tokio::io::duplex(1024);
        drop(device);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let mut session = CaptureSession::new(CaptureConfig::default());
        let err = session.run(host, control_rx).await.unwrap_err();
        assert!(matches!(err, CaptureError::Connection(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let (host, _device) = tokio::io::duplex(1024);
        let (control_tx, control_rx) = mpsc::channel(1);
        control_tx.send(SessionControl::Stop).await.unwrap();
        let mut session = CaptureSession::new(CaptureConfig::default());
        assert_eq!(session.run(host, control_rx).await.unwrap(), StopReason::Cancelled);
    }
}
