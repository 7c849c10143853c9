//! # Frame Reassembly
//!
//! Turns the raw TCP byte stream into complete, length-prefixed packets.
//!
//! ```text
//! stream  := [len:u32 LE][payload; len] [len:u32 LE][payload; len] ...
//! ```
//!
//! Chunks arrive with arbitrary boundaries: the length prefix may be split,
//! a payload may span many chunks, and one chunk may carry several packets.
//! The reassembler keeps exactly two pieces of state, the partial length
//! prefix (0-4 bytes) and the partial payload, and hands every completed
//! payload to the caller before it continues buffering.

use crate::domain::ProtocolError;
use loli_common::FRAME_HEADER_SIZE;
use log::trace;

/// Default upper bound for a single packet (64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Byte counters used to check that no payload byte is lost or duplicated
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub bytes_received: u64,
    pub payload_bytes: u64,
    pub packets: u64,
}

impl FrameStats {
    /// Bytes spent on length prefixes
    #[must_use]
    pub fn overhead(&self) -> u64 {
        self.packets * FRAME_HEADER_SIZE as u64
    }
}

#[derive(Debug)]
pub struct FrameReassembler {
    max_frame_len: usize,
    header: [u8; FRAME_HEADER_SIZE],
    header_len: usize,
    /// Length of the packet being assembled, once the prefix is complete
    expected: Option<usize>,
    payload: Vec<u8>,
    stats: FrameStats,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameReassembler {
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            header: [0; FRAME_HEADER_SIZE],
            header_len: 0,
            expected: None,
            payload: Vec::new(),
            stats: FrameStats::default(),
        }
    }

    /// Feed one chunk, calling `on_packet` for every completed payload in order.
    ///
    /// Returns the number of packets completed by this chunk.
    ///
    /// # Errors
    /// Returns `ProtocolError::FrameTooLarge` when a length prefix exceeds the
    /// configured maximum. The partial state is discarded in that case.
    pub fn push<F>(&mut self, mut chunk: &[u8], mut on_packet: F) -> Result<usize, ProtocolError>
    where
        F: FnMut(Vec<u8>),
    {
        self.stats.bytes_received += chunk.len() as u64;
        let mut completed = 0;

        while !chunk.is_empty() {
            let expected = match self.expected {
                Some(len) => len,
                None => {
                    let take = (FRAME_HEADER_SIZE - self.header_len).min(chunk.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_len += take;
                    chunk = &chunk[take..];

                    if self.header_len < FRAME_HEADER_SIZE {
                        break;
                    }

                    let len = u32::from_le_bytes(self.header) as usize;
                    self.header_len = 0;
                    if len > self.max_frame_len {
                        self.reset();
                        return Err(ProtocolError::FrameTooLarge { len, max: self.max_frame_len });
                    }
                    self.payload.reserve(len);
                    self.expected = Some(len);
                    len
                }
            };

            let take = (expected - self.payload.len()).min(chunk.len());
            self.payload.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if self.payload.len() == expected {
                let packet = std::mem::take(&mut self.payload);
                self.expected = None;
                self.stats.packets += 1;
                self.stats.payload_bytes += packet.len() as u64;
                trace!("Reassembled packet of {} bytes", packet.len());
                completed += 1;
                on_packet(packet);
            }
        }

        Ok(completed)
    }

    /// Feed one chunk and collect the completed payloads
    ///
    /// # Errors
    /// Same as [`FrameReassembler::push`].
    pub fn push_collect(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut packets = Vec::new();
        self.push(chunk, |packet| packets.push(packet))?;
        Ok(packets)
    }

    /// Drop any partially buffered packet (used when a session is cancelled)
    pub fn reset(&mut self) {
        self.header_len = 0;
        self.expected = None;
        self.payload = Vec::new();
    }

    /// Bytes currently held for an incomplete packet, prefix included
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.header_len + self.payload.len()
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

/// Prefix `payload` with its little-endian length
///
/// # Errors
/// `ProtocolError::FrameTooLarge` if the length does not fit the u32 prefix
pub fn frame_packet(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = wire_len(payload.len())?;
    let mut framed = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// A length as the u32 the wire format carries
pub(crate) fn wire_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge { len, max: u32::MAX as usize })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stream_of(packets: &[Vec<u8>]) -> Vec<u8> {
        packets.iter().flat_map(|p| frame_packet(p).unwrap()).collect()
    }

    #[test]
    fn test_multiple_packets_in_one_chunk() {
        let packets = vec![b"abc".to_vec(), b"".to_vec(), b"defgh".to_vec()];
        let mut reassembler = FrameReassembler::default();
        let out = reassembler.push_collect(&stream_of(&packets)).unwrap();
        assert_eq!(out, packets);
        assert_eq!(reassembler.buffered_len(), 0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_wire_len_rejects_lengths_past_u32() {
        assert_eq!(wire_len(16).unwrap(), 16);
        let err = wire_len(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_split_length_prefix() {
        let stream = stream_of(&[b"hello".to_vec()]);
        let mut reassembler = FrameReassembler::default();
        assert!(reassembler.push_collect(&stream[..1]).unwrap().is_empty());
        assert!(reassembler.push_collect(&stream[1..3]).unwrap().is_empty());
        assert_eq!(reassembler.buffered_len(), 3);
        let out = reassembler.push_collect(&stream[3..]).unwrap();
        assert_eq!(out, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_byte_by_byte() {
        let packets = vec![vec![1u8; 300], vec![2u8; 7]];
        let stream = stream_of(&packets);
        let mut reassembler = FrameReassembler::default();
        let mut out = Vec::new();
        for byte in &stream {
            out.extend(reassembler.push_collect(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(out, packets);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reassembler = FrameReassembler::new(16);
        let mut stream = 17u32.to_le_bytes().to_vec();
        stream.extend_from_slice(&[0; 17]);
        let err = reassembler.push_collect(&stream).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { len: 17, max: 16 }));
        assert_eq!(reassembler.buffered_len(), 0);
    }

    #[test]
    fn test_reset_discards_partial_packet() {
        let stream = stream_of(&[b"first".to_vec()]);
        let mut reassembler = FrameReassembler::default();
        reassembler.push_collect(&stream[..6]).unwrap();
        reassembler.reset();
        let fresh = stream_of(&[b"second".to_vec()]);
        assert_eq!(reassembler.push_collect(&fresh).unwrap(), vec![b"second".to_vec()]);
    }

    #[test]
    fn test_every_two_cut_points() {
        let packets = vec![b"ab".to_vec(), b"cdef".to_vec(), b"g".to_vec()];
        let stream = stream_of(&packets);
        for i in 0..=stream.len() {
            for j in i..=stream.len() {
                let mut reassembler = FrameReassembler::default();
                let mut out = reassembler.push_collect(&stream[..i]).unwrap();
                out.extend(reassembler.push_collect(&stream[i..j]).unwrap());
                out.extend(reassembler.push_collect(&stream[j..]).unwrap());
                assert_eq!(out, packets, "cuts at {i}, {j}");
            }
        }
    }

    proptest! {
        #[test]
        fn proptest_any_fragmentation_preserves_packets(
            packets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..200), 0..12),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..24),
        ) {
            let stream = stream_of(&packets);
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(stream.len() + 1)).collect();
            points.sort_unstable();

            let mut reassembler = FrameReassembler::default();
            let mut out = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(stream.len())) {
                out.extend(reassembler.push_collect(&stream[start..point]).unwrap());
                start = point;
            }

            prop_assert_eq!(&out, &packets);
            let stats = reassembler.stats();
            prop_assert_eq!(stats.bytes_received - stats.overhead(), stats.payload_bytes);
        }
    }
}
