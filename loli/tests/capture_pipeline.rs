//! Wire bytes → session → record store → call tree

use loli::analysis::{CallTree, TreeOptions};
use loli::capture::agent::{encode_batch_packet, encode_command_packet, AgentBuffer};
use loli::capture::batch::{encode_alloc_line, encode_free_line, AllocLine, AllocPayload, FreeLine};
use loli::capture::{CaptureSession, SendLoop, SessionControl, StopReason};
use loli::config::{AgentConfig, CaptureConfig};
use loli::domain::Seq;
use loli_common::{Command, RecordTag};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn alloc(seq: u32, addr: u64, size: u32, stack: &[u64]) -> AllocLine {
    AllocLine {
        tag: RecordTag::Malloc,
        seq: Seq(seq),
        time: i64::from(seq) * 66,
        size,
        addr,
        payload: AllocPayload::Stack(stack.to_vec()),
    }
}

fn free(seq: u32, addr: u64) -> FreeLine {
    FreeLine { seq: Seq(seq), addr }
}

/// Two data batches (5 allocs, 2 frees) followed by the smaps acknowledgement
fn three_packet_capture() -> Vec<u8> {
    let first = vec![
        encode_alloc_line(&alloc(1, 0xA000, 100, &[0x10, 0x20])),
        encode_alloc_line(&alloc(2, 0xB000, 200, &[0x11, 0x20])),
        encode_alloc_line(&alloc(3, 0xC000, 300, &[0x12, 0x20])),
        encode_free_line(&free(4, 0xA000)),
    ];
    let second = vec![
        encode_alloc_line(&alloc(5, 0xD000, 400, &[0x10, 0x20])),
        encode_alloc_line(&alloc(6, 0xE000, 500, &[0x13, 0x21])),
        encode_free_line(&free(7, 0xB000)),
    ];
    let mut stream = encode_batch_packet(&first).unwrap();
    stream.extend(encode_batch_packet(&second).unwrap());
    stream.extend(encode_command_packet(Command::SmapsDump).unwrap());
    stream
}

#[test]
fn test_three_packet_capture() {
    let mut session = CaptureSession::new(CaptureConfig::default());
    let reason = session.feed(&three_packet_capture()).unwrap();
    assert_eq!(reason, Some(StopReason::SmapsDumped));

    let stats = session.stats();
    assert_eq!(stats.packets, 3);
    assert_eq!((stats.allocs, stats.frees), (5, 2));

    let snapshot = session.into_snapshot();
    assert_eq!(snapshot.records.len(), 5);
    assert_eq!(snapshot.records.free_index().len(), 2);

    let live = CallTree::build(&snapshot, TreeOptions { live_only: true, ..TreeOptions::default() });
    let root_sum: i64 = live.roots().iter().map(|id| live.node(*id).size).sum();
    assert_eq!(root_sum, 300 + 400 + 500);

    let all = CallTree::build(&snapshot, TreeOptions::default());
    assert_eq!(all.total_size(), 1500);
    assert_eq!(all.total_count(), 5);
}

#[test]
fn test_byte_at_a_time_delivery_matches_single_chunk() {
    let stream = three_packet_capture();
    let mut session = CaptureSession::new(CaptureConfig::default());
    let mut reason = None;
    for byte in &stream {
        if let Some(stop) = session.feed(std::slice::from_ref(byte)).unwrap() {
            reason = Some(stop);
        }
    }
    assert_eq!(reason, Some(StopReason::SmapsDumped));
    assert_eq!(session.snapshot().records.len(), 5);
    assert_eq!(session.snapshot().records.live_size(), 1200);
}

#[test]
fn test_realloc_at_same_address_keeps_new_allocation_alive() {
    // realloc in place: free and alloc share the seq
    let lines = vec![
        encode_alloc_line(&alloc(1, 0xA000, 64, &[0x10])),
        encode_free_line(&free(2, 0xA000)),
        encode_alloc_line(&alloc(2, 0xA000, 128, &[0x10])),
    ];
    let mut session = CaptureSession::new(CaptureConfig::default());
    session.feed(&encode_batch_packet(&lines).unwrap()).unwrap();
    let live: Vec<i64> = session.snapshot().records.live_records().map(|r| r.size).collect();
    assert_eq!(live, vec![128]);
}

#[tokio::test]
async fn test_loopback_session_against_agent_model() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let buffer = Arc::new(AgentBuffer::new(loli_common::MAX_BUFFERED_RECORDS));
    for seq in 0..10u32 {
        buffer.record_alloc(&alloc(seq * 2, 0x1000 + u64::from(seq), 32, &[0x40, 0x50]));
    }
    buffer.record_free(&free(100, 0x1000));

    let device_buffer = Arc::clone(&buffer);
    let device = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let config = AgentConfig { tick_interval: Duration::from_millis(5), ..AgentConfig::default() };
        SendLoop::new(&device_buffer, config).run(socket).await.unwrap()
    });

    let config = CaptureConfig { port, connect_attempts: 3, ..CaptureConfig::default() };
    let mut session = CaptureSession::new(config);
    let stream = session.connect().await.unwrap();
    let (control_tx, control_rx) = mpsc::channel(1);
    control_tx.send(SessionControl::RequestSmapsDump).await.unwrap();

    let reason = session.run(stream, control_rx).await.unwrap();
    assert_eq!(reason, StopReason::SmapsDumped);
    let snapshot = session.into_snapshot();
    assert_eq!(snapshot.records.len(), 10);
    assert_eq!(snapshot.records.live_records().count(), 9);
    assert!(!snapshot.meminfo.is_empty());

    let sent = device.await.unwrap();
    assert!(sent.smaps_dumped);
    assert_eq!(sent.records, 11);
    assert_eq!(sent.dropped, 0);
}
